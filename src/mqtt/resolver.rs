//! Redelivery resolver: page-bounded replay of unconfirmed samples.
//!
//! On (re)connect the resolver reads the latest PostRecord for the sensor
//! topic and replays everything strictly newer, one page (30 samples) per
//! publish. Each pass re-queries the store from the confirmed high-water
//! mark rather than holding a live cursor, so samples arriving mid-replay
//! and restarts after a failed pass are both handled by construction. A
//! short page (<30) marks the final pass; the resolver returns to idle once
//! that batch confirms instead of re-querying forever.
//!
//! The page size must stay above the number of sensors on the device: a
//! full acquisition round sharing one timestamp must fit in a single page,
//! or the strict `>` boundary can never advance past it.

use crate::store::{LogStore, StoreError};

/// Samples per replay publish.
pub const REPLAY_PAGE_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolverState {
    #[default]
    Idle,
    /// A batch is awaiting publish confirmation. `final_pass` is set when
    /// the batch came from a short page.
    Resolving { final_pass: bool },
}

/// What the service loop should do next.
#[derive(Debug, PartialEq)]
pub enum ReplayAction {
    /// Publish this batch, recording `high_water` as the sample timestamp
    /// on confirmation.
    Publish {
        payload: Vec<u8>,
        high_water: i64,
        count: usize,
    },
    /// A pass is already pending; the trigger is coalesced.
    AlreadyResolving,
    /// First-ever run: no prior posts, nothing to replay.
    NothingToReplay,
    /// No unconfirmed samples remain; normal flow resumes.
    CaughtUp,
}

#[derive(Debug, Default)]
pub struct RedeliveryResolver {
    state: ResolverState,
}

impl RedeliveryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    /// True when no replay pass is pending.
    pub fn is_idle(&self) -> bool {
        self.state == ResolverState::Idle
    }

    /// Entry point on (re)connect. Idempotent: a second trigger while a
    /// batch is pending does not start an overlapping pass.
    pub fn begin(&mut self, store: &LogStore, topic: &str) -> Result<ReplayAction, StoreError> {
        if matches!(self.state, ResolverState::Resolving { .. }) {
            return Ok(ReplayAction::AlreadyResolving);
        }
        self.next_batch(store, topic)
    }

    /// The pending batch was confirmed: finish, or re-query for samples
    /// that arrived while it was in flight.
    pub fn on_batch_confirmed(
        &mut self,
        store: &LogStore,
        topic: &str,
    ) -> Result<ReplayAction, StoreError> {
        match self.state {
            ResolverState::Resolving { final_pass: true } => {
                self.state = ResolverState::Idle;
                Ok(ReplayAction::CaughtUp)
            }
            ResolverState::Resolving { final_pass: false } => self.next_batch(store, topic),
            ResolverState::Idle => Ok(ReplayAction::CaughtUp),
        }
    }

    /// Publish failed or the connection dropped mid-pass. No progress is
    /// recorded; the next reconnect restarts from the last confirmed
    /// high-water mark.
    pub fn reset(&mut self) {
        self.state = ResolverState::Idle;
    }

    fn next_batch(&mut self, store: &LogStore, topic: &str) -> Result<ReplayAction, StoreError> {
        let Some(last_post) = store.latest_post_record(topic)? else {
            self.state = ResolverState::Idle;
            return Ok(ReplayAction::NothingToReplay);
        };

        let samples = store.samples_after(last_post.sample_ts, REPLAY_PAGE_SIZE)?;
        if samples.is_empty() {
            self.state = ResolverState::Idle;
            return Ok(ReplayAction::CaughtUp);
        }

        let high_water = samples.last().map(|s| s.ts).unwrap_or(last_post.sample_ts);
        let count = samples.len();
        let payload = serde_json::to_vec(&samples)?;

        self.state = ResolverState::Resolving {
            final_pass: count < REPLAY_PAGE_SIZE,
        };
        Ok(ReplayAction::Publish {
            payload,
            high_water,
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PostRecord, Sample, SampleValue};

    const TOPIC: &str = "atech/sensors/dev";

    fn store_with_post(sample_ts: i64) -> LogStore {
        let store = LogStore::open_in_memory().unwrap();
        store
            .append_post_record(&PostRecord {
                topic: TOPIC.to_string(),
                payload_len: 2,
                sample_ts,
                real_ts: sample_ts,
            })
            .unwrap();
        store
    }

    fn add_sample(store: &LogStore, ts: i64) {
        store
            .append_sample(&Sample {
                sensor: "DI1".to_string(),
                value: SampleValue::Number(1.0),
                ts,
            })
            .unwrap();
    }

    fn batch_timestamps(payload: &[u8]) -> Vec<i64> {
        let samples: Vec<Sample> = serde_json::from_slice(payload).unwrap();
        samples.iter().map(|s| s.ts).collect()
    }

    #[test]
    fn first_run_has_nothing_to_replay() {
        let store = LogStore::open_in_memory().unwrap();
        add_sample(&store, 100);

        let mut resolver = RedeliveryResolver::new();
        let action = resolver.begin(&store, TOPIC).unwrap();
        assert_eq!(action, ReplayAction::NothingToReplay);
        assert_eq!(resolver.state(), ResolverState::Idle);
    }

    #[test]
    fn no_gap_means_caught_up() {
        let store = store_with_post(160);
        add_sample(&store, 160); // boundary sample, already covered

        let mut resolver = RedeliveryResolver::new();
        assert_eq!(resolver.begin(&store, TOPIC).unwrap(), ReplayAction::CaughtUp);
    }

    #[test]
    fn outage_batch_replays_in_order_with_high_water_mark() {
        // Broker down for 3 flush ticks: samples at ts=100,130,160.
        let store = store_with_post(90);
        add_sample(&store, 100);
        add_sample(&store, 130);
        add_sample(&store, 160);

        let mut resolver = RedeliveryResolver::new();
        let ReplayAction::Publish {
            payload,
            high_water,
            count,
        } = resolver.begin(&store, TOPIC).unwrap()
        else {
            panic!("expected a replay batch");
        };

        assert_eq!(batch_timestamps(&payload), vec![100, 130, 160]);
        assert_eq!(high_water, 160);
        assert_eq!(count, 3);

        // The pipeline confirms and records the high-water mark.
        store
            .append_post_record(&PostRecord {
                topic: TOPIC.to_string(),
                payload_len: payload.len(),
                sample_ts: high_water,
                real_ts: 200,
            })
            .unwrap();

        // Short page: this pass was the last.
        assert_eq!(
            resolver.on_batch_confirmed(&store, TOPIC).unwrap(),
            ReplayAction::CaughtUp
        );
        assert_eq!(resolver.state(), ResolverState::Idle);
        assert_eq!(
            store.latest_post_record(TOPIC).unwrap().unwrap().sample_ts,
            160
        );
    }

    #[test]
    fn full_page_requeries_instead_of_assuming_completion() {
        let store = store_with_post(0);
        for i in 1..=35 {
            add_sample(&store, i);
        }

        let mut resolver = RedeliveryResolver::new();
        let ReplayAction::Publish {
            payload,
            high_water,
            count,
        } = resolver.begin(&store, TOPIC).unwrap()
        else {
            panic!("expected first batch");
        };
        assert_eq!(count, REPLAY_PAGE_SIZE);
        assert_eq!(high_water, 30);
        assert_eq!(batch_timestamps(&payload).first(), Some(&1));

        store
            .append_post_record(&PostRecord {
                topic: TOPIC.to_string(),
                payload_len: payload.len(),
                sample_ts: high_water,
                real_ts: 100,
            })
            .unwrap();

        // Exactly-full page must re-query, finding the remaining 5.
        let ReplayAction::Publish {
            high_water, count, ..
        } = resolver.on_batch_confirmed(&store, TOPIC).unwrap()
        else {
            panic!("expected second batch");
        };
        assert_eq!(count, 5);
        assert_eq!(high_water, 35);

        store
            .append_post_record(&PostRecord {
                topic: TOPIC.to_string(),
                payload_len: 1,
                sample_ts: high_water,
                real_ts: 101,
            })
            .unwrap();
        assert_eq!(
            resolver.on_batch_confirmed(&store, TOPIC).unwrap(),
            ReplayAction::CaughtUp
        );
    }

    #[test]
    fn double_trigger_does_not_overlap() {
        let store = store_with_post(90);
        add_sample(&store, 100);

        let mut resolver = RedeliveryResolver::new();
        assert!(matches!(
            resolver.begin(&store, TOPIC).unwrap(),
            ReplayAction::Publish { .. }
        ));
        assert_eq!(
            resolver.begin(&store, TOPIC).unwrap(),
            ReplayAction::AlreadyResolving
        );
    }

    #[test]
    fn reset_allows_restart_from_last_confirmed_point() {
        let store = store_with_post(90);
        add_sample(&store, 100);
        add_sample(&store, 130);

        let mut resolver = RedeliveryResolver::new();
        assert!(matches!(
            resolver.begin(&store, TOPIC).unwrap(),
            ReplayAction::Publish { .. }
        ));

        // Publish failed mid-replay: no record was written.
        resolver.reset();

        // The reconnect re-trigger replays the same batch.
        let ReplayAction::Publish { payload, .. } = resolver.begin(&store, TOPIC).unwrap() else {
            panic!("expected replay to restart");
        };
        assert_eq!(batch_timestamps(&payload), vec![100, 130]);
    }
}
