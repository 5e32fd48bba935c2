//! Publish pipeline: QoS 1 publishes with durable confirmation records.
//!
//! A publish is only "done" when its PUBACK arrives. Pending publishes are
//! matched FIFO to the packet ids the client assigns (rumqttc reports them
//! as `Outgoing::Publish`), then confirmed by PUBACK pkid. Only a confirmed
//! publish writes a PostRecord; a failed send or a dropped connection
//! leaves the store untouched, so the affected samples stay unconfirmed and
//! are picked up by the next replay pass.

use super::ConnectionState;
use crate::store::{LogStore, PostRecord, StoreError};
use rumqttc::{AsyncClient, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The broker session is not connected. The caller retries through the
    /// reconnection flow; nothing is queued here.
    #[error("broker not connected")]
    NotConnected,

    #[error("broker rejected publish: {0}")]
    BrokerRejected(String),
}

#[derive(Debug)]
struct PendingPublish {
    topic: String,
    payload_len: usize,
    /// High-water mark to record on confirmation (replay path).
    /// Live publishes record wall-clock time instead.
    sample_ts: Option<i64>,
}

/// A confirmed delivery, handed back to the service loop.
#[derive(Debug, PartialEq)]
pub struct ConfirmedPublish {
    pub topic: String,
    pub sample_ts: i64,
    /// True when this was a replay batch; the resolver wants to know.
    pub was_replay: bool,
}

pub struct PublishPipeline {
    store: Option<Arc<LogStore>>,
    /// Sent to the client, no packet id assigned yet.
    queued: VecDeque<PendingPublish>,
    /// Packet id assigned, awaiting PUBACK.
    inflight: HashMap<u16, PendingPublish>,
    /// Live confirmations held back while a replay pass is pending.
    deferred: Vec<PostRecord>,
}

impl PublishPipeline {
    /// `store` is `None` when the gateway runs degraded; publishes still
    /// happen but no confirmation records are written.
    pub fn new(store: Option<Arc<LogStore>>) -> Self {
        Self {
            store,
            queued: VecDeque::new(),
            inflight: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    /// Publishes one payload at QoS 1. Fails fast when not connected.
    pub async fn publish(
        &mut self,
        state: ConnectionState,
        client: Option<&AsyncClient>,
        topic: &str,
        payload: Vec<u8>,
        sample_ts: Option<i64>,
    ) -> Result<(), PublishError> {
        let client = match (state, client) {
            (ConnectionState::Connected, Some(client)) => client,
            _ => return Err(PublishError::NotConnected),
        };

        let payload_len = payload.len();
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PublishError::BrokerRejected(e.to_string()))?;

        self.queued.push_back(PendingPublish {
            topic: topic.to_string(),
            payload_len,
            sample_ts,
        });
        Ok(())
    }

    /// The client assigned `pkid` to the oldest queued publish.
    pub fn on_queued(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(pending) => {
                self.inflight.insert(pkid, pending);
            }
            None => warn!(pkid, "packet id assigned with no queued publish"),
        }
    }

    /// PUBACK for `pkid`: write the durable record and report what was
    /// confirmed. An unknown pkid (e.g. after a reconnect) is ignored.
    ///
    /// While `replay_pending` is set, live confirmations are held back
    /// instead of written: a wall-clock record would advance the high-water
    /// mark past the backlog the replay pass is still confirming, and a
    /// disconnect before that pass completes would then skip the backlog
    /// forever. Held records are released by [`Self::flush_deferred`] once
    /// the resolver is idle again.
    pub fn on_confirmed(
        &mut self,
        pkid: u16,
        replay_pending: bool,
    ) -> Result<Option<ConfirmedPublish>, StoreError> {
        let Some(pending) = self.inflight.remove(&pkid) else {
            debug!(pkid, "puback for unknown packet id");
            return Ok(None);
        };

        let now = chrono::Utc::now().timestamp();
        let sample_ts = pending.sample_ts.unwrap_or(now);
        let record = PostRecord {
            topic: pending.topic.clone(),
            payload_len: pending.payload_len,
            sample_ts,
            real_ts: now,
        };

        if pending.sample_ts.is_none() && replay_pending {
            debug!(topic = record.topic, "holding live confirmation until replay catches up");
            self.deferred.push(record);
        } else if let Some(store) = &self.store {
            store.append_post_record(&record)?;
        }

        Ok(Some(ConfirmedPublish {
            topic: pending.topic,
            sample_ts,
            was_replay: pending.sample_ts.is_some(),
        }))
    }

    /// Writes the confirmations held back during a replay pass. Called once
    /// the resolver reports caught-up; at that point every older sample is
    /// confirmed, so the wall-clock records no longer hide a backlog.
    pub fn flush_deferred(&mut self) -> Result<usize, StoreError> {
        let records = std::mem::take(&mut self.deferred);
        let count = records.len();
        if let Some(store) = &self.store {
            for record in &records {
                store.append_post_record(record)?;
            }
        }
        Ok(count)
    }

    /// Connection dropped: everything unconfirmed stays unconfirmed.
    /// Packet ids are not stable across sessions, so the bookkeeping is
    /// cleared; the store keeps the samples for replay. Held live
    /// confirmations die with the session too: writing them after a loss
    /// would claim the unreplayed backlog as delivered, so their samples
    /// are re-published by the next replay pass instead.
    pub fn on_connection_lost(&mut self) {
        let pending = self.queued.len() + self.inflight.len();
        if pending > 0 {
            debug!(pending, "dropping unconfirmed publishes, replay will cover them");
        }
        if !self.deferred.is_empty() {
            debug!(held = self.deferred.len(), "dropping held live confirmations");
        }
        self.queued.clear();
        self.inflight.clear();
        self.deferred.clear();
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;

    fn test_client() -> (AsyncClient, rumqttc::EventLoop) {
        AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10)
    }

    fn store() -> Arc<LogStore> {
        Arc::new(LogStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn not_connected_fails_fast_and_stores_nothing() {
        let store = store();
        let mut pipeline = PublishPipeline::new(Some(store.clone()));
        let (client, _eventloop) = test_client();

        let err = pipeline
            .publish(
                ConnectionState::Disconnected,
                Some(&client),
                "a/sensors/dev",
                b"[]".to_vec(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
        assert_eq!(pipeline.pending_count(), 0);
        assert!(store.latest_post_record("a/sensors/dev").unwrap().is_none());
    }

    #[tokio::test]
    async fn confirmation_writes_replay_high_water_mark() {
        let store = store();
        let mut pipeline = PublishPipeline::new(Some(store.clone()));
        let (client, _eventloop) = test_client();

        pipeline
            .publish(
                ConnectionState::Connected,
                Some(&client),
                "a/sensors/dev",
                b"[1,2,3]".to_vec(),
                Some(160),
            )
            .await
            .unwrap();

        // No record until PUBACK.
        assert!(store.latest_post_record("a/sensors/dev").unwrap().is_none());

        pipeline.on_queued(7);
        let confirmed = pipeline.on_confirmed(7, false).unwrap().unwrap();
        assert!(confirmed.was_replay);
        assert_eq!(confirmed.sample_ts, 160);

        let record = store.latest_post_record("a/sensors/dev").unwrap().unwrap();
        assert_eq!(record.sample_ts, 160);
        assert_eq!(record.payload_len, 7);
    }

    #[tokio::test]
    async fn live_confirmation_records_wall_clock() {
        let store = store();
        let mut pipeline = PublishPipeline::new(Some(store.clone()));
        let (client, _eventloop) = test_client();

        let before = chrono::Utc::now().timestamp();
        pipeline
            .publish(
                ConnectionState::Connected,
                Some(&client),
                "a/sensors/dev",
                b"[]".to_vec(),
                None,
            )
            .await
            .unwrap();
        pipeline.on_queued(1);
        let confirmed = pipeline.on_confirmed(1, false).unwrap().unwrap();
        assert!(!confirmed.was_replay);

        let record = store.latest_post_record("a/sensors/dev").unwrap().unwrap();
        assert!(record.sample_ts >= before);
    }

    #[tokio::test]
    async fn connection_loss_leaves_store_unchanged() {
        let store = store();
        let mut pipeline = PublishPipeline::new(Some(store.clone()));
        let (client, _eventloop) = test_client();

        pipeline
            .publish(
                ConnectionState::Connected,
                Some(&client),
                "a/sensors/dev",
                b"[1]".to_vec(),
                Some(100),
            )
            .await
            .unwrap();
        pipeline.on_queued(3);

        pipeline.on_connection_lost();
        assert_eq!(pipeline.pending_count(), 0);

        // A late PUBACK from the dead session confirms nothing.
        assert_eq!(pipeline.on_confirmed(3, false).unwrap(), None);
        assert!(store.latest_post_record("a/sensors/dev").unwrap().is_none());
    }

    #[tokio::test]
    async fn live_confirmation_is_held_while_replay_pending() {
        let store = store();
        let mut pipeline = PublishPipeline::new(Some(store.clone()));
        let (client, _eventloop) = test_client();

        pipeline
            .publish(
                ConnectionState::Connected,
                Some(&client),
                "a/sensors/dev",
                b"[]".to_vec(),
                None,
            )
            .await
            .unwrap();
        pipeline.on_queued(1);

        // Replay still in flight: the wall-clock record must not advance
        // the high-water mark yet.
        let confirmed = pipeline.on_confirmed(1, true).unwrap().unwrap();
        assert!(!confirmed.was_replay);
        assert!(store.latest_post_record("a/sensors/dev").unwrap().is_none());

        // Replay caught up: the held record is released.
        assert_eq!(pipeline.flush_deferred().unwrap(), 1);
        let record = store.latest_post_record("a/sensors/dev").unwrap().unwrap();
        assert_eq!(record.sample_ts, confirmed.sample_ts);
    }

    #[tokio::test]
    async fn held_confirmations_die_with_the_session() {
        let store = store();
        let mut pipeline = PublishPipeline::new(Some(store.clone()));
        let (client, _eventloop) = test_client();

        pipeline
            .publish(
                ConnectionState::Connected,
                Some(&client),
                "a/sensors/dev",
                b"[]".to_vec(),
                None,
            )
            .await
            .unwrap();
        pipeline.on_queued(1);
        pipeline.on_confirmed(1, true).unwrap();

        // The connection dropped before replay finished; the held record
        // would have hidden the unreplayed backlog.
        pipeline.on_connection_lost();
        assert_eq!(pipeline.flush_deferred().unwrap(), 0);
        assert!(store.latest_post_record("a/sensors/dev").unwrap().is_none());
    }
}
