//! Outbound configuration command queue.
//!
//! One command is in flight at a time; the next is released by ACK/NACK
//! from the acquisition daemon. An unanswered command is re-sent on a fixed
//! timeout a bounded number of times, then dropped so the queue can never
//! wedge behind a dead command.

use std::collections::VecDeque;
use std::time::Duration;

pub const COMMAND_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug)]
struct Inflight {
    line: String,
    attempts: u32,
    seq: u64,
}

/// Outcome of a retry-timer expiry.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-send this line and arm a new retry timer with the given sequence.
    Resend { line: String, seq: u64 },
    /// The command exhausted its attempts and was discarded.
    Dropped(String),
    /// The timer was stale (command already answered or superseded).
    Idle,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    queue: VecDeque<String>,
    inflight: Option<Inflight>,
    next_seq: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, line: String) {
        self.queue.push_back(line);
    }

    /// Releases the next command if nothing is in flight.
    /// Returns the line to send plus the retry-timer sequence for it.
    pub fn next_to_send(&mut self) -> Option<(String, u64)> {
        if self.inflight.is_some() {
            return None;
        }
        let line = self.queue.pop_front()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight = Some(Inflight {
            line: line.clone(),
            attempts: 1,
            seq,
        });
        Some((line, seq))
    }

    /// ACK or NACK for the in-flight command.
    pub fn acknowledge(&mut self) -> Option<String> {
        self.inflight.take().map(|inflight| inflight.line)
    }

    /// Retry timer with sequence `seq` fired.
    pub fn retry(&mut self, seq: u64) -> RetryOutcome {
        let Some(mut inflight) = self.inflight.take() else {
            return RetryOutcome::Idle;
        };
        if inflight.seq != seq {
            self.inflight = Some(inflight);
            return RetryOutcome::Idle;
        }
        if inflight.attempts >= MAX_ATTEMPTS {
            return RetryOutcome::Dropped(inflight.line);
        }
        inflight.attempts += 1;
        let new_seq = self.next_seq;
        self.next_seq += 1;
        inflight.seq = new_seq;
        let line = inflight.line.clone();
        self.inflight = Some(inflight);
        RetryOutcome::Resend { line, seq: new_seq }
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_none() && self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_command_in_flight_at_a_time() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a".to_string());
        queue.enqueue("b".to_string());

        let (line, _) = queue.next_to_send().unwrap();
        assert_eq!(line, "a");
        assert!(queue.next_to_send().is_none());

        assert_eq!(queue.acknowledge().unwrap(), "a");
        let (line, _) = queue.next_to_send().unwrap();
        assert_eq!(line, "b");
    }

    #[test]
    fn retry_is_bounded() {
        let mut queue = CommandQueue::new();
        queue.enqueue("cmd".to_string());
        let (_, seq) = queue.next_to_send().unwrap();

        let RetryOutcome::Resend { seq, .. } = queue.retry(seq) else {
            panic!("expected first resend");
        };
        let RetryOutcome::Resend { seq, .. } = queue.retry(seq) else {
            panic!("expected second resend");
        };
        assert_eq!(queue.retry(seq), RetryOutcome::Dropped("cmd".to_string()));
        assert!(queue.is_idle());
    }

    #[test]
    fn stale_retry_timer_is_ignored() {
        let mut queue = CommandQueue::new();
        queue.enqueue("a".to_string());
        let (_, old_seq) = queue.next_to_send().unwrap();

        // Answered before the timer fired.
        queue.acknowledge();
        assert_eq!(queue.retry(old_seq), RetryOutcome::Idle);

        // A different command in flight must not be retried early by the
        // old timer.
        queue.enqueue("b".to_string());
        let (_, new_seq) = queue.next_to_send().unwrap();
        assert_eq!(queue.retry(old_seq), RetryOutcome::Idle);
        assert!(matches!(queue.retry(new_seq), RetryOutcome::Resend { .. }));
    }
}
