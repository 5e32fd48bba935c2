//! Status reporting toward the external health collaborator.
//!
//! One global status code: 0 is healthy, nonzero identifies the failing
//! subsystem. Reports are coalesced; repeating the code already in effect
//! is a no-op, so one loss episode produces one report.

use tokio::sync::watch;
use tracing::{info, warn};

pub const STATUS_HEALTHY: u8 = 0;
pub const ERROR_SAVE_CONFIG: u8 = 0x30;
pub const ERROR_STORE_INIT: u8 = 0x31;
pub const ERROR_TRANSPORT_LOST: u8 = 0x32;
pub const ERROR_BROKER_LOST: u8 = 0x33;

pub struct StatusReporter {
    tx: watch::Sender<u8>,
}

impl StatusReporter {
    /// Returns the reporter and the receiver handed to the health collaborator.
    pub fn new() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(STATUS_HEALTHY);
        (Self { tx }, rx)
    }

    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }

    /// Reports `code`, suppressing duplicates of the current status.
    pub fn report(&self, code: u8, detail: &str) {
        if self.current() == code {
            return;
        }
        if code == STATUS_HEALTHY {
            info!("status recovered: {}", detail);
        } else {
            warn!(code = format!("{code:#04x}"), "status degraded: {}", detail);
        }
        let _ = self.tx.send(code);
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new().0
    }
}
