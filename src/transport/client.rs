//! Unix-socket client for the acquisition daemon.
//!
//! Maintains the connection for the lifetime of the process: on loss it
//! reports `Disconnected` and retries with a fixed delay. Inbound lines are
//! parsed into [`Frame`]s; outbound command lines arrive over an mpsc
//! channel from the service loop.

use super::{Frame, TransportEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default socket the acquisition daemon listens on.
pub const ACQUISITION_SOCKET: &str = "/run/sensorgate/acquisition.sock";

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct TransportHandle {
    /// Serialized frames to write to the daemon, one line each.
    pub outgoing: mpsc::Sender<String>,
    _task: JoinHandle<()>,
}

pub struct TransportClient {
    path: PathBuf,
    events: mpsc::Sender<TransportEvent>,
    outgoing: mpsc::Receiver<String>,
}

impl TransportClient {
    /// Spawns the connect/read/write loop and returns the command handle.
    pub fn spawn(path: impl Into<PathBuf>, events: mpsc::Sender<TransportEvent>) -> TransportHandle {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(32);
        let client = Self {
            path: path.into(),
            events,
            outgoing: outgoing_rx,
        };
        let task = tokio::spawn(client.run());
        TransportHandle {
            outgoing: outgoing_tx,
            _task: task,
        }
    }

    async fn run(mut self) {
        loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    info!("connected to acquisition daemon at {}", self.path.display());
                    if self.events.send(TransportEvent::Connected).await.is_err() {
                        return;
                    }
                    self.session(stream).await;
                    if self.events.send(TransportEvent::Disconnected).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("acquisition socket unavailable: {e}");
                }
            }
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
    }

    /// Pumps one connected session until either side drops.
    async fn session(&mut self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            match Frame::parse(&line) {
                                Ok(frame) => {
                                    if self.events.send(TransportEvent::Frame(frame)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("dropping bad acquisition frame: {e}"),
                            }
                        }
                        Ok(None) => {
                            warn!("acquisition daemon closed the socket");
                            return;
                        }
                        Err(e) => {
                            warn!("acquisition socket read failed: {e}");
                            return;
                        }
                    }
                }
                command = self.outgoing.recv() => {
                    let Some(mut command) = command else { return };
                    command.push('\n');
                    if let Err(e) = write_half.write_all(command.as_bytes()).await {
                        warn!("acquisition socket write failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}
