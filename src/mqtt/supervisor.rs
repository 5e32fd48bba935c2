//! Connection supervisor state machine.
//!
//! Transitions are pure: `apply` maps (current state, event) to a new state
//! plus a list of side effects for the service loop to execute. Nothing in
//! here touches the network, which is what makes the loss-coalescing and
//! stale-timer rules directly testable.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^                           |
//!       |                     (loss signal)
//!       |                           v
//!       +--- Connecting <- ReconnectScheduled
//! ```
//!
//! Loss signals arriving while a reconnect is already scheduled are
//! no-ops, so a `closed` followed by a `disconnected` inside the delay
//! window schedules exactly one reconnection.
//!
//! Broker reconfiguration takes the intentional path: `DisconnectRequested`
//! parks the machine in `Disconnected` until the old session's close event
//! confirms, which reconnects immediately and without a loss report. The
//! reconnect timer armed alongside is the fallback if confirmation never
//! arrives; a confirmed disconnect bumps the generation and turns that
//! timer stale.

use super::ConnectionState;

/// Inputs to the supervisor, produced by the service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Startup or broker reconfiguration wants a (new) session.
    ConnectRequested,
    /// CONNACK arrived on the current session.
    BrokerConnected,
    /// closed / disconnected / errored from the current session.
    ConnectionLost,
    /// Reconfiguration asked the live session to disconnect; reconnect
    /// once its close event confirms, with a timed fallback.
    DisconnectRequested,
    /// The disconnect request itself could not be issued;
    /// fall back to a delayed reconnect.
    DisconnectFailed,
    /// A reconnect timer fired. Carries the generation it was armed with.
    ReconnectTimerFired { generation: u64 },
}

/// Effects the service loop executes after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Build a fresh broker session for the current generation.
    OpenSession,
    /// Subscribe `<tenant>/config/+/<device>` on the live session.
    SubscribeConfigTopic,
    /// Kick the redelivery resolver.
    StartRedelivery,
    /// Start the periodic flush ticker for the current generation.
    StartFlushTicker,
    /// One coalesced connection-lost report for this loss episode.
    ReportConnectionLost,
    /// Connection recovered; report healthy if the other subsystems are up.
    ReportConnected,
    /// Arm the single reconnect timer for this generation.
    ScheduleReconnect { generation: u64 },
}

#[derive(Debug, Default)]
pub struct Supervisor {
    state: ConnectionState,
    /// Bumped on every session open; tags sessions, timers and flush ticks
    /// so anything from a superseded attempt is discarded.
    generation: u64,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn apply(&mut self, event: SupervisorEvent) -> Vec<SideEffect> {
        match event {
            SupervisorEvent::ConnectRequested => {
                self.generation += 1;
                self.state = ConnectionState::Connecting;
                vec![SideEffect::OpenSession]
            }

            SupervisorEvent::BrokerConnected => match self.state {
                ConnectionState::Connecting => {
                    self.state = ConnectionState::Connected;
                    vec![
                        SideEffect::ReportConnected,
                        SideEffect::SubscribeConfigTopic,
                        SideEffect::StartRedelivery,
                        SideEffect::StartFlushTicker,
                    ]
                }
                // Duplicate CONNACK or late event from the current session.
                _ => vec![],
            },

            SupervisorEvent::ConnectionLost => match self.state {
                // Already handled this loss episode.
                ConnectionState::ReconnectScheduled => vec![],
                // Confirmation of a requested disconnect: reconnect right
                // away, no loss report for an intentional teardown.
                ConnectionState::Disconnected => {
                    self.generation += 1;
                    self.state = ConnectionState::Connecting;
                    vec![SideEffect::OpenSession]
                }
                _ => {
                    self.state = ConnectionState::ReconnectScheduled;
                    vec![
                        SideEffect::ReportConnectionLost,
                        SideEffect::ScheduleReconnect {
                            generation: self.generation,
                        },
                    ]
                }
            },

            SupervisorEvent::DisconnectRequested => {
                self.state = ConnectionState::Disconnected;
                // Fallback timer in case the close event never arrives.
                vec![SideEffect::ScheduleReconnect {
                    generation: self.generation,
                }]
            }

            SupervisorEvent::DisconnectFailed => {
                self.state = ConnectionState::ReconnectScheduled;
                vec![SideEffect::ScheduleReconnect {
                    generation: self.generation,
                }]
            }

            SupervisorEvent::ReconnectTimerFired { generation } => {
                // Stale-timer guard: a timer superseded by a later connect
                // (which bumped the generation) must not act. Disconnected
                // is the awaiting-close-confirmation window.
                let awaiting = matches!(
                    self.state,
                    ConnectionState::ReconnectScheduled | ConnectionState::Disconnected
                );
                if !awaiting || generation != self.generation {
                    return vec![];
                }
                self.generation += 1;
                self.state = ConnectionState::Connecting;
                vec![SideEffect::OpenSession]
            }
        }
    }
}
