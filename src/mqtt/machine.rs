//! Broker connection lifecycle as an explicit state machine.
//!
//! ```text
//!                 start                 CONNACK + SUBACK
//! Disconnected ─────────► Connecting ───────────────────► Connected
//!      ▲                  │    ▲                           │
//!      │ stop (any)       │    │ delay elapsed             │ unexpected disconnect
//!      │                  │    │                           ▼
//!      │      failure     ▼    │                         Lost
//!      │  ┌──────────► Reconnecting(n, delay) ◄───────────┘
//!      │  │                 │
//!      │  └─ retries left   └─ budget exhausted ──► Failed
//! ```
//!
//! The machine is pure: every event goes through [`ConnectionMachine::handle`],
//! which returns the states entered and the I/O the driver should perform next.
//! Each dial gets a new generation number; events tagged with an older
//! generation are ignored, which is how callbacks from a superseded client
//! instance are kept from touching the current one.

use super::backoff::BackoffPolicy;
use crate::error::{ConfigError, TransportError};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

pub type Generation = u64;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Lost,
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Failed,
}

impl ConnectionState {
    /// True while a lifecycle started by `start` is still running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Lost
                | ConnectionState::Reconnecting { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Lost => write!(f, "connection lost"),
            ConnectionState::Reconnecting { attempt, delay } => write!(
                f,
                "retrying in {}s (attempt {attempt})",
                delay.as_secs_f64().ceil() as u64
            ),
            ConnectionState::Failed => write!(f, "failed, giving up"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    ConfigRejected(ConfigError),
    Connected { generation: Generation },
    ConnectFailed { generation: Generation, error: TransportError },
    Lost { generation: Generation, reason: TransportError },
    RetryElapsed { generation: Generation },
    Stop,
}

/// I/O the driver has to perform after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Dial { generation: Generation },
    Wait { generation: Generation, delay: Duration },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub transitions: Vec<ConnectionState>,
    pub command: Command,
}

impl Step {
    fn ignored() -> Self {
        Self {
            transitions: Vec::new(),
            command: Command::None,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    /// Consecutive retries since the last successful connect
    attempts: u32,
    generation: Generation,
    policy: BackoffPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            generation: 0,
            policy,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Whether payloads from `generation` may still reach the message handler.
    pub fn accepts(&self, generation: Generation) -> bool {
        generation == self.generation && self.state == ConnectionState::Connected
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Step {
        match event {
            ConnectionEvent::Start => {
                if self.state.is_active() {
                    debug!(state = %self.state, "start ignored, lifecycle already running");
                    return Step::ignored();
                }
                self.attempts = 0;
                self.dial()
            }
            ConnectionEvent::ConfigRejected(reason) => {
                if self.state.is_active() {
                    return Step::ignored();
                }
                warn!("connection config rejected: {}", reason);
                self.generation += 1;
                self.single(ConnectionState::Failed, Command::None)
            }
            ConnectionEvent::Connected { generation } => {
                if !self.is_current(generation, &ConnectionState::Connecting) {
                    return Step::ignored();
                }
                self.attempts = 0;
                self.single(ConnectionState::Connected, Command::None)
            }
            ConnectionEvent::ConnectFailed { generation, error } => {
                if !self.is_current(generation, &ConnectionState::Connecting) {
                    return Step::ignored();
                }
                self.handle_failure(error)
            }
            ConnectionEvent::Lost { generation, reason } => {
                if !self.is_current(generation, &ConnectionState::Connected) {
                    return Step::ignored();
                }
                self.handle_loss(reason)
            }
            ConnectionEvent::RetryElapsed { generation } => {
                if generation != self.generation
                    || !matches!(self.state, ConnectionState::Reconnecting { .. })
                {
                    debug!(generation, "stale retry timer ignored");
                    return Step::ignored();
                }
                self.dial()
            }
            ConnectionEvent::Stop => {
                // Invalidate whatever is still in flight, even when already idle.
                self.generation += 1;
                if self.state == ConnectionState::Disconnected {
                    return Step::ignored();
                }
                self.attempts = 0;
                self.single(ConnectionState::Disconnected, Command::Close)
            }
        }
    }

    fn is_current(&self, generation: Generation, expected: &ConnectionState) -> bool {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "event from superseded connection ignored"
            );
            return false;
        }
        &self.state == expected
    }

    fn dial(&mut self) -> Step {
        self.generation += 1;
        self.single(
            ConnectionState::Connecting,
            Command::Dial {
                generation: self.generation,
            },
        )
    }

    fn handle_failure(&mut self, error: TransportError) -> Step {
        warn!(attempts = self.attempts, "connect attempt failed: {}", error);
        self.schedule_retry()
    }

    fn handle_loss(&mut self, reason: TransportError) -> Step {
        warn!("connection lost: {}", reason);
        self.state = ConnectionState::Lost;
        let mut step = self.schedule_retry();
        step.transitions.insert(0, ConnectionState::Lost);
        step
    }

    fn schedule_retry(&mut self) -> Step {
        if self.policy.exhausted(self.attempts) {
            warn!(
                max_attempts = self.policy.max_attempts,
                "retry budget exhausted"
            );
            return self.single(ConnectionState::Failed, Command::None);
        }
        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        self.single(
            ConnectionState::Reconnecting {
                attempt: self.attempts,
                delay,
            },
            Command::Wait {
                generation: self.generation,
                delay,
            },
        )
    }

    fn single(&mut self, state: ConnectionState, command: Command) -> Step {
        self.state = state.clone();
        Step {
            transitions: vec![state],
            command,
        }
    }
}
