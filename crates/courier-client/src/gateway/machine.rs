//! Connection state machine, free of any transport.
//!
//! The runner feeds [`Input`]s in and executes the returned [`Action`]s; every
//! transition is a plain function call so it can be tested without a socket.
//!
//! ```text
//! Idle → Connecting → Authenticating → Authenticated → Active
//!            ↑                                           │
//!            └──────────── Reconnecting ←────────────────┘
//! any open state → Closed
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use courier_core::events::{reasons, ClientEvent};

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

/// Reconnect schedule: `base × 2^(attempt-1)`, up to `max_attempts` attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before 1-based `attempt`, or `None` past the cap.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.base.saturating_mul(factor))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Why the gateway stopped for good.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner disconnected.
    Requested,
    /// Another device logged in.
    Superseded,
    /// The server ended the session (expiry, logout).
    SessionEnded(String),
    /// The handshake was refused.
    AuthFailed(String),
    /// A newer socket took over this session.
    Replaced,
    /// Reconnect attempts exhausted.
    GaveUp,
}

/// Connection lifecycle state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum GatewayState {
    /// Never connected.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, `authenticate` sent.
    Authenticating,
    /// Server confirmed; flushing the queue.
    Authenticated,
    /// Live.
    Active,
    /// Waiting before the next attempt.
    Reconnecting {
        /// 1-based attempt about to run.
        attempt: u32,
    },
    /// Stopped; timers cancelled.
    Closed(CloseReason),
}

impl GatewayState {
    /// Whether the machine has stopped.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Whether a transport should currently exist.
    fn has_transport(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Authenticated | Self::Active
        )
    }
}

/// Something the owner of the client should hear about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// "You were logged out elsewhere."
    SessionSuperseded,
    /// The credential is no longer accepted; log in again.
    AuthInvalid(String),
    /// Another socket took over this session.
    ConnectionReplaced,
    /// The server stayed unreachable.
    GaveUp {
        /// Attempts made.
        attempts: u32,
    },
}

/// Inputs the runner feeds in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// Start (or restart after `Closed`).
    Connect,
    /// The transport opened.
    TransportOpened,
    /// The server sent `authenticated`.
    Authenticated,
    /// The queue flush was written.
    Flushed,
    /// The transport failed, closed, or missed a pong.
    TransportLost,
    /// The server sent `authentication_failed`.
    AuthRejected(String),
    /// The server sent `session_invalidated`.
    Invalidated(String),
    /// The server sent `connection_replaced`.
    Replaced,
    /// The owner asked to stop.
    Disconnect,
    /// A scheduled retry fired.
    RetryDue,
}

/// Side effects the runner performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Open a new transport.
    OpenTransport,
    /// Send `authenticate` on the new transport.
    SendAuthenticate,
    /// Write these queued events, in order.
    Flush(Vec<ClientEvent>),
    /// Fire [`Input::RetryDue`] after the delay.
    ScheduleRetry(Duration),
    /// Close the transport and cancel pending retries.
    CloseTransport,
    /// Tell the owner.
    Notify(Notice),
}

/// Result of handing the machine an outbound event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// `Active`: write it now.
    SendNow(ClientEvent),
    /// Held until `Active`.
    Queued,
    /// Held; the queue was full and this older event was discarded.
    DroppedOldest(ClientEvent),
    /// `Closed`: nothing will ever send it.
    Rejected,
}

// ─────────────────────────────────────────────────────────────────────────────
// Machine
// ─────────────────────────────────────────────────────────────────────────────

/// The client gateway state machine.
#[derive(Debug)]
pub struct GatewayMachine {
    state: GatewayState,
    attempt: u32,
    backoff: BackoffPolicy,
    queue: VecDeque<ClientEvent>,
    queue_limit: usize,
}

impl GatewayMachine {
    /// New machine in `Idle`. `queue_limit` of `0` means unbounded.
    pub fn new(backoff: BackoffPolicy, queue_limit: usize) -> Self {
        Self {
            state: GatewayState::Idle,
            attempt: 0,
            backoff,
            queue: VecDeque::new(),
            queue_limit,
        }
    }

    /// Current state.
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Consecutive failed attempts since the last `Active`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Events waiting for `Active`.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Hand over an outbound event.
    pub fn enqueue(&mut self, event: ClientEvent) -> Enqueued {
        match self.state {
            GatewayState::Active => Enqueued::SendNow(event),
            GatewayState::Closed(_) => Enqueued::Rejected,
            _ => {
                let dropped = if self.queue_limit > 0 && self.queue.len() >= self.queue_limit {
                    self.queue.pop_front()
                } else {
                    None
                };
                self.queue.push_back(event);
                dropped.map_or(Enqueued::Queued, Enqueued::DroppedOldest)
            }
        }
    }

    /// Put events that failed to write back at the head of the queue.
    pub fn requeue(&mut self, events: Vec<ClientEvent>) {
        for event in events.into_iter().rev() {
            self.queue.push_front(event);
        }
        if self.queue_limit > 0 {
            while self.queue.len() > self.queue_limit {
                let _ = self.queue.pop_front();
            }
        }
    }

    /// Apply `input`, returning the actions to perform in order.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        use GatewayState as S;

        let current = self.state.clone();
        match (&current, input) {
            (S::Idle | S::Closed(_), Input::Connect) => {
                self.attempt = 0;
                self.state = S::Connecting;
                vec![Action::OpenTransport]
            }
            (S::Reconnecting { .. }, Input::RetryDue | Input::Connect) => {
                self.state = S::Connecting;
                vec![Action::OpenTransport]
            }
            (S::Connecting, Input::TransportOpened) => {
                self.state = S::Authenticating;
                vec![Action::SendAuthenticate]
            }
            (S::Authenticating, Input::Authenticated) => {
                self.state = S::Authenticated;
                vec![Action::Flush(self.queue.drain(..).collect())]
            }
            (S::Authenticated, Input::Flushed) => {
                self.state = S::Active;
                self.attempt = 0;
                if self.queue.is_empty() {
                    Vec::new()
                } else {
                    vec![Action::Flush(self.queue.drain(..).collect())]
                }
            }
            (state, Input::TransportLost) if state.has_transport() => self.retry(),
            (S::Authenticating, Input::AuthRejected(error)) => {
                self.close(CloseReason::AuthFailed(error.clone()), Some(Notice::AuthInvalid(error)))
            }
            (state, Input::Invalidated(reason)) if state.has_transport() => {
                if reason == reasons::SUPERSEDED {
                    self.close(CloseReason::Superseded, Some(Notice::SessionSuperseded))
                } else {
                    self.close(
                        CloseReason::SessionEnded(reason.clone()),
                        Some(Notice::AuthInvalid(reason)),
                    )
                }
            }
            (state, Input::Replaced) if state.has_transport() => {
                self.close(CloseReason::Replaced, Some(Notice::ConnectionReplaced))
            }
            (S::Closed(_), Input::Disconnect) => Vec::new(),
            (_, Input::Disconnect) => self.close(CloseReason::Requested, None),
            _ => Vec::new(),
        }
    }

    fn retry(&mut self) -> Vec<Action> {
        self.attempt = self.attempt.saturating_add(1);
        match self.backoff.delay(self.attempt) {
            Some(delay) => {
                self.state = GatewayState::Reconnecting {
                    attempt: self.attempt,
                };
                vec![Action::CloseTransport, Action::ScheduleRetry(delay)]
            }
            None => {
                let attempts = self.attempt - 1;
                self.close(CloseReason::GaveUp, Some(Notice::GaveUp { attempts }))
            }
        }
    }

    fn close(&mut self, reason: CloseReason, notice: Option<Notice>) -> Vec<Action> {
        self.state = GatewayState::Closed(reason);
        self.queue.clear();
        let mut actions = vec![Action::CloseTransport];
        actions.extend(notice.map(Action::Notify));
        actions
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
