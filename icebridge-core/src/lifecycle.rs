//! Connection lifecycle state machine.
//!
//! [`Lifecycle`] owns no I/O and no clock. The connection driver reports
//! events with the current [`Instant`], calls [`Lifecycle::poll`] and carries
//! out the returned [`LifecycleAction`]s, then sleeps until
//! [`Lifecycle::next_deadline`].
//!
//! ```text
//! Connecting -> Active -> ShuttingDown -> Closed
//!      \          |            |
//!       +---------+------------+--> Failed
//! ```

use crate::options::{ConnectionOptions, IdleCheckMode, IdlePolicy};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Active,
    ShuttingDown,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Why a connection left the active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    Inactivity,
    IdleTimeout,
    PeerClosed,
    GracePeriodElapsed,
    TransportClosed,
    Failure(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "shutdown requested"),
            CloseReason::Inactivity => write!(f, "inactivity timeout"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::GracePeriodElapsed => write!(f, "shutdown grace period elapsed"),
            CloseReason::TransportClosed => write!(f, "transport closed"),
            CloseReason::Failure(message) => write!(f, "{message}"),
        }
    }
}

/// Work the driver must perform after [`Lifecycle::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Write a ValidateConnection heartbeat.
    SendValidate,
    /// Write CloseConnection, then report [`Lifecycle::on_close_sent`].
    SendClose,
    /// Both sides confirmed the close; shut the transport down.
    CloseTransport,
    /// Drop the transport and fail everything in flight.
    Abort(CloseReason),
    /// Nothing arrived for this long; log it and keep going.
    WarnIdle(Duration),
}

#[derive(Debug)]
pub struct Lifecycle {
    role: Role,
    state: ConnectionState,
    idle_timeout: Duration,
    idle_check_mode: IdleCheckMode,
    idle_policy: IdlePolicy,
    inactivity_timeout: Duration,
    grace_period: Duration,
    last_received: Instant,
    last_sent: Instant,
    last_activity: Instant,
    invocations: usize,
    dispatches: usize,
    idle_warned: bool,
    shutdown_started: Option<Instant>,
    close_reason: Option<CloseReason>,
    close_pending: bool,
    close_sent: bool,
    close_received: bool,
}

impl Lifecycle {
    pub fn new(role: Role, options: &ConnectionOptions, now: Instant) -> Self {
        Self {
            role,
            state: ConnectionState::Connecting,
            idle_timeout: options.idle_timeout,
            idle_check_mode: options.idle_check_mode,
            idle_policy: options.idle_policy,
            inactivity_timeout: options.inactivity_timeout,
            grace_period: options.shutdown_grace_period,
            last_received: now,
            last_sent: now,
            last_activity: now,
            invocations: 0,
            dispatches: 0,
            idle_warned: false,
            shutdown_started: None,
            close_reason: None,
            close_pending: false,
            close_sent: false,
            close_received: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Outstanding invocations plus running dispatches.
    pub fn in_flight(&self) -> usize {
        self.invocations + self.dispatches
    }

    /// New invocations are only issued on active connections.
    pub fn accepts_invocations(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Requests that arrive after our CloseConnection went out are ignored.
    pub fn accepts_requests(&self) -> bool {
        match self.state {
            ConnectionState::Active => true,
            ConnectionState::ShuttingDown => !self.close_pending && !self.close_sent,
            _ => false,
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// The handshake completed.
    pub fn on_connected(&mut self, now: Instant) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Active;
        self.last_received = now;
        self.last_sent = now;
        self.last_activity = now;
        true
    }

    /// Any frame arrived, heartbeats included.
    pub fn on_frame_received(&mut self, now: Instant) {
        self.last_received = now;
        self.idle_warned = false;
    }

    pub fn on_frame_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// An application frame (request or reply) moved in either direction.
    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn invocation_started(&mut self, now: Instant) {
        self.invocations += 1;
        self.last_activity = now;
    }

    pub fn invocation_finished(&mut self, now: Instant) {
        self.invocations = self.invocations.saturating_sub(1);
        self.last_activity = now;
    }

    pub fn dispatch_started(&mut self, now: Instant) {
        self.dispatches += 1;
        self.last_activity = now;
    }

    pub fn dispatch_finished(&mut self, now: Instant) {
        self.dispatches = self.dispatches.saturating_sub(1);
        self.last_activity = now;
    }

    /// Starts a graceful shutdown. Returns false if one is already under way
    /// or the connection is finished.
    pub fn request_shutdown(&mut self, now: Instant, reason: CloseReason) -> bool {
        match self.state {
            ConnectionState::Active => {
                self.begin_shutdown(now, reason);
                true
            }
            ConnectionState::Connecting => {
                self.state = ConnectionState::Closed;
                self.close_reason = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// The peer sent CloseConnection.
    pub fn on_peer_close(&mut self, now: Instant) {
        self.close_received = true;
        if self.state == ConnectionState::Active {
            self.begin_shutdown(now, CloseReason::PeerClosed);
        }
    }

    pub fn on_close_sent(&mut self, now: Instant) {
        self.close_pending = false;
        self.close_sent = true;
        self.last_sent = now;
    }

    /// The transport reached end of stream. Returns the resulting state.
    pub fn on_transport_closed(&mut self, _now: Instant) -> ConnectionState {
        match self.state {
            ConnectionState::ShuttingDown if self.close_sent || self.close_received => {
                self.state = ConnectionState::Closed;
            }
            ConnectionState::Closed | ConnectionState::Failed => {}
            _ => {
                self.state = ConnectionState::Failed;
                self.close_reason = Some(CloseReason::TransportClosed);
            }
        }
        self.state
    }

    /// Unrecoverable error. Returns false if already terminal.
    pub fn fail(&mut self, reason: CloseReason) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ConnectionState::Failed;
        self.close_reason = Some(reason);
        true
    }

    fn begin_shutdown(&mut self, now: Instant, reason: CloseReason) {
        self.state = ConnectionState::ShuttingDown;
        self.shutdown_started = Some(now);
        self.close_reason = Some(reason);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn idle_enabled(&self) -> bool {
        !self.idle_timeout.is_zero()
    }

    fn watches_receive_idle(&self) -> bool {
        match self.idle_check_mode {
            IdleCheckMode::ValidateAndRequire => true,
            IdleCheckMode::Heartbeat => match self.idle_policy {
                IdlePolicy::Close => true,
                IdlePolicy::Warn => !self.idle_warned,
            },
        }
    }

    fn ready_to_close(&self) -> bool {
        // A peer that sent CloseConnection will not answer our invocations.
        self.dispatches == 0 && (self.close_received || self.invocations == 0)
    }

    /// Advances timers and shutdown progress to `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();

        if self.state == ConnectionState::Active && self.idle_enabled() {
            if now >= self.last_received + self.idle_timeout {
                match (self.idle_check_mode, self.idle_policy) {
                    (IdleCheckMode::ValidateAndRequire, _) => {
                        self.fail(CloseReason::IdleTimeout);
                        actions.push(LifecycleAction::Abort(CloseReason::IdleTimeout));
                        return actions;
                    }
                    (IdleCheckMode::Heartbeat, IdlePolicy::Close) => {
                        self.begin_shutdown(now, CloseReason::IdleTimeout);
                    }
                    (IdleCheckMode::Heartbeat, IdlePolicy::Warn) => {
                        if !self.idle_warned {
                            self.idle_warned = true;
                            actions.push(LifecycleAction::WarnIdle(now - self.last_received));
                        }
                    }
                }
            }
            if self.state == ConnectionState::Active && now >= self.last_sent + self.idle_timeout / 2
            {
                self.last_sent = now;
                actions.push(LifecycleAction::SendValidate);
            }
        }

        if self.state == ConnectionState::Active
            && !self.inactivity_timeout.is_zero()
            && self.in_flight() == 0
            && now >= self.last_activity + self.inactivity_timeout
        {
            self.begin_shutdown(now, CloseReason::Inactivity);
        }

        if self.state == ConnectionState::ShuttingDown {
            let started = self.shutdown_started.unwrap_or(now);
            if now >= started + self.grace_period {
                self.state = ConnectionState::Closed;
                actions.push(LifecycleAction::Abort(CloseReason::GracePeriodElapsed));
                return actions;
            }
            if !self.close_sent && !self.close_pending && self.ready_to_close() {
                self.close_pending = true;
                actions.push(LifecycleAction::SendClose);
            }
            if self.close_sent && self.close_received {
                self.state = ConnectionState::Closed;
                actions.push(LifecycleAction::CloseTransport);
            }
        }

        actions
    }

    /// Earliest instant at which [`poll`](Self::poll) has timer work to do.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut deadlines = Vec::with_capacity(3);
        match self.state {
            ConnectionState::Active => {
                if self.idle_enabled() {
                    deadlines.push(self.last_sent + self.idle_timeout / 2);
                    if self.watches_receive_idle() {
                        deadlines.push(self.last_received + self.idle_timeout);
                    }
                }
                if !self.inactivity_timeout.is_zero() && self.in_flight() == 0 {
                    deadlines.push(self.last_activity + self.inactivity_timeout);
                }
            }
            ConnectionState::ShuttingDown => {
                let started = self.shutdown_started.unwrap_or(now);
                deadlines.push(started + self.grace_period);
            }
            _ => {}
        }
        deadlines.into_iter().min().map(|deadline| deadline.max(now))
    }
}
