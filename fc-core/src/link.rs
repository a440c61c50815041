//! Self-healing outbound TCP links
//!
//! Each link is a dedicated task that owns one [`ConnectionHandle`] and is fed
//! through a bounded channel. Publishing never blocks: a full queue drops the
//! message. A failed write marks the connection down, and the task reconnects
//! on its own cadence while the rest of the process keeps going.
//!
//! # Retry policy
//!
//! - [`RetryPolicy::Unbounded`]: retry forever.
//! - [`RetryPolicy::Bounded`]: give up after `n` failed attempts in one outage.
//!   The first message published after giving up re-arms the budget once.

use std::time::{Duration, Instant};

use fc_error::{FanctlError, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::constants::{network, timing};

/// How many reconnect attempts a link makes per outage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Unbounded,
    Bounded(u32),
}

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    /// Bounded retry budget exhausted; waiting for the next message
    GaveUp,
}

// ============================================================================
// Connection Handle
// ============================================================================

/// One outbound TCP connection and its retry bookkeeping
#[derive(Debug)]
pub struct ConnectionHandle {
    peer: String,
    socket: Option<TcpStream>,
    last_attempt: Option<Instant>,
    failed_attempts: u32,
    policy: RetryPolicy,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl ConnectionHandle {
    /// `peer` is a `host:port` string resolved on every connect
    pub fn new(peer: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            peer: peer.into(),
            socket: None,
            last_attempt: None,
            failed_attempts: 0,
            policy,
            connect_timeout: timing::CONNECT_TIMEOUT,
            write_timeout: timing::WRITE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_up(&self) -> bool {
        self.socket.is_some()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// Whether the retry budget allows another connect attempt
    pub fn may_retry(&self) -> bool {
        match self.policy {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Bounded(limit) => self.failed_attempts < limit,
        }
    }

    /// Restore the full retry budget
    pub fn rearm(&mut self) {
        self.failed_attempts = 0;
    }

    /// A message was dropped because the link is down
    ///
    /// Only a link that already gave up gets a fresh budget; an outage still
    /// being retried keeps counting toward its limit.
    pub fn message_dropped(&mut self) {
        if self.state() == LinkState::GaveUp {
            self.rearm();
        }
    }

    pub fn state(&self) -> LinkState {
        if self.is_up() {
            LinkState::Up
        } else if self.may_retry() {
            LinkState::Down
        } else {
            LinkState::GaveUp
        }
    }

    /// Make one connect attempt
    pub async fn connect(&mut self) -> Result<()> {
        self.last_attempt = Some(Instant::now());

        let attempt = time::timeout(self.connect_timeout, TcpStream::connect(&self.peer)).await;
        let result = match attempt {
            Ok(Ok(stream)) => {
                // Best effort; commands are tiny and undelimited
                let _ = stream.set_nodelay(true);
                self.socket = Some(stream);
                self.failed_attempts = 0;
                return Ok(());
            }
            Ok(Err(e)) => FanctlError::connection(&self.peer, e),
            Err(_) => FanctlError::Timeout(format!("connect to {}", self.peer)),
        };

        self.failed_attempts = self.failed_attempts.saturating_add(1);
        Err(result)
    }

    /// Single write attempt; on failure the connection is dropped
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self
            .socket
            .as_mut()
            .ok_or_else(|| FanctlError::NotConnected(self.peer.clone()))?;

        let err = match time::timeout(self.write_timeout, stream.write_all(payload)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => FanctlError::connection(&self.peer, e),
            Err(_) => FanctlError::Timeout(format!("write to {}", self.peer)),
        };

        self.mark_down();
        Err(err)
    }

    pub fn mark_down(&mut self) {
        self.socket = None;
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.socket.take() {
            let _ = stream.shutdown().await;
        }
    }
}

// ============================================================================
// Link Task
// ============================================================================

/// Settings for one link task
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub policy: RetryPolicy,
    pub reconnect_interval: Duration,
    pub queue_depth: usize,
    /// Resend the most recent message after every reconnect
    pub replay_last: bool,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl LinkOptions {
    /// Fire-and-forget telemetry
    pub fn telemetry(policy: RetryPolicy) -> Self {
        Self {
            policy,
            reconnect_interval: Duration::from_secs(timing::RECONNECT_INTERVAL_SECS),
            queue_depth: network::LINK_QUEUE_DEPTH,
            replay_last: false,
            connect_timeout: timing::CONNECT_TIMEOUT,
            write_timeout: timing::WRITE_TIMEOUT,
        }
    }

    /// Duty commands; a reconnecting node receives the latest decision
    pub fn command() -> Self {
        Self {
            replay_last: true,
            ..Self::telemetry(RetryPolicy::Unbounded)
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

/// Sending side of a link task
#[derive(Debug, Clone)]
pub struct LinkHandle {
    name: String,
    tx: mpsc::Sender<String>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a message without waiting; returns false if it was dropped
    pub fn publish(&self, message: impl Into<String>) -> bool {
        match self.tx.try_send(message.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(link = %self.name, "Link queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(link = %self.name, "Link closed, dropping message");
                false
            }
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

/// Spawn a link task to `peer`
///
/// The task runs until `shutdown` flips to true or every [`LinkHandle`] is dropped.
pub fn spawn_link(
    name: impl Into<String>,
    peer: impl Into<String>,
    options: LinkOptions,
    shutdown: watch::Receiver<bool>,
) -> (LinkHandle, JoinHandle<()>) {
    let name = name.into();
    let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
    let (state_tx, state_rx) = watch::channel(LinkState::Down);

    let handle = ConnectionHandle::new(peer, options.policy)
        .with_timeouts(options.connect_timeout, options.write_timeout);

    let task = tokio::spawn(run_link(name.clone(), handle, rx, options, state_tx, shutdown));

    (
        LinkHandle {
            name,
            tx,
            state: state_rx,
        },
        task,
    )
}

async fn run_link(
    name: String,
    mut handle: ConnectionHandle,
    mut rx: mpsc::Receiver<String>,
    options: LinkOptions,
    state_tx: watch::Sender<LinkState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last: Option<String> = None;
    let mut retry = time::interval(options.reconnect_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    retry.reset();

    attempt_connect(&name, &mut handle, None).await;
    state_tx.send_replace(handle.state());

    loop {
        let was_up = handle.is_up();

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = rx.recv() => {
                let Some(message) = message else { break };
                if handle.is_up() {
                    if let Err(e) = handle.send(message.as_bytes()).await {
                        warn!(link = %name, peer = %handle.peer(), error = %e, "Send failed, link down");
                    }
                } else {
                    handle.message_dropped();
                    trace!(link = %name, "Link down, message not sent");
                }
                if options.replay_last {
                    last = Some(message);
                }
            }
            _ = retry.tick(), if !handle.is_up() && handle.may_retry() => {
                attempt_connect(&name, &mut handle, last.as_deref()).await;
            }
        }

        if was_up && !handle.is_up() {
            retry.reset();
        }
        let state = handle.state();
        if *state_tx.borrow() != state {
            if state == LinkState::GaveUp {
                warn!(link = %name, peer = %handle.peer(), "Retry budget exhausted, waiting for next message");
            }
            state_tx.send_replace(state);
        }
    }

    handle.close().await;
    state_tx.send_replace(LinkState::Down);
    debug!(link = %name, "Link task stopped");
}

async fn attempt_connect(name: &str, handle: &mut ConnectionHandle, replay: Option<&str>) {
    match handle.connect().await {
        Ok(()) => {
            info!(link = %name, peer = %handle.peer(), "Link connected");
            if let Some(message) = replay {
                if let Err(e) = handle.send(message.as_bytes()).await {
                    warn!(link = %name, error = %e, "Replay after reconnect failed");
                }
            }
        }
        Err(e) => {
            let failures = handle.failed_attempts();
            if failures == 1 || failures % timing::ERROR_LOG_EVERY == 0 {
                warn!(link = %name, failures = failures, error = %e, "Connect failed");
            } else {
                trace!(link = %name, failures = failures, error = %e, "Connect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_budget_and_rearm() {
        let mut handle = ConnectionHandle::new("127.0.0.1:1", RetryPolicy::Bounded(2));
        assert!(handle.may_retry());
        handle.failed_attempts = 2;
        assert!(!handle.may_retry());
        assert_eq!(handle.state(), LinkState::GaveUp);
        handle.rearm();
        assert_eq!(handle.state(), LinkState::Down);
    }

    #[test]
    fn test_dropped_message_rearms_only_after_giving_up() {
        let mut handle = ConnectionHandle::new("127.0.0.1:1", RetryPolicy::Bounded(3));
        handle.failed_attempts = 2;
        handle.message_dropped();
        assert_eq!(handle.failed_attempts(), 2);

        handle.failed_attempts = 3;
        assert_eq!(handle.state(), LinkState::GaveUp);
        handle.message_dropped();
        assert_eq!(handle.failed_attempts(), 0);
        assert_eq!(handle.state(), LinkState::Down);
    }

    #[test]
    fn test_unbounded_never_gives_up() {
        let mut handle = ConnectionHandle::new("127.0.0.1:1", RetryPolicy::Unbounded);
        handle.failed_attempts = u32::MAX;
        assert!(handle.may_retry());
    }

    #[tokio::test]
    async fn test_send_while_down_is_not_connected() {
        let mut handle = ConnectionHandle::new("127.0.0.1:1", RetryPolicy::Unbounded);
        let err = handle.send(b"50").await.unwrap_err();
        assert_eq!(err.kind(), fc_error::ErrorKind::Connectivity);
    }

    #[test]
    fn test_command_options_replay() {
        let options = LinkOptions::command();
        assert!(options.replay_last);
        assert_eq!(options.policy, RetryPolicy::Unbounded);
        assert!(!LinkOptions::telemetry(RetryPolicy::Bounded(5)).replay_last);
    }
}
