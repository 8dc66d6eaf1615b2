//! Connection state ownership.
//!
//! [`ConnectionSupervisor`] is the only place that changes the
//! [`ConnectionState`]. It turns transport events and handshake progress into
//! transitions and publishes a [`ConnectionStatus`] on a `watch` channel for
//! the host UI.
//!
//! ```text
//! Connecting ──open──► Connected ──step1 sent──► Syncing ──both steps──► Synced
//!     ▲                    │                        │                      │
//!     └──── reconnect ◄── Disconnected ◄────────────┴──────────────────────┘
//!                                      fail() ──► Error (terminal)
//! ```

use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::awareness::AwarenessStore;
use crate::transport::TransportEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Syncing,
    Synced,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// Whether a socket is currently open.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Syncing | Self::Synced)
    }
}

/// Published connection status.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Smoothed round-trip time of the heartbeat
    pub rtt: Option<Duration>,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Connecting,
            rtt: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ping_interval: Duration,
    pub sweep_interval: Duration,
    /// Weight of a new RTT sample in the moving average
    pub rtt_smoothing: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            rtt_smoothing: 0.2,
        }
    }
}

impl SupervisorConfig {
    pub fn for_testing() -> Self {
        Self {
            ping_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
            rtt_smoothing: 0.2,
        }
    }
}

#[derive(Debug, Default)]
struct Handshake {
    received_step2: bool,
    answered_step1: bool,
}

pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    status: watch::Sender<ConnectionStatus>,
    handshake: Handshake,
    next_nonce: u64,
    outstanding_ping: Option<(u64, Instant)>,
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status, rx) = watch::channel(ConnectionStatus::default());
        (
            Self {
                config,
                status,
                handshake: Handshake::default(),
                next_nonce: 1,
                outstanding_ping: None,
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    fn transition(&mut self, state: ConnectionState) {
        self.status.send_modify(|status| {
            if status.state != state {
                debug!("Connection {:?} -> {:?}", status.state, state);
                status.state = state;
            }
        });
    }

    /// Apply a transport event. Events after a fatal error are ignored.
    pub fn on_transport_event(&mut self, event: &TransportEvent) {
        if self.state() == ConnectionState::Error {
            return;
        }
        match event {
            TransportEvent::Connecting { .. } => self.transition(ConnectionState::Connecting),
            TransportEvent::Open => {
                self.handshake = Handshake::default();
                self.outstanding_ping = None;
                self.transition(ConnectionState::Connected);
            }
            TransportEvent::Closed { .. } | TransportEvent::ReconnectScheduled { .. } => {
                self.transition(ConnectionState::Disconnected);
            }
            TransportEvent::Error(e) => {
                let message = e.to_string();
                self.status.send_modify(|status| status.last_error = Some(message));
                if self.state() == ConnectionState::Connecting {
                    self.transition(ConnectionState::Disconnected);
                }
            }
            TransportEvent::Message(_) => {}
        }
    }

    /// Our sync step 1 went out.
    pub fn handshake_started(&mut self) {
        if self.state() == ConnectionState::Connected {
            self.transition(ConnectionState::Syncing);
        }
    }

    /// The peer's sync step 2 arrived.
    pub fn on_step2_received(&mut self) {
        self.handshake.received_step2 = true;
        self.check_synced();
    }

    /// We answered the peer's sync step 1.
    pub fn on_step1_answered(&mut self) {
        self.handshake.answered_step1 = true;
        self.check_synced();
    }

    fn check_synced(&mut self) {
        if self.state() == ConnectionState::Syncing
            && self.handshake.received_step2
            && self.handshake.answered_step1
        {
            info!("Handshake complete");
            self.transition(ConnectionState::Synced);
        }
    }

    /// Fatal failure. The state stays `Error` from here on.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Connection failed: {}", reason);
        self.status.send_modify(|status| {
            status.state = ConnectionState::Error;
            status.last_error = Some(reason);
        });
    }

    /// Session ended normally.
    pub fn stopped(&mut self) {
        if self.state() != ConnectionState::Error {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Nonce for the next heartbeat ping. Replaces any unanswered ping.
    pub fn next_ping(&mut self, now: Instant) -> u64 {
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.outstanding_ping = Some((nonce, now));
        nonce
    }

    /// Record a pong. Returns the sample if it matched the outstanding ping.
    pub fn on_pong(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        let (expected, sent_at) = self.outstanding_ping?;
        if expected != nonce {
            debug!("Ignoring stale pong {} (waiting for {})", nonce, expected);
            return None;
        }
        self.outstanding_ping = None;
        let sample = now.saturating_duration_since(sent_at);
        let alpha = self.config.rtt_smoothing;
        self.status.send_modify(|status| {
            status.rtt = Some(match status.rtt {
                Some(rtt) => rtt.mul_f64(1.0 - alpha) + sample.mul_f64(alpha),
                None => sample,
            });
        });
        Some(sample)
    }

    /// Expire silent awareness entries. Returns the removed client ids.
    pub fn sweep_awareness(&self, store: &mut AwarenessStore, now: Instant) -> Vec<Uuid> {
        let removed = store.sweep_expired(now);
        for id in &removed {
            debug!("Awareness entry {} timed out", id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    fn supervisor() -> (ConnectionSupervisor, watch::Receiver<ConnectionStatus>) {
        ConnectionSupervisor::new(SupervisorConfig::for_testing())
    }

    #[test]
    fn test_handshake_needs_both_directions() {
        let (mut sup, rx) = supervisor();
        sup.on_transport_event(&TransportEvent::Open);
        assert_eq!(rx.borrow().state, ConnectionState::Connected);

        sup.handshake_started();
        assert_eq!(sup.state(), ConnectionState::Syncing);

        sup.on_step2_received();
        assert_eq!(sup.state(), ConnectionState::Syncing);
        sup.on_step1_answered();
        assert_eq!(rx.borrow().state, ConnectionState::Synced);
    }

    #[test]
    fn test_reconnect_resets_handshake() {
        let (mut sup, _rx) = supervisor();
        sup.on_transport_event(&TransportEvent::Open);
        sup.handshake_started();
        sup.on_step2_received();
        sup.on_step1_answered();

        sup.on_transport_event(&TransportEvent::Closed { reason: None });
        assert_eq!(sup.state(), ConnectionState::Disconnected);

        sup.on_transport_event(&TransportEvent::Connecting { attempt: 1 });
        sup.on_transport_event(&TransportEvent::Open);
        sup.handshake_started();
        sup.on_step1_answered();
        assert_eq!(sup.state(), ConnectionState::Syncing);
    }

    #[test]
    fn test_connect_error_recorded() {
        let (mut sup, _rx) = supervisor();
        sup.on_transport_event(&TransportEvent::Error(TransportError::Timeout));
        let status = sup.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.last_error.as_deref(), Some("Connect timed out"));
    }

    #[test]
    fn test_error_state_is_terminal() {
        let (mut sup, _rx) = supervisor();
        sup.fail("version mismatch");
        sup.on_transport_event(&TransportEvent::Open);
        sup.stopped();
        assert_eq!(sup.state(), ConnectionState::Error);
    }

    #[test]
    fn test_rtt_is_smoothed() {
        let (mut sup, _rx) = supervisor();
        let start = Instant::now();

        let nonce = sup.next_ping(start);
        assert_eq!(sup.on_pong(nonce, start + Duration::from_millis(100)), Some(Duration::from_millis(100)));
        assert_eq!(sup.status().rtt, Some(Duration::from_millis(100)));

        let nonce = sup.next_ping(start);
        sup.on_pong(nonce, start + Duration::from_millis(200));
        let rtt = sup.status().rtt.unwrap();
        assert!(rtt > Duration::from_millis(115) && rtt < Duration::from_millis(125), "{:?}", rtt);
    }

    #[test]
    fn test_mismatched_pong_ignored() {
        let (mut sup, _rx) = supervisor();
        let now = Instant::now();
        let nonce = sup.next_ping(now);
        assert_eq!(sup.on_pong(nonce + 1, now), None);
        assert_eq!(sup.status().rtt, None);
    }
}
