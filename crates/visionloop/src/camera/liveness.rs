//! Camera liveness tracking with bounded exponential reconnect backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RuntimeConfig;
use crate::error::CaptureError;

/// Liveness of a camera's capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    Connected,
    Disconnected,
    /// The device is missing or could not be opened
    Error,
}

/// Reconnect backoff parameters
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures after which probing stops until re-armed
    pub max_failures: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            max_failures: config.max_consecutive_failures,
        }
    }

    /// Delay before the probe following the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// What the capture loop should do before its next capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Device is healthy, capture normally
    Capture,
    /// Backoff elapsed, attempt a reconnect
    Probe,
    /// Still inside the backoff window
    Wait(Duration),
    /// Retry budget spent; stays disconnected until re-armed
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    state: LivenessState,
    consecutive_failures: u32,
    next_probe_at: Option<Instant>,
    last_error: Option<String>,
    policy: BackoffPolicy,
}

impl Liveness {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: LivenessState::Connected,
            consecutive_failures: 0,
            next_probe_at: None,
            last_error: None,
            policy,
        }
    }

    /// Start in the error state, e.g. when the device failed to open.
    pub fn failed(policy: BackoffPolicy, reason: impl Into<String>) -> Self {
        let mut liveness = Self::new(policy);
        liveness.state = LivenessState::Error;
        liveness.consecutive_failures = 1;
        liveness.next_probe_at = Some(Instant::now() + policy.delay(1));
        liveness.last_error = Some(reason.into());
        liveness
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state != LivenessState::Connected
            && self.consecutive_failures >= self.policy.max_failures
    }

    pub fn decide(&self, now: Instant) -> ProbeDecision {
        if self.state == LivenessState::Connected {
            return ProbeDecision::Capture;
        }
        if self.is_exhausted() {
            return ProbeDecision::Exhausted;
        }
        match self.next_probe_at {
            Some(at) if at > now => ProbeDecision::Wait(at - now),
            _ => ProbeDecision::Probe,
        }
    }

    /// Record a successful capture or reconnect. Returns true on a state change.
    pub fn record_success(&mut self) -> bool {
        let changed = self.state != LivenessState::Connected;
        self.state = LivenessState::Connected;
        self.consecutive_failures = 0;
        self.next_probe_at = None;
        self.last_error = None;
        changed
    }

    /// Record a failed capture or probe. Returns true on a state change.
    pub fn record_failure(&mut self, err: &CaptureError, now: Instant) -> bool {
        let next = match err {
            CaptureError::Unavailable(_) => LivenessState::Error,
            _ => LivenessState::Disconnected,
        };
        let changed = self.state != next;
        self.state = next;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.next_probe_at = Some(now + self.policy.delay(self.consecutive_failures));
        self.last_error = Some(err.to_string());
        changed
    }

    /// Reset the retry budget so probing resumes immediately.
    pub fn rearm(&mut self) {
        if self.state != LivenessState::Connected {
            self.consecutive_failures = 0;
            self.next_probe_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            max_failures: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_millis(1_000));
        assert_eq!(p.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_failure_then_reconnect() {
        let mut liveness = Liveness::new(policy());
        let now = Instant::now();
        assert_eq!(liveness.decide(now), ProbeDecision::Capture);

        assert!(liveness.record_failure(&CaptureError::Timeout(500), now));
        assert_eq!(liveness.state(), LivenessState::Disconnected);
        assert_eq!(
            liveness.decide(now),
            ProbeDecision::Wait(Duration::from_millis(100))
        );
        assert_eq!(
            liveness.decide(now + Duration::from_millis(100)),
            ProbeDecision::Probe
        );

        assert!(liveness.record_success());
        assert_eq!(liveness.state(), LivenessState::Connected);
        assert_eq!(liveness.consecutive_failures(), 0);
    }

    #[test]
    fn test_exhaustion_and_rearm() {
        let mut liveness = Liveness::new(policy());
        let now = Instant::now();
        for _ in 0..3 {
            liveness.record_failure(&CaptureError::Device("io".into()), now);
        }
        assert!(liveness.is_exhausted());
        assert_eq!(
            liveness.decide(now + Duration::from_secs(60)),
            ProbeDecision::Exhausted
        );
        // Never deleted, just parked as disconnected
        assert_eq!(liveness.state(), LivenessState::Disconnected);

        liveness.rearm();
        assert_eq!(liveness.decide(now), ProbeDecision::Probe);
    }

    #[test]
    fn test_unavailable_device_is_error_state() {
        let mut liveness = Liveness::new(policy());
        liveness.record_failure(&CaptureError::Unavailable("unplugged".into()), Instant::now());
        assert_eq!(liveness.state(), LivenessState::Error);
        assert_eq!(liveness.last_error(), Some("Device unavailable: unplugged"));
    }
}
