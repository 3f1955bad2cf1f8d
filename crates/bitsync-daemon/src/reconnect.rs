//! Redial schedule for known peer addresses.
//!
//! An address becomes known when we dial it, whether it came from the
//! config or from a CONNECTION_REFUSED peer list. Losing the connection
//! (or failing to make it) schedules the next attempt, each consecutive
//! failure waiting longer up to `max_delay`. An address that keeps failing
//! past `max_attempts` is forgotten.

use bitsync_core::HostPort;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Wait after the first failure
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth of the wait per consecutive failure
    pub backoff_factor: f64,
    /// Consecutive failures before the address is forgotten (unlimited if unset)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Wait that follows `previous`, or the initial wait.
    fn next_delay(&self, previous: Option<Duration>) -> Duration {
        let Some(previous) = previous else {
            return self.initial_delay.min(self.max_delay);
        };
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        Duration::try_from_secs_f64(previous.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What happens to an address after its connection failed or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Redial after this wait.
    After(Duration),
    /// Out of attempts; the address was forgotten.
    GaveUp,
    /// Not a known address.
    Unknown,
}

#[derive(Debug, Clone, Default)]
struct Schedule {
    failures: u32,
    delay: Option<Duration>,
    due_at: Option<Instant>,
}

/// Every address we may redial, with its own backoff.
#[derive(Debug, Default)]
pub struct KnownPeers {
    config: ReconnectConfig,
    addresses: HashMap<HostPort, Schedule>,
}

impl KnownPeers {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            addresses: HashMap::new(),
        }
    }

    /// Start tracking `host_port`. False if it was already known.
    pub fn remember(&mut self, host_port: HostPort) -> bool {
        if self.addresses.contains_key(&host_port) {
            return false;
        }
        self.addresses.insert(host_port, Schedule::default());
        true
    }

    pub fn contains(&self, host_port: &HostPort) -> bool {
        self.addresses.contains_key(host_port)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// A peer on `host_port` activated: the next loss starts from the
    /// initial wait again.
    pub fn connected(&mut self, host_port: &HostPort) {
        if let Some(schedule) = self.addresses.get_mut(host_port) {
            *schedule = Schedule::default();
        }
    }

    /// Dialling `host_port` failed, or its connection dropped.
    pub fn lost(&mut self, host_port: &HostPort, now: Instant) -> Retry {
        let Some(schedule) = self.addresses.get_mut(host_port) else {
            return Retry::Unknown;
        };
        if self
            .config
            .max_attempts
            .is_some_and(|max| schedule.failures >= max)
        {
            self.addresses.remove(host_port);
            return Retry::GaveUp;
        }
        let delay = self.config.next_delay(schedule.delay);
        schedule.failures += 1;
        schedule.delay = Some(delay);
        schedule.due_at = Some(now + delay);
        Retry::After(delay)
    }

    /// Addresses whose wait is over, sorted.
    pub fn due(&self, now: Instant) -> Vec<HostPort> {
        let mut due: Vec<HostPort> = self
            .addresses
            .iter()
            .filter(|(_, s)| s.due_at.is_some_and(|at| at <= now))
            .map(|(hp, _)| hp.clone())
            .collect();
        due.sort();
        due
    }

    /// A redial of `host_port` is starting; it is not due again until the
    /// next loss.
    pub fn take(&mut self, host_port: &HostPort) {
        if let Some(schedule) = self.addresses.get_mut(host_port) {
            schedule.due_at = None;
        }
    }
}
