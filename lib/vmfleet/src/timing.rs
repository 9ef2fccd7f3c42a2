// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry bounds, sleep durations, and the adaptive communication delay.

use std::time::Duration;

/// A multiplier applied to guest communication timeouts.
///
/// Guests that are slow to show up in the ARP table are usually slow to
/// answer on their console as well, so every IP discovery reports a delay
/// derived from how long it took and the caller keeps the largest one seen.
/// The value never decreases during an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommDelay(u32);

impl CommDelay {
    pub const BASE: Self = Self(1);

    /// The delay implied by an IP discovery that needed `attempts` failed
    /// polls before it succeeded.
    pub fn from_attempts(attempts: u32) -> Self {
        Self(attempts / 5 + 1)
    }

    pub fn factor(self) -> u32 {
        self.0
    }

    /// Returns the larger of `self` and `other`.
    #[must_use]
    pub fn raise_to(self, other: Self) -> Self {
        self.max(other)
    }

    /// Scales `base` by this multiplier.
    pub fn scale(self, base: Duration) -> Duration {
        base.saturating_mul(self.0)
    }
}

impl Default for CommDelay {
    fn default() -> Self {
        Self::BASE
    }
}

impl std::fmt::Display for CommDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Every retry bound and sleep used while driving guests.
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// ARP polls made while waiting for a guest's MAC to appear.
    pub arp_attempts: u32,
    pub arp_interval: Duration,

    /// Pings made while waiting for a freshly booted guest to answer.
    pub boot_ping_attempts: u32,
    /// The `ping -i` interval used for boot-time checks.
    pub boot_ping_interval: Duration,
    /// The interval used by the single quick ping made during reconciliation.
    pub reconcile_ping_interval: Duration,
    /// Sleep between failed ping attempts.
    pub ping_retry_delay: Duration,

    /// How long a single console read waits for the login prompt.
    pub login_read: Duration,
    /// How many console reads are made before giving up on the login prompt.
    pub login_read_attempts: u32,
    /// Settle time after each login step, scaled by the [`CommDelay`].
    pub login_settle: Duration,
    /// How long stale console output is drained before a command is written.
    pub console_flush: Duration,
    /// How long console output is read after a command is written.
    pub console_command: Duration,

    /// Time between spawning consecutive guests.
    pub spawn_stagger: Duration,
    /// Lookups made while waiting for a spawned hypervisor to appear in the
    /// process table.
    pub pid_lookup_attempts: u32,
    pub pid_lookup_interval: Duration,

    /// Time given to a guest between issuing `reboot` and polling for it.
    pub reboot_settle: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            arp_attempts: 500,
            arp_interval: Duration::from_secs(1),
            boot_ping_attempts: 50,
            boot_ping_interval: Duration::from_secs(1),
            reconcile_ping_interval: Duration::from_millis(200),
            ping_retry_delay: Duration::from_secs(2),
            login_read: Duration::from_secs(5),
            login_read_attempts: 120,
            login_settle: Duration::from_secs(1),
            console_flush: Duration::from_secs(2),
            console_command: Duration::from_secs(3),
            spawn_stagger: Duration::from_secs(1),
            pid_lookup_attempts: 30,
            pid_lookup_interval: Duration::from_millis(500),
            reboot_settle: Duration::from_secs(5),
        }
    }
}

impl PollConfig {
    /// A configuration with every sleep set to zero, for driving the state
    /// machines against scripted collaborators.
    pub fn immediate() -> Self {
        Self {
            arp_interval: Duration::ZERO,
            boot_ping_interval: Duration::ZERO,
            reconcile_ping_interval: Duration::ZERO,
            ping_retry_delay: Duration::ZERO,
            login_read: Duration::ZERO,
            login_settle: Duration::ZERO,
            console_flush: Duration::ZERO,
            console_command: Duration::ZERO,
            spawn_stagger: Duration::ZERO,
            pid_lookup_interval: Duration::ZERO,
            reboot_settle: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Sleeps for `duration`, skipping the syscall for zero durations.
pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
