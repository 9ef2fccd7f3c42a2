// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MAC addresses, the host ARP table, and reachability checks.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, trace};

use crate::executor::{ExecutionError, Executor};
use crate::timing::pause;

/// The locally administered prefix every guest NIC address starts with.
pub const FLEET_MAC_PREFIX: [u8; 5] = [0x52, 0x54, 0x00, 0x12, 0x43];

/// The range of final-octet suffixes handed out to guest NICs. Suffixes are
/// written in decimal, so suffix 10 becomes `52:54:00:12:43:10`.
pub const FLEET_MAC_SUFFIXES: std::ops::RangeInclusive<u8> = 10..=99;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address {0:?}")]
pub struct MacParseError(String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The fleet address with decimal suffix `n`.
    ///
    /// The suffix is encoded so that its hex rendering reads as the decimal
    /// number, matching addresses handed out by earlier runs.
    pub fn fleet(n: u8) -> Self {
        let [a, b, c, d, e] = FLEET_MAC_PREFIX;
        Self([a, b, c, d, e, ((n / 10) << 4) | (n % 10)])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One resolved neighbour from `arp -n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: IpAddr,
    pub mac: MacAddr,
}

/// Parses `arp -n` output, skipping the header and incomplete entries.
pub fn parse_arp_table(output: &str) -> Vec<ArpEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let ip = fields.next()?.parse().ok()?;
            let mac = fields.find_map(|f| f.parse().ok())?;
            Some(ArpEntry { ip, mac })
        })
        .collect()
}

/// Reads the host ARP table.
pub fn arp_table(exec: &dyn Executor) -> Result<Vec<ArpEntry>, ExecutionError> {
    let out = exec.run_local("arp -n")?;
    let entries = parse_arp_table(&out.stdout);
    trace!(count = entries.len(), "read arp table");
    Ok(entries)
}

/// Looks `mac` up in the host ARP table.
pub fn arp_lookup(
    exec: &dyn Executor,
    mac: MacAddr,
) -> Result<Option<IpAddr>, ExecutionError> {
    Ok(arp_table(exec)?.into_iter().find(|e| e.mac == mac).map(|e| e.ip))
}

/// Parses one MAC address per line, as printed by
/// `ip -o -0 a | awk '{print $15}'` inside a guest.
pub fn parse_mac_list(output: &str) -> Result<Vec<MacAddr>, MacParseError> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::parse)
        .collect()
}

/// Pings `ip` up to `attempts` times, sleeping `retry_delay` between failed
/// attempts, and reports whether any ping was answered.
pub fn ping_check(
    exec: &dyn Executor,
    ip: IpAddr,
    attempts: u32,
    interval: Duration,
    retry_delay: Duration,
) -> bool {
    let cmd = format!("ping -c 1 -i {} {ip}", interval.as_secs_f64());
    for attempt in 1..=attempts {
        match exec.run_local(&cmd) {
            Ok(_) => {
                debug!(%ip, attempt, "ping answered");
                return true;
            }
            Err(e) => {
                trace!(%ip, attempt, error = %e, "ping failed");
                if attempt < attempts {
                    pause(retry_delay);
                }
            }
        }
    }

    debug!(%ip, attempts, "no ping answered");
    false
}
