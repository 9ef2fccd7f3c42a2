// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hands out UUIDs, MAC addresses, and persistent slots to a new batch.
//!
//! Nothing here is reserved anywhere: an identity is free if no registered
//! guest holds it and, for MACs, if the host ARP table has not seen it.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::executor::{ExecutionError, Executor};
use crate::net::{self, ArpEntry, MacAddr, FLEET_MAC_SUFFIXES};
use crate::registry::VmRegistry;
use crate::request::{LaunchRequest, VmMode, NICS_PER_VM};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(
        "ran out of MAC addresses: needed {needed}, found {found} free in \
         the fleet range"
    )]
    MacsExhausted { needed: usize, found: usize },

    #[error("failed to read the host ARP table")]
    Arp(#[from] ExecutionError),
}

/// The identities of one batch, indexed by position in the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchIdentity {
    pub uuids: Vec<Uuid>,
    pub macs: Vec<[MacAddr; NICS_PER_VM]>,
    /// Persistent slots for persistent batches, batch indices otherwise.
    pub slots: Vec<u32>,
}

impl BatchIdentity {
    pub fn len(&self) -> usize {
        self.uuids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uuids.is_empty()
    }
}

/// Draws `count` UUIDs from `draw`, redrawing any that collide with a
/// registered guest or an earlier draw.
pub fn allocate_uuids_with(
    count: usize,
    registry: &VmRegistry,
    mut draw: impl FnMut() -> Uuid,
) -> Vec<Uuid> {
    let mut uuids: Vec<Uuid> = Vec::with_capacity(count);
    while uuids.len() < count {
        let candidate = draw();
        if registry.contains(&candidate) || uuids.contains(&candidate) {
            debug!(%candidate, "uuid collision, redrawing");
            continue;
        }
        uuids.push(candidate);
    }
    uuids
}

pub fn allocate_uuids(count: usize, registry: &VmRegistry) -> Vec<Uuid> {
    allocate_uuids_with(count, registry, Uuid::new_v4)
}

/// Picks `NICS_PER_VM` addresses for each of `vms` guests, walking the fleet
/// suffix range in order and skipping any address seen in `arp` or held by a
/// registered guest.
pub fn allocate_macs(
    vms: usize,
    registry: &VmRegistry,
    arp: &[ArpEntry],
) -> Result<Vec<[MacAddr; NICS_PER_VM]>, AllocationError> {
    let needed = vms * NICS_PER_VM;
    let mut taken = registry.used_macs();
    taken.extend(arp.iter().map(|e| e.mac));

    let free: Vec<MacAddr> = FLEET_MAC_SUFFIXES
        .map(MacAddr::fleet)
        .filter(|mac| !taken.contains(mac))
        .take(needed)
        .collect();

    if free.len() < needed {
        return Err(AllocationError::MacsExhausted {
            needed,
            found: free.len(),
        });
    }

    Ok(free
        .chunks_exact(NICS_PER_VM)
        .map(|pair| [pair[0], pair[1]])
        .collect())
}

/// Picks the `count` smallest slot numbers not in `used`.
pub fn allocate_slots(count: usize, used: &BTreeSet<u32>) -> Vec<u32> {
    (0u32..).filter(|slot| !used.contains(slot)).take(count).collect()
}

/// Allocates every identity a batch for `request` needs.
pub fn allocate(
    request: &LaunchRequest,
    registry: &VmRegistry,
    exec: &dyn Executor,
) -> Result<BatchIdentity, AllocationError> {
    let count = request.num_of_vm as usize;
    let uuids = allocate_uuids(count, registry);

    let arp = net::arp_table(exec)?;
    let macs = allocate_macs(count, registry, &arp)?;

    let slots = match request.mode {
        VmMode::Persistent => {
            allocate_slots(count, &registry.used_slots(request.vm_class))
        }
        VmMode::Snapshot => (0..request.num_of_vm).collect(),
    };

    let mac_list: Vec<String> =
        macs.iter().flatten().map(ToString::to_string).collect();
    info!(
        class = %request.vm_class,
        count,
        ?slots,
        macs = ?mac_list,
        "allocated batch identities"
    );

    Ok(BatchIdentity { uuids, macs, slots })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::test::record;
    use crate::request::VmClass;

    #[test]
    fn slots_fill_gaps_first() {
        let used = BTreeSet::from([0, 2, 3]);
        assert_eq!(allocate_slots(2, &used), vec![1, 4]);
        assert_eq!(allocate_slots(2, &BTreeSet::new()), vec![0, 1]);
        assert!(allocate_slots(0, &used).is_empty());
    }

    #[test]
    fn uuids_are_redrawn_on_collision() {
        let existing = Uuid::from_u128(1);
        let mut registry = VmRegistry::new();
        registry
            .insert(existing, record(VmClass::Server, VmMode::Snapshot, 0, 1));

        // The generator repeats itself and hits the registered id.
        let mut draws = [1u128, 2, 2, 3].into_iter();
        let uuids = allocate_uuids_with(2, &registry, || {
            Uuid::from_u128(draws.next().unwrap_or(99))
        });
        assert_eq!(uuids, vec![Uuid::from_u128(2), Uuid::from_u128(3)]);
    }

    #[test]
    fn macs_avoid_registry_and_arp() {
        let mut registry = VmRegistry::new();
        // Holds suffixes 10 and 11.
        registry.insert(
            Uuid::new_v4(),
            record(VmClass::Server, VmMode::Snapshot, 0, 1),
        );
        let arp = vec![ArpEntry {
            ip: "192.168.122.99".parse().unwrap(),
            mac: MacAddr::fleet(12),
        }];

        let macs = allocate_macs(2, &registry, &arp).unwrap();
        assert_eq!(
            macs,
            vec![
                [MacAddr::fleet(13), MacAddr::fleet(14)],
                [MacAddr::fleet(15), MacAddr::fleet(16)],
            ]
        );
    }

    #[test]
    fn mac_space_runs_out() {
        let registry = VmRegistry::new();
        let arp: Vec<ArpEntry> = (10..=97)
            .map(|n| ArpEntry {
                ip: "10.0.0.1".parse().unwrap(),
                mac: MacAddr::fleet(n),
            })
            .collect();

        // Two suffixes left: enough for one guest, not two.
        assert_eq!(allocate_macs(1, &registry, &arp).unwrap().len(), 1);
        assert!(matches!(
            allocate_macs(2, &registry, &arp),
            Err(AllocationError::MacsExhausted { needed: 4, found: 2 })
        ));
    }

    #[test]
    fn batch_identities_are_distinct() {
        let registry = VmRegistry::new();
        let uuids = allocate_uuids(8, &registry);
        let unique: BTreeSet<_> = uuids.iter().collect();
        assert_eq!(unique.len(), 8);

        let macs = allocate_macs(8, &registry, &[]).unwrap();
        let unique: BTreeSet<_> = macs.iter().flatten().collect();
        assert_eq!(unique.len(), 16);
    }
}
