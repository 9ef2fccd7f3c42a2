// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-fleet scenarios run against a simulated host.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use uuid::Uuid;

use vmfleet::executor::CommandOutput;
use vmfleet::fakes::{
    failure, CallKind, FakeExecutor, FakeProcessProbe, ScriptedConsole,
    ScriptedConsoles,
};
use vmfleet::launch::LaunchError;
use vmfleet::net::MacAddr;
use vmfleet::registry::{
    NetworkState, ProcessStatus, RegistryStore, Target, VmRecord, VmRegistry,
};
use vmfleet::request::{
    BuildOption, Credentials, LaunchRequest, OptionalFeature, VmClass, VmMode,
};
use vmfleet::timing::PollConfig;
use vmfleet::{DataDir, FleetController, LifecycleError};

/// What the simulated host and its guests do.
#[derive(Default)]
struct HostState {
    /// MAC to address, for every NIC a spawned guest has brought up.
    arp: BTreeMap<String, String>,
    next_ip: u8,
    next_pid: u32,
    /// `pgrep` lookups that find nothing before one succeeds.
    pgrep_misses: u32,
    /// `arp -n` reads that come back empty before the table shows.
    arp_blackout: u32,
    pings_answered: bool,
    silent_ips: BTreeSet<String>,
    rdma_link_add_invalid: bool,
    /// No RDMA link is ever reported up, whichever way it was added.
    rdma_never_up: bool,
    mount_fails_on: Option<IpAddr>,
    /// Addresses each guest NIC moves to when its guest reboots.
    reboot_moves: BTreeMap<String, String>,
    guest_macs: String,
}

struct SimHost {
    state: Arc<Mutex<HostState>>,
}

impl SimHost {
    fn new() -> Self {
        let state = HostState { pings_answered: true, ..Default::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn with<F: FnOnce(&mut HostState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    fn executor(&self) -> Arc<FakeExecutor> {
        let state = self.state.clone();
        Arc::new(FakeExecutor::new(move |call| {
            let mut host = state.lock().unwrap();
            let cmd = call.command.as_str();

            if call.kind == CallKind::Spawn {
                for part in cmd.split("mac=").skip(1) {
                    let mac = part[..17].to_string();
                    let ip = format!("192.168.122.{}", 100 + host.next_ip);
                    host.next_ip += 1;
                    host.arp.insert(mac, ip);
                }
                return Ok(CommandOutput::ok(""));
            }

            if cmd == "arp -n" {
                if host.arp_blackout > 0 {
                    host.arp_blackout -= 1;
                    return Ok(CommandOutput::ok(""));
                }
                let table: String = host
                    .arp
                    .iter()
                    .map(|(mac, ip)| format!("{ip} ether {mac} C virbr0\n"))
                    .collect();
                return Ok(CommandOutput::ok(table));
            }
            if cmd.starts_with("pgrep") {
                if host.pgrep_misses > 0 {
                    host.pgrep_misses -= 1;
                    return Ok(CommandOutput::ok(""));
                }
                host.next_pid += 1;
                let pid = 4000 + host.next_pid;
                return Ok(CommandOutput::ok(format!("{pid}\n")));
            }
            if cmd.starts_with("dmesg") {
                return Err(failure(cmd, 1, ""));
            }
            if cmd.starts_with("ip -o -4 a | grep") {
                let bridge = cmd.split_whitespace().nth(6).unwrap_or_default();
                return Ok(CommandOutput::ok(format!("{bridge}\n")));
            }
            if cmd.starts_with("ping") {
                let ip = cmd.rsplit(' ').next().unwrap_or_default();
                return if host.pings_answered
                    && !host.silent_ips.contains(ip)
                {
                    Ok(CommandOutput::ok("1 received"))
                } else {
                    Err(failure(cmd, 1, "100% packet loss"))
                };
            }

            let guest = call.target();
            if cmd == "ip -o -4 addr" {
                let ip = guest.unwrap();
                return Ok(CommandOutput::ok(format!(
                    "2: ens3    inet {ip}/24 brd 192.168.122.255 \
                     scope global ens3\n"
                )));
            }
            if cmd.starts_with("ip -o -0 a") {
                return Ok(CommandOutput::ok(host.guest_macs.clone()));
            }
            if cmd.starts_with("lsmod") {
                return Ok(CommandOutput::ok("rdma_rxe 126976 0\n"));
            }
            if cmd.starts_with("mount") && host.mount_fails_on == guest {
                return Err(failure(cmd, 32, "mount: wrong fs type"));
            }
            if cmd.starts_with("rdma link add") && host.rdma_link_add_invalid {
                return Err(failure(cmd, 255, "error: Invalid argument"));
            }
            if cmd.starts_with("rdma link show") && host.rdma_never_up {
                return Err(failure(cmd, 1, ""));
            }
            if let Some(dev) = cmd.strip_prefix("rdma link show | grep ") {
                return Ok(CommandOutput::ok(format!(
                    "link {dev}/1 state ACTIVE physical_state LINK_UP \
                     netdev ens3\n"
                )));
            }
            if cmd == "reboot" {
                let moves = std::mem::take(&mut host.reboot_moves);
                host.arp.extend(moves);
                return Ok(CommandOutput::ok(""));
            }
            if cmd == "shutdown -h now" {
                let stderr = "Connection closed by remote host";
                return Err(failure(cmd, 255, stderr));
            }

            Ok(CommandOutput::ok(""))
        }))
    }
}

fn guest_console() -> ScriptedConsole {
    ScriptedConsole::new(|input| match input.trim_end() {
        "root" => "root\r\nPassword: ".to_string(),
        "root-pw" => "\r\nLast login: never\r\nroot@guest:~# ".to_string(),
        "uname -a" => "uname -a\r\nLinux guest 6.1.0 x86_64 GNU/Linux\r\n# "
            .to_string(),
        other => format!("{other}\r\nroot@guest:~# "),
    })
    .with_pending("\r\nguest login: ")
}

struct Fleet {
    _tmp: tempfile::TempDir,
    root: Utf8PathBuf,
    host: SimHost,
    exec: Arc<FakeExecutor>,
    probe: Arc<FakeProcessProbe>,
    consoles: Arc<ScriptedConsoles>,
    controller: FleetController,
}

impl Fleet {
    fn new() -> Self {
        Self::with_poll(PollConfig::immediate())
    }

    fn with_poll(poll: PollConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        std::fs::write(root.join("debian.qcow2"), b"base image").unwrap();

        let host = SimHost::new();
        let exec = host.executor();
        let probe = Arc::new(FakeProcessProbe::new());
        let consoles = Arc::new(ScriptedConsoles::new(|_| guest_console()));
        let controller = FleetController::new(
            DataDir::new(root.join("vmfleet_data")),
            exec.clone(),
            probe.clone(),
            consoles.clone(),
        )
        .with_poll_config(poll);

        Self { _tmp: tmp, root, host, exec, probe, consoles, controller }
    }

    fn request(
        &self,
        class: VmClass,
        mode: VmMode,
        count: u32,
    ) -> LaunchRequest {
        LaunchRequest {
            vm_class: class,
            mode,
            num_of_vm: count,
            num_of_cpu: 2,
            ram_size: 2048,
            qcow: self.root.join("debian.qcow2"),
            block_dev: "vda".to_string(),
            creds: creds(),
            bridges: ["virbr0".to_string(), "virbr0".to_string()],
            kernel_code: None,
            modules: Vec::new(),
            optional: BTreeSet::new(),
            scsi_images: Vec::new(),
            build: BuildOption::Run,
        }
    }

    fn store(&self) -> RegistryStore {
        RegistryStore::new(self.controller.data_dir())
    }

    fn saved(&self) -> VmRegistry {
        self.store().read_raw().unwrap()
    }

    /// Registers guests as if an earlier run had started them.
    fn seed(&self, records: Vec<VmRecord>) -> Vec<Uuid> {
        self.seed_as(
            records.into_iter().map(|r| (Uuid::new_v4(), r)).collect(),
        )
    }

    fn seed_as(&self, records: Vec<(Uuid, VmRecord)>) -> Vec<Uuid> {
        self.controller.data_dir().create_layout().unwrap();
        let mut registry = VmRegistry::new();
        let uuids: Vec<Uuid> = records
            .into_iter()
            .map(|(uuid, record)| {
                self.probe.set(record.pid, ProcessStatus::Alive);
                registry.insert(uuid, record);
                uuid
            })
            .collect();
        self.store().save(&registry).unwrap();
        uuids
    }
}

fn creds() -> Credentials {
    Credentials::new("root", "root-pw")
}

fn record(num: u32, pid: u32) -> VmRecord {
    let octet = 10 + 2 * num;
    VmRecord {
        mode: VmMode::Snapshot,
        vm_type: VmClass::Server,
        vm_num: num,
        vm_name: format!("server_{num}"),
        kernel_code: None,
        ips: vec![
            format!("192.168.122.{octet}").parse().unwrap(),
            format!("192.168.122.{}", octet + 1).parse().unwrap(),
        ],
        pid,
        state: NetworkState::Up,
        macs: vec![
            MacAddr::fleet(octet as u8),
            MacAddr::fleet(octet as u8 + 1),
        ],
        bridges: vec!["virbr0".into(), "virbr0".into()],
        shared_9p_tag: "serverhost".into(),
        base_image: "/images/debian.qcow2".into(),
        scsi_images: Vec::new(),
        optional: BTreeSet::new(),
    }
}

#[test]
fn persistent_storage_batch_is_registered() {
    let mut fleet = Fleet::new();
    let req = fleet.request(VmClass::Storage, VmMode::Persistent, 2);

    let plan = fleet.controller.set_params(req).unwrap();
    assert_eq!(plan.identity.slots, vec![0, 1]);
    let macs: BTreeSet<MacAddr> =
        plan.identity.macs.iter().flatten().copied().collect();
    assert_eq!(macs.len(), 4);

    let outcome = fleet.controller.start("hostpw").unwrap();
    assert_eq!(outcome.vms.len(), 2);
    assert!(outcome.skipped.is_empty());
    assert!(outcome.ips().all(|ips| ips.len() == 2));

    let saved = fleet.saved();
    assert_eq!(saved.len(), 2);
    for (_, rec) in &saved {
        assert_eq!(rec.mode, VmMode::Persistent);
        assert_eq!(rec.vm_type, VmClass::Storage);
        assert_eq!(rec.state, NetworkState::Up);
        assert_eq!(rec.shared_9p_tag, "storehost");
        let images = fleet.root.join("vmfleet_data/vm_imgs/storage");
        assert!(rec.base_image.starts_with(&images));
        assert!(rec.base_image.exists());
    }
    let names: BTreeSet<&str> =
        saved.iter().map(|(_, r)| r.vm_name.as_str()).collect();
    assert_eq!(names, BTreeSet::from(["storage_0", "storage_1"]));

    // The file itself uses the registry's field names and values.
    let json: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fleet.store().path()).unwrap(),
    )
    .unwrap();
    let first = json.as_object().unwrap().values().next().unwrap();
    assert_eq!(first["mode"], "persistent");
    assert_eq!(first["vm_type"], "storage");
    assert_eq!(first["state"], "Network Up");

    // Guests were spawned as qemu with their own disks and no -snapshot.
    let spawns: Vec<_> = fleet
        .exec
        .calls()
        .into_iter()
        .filter(|c| c.kind == CallKind::Spawn)
        .collect();
    assert_eq!(spawns.len(), 2);
    assert!(spawns
        .iter()
        .all(|c| c.command.starts_with("qemu-system-x86_64 -enable-kvm")));
    assert!(spawns.iter().all(|c| !c.command.contains("-snapshot")));

    // The sudo wrappers were collected once every guest had an address.
    assert_eq!(fleet.exec.reap_count(), 1);
}

#[test]
fn guest_without_pid_is_skipped_not_registered() {
    let mut fleet = Fleet::new();
    let misses = PollConfig::immediate().pid_lookup_attempts;
    fleet.host.with(|h| h.pgrep_misses = misses);

    let req = fleet.request(VmClass::Server, VmMode::Snapshot, 2);
    let plan = fleet.controller.set_params(req).unwrap();
    let first = plan.guests[0].uuid;
    let outcome = fleet.controller.start("hostpw").unwrap();

    assert_eq!(outcome.skipped, vec![first]);
    assert_eq!(outcome.vms.len(), 1);
    let saved = fleet.saved();
    assert_eq!(saved.len(), 1);
    assert!(!saved.contains(&first));
    assert!(saved.iter().all(|(_, r)| r.pid != 0));

    // The skipped guest is not configured either.
    let mounts = fleet.exec.commands_containing("mount -t 9p");
    assert_eq!(mounts.len(), 1);
}

#[test]
fn second_persistent_batch_takes_free_slots() {
    let mut fleet = Fleet::new();
    let req = fleet.request(VmClass::Storage, VmMode::Persistent, 2);
    fleet.controller.set_params(req.clone()).unwrap();
    let first = fleet.controller.start("hostpw").unwrap();
    for pid in first.pids() {
        fleet.probe.set(pid, ProcessStatus::Alive);
    }

    let taken: BTreeSet<MacAddr> =
        fleet.saved().iter().flat_map(|(_, r)| r.macs.clone()).collect();
    assert_eq!(taken.len(), 4);

    let plan = fleet.controller.set_params(req).unwrap();
    assert_eq!(plan.identity.slots, vec![2, 3]);
    assert!(plan.identity.macs.iter().flatten().all(|m| !taken.contains(m)));
}

#[test]
fn start_requires_prepared_batch() {
    let mut fleet = Fleet::new();
    assert!(matches!(
        fleet.controller.start("hostpw"),
        Err(LifecycleError::NotPrepared)
    ));

    // A prepared batch is consumed by one start.
    let req = fleet.request(VmClass::Server, VmMode::Snapshot, 1);
    fleet.controller.set_params(req).unwrap();
    fleet.controller.start("hostpw").unwrap();
    assert!(fleet.controller.plan().is_none());
    assert!(matches!(
        fleet.controller.start("hostpw"),
        Err(LifecycleError::NotPrepared)
    ));
}

#[test]
fn shutdown_all_empties_registry_even_when_commands_fail() {
    let fleet = Fleet::new();
    fleet.seed(vec![record(0, 501), record(1, 502), record(2, 503)]);

    let removed = fleet.controller.shutdown(Target::All, &creds()).unwrap();
    assert_eq!(removed.len(), 3);
    assert!(fleet.saved().is_empty());
    assert_eq!(
        std::fs::read_to_string(fleet.store().path()).unwrap().trim(),
        "{}"
    );

    let shutdowns = fleet.exec.commands_containing("shutdown -h now");
    assert_eq!(shutdowns.len(), 3);
    assert!(shutdowns
        .iter()
        .all(|c| matches!(c.kind, CallKind::RemotePrivileged(_))));
}

#[test]
fn shutdown_by_address_only_touches_that_guest() {
    let fleet = Fleet::new();
    let uuids = fleet.seed(vec![record(0, 501), record(1, 502)]);

    // The second NIC's address identifies the guest too.
    let target: Target = "192.168.122.13".parse().unwrap();
    let removed = fleet.controller.shutdown(target, &creds()).unwrap();
    assert_eq!(removed, vec![uuids[1]]);

    let saved = fleet.saved();
    assert_eq!(saved.len(), 1);
    assert!(saved.contains(&uuids[0]));

    let unknown: Target = "10.0.0.1".parse().unwrap();
    assert!(matches!(
        fleet.controller.shutdown(unknown, &creds()),
        Err(LifecycleError::NoMatchingVm(_))
    ));
}

#[test]
fn unreachable_guest_with_pipe_is_shut_down_over_console() {
    let fleet = Fleet::new();
    let mut rec = record(0, 501);
    rec.optional.insert(OptionalFeature::Pipe);
    let uuids = fleet.seed(vec![rec]);
    fleet.host.with(|h| h.pings_answered = false);

    fleet.controller.shutdown(Target::All, &creds()).unwrap();
    assert!(fleet.saved().is_empty());
    assert!(fleet.exec.commands_containing("shutdown -h now").is_empty());

    let opened = fleet.consoles.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, uuids[0]);
    assert!(opened[0]
        .1
        .written()
        .contains(&"sudo shutdown -h now\n".to_string()));
}

#[test]
fn softroce_fallback_still_completes_batch() {
    let mut fleet = Fleet::new();
    fleet.host.with(|h| h.rdma_link_add_invalid = true);

    let req = fleet.request(VmClass::Server, VmMode::Snapshot, 2);
    fleet.controller.set_params(req).unwrap();
    let outcome = fleet.controller.start("hostpw").unwrap();

    assert_eq!(outcome.vms.len(), 2);
    assert_eq!(fleet.saved().len(), 2);
    // Both NICs of both guests fell back to rxe_cfg.
    assert_eq!(fleet.exec.commands_containing("rxe_cfg add ens3").len(), 4);

    let spawns = fleet
        .exec
        .calls()
        .into_iter()
        .filter(|c| c.kind == CallKind::Spawn)
        .count();
    assert_eq!(spawns, 2);
}

#[test]
fn unconfirmed_rdma_links_still_register_batch() {
    let mut fleet = Fleet::new();
    fleet.host.with(|h| h.rdma_never_up = true);

    let req = fleet.request(VmClass::Server, VmMode::Snapshot, 2);
    fleet.controller.set_params(req).unwrap();
    let outcome = fleet.controller.start("hostpw").unwrap();

    assert_eq!(outcome.vms.len(), 2);
    assert!(outcome.skipped.is_empty());
    let saved = fleet.saved();
    assert_eq!(saved.len(), 2);
    assert!(saved.iter().all(|(_, r)| r.state == NetworkState::Up));

    // Every NIC tried both ways of adding a link.
    assert_eq!(fleet.exec.commands_containing("rdma link add").len(), 4);
    assert_eq!(fleet.exec.commands_containing("rxe_cfg add").len(), 4);
}

#[test]
fn failed_post_boot_skips_only_that_guest() {
    let mut fleet = Fleet::new();
    // The first NIC of the second guest spawned.
    let second: IpAddr = "192.168.122.102".parse().unwrap();
    fleet.host.with(|h| h.mount_fails_on = Some(second));

    let req = fleet.request(VmClass::Server, VmMode::Snapshot, 2);
    fleet.controller.set_params(req).unwrap();
    let outcome = fleet.controller.start("hostpw").unwrap();

    assert_eq!(outcome.vms.len(), 1);
    assert_eq!(outcome.skipped.len(), 1);
    let saved = fleet.saved();
    assert_eq!(saved.len(), 1);
    assert!(!saved.contains(&outcome.skipped[0]));
}

#[test]
fn ip_discovery_timeout_fails_start() {
    let fleet = Fleet::new();
    let mut poll = PollConfig::immediate();
    poll.arp_attempts = 3;
    let mut controller = FleetController::new(
        fleet.controller.data_dir().clone(),
        Arc::new(FakeExecutor::new(|call| {
            let cmd = call.command.as_str();
            if cmd.starts_with("pgrep") {
                Ok(CommandOutput::ok("4001\n"))
            } else if cmd.starts_with("ip -o -4 a | grep") {
                Ok(CommandOutput::ok("virbr0\n"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        })),
        fleet.probe.clone(),
        fleet.consoles.clone(),
    )
    .with_poll_config(poll);

    controller
        .set_params(fleet.request(VmClass::Server, VmMode::Snapshot, 1))
        .unwrap();
    assert!(matches!(
        controller.start("hostpw"),
        Err(LifecycleError::Launch(LaunchError::IpDiscoveryTimeout {
            attempts: 3,
            ..
        }))
    ));
    assert!(fleet.saved().is_empty());
}

#[test]
fn pipe_guests_are_verified_over_console() {
    let mut fleet = Fleet::new();
    let mut req = fleet.request(VmClass::Server, VmMode::Snapshot, 1);
    req.optional.insert(OptionalFeature::Pipe);

    fleet.controller.set_params(req).unwrap();
    let outcome = fleet.controller.start("hostpw").unwrap();
    let uuid = outcome.vms[0].uuid;

    let pipes = fleet.controller.data_dir().pipes_dir();
    assert!(pipes.join(format!("{uuid}.in")).exists());
    assert!(pipes.join(format!("{uuid}.out")).exists());

    let spawn = fleet
        .exec
        .calls()
        .into_iter()
        .find(|c| c.kind == CallKind::Spawn)
        .unwrap();
    assert!(spawn.command.contains(&format!("-serial pipe:{}/{uuid}", pipes)));

    let opened = fleet.consoles.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(
        opened[0].1.written(),
        vec!["root\n", "root-pw\n", "uname -a\n"]
    );
    assert!(fleet.saved().get(&uuid).unwrap().has_pipe());
}

#[test]
fn reboot_rediscovers_and_saves_new_addresses() {
    let fleet = Fleet::new();
    let uuids = fleet.seed(vec![record(0, 501)]);
    fleet.host.with(|h| {
        h.guest_macs = "52:54:00:12:43:10\n52:54:00:12:43:11\n".into();
        h.arp.insert("52:54:00:12:43:10".into(), "192.168.122.10".into());
        h.arp.insert("52:54:00:12:43:11".into(), "192.168.122.11".into());
        let moves = &mut h.reboot_moves;
        moves.insert("52:54:00:12:43:10".into(), "192.168.122.60".into());
        moves.insert("52:54:00:12:43:11".into(), "192.168.122.61".into());
    });

    let target: Target = "192.168.122.10".parse().unwrap();
    let rebooted = fleet.controller.reboot(target, &creds()).unwrap();

    let expected: Vec<IpAddr> = ["192.168.122.60", "192.168.122.61"]
        .iter()
        .map(|ip| ip.parse().unwrap())
        .collect();
    assert_eq!(rebooted, vec![(uuids[0], expected.clone())]);
    assert_eq!(fleet.saved().get(&uuids[0]).unwrap().ips, expected);

    // Post-boot configuration ran again against the new address.
    let new_primary = CallKind::Remote(expected[0]);
    assert!(fleet.exec.calls().iter().any(|c| {
        c.kind == new_primary && c.command.starts_with("mount -t 9p")
    }));
}

#[test]
fn console_reboot_after_slow_rediscovery_uses_raised_delay() {
    let mut poll = PollConfig::immediate();
    poll.console_command = Duration::from_millis(1);
    let fleet = Fleet::with_poll(poll);

    let ssh_guest = Uuid::from_u128(1);
    let pipe_guest = Uuid::from_u128(2);
    let mut piped = record(1, 502);
    piped.optional.insert(OptionalFeature::Pipe);
    fleet.seed_as(vec![(ssh_guest, record(0, 501)), (pipe_guest, piped)]);

    fleet.host.with(|h| {
        h.guest_macs = "52:54:00:12:43:10\n52:54:00:12:43:11\n".into();
        let moves = &mut h.reboot_moves;
        moves.insert("52:54:00:12:43:10".into(), "192.168.122.60".into());
        moves.insert("52:54:00:12:43:11".into(), "192.168.122.61".into());
        // The first guest takes ten empty lookups to show up again.
        h.arp_blackout = 10;
        // The piped guest only answers on its console.
        h.silent_ips.insert("192.168.122.12".into());
        h.arp.insert("52:54:00:12:43:12".into(), "192.168.122.70".into());
        h.arp.insert("52:54:00:12:43:13".into(), "192.168.122.71".into());
    });

    let rebooted = fleet.controller.reboot(Target::All, &creds()).unwrap();
    let order: Vec<Uuid> = rebooted.iter().map(|(uuid, _)| *uuid).collect();
    assert_eq!(order, vec![ssh_guest, pipe_guest]);

    let opened = fleet.consoles.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, pipe_guest);
    let console = &opened[0].1;
    assert!(console.written().contains(&"sudo reboot\n".to_string()));

    // Ten misses triple the delay, so the one-millisecond command budget
    // is read for three.
    let reads = console.read_timeouts();
    assert!(reads.contains(&Duration::from_millis(3)));
    assert!(!reads.contains(&Duration::from_millis(1)));
}

#[test]
fn registry_load_is_idempotent() {
    let fleet = Fleet::new();
    let uuids =
        fleet.seed(vec![record(0, 501), record(1, 502), record(2, 503)]);
    fleet.probe.set(502, ProcessStatus::AliveUnsignalable);
    fleet.probe.kill(503);
    fleet.host.with(|h| h.pings_answered = false);

    let first = fleet.controller.list().unwrap();
    let second = fleet.controller.list().unwrap();
    assert_eq!(first, second);

    assert_eq!(first.len(), 2);
    assert_eq!(first.get(&uuids[0]).unwrap().state, NetworkState::Up);
    assert_eq!(first.get(&uuids[1]).unwrap().state, NetworkState::DownMaybe);
    assert!(!first.contains(&uuids[2]));
    assert_eq!(fleet.saved(), first);
}
