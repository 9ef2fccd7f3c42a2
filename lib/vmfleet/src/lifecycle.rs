// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operations a user runs against a fleet: prepare and start a batch,
//! shut guests down, reboot them, and list what is running.
//!
//! Every operation starts by loading (and so reconciling) the registry and
//! ends by saving it. Guests are handled one after another; nothing here
//! runs concurrently.

use std::net::IpAddr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::build::{BuildError, KernelBuilder};
use crate::console::{
    self, ConsoleChannel, ConsoleError, ConsoleOpener, FifoConsoles,
};
use crate::data_dir::{DataDir, DataDirError};
use crate::executor::{ExecutionError, Executor, HostExecutor};
use crate::identity::{self, AllocationError, BatchIdentity};
use crate::launch::{
    self, GuestLaunch, LaunchDriver, LaunchError, NicConfig, QemuCommand,
};
use crate::net::{self, MacAddr, MacParseError};
use crate::post_boot::{PostBootConfigurator, PostBootError};
use crate::registry::{
    HostProcessProbe, NetworkState, ProcessProbe, RegistryError, RegistryStore,
    Target, VmRecord, VmRegistry,
};
use crate::request::{
    ClassProfile, Credentials, LaunchRequest, OptionalFeature, RequestError,
    VmMode,
};
use crate::timing::{pause, CommDelay, PollConfig};

/// Lists the MAC of every `ens*` interface in a guest, one per line.
const GUEST_MAC_QUERY: &str = "ip -o -0 a | grep 'ens.' | awk '{print $15}'";

const SHUTDOWN_COMMAND: &str = "shutdown -h now";
const REBOOT_COMMAND: &str = "reboot";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid launch request")]
    Request(#[from] RequestError),

    #[error(transparent)]
    DataDir(#[from] DataDirError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to allocate guest identities")]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("kernel build failed")]
    Build(#[from] BuildError),

    #[error("{0} is not installed")]
    MissingTool(&'static str),

    #[error("bridge {0} has no IPv4 address on this host")]
    MissingBridge(String),

    #[error("start called without a prepared batch")]
    NotPrepared,

    #[error("no registered guest matches {0}")]
    NoMatchingVm(Target),

    #[error("failed to list the interfaces of {ip}")]
    MacQuery {
        ip: IpAddr,
        #[source]
        err: ExecutionError,
    },

    #[error("guest reported an unreadable MAC address")]
    MacParse(#[from] MacParseError),

    #[error("guest {uuid} has no address to reach it by")]
    NoAddress { uuid: Uuid },

    #[error("console of guest {uuid} is unusable")]
    Console {
        uuid: Uuid,
        #[source]
        err: ConsoleError,
    },

    #[error("post-boot configuration of guest {uuid} failed")]
    PostBoot {
        uuid: Uuid,
        #[source]
        err: PostBootError,
    },

    #[error("failed to create console pipes for guest {uuid}")]
    Pipes {
        uuid: Uuid,
        #[source]
        err: ConsoleError,
    },
}

/// A batch bound by [`FleetController::set_params`], waiting for
/// [`FleetController::start`].
#[derive(Clone, Debug)]
pub struct LaunchPlan {
    pub request: LaunchRequest,
    pub profile: ClassProfile,
    pub identity: BatchIdentity,
    pub guests: Vec<GuestLaunch>,
}

/// One guest a successful [`FleetController::start`] left running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchedVm {
    pub uuid: Uuid,
    pub name: String,
    pub ips: Vec<IpAddr>,
    pub pid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// Guests that were configured and registered, in spawn order.
    pub vms: Vec<LaunchedVm>,
    /// Guests whose qemu pid could not be found or whose post-boot
    /// configuration failed. They are not registered.
    pub skipped: Vec<Uuid>,
}

impl StartOutcome {
    pub fn ips(&self) -> impl Iterator<Item = &[IpAddr]> + '_ {
        self.vms.iter().map(|vm| vm.ips.as_slice())
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.vms.iter().map(|vm| vm.pid)
    }
}

/// Checks that this host can run a batch bridged onto `bridges`.
pub fn check_host(
    exec: &dyn Executor,
    bridges: &[String],
) -> Result<(), LifecycleError> {
    let qemu = launch::qemu::QEMU_BINARY;
    if exec.run_local(&format!("command -v {qemu}")).is_err() {
        return Err(LifecycleError::MissingTool(qemu));
    }

    let mut checked: Vec<&str> = Vec::new();
    for bridge in bridges {
        if checked.contains(&bridge.as_str()) {
            continue;
        }
        checked.push(bridge);

        let cmd = format!("ip -o -4 a | grep {bridge} | awk '{{print $2}}'");
        let found = exec
            .run_local(&cmd)
            .ok()
            .and_then(|out| out.first_line().map(|l| l.trim() == bridge))
            .unwrap_or(false);
        if !found {
            return Err(LifecycleError::MissingBridge(bridge.clone()));
        }
        if !bridge.starts_with("virbr") {
            info!(
                %bridge,
                "not a libvirt bridge, guests need a DHCP server on it"
            );
        }
    }

    Ok(())
}

/// Drives batches of guests on one host.
pub struct FleetController {
    exec: Arc<dyn Executor>,
    probe: Arc<dyn ProcessProbe>,
    consoles: Arc<dyn ConsoleOpener>,
    data_dir: DataDir,
    poll: PollConfig,
    store: RegistryStore,
    plan: Option<LaunchPlan>,
}

impl FleetController {
    pub fn new(
        data_dir: DataDir,
        exec: Arc<dyn Executor>,
        probe: Arc<dyn ProcessProbe>,
        consoles: Arc<dyn ConsoleOpener>,
    ) -> Self {
        let poll = PollConfig::default();
        let store = RegistryStore::new(&data_dir)
            .with_ping_interval(poll.reconcile_ping_interval);
        Self { exec, probe, consoles, data_dir, poll, store, plan: None }
    }

    /// A controller that runs commands on this host.
    pub fn host(data_dir: DataDir) -> Self {
        let consoles = FifoConsoles::new(data_dir.pipes_dir());
        Self::new(
            data_dir,
            Arc::new(HostExecutor::new()),
            Arc::new(HostProcessProbe),
            Arc::new(consoles),
        )
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.store =
            self.store.with_ping_interval(poll.reconcile_ping_interval);
        self.poll = poll;
        self
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn plan(&self) -> Option<&LaunchPlan> {
        self.plan.as_ref()
    }

    fn load(&self) -> Result<VmRegistry, LifecycleError> {
        Ok(self.store.load(self.exec.as_ref(), self.probe.as_ref())?)
    }

    /// The registry, reconciled against the host.
    pub fn list(&self) -> Result<VmRegistry, LifecycleError> {
        self.load()
    }

    /// Validates `request`, allocates identities for its guests, stages their
    /// disks, and prepares the command lines [`FleetController::start`] will
    /// run. Replaces any batch prepared earlier.
    pub fn set_params(
        &mut self,
        request: LaunchRequest,
    ) -> Result<&LaunchPlan, LifecycleError> {
        let _span =
            info_span!("set_params", class = %request.vm_class).entered();
        request.validate()?;
        self.data_dir.create_layout()?;

        let registry = self.load()?;
        let identity =
            identity::allocate(&request, &registry, self.exec.as_ref())?;
        let profile = request.vm_class.profile(&self.data_dir);

        let (images, scsi_images) =
            self.stage_images(&request, &identity.slots)?;
        let kvm = launch::kvm_available(self.exec.as_ref());
        let pipes_dir = self.data_dir.pipes_dir();
        let with_pipe = request.has_feature(OptionalFeature::Pipe);

        let guests = (0..identity.len())
            .map(|i| {
                let uuid = identity.uuids[i];
                let macs = identity.macs[i];
                let nic = |n: usize| NicConfig {
                    bridge: request.bridges[n].clone(),
                    mac: macs[n],
                };
                let qemu = QemuCommand {
                    kvm,
                    cpus: request.num_of_cpu,
                    ram_mib: request.ram_size,
                    snapshot: request.mode == VmMode::Snapshot,
                    monitor: self.data_dir.monitor_socket(&uuid),
                    image: images[i].clone(),
                    kernel: profile.bz_image(),
                    root_dev: request.block_dev.clone(),
                    nics: [nic(0), nic(1)],
                    share_dir: profile.share_dir.clone(),
                    share_tag: profile.tag.clone(),
                    serial_pipe: with_pipe
                        .then(|| console::pipe_prefix(&pipes_dir, &uuid)),
                    scsi_images: scsi_images[i].clone(),
                };
                GuestLaunch::new(uuid, identity.slots[i], qemu)
            })
            .collect();

        info!(count = identity.len(), mode = ?request.mode, "batch prepared");
        Ok(self.plan.insert(LaunchPlan { request, profile, identity, guests }))
    }

    /// The boot image and SCSI images for each guest of the batch. Persistent
    /// guests get their own copies in their slots.
    #[allow(clippy::type_complexity)]
    fn stage_images(
        &self,
        request: &LaunchRequest,
        slots: &[u32],
    ) -> Result<(Vec<Utf8PathBuf>, Vec<Vec<Utf8PathBuf>>), LifecycleError> {
        match request.mode {
            VmMode::Snapshot => Ok((
                vec![request.qcow.clone(); slots.len()],
                vec![request.scsi_images.clone(); slots.len()],
            )),
            VmMode::Persistent => {
                let images_dir = self.data_dir.images_dir();
                let class = request.vm_class;
                let images = launch::stage_persistent_images(
                    &images_dir,
                    class,
                    slots,
                    &request.qcow,
                )?;

                let mut scsi = vec![Vec::new(); slots.len()];
                for source in &request.scsi_images {
                    let staged = launch::stage_persistent_images(
                        &images_dir,
                        class,
                        slots,
                        source,
                    )?;
                    for (per_vm, path) in scsi.iter_mut().zip(staged) {
                        per_vm.push(path);
                    }
                }
                Ok((images, scsi))
            }
        }
    }

    fn build(&self, plan: &LaunchPlan) -> Result<(), LifecycleError> {
        let request = &plan.request;
        let builder = KernelBuilder::new(
            self.exec.as_ref(),
            &self.data_dir,
            &plan.profile,
        );

        if request.build.builds_kernel() {
            match &request.kernel_code {
                Some(source) => builder
                    .build_kernel(source, !request.scsi_images.is_empty())?,
                None => {
                    debug!("no kernel source given, using the existing build")
                }
            }
        }

        if request.build.builds_modules() && !request.modules.is_empty() {
            let tree = match &request.kernel_code {
                Some(source) => builder.kernel_tree(source),
                None => plan.profile.kernel_dir.clone(),
            };
            for module in &request.modules {
                builder.build_module(module, &tree)?;
            }
        }

        Ok(())
    }

    /// Builds what the prepared batch asks for, boots its guests, configures
    /// them, and registers the ones that came up.
    ///
    /// Failing to find a guest's address ends the whole call; guests spawned
    /// by then keep running. A guest whose qemu pid cannot be found, or whose
    /// post-boot configuration fails, is reported in
    /// [`StartOutcome::skipped`] and not registered.
    pub fn start(
        &mut self,
        host_password: &str,
    ) -> Result<StartOutcome, LifecycleError> {
        let mut plan = self.plan.take().ok_or(LifecycleError::NotPrepared)?;
        let _span =
            info_span!("start", class = %plan.request.vm_class).entered();
        let exec = self.exec.as_ref();

        check_host(exec, &plan.request.bridges)?;
        self.build(&plan)?;

        let with_pipe = plan.request.has_feature(OptionalFeature::Pipe);
        let pipes_dir = self.data_dir.pipes_dir();
        let driver = LaunchDriver::new(exec, &self.poll);
        let mut outcome = StartOutcome::default();

        for (i, guest) in plan.guests.iter_mut().enumerate() {
            if with_pipe {
                let uuid = guest.uuid;
                console::create_pipe_files(&pipes_dir, &uuid)
                    .map_err(|err| LifecycleError::Pipes { uuid, err })?;
            }
            if i > 0 {
                pause(self.poll.spawn_stagger);
            }
            match driver.spawn(guest, host_password) {
                Ok(_) => {}
                Err(LaunchError::PidNotFound { uuid }) => {
                    error!(%uuid, "no qemu pid found, not registering guest");
                    outcome.skipped.push(uuid);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut delay = CommDelay::BASE;
        for guest in plan.guests.iter_mut().filter(|g| g.pid.is_some()) {
            delay = delay.raise_to(driver.discover(guest)?);
            if with_pipe {
                driver.verify_console(
                    guest,
                    self.consoles.as_ref(),
                    &plan.request.creds,
                    delay,
                )?;
            } else {
                driver.skip_console(guest);
            }
        }
        info!(%delay, "all guests discovered");

        let reaped = exec.reap_spawned();
        debug!(reaped, "collected finished spawn wrappers");

        let configurator =
            PostBootConfigurator::new(exec, &self.poll).with_delay(delay);
        let mut ready = Vec::new();
        for guest in &plan.guests {
            let Some(pid) = guest.pid else {
                continue;
            };
            let result = configurator.configure(
                &guest.ips,
                &plan.request.creds,
                &plan.profile.tag,
            );
            match result {
                Ok(report) => {
                    for ip in report.degraded() {
                        warn!(
                            uuid = %guest.uuid, %ip,
                            "guest has no RDMA link"
                        );
                    }
                    ready.push((guest, pid));
                }
                Err(e) => {
                    error!(
                        uuid = %guest.uuid,
                        error = %e,
                        "post-boot configuration failed, not registering guest"
                    );
                    outcome.skipped.push(guest.uuid);
                }
            }
        }

        let mut registry = self.load()?;
        for (guest, pid) in ready {
            let record = self.record_for(&plan, guest, pid);
            outcome.vms.push(LaunchedVm {
                uuid: guest.uuid,
                name: record.vm_name.clone(),
                ips: record.ips.clone(),
                pid: record.pid,
            });
            registry.insert(guest.uuid, record);
        }
        self.store.save(&registry)?;

        info!(
            started = outcome.vms.len(),
            skipped = outcome.skipped.len(),
            "batch started"
        );
        Ok(outcome)
    }

    fn record_for(
        &self,
        plan: &LaunchPlan,
        guest: &GuestLaunch,
        pid: u32,
    ) -> VmRecord {
        let request = &plan.request;
        VmRecord {
            mode: request.mode,
            vm_type: request.vm_class,
            vm_num: guest.slot,
            vm_name: format!("{}_{}", request.vm_class.name(), guest.slot),
            kernel_code: request.kernel_code.as_ref().map(ToString::to_string),
            ips: guest.ips.clone(),
            pid,
            state: NetworkState::Up,
            macs: guest.macs().to_vec(),
            bridges: request.bridges.to_vec(),
            shared_9p_tag: plan.profile.tag.clone(),
            base_image: guest.qemu.image.clone(),
            scsi_images: guest.qemu.scsi_images.clone(),
            optional: request.optional.clone(),
        }
    }

    fn targets(
        &self,
        registry: &VmRegistry,
        target: Target,
    ) -> Result<Vec<Uuid>, LifecycleError> {
        let uuids = registry.resolve(target);
        if uuids.is_empty() {
            return Err(LifecycleError::NoMatchingVm(target));
        }
        Ok(uuids)
    }

    /// Whether `record` should be driven over its console: it has one and
    /// its primary address does not answer.
    fn use_console(&self, record: &VmRecord) -> bool {
        if !record.has_pipe() {
            return false;
        }
        let reachable = record.primary_ip().is_some_and(|ip| {
            net::ping_check(
                self.exec.as_ref(),
                ip,
                1,
                self.poll.reconcile_ping_interval,
                self.poll.ping_retry_delay,
            )
        });
        if !reachable {
            info!(
                name = %record.vm_name,
                "guest does not answer ping, using its console"
            );
        }
        !reachable
    }

    fn console_command(
        &self,
        uuid: Uuid,
        creds: &Credentials,
        cmd: &str,
        delay: CommDelay,
    ) -> Result<String, LifecycleError> {
        let console_err = |err| LifecycleError::Console { uuid, err };
        let mut chan = ConsoleChannel::new(
            self.consoles.open(&uuid),
            creds.clone(),
            &self.poll,
            delay,
        );
        chan.login().map_err(console_err)?;
        let timeout = chan.command_timeout();
        chan.run_sudo_command(cmd, timeout).map_err(console_err)
    }

    /// Shuts down the guests `target` names and forgets them.
    ///
    /// A guest often goes away before the shutdown command can report
    /// success, so records are removed whatever the command returned.
    pub fn shutdown(
        &self,
        target: Target,
        creds: &Credentials,
    ) -> Result<Vec<Uuid>, LifecycleError> {
        let mut registry = self.load()?;
        let uuids = self.targets(&registry, target)?;
        let pipes_dir = self.data_dir.pipes_dir();

        for uuid in &uuids {
            let Some(record) = registry.remove(uuid) else {
                continue;
            };
            let _span =
                info_span!("shutdown", %uuid, name = %record.vm_name).entered();

            if self.use_console(&record) {
                if let Err(e) = self.console_command(
                    *uuid,
                    creds,
                    SHUTDOWN_COMMAND,
                    CommDelay::BASE,
                ) {
                    debug!(error = %e, "console shutdown reported failure");
                }
            } else if let Some(ip) = record.primary_ip() {
                info!(%ip, "shutting down guest");
                if let Err(e) =
                    self.exec.run_remote_privileged(SHUTDOWN_COMMAND, ip, creds)
                {
                    debug!(%ip, error = %e, "shutdown reported failure");
                }
            } else {
                warn!("guest has no address, forgetting it");
            }

            if record.has_pipe() {
                console::delete_pipe_files(&pipes_dir, uuid);
            }
        }

        self.store.save(&registry)?;
        info!(count = uuids.len(), "guests shut down");
        Ok(uuids)
    }

    /// Reboots the guests `target` names, finds them again by MAC, and
    /// reconfigures them. The addresses they come back with are saved.
    ///
    /// Guests are handled in turn. A slow rediscovery raises the delay used
    /// for every later console session and connectivity check.
    pub fn reboot(
        &self,
        target: Target,
        creds: &Credentials,
    ) -> Result<Vec<(Uuid, Vec<IpAddr>)>, LifecycleError> {
        let mut registry = self.load()?;
        let uuids = self.targets(&registry, target)?;
        let driver = LaunchDriver::new(self.exec.as_ref(), &self.poll);

        let mut delay = CommDelay::BASE;
        let mut rebooted = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let Some(record) = registry.get(&uuid).cloned() else {
                continue;
            };
            let _span =
                info_span!("reboot", %uuid, name = %record.vm_name).entered();

            let macs = if self.use_console(&record) {
                if let Err(e) =
                    self.console_command(uuid, creds, REBOOT_COMMAND, delay)
                {
                    debug!(error = %e, "console reboot reported failure");
                }
                record.macs.clone()
            } else {
                let ip = record
                    .primary_ip()
                    .ok_or(LifecycleError::NoAddress { uuid })?;
                let macs = self.guest_macs(ip, creds)?;
                info!(%ip, "rebooting guest");
                if let Err(e) =
                    self.exec.run_remote_privileged(REBOOT_COMMAND, ip, creds)
                {
                    debug!(%ip, error = %e, "reboot reported failure");
                }
                macs
            };

            pause(self.poll.reboot_settle);

            let (ips, d) = driver.discover_ips(&macs)?;
            delay = delay.raise_to(d);
            debug!(%delay, "guest rediscovered");

            PostBootConfigurator::new(self.exec.as_ref(), &self.poll)
                .with_delay(delay)
                .configure(&ips, creds, &record.shared_9p_tag)
                .map_err(|err| LifecycleError::PostBoot { uuid, err })?;

            if let Some(record) = registry.get_mut(&uuid) {
                record.ips = ips.clone();
                record.state = NetworkState::Up;
            }
            self.store.save(&registry)?;
            rebooted.push((uuid, ips));
        }

        Ok(rebooted)
    }

    fn guest_macs(
        &self,
        ip: IpAddr,
        creds: &Credentials,
    ) -> Result<Vec<MacAddr>, LifecycleError> {
        let out = self
            .exec
            .run_remote(GUEST_MAC_QUERY, ip, creds)
            .map_err(|err| LifecycleError::MacQuery { ip, err })?;
        let macs = net::parse_mac_list(&out.stdout)?;
        debug!(%ip, ?macs, "guest interfaces");
        Ok(macs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::fakes::{failure, FakeExecutor};

    #[test]
    fn host_check_requires_qemu() {
        let exec = FakeExecutor::new(|c| Err(failure(&c.command, 1, "")));
        assert!(matches!(
            check_host(&exec, &["virbr0".to_string()]),
            Err(LifecycleError::MissingTool(_))
        ));
    }

    #[test]
    fn host_check_looks_up_each_bridge_once() {
        let exec = FakeExecutor::new(|c| {
            if c.command.contains("grep virbr0") {
                Ok(CommandOutput::ok("virbr0\n"))
            } else if c.command.contains("grep br1") {
                Ok(CommandOutput::ok(""))
            } else {
                Ok(CommandOutput::ok("/usr/bin/qemu-system-x86_64\n"))
            }
        });

        let same = ["virbr0".to_string(), "virbr0".to_string()];
        check_host(&exec, &same).unwrap();
        assert_eq!(exec.commands_containing("ip -o -4 a").len(), 1);

        let missing = ["virbr0".to_string(), "br1".to_string()];
        assert!(matches!(
            check_host(&exec, &missing),
            Err(LifecycleError::MissingBridge(b)) if b == "br1"
        ));
    }
}
