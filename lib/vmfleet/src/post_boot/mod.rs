// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing a booted guest to a test-ready state.

use std::net::IpAddr;

use thiserror::Error;
use tracing::{info, info_span};

use crate::executor::Executor;
use crate::guest::{GuestError, GuestShell, SshShell};
use crate::net;
use crate::request::Credentials;
use crate::timing::{CommDelay, PollConfig};

pub mod softroce;

pub use softroce::{LinkAddFailure, RdmaLinkState};

/// Where the host's module share is mounted inside guests.
pub const SHARED_MODULES_MOUNT: &str = "/mnt/shared_modules";

/// Modules (with parameters) downstream tests expect to be loaded already.
pub const REQUIRED_MODULES: &[&str] = &[
    "null_blk nr_devices=5",
    "brd rd_nr=5 rd_size=204800",
    "loop",
];

#[derive(Debug, Error)]
pub enum PostBootError {
    #[error("guest has no addresses")]
    NoAddress,

    #[error("{ip} did not answer {attempts} pings")]
    Unreachable { ip: IpAddr, attempts: u32 },

    #[error("mounting the module share failed at `{step}`")]
    Mount {
        step: String,
        #[source]
        err: GuestError,
    },

    #[error("failed to load module `{module}`")]
    ModuleLoad {
        module: &'static str,
        #[source]
        err: GuestError,
    },
}

/// The softROCE outcome for each of a guest's interfaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostBootReport {
    pub links: Vec<(IpAddr, RdmaLinkState)>,
}

impl PostBootReport {
    /// Interfaces left without a working RDMA link.
    pub fn degraded(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.links
            .iter()
            .filter(|(_, state)| !state.is_confirmed())
            .map(|(ip, _)| *ip)
    }
}

/// Mounts the 9p share tagged `tag` and links the modules it carries into
/// the guest's module search path.
pub fn mount_shared_modules(
    shell: &mut dyn GuestShell,
    tag: &str,
) -> Result<(), PostBootError> {
    let steps = [
        format!("rm -rf {SHARED_MODULES_MOUNT}/"),
        format!("mkdir {SHARED_MODULES_MOUNT}"),
        format!(
            "mount -t 9p -o trans=virtio {tag} {SHARED_MODULES_MOUNT} \
             -oversion=9p2000.L"
        ),
        format!("ln -s -f {SHARED_MODULES_MOUNT}/lib/modules/*/ /lib/modules/"),
    ];

    for step in steps {
        shell
            .run(&step)
            .map_err(|err| PostBootError::Mount { step: step.clone(), err })?;
    }
    Ok(())
}

/// Loads every module in [`REQUIRED_MODULES`].
pub fn load_required_modules(
    shell: &mut dyn GuestShell,
) -> Result<(), PostBootError> {
    for &module in REQUIRED_MODULES {
        shell
            .run_privileged(&format!("modprobe {module}"))
            .map_err(|err| PostBootError::ModuleLoad { module, err })?;
    }
    Ok(())
}

pub struct PostBootConfigurator<'a> {
    exec: &'a dyn Executor,
    poll: &'a PollConfig,
    delay: CommDelay,
}

impl<'a> PostBootConfigurator<'a> {
    pub fn new(exec: &'a dyn Executor, poll: &'a PollConfig) -> Self {
        Self { exec, poll, delay: CommDelay::BASE }
    }

    /// Stretches the wait between ping retries for a slow host.
    pub fn with_delay(mut self, delay: CommDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Configures the guest reachable at `ips` over SSH.
    ///
    /// Reachability, the module share, and module loading must all succeed.
    /// softROCE is attempted on every interface and its failures only show
    /// up in the returned report.
    pub fn configure(
        &self,
        ips: &[IpAddr],
        creds: &Credentials,
        tag: &str,
    ) -> Result<PostBootReport, PostBootError> {
        let primary = *ips.first().ok_or(PostBootError::NoAddress)?;
        let _span = info_span!("post_boot", ip = %primary).entered();

        for &ip in ips {
            info!(%ip, "checking connectivity");
            if !net::ping_check(
                self.exec,
                ip,
                self.poll.boot_ping_attempts,
                self.poll.boot_ping_interval,
                self.delay.scale(self.poll.ping_retry_delay),
            ) {
                return Err(PostBootError::Unreachable {
                    ip,
                    attempts: self.poll.boot_ping_attempts,
                });
            }
        }

        let mut shell = SshShell::new(self.exec, primary, creds);
        info!(tag, "mounting module share");
        mount_shared_modules(&mut shell, tag)?;
        info!("loading required modules");
        load_required_modules(&mut shell)?;

        let mut report = PostBootReport::default();
        for (i, &ip) in ips.iter().enumerate() {
            let mut shell = SshShell::new(self.exec, ip, creds);
            let state = softroce::SoftRoceLink::new(
                &mut shell,
                ip,
                softroce::device_name(i),
            )
            .establish();
            report.links.push((ip, state));
        }

        info!(
            degraded = report.degraded().count(),
            "post-boot configuration done"
        );
        Ok(report)
    }
}
