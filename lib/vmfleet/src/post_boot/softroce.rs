// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! softROCE link setup on one guest interface.
//!
//! Newer iproute2 creates rxe links with `rdma link add`; older guests only
//! have `rxe_cfg`. The newer form is tried first. If it is rejected as an
//! invalid argument, or the link it creates never comes up, `rxe_cfg` is
//! tried before the interface is given up on. A failed interface is left
//! [`RdmaLinkState::Degraded`]: the guest is still usable for anything that
//! does not need RDMA.

use std::net::IpAddr;

use tracing::{debug, error, info, warn};

use crate::guest::{GuestError, GuestShell};

/// Device names are this prefix followed by the interface index.
pub const RDMA_DEVICE_PREFIX: &str = "mlx4_";

const RXE_MODULE: &str = "rdma_rxe";

/// The device name for the guest's `index`th interface.
pub fn device_name(index: usize) -> String {
    format!("{RDMA_DEVICE_PREFIX}{index}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RdmaLinkState {
    ModuleAbsent,
    ModuleLoaded,
    LinkRequested { netdev: String },
    LinkConfirmed { device: String },
    Degraded { reason: String },
}

impl RdmaLinkState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::LinkConfirmed { .. })
    }
}

/// Why `rdma link add` failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkAddFailure {
    /// The tool does not understand the request; an older guest whose
    /// links are managed with `rxe_cfg`.
    InvalidArgument,
    Other(String),
}

impl LinkAddFailure {
    /// `rdma` reports failures only as text, so this is the one place that
    /// reads it.
    pub fn classify(err: &GuestError) -> Self {
        let diagnostic = err.diagnostic();
        if diagnostic.contains("Invalid argument") {
            Self::InvalidArgument
        } else {
            Self::Other(diagnostic.trim().to_string())
        }
    }
}

/// Finds the interface holding `ip` in `ip -o -4 addr` output.
pub fn netdev_for_ip(output: &str, ip: IpAddr) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let inet = fields.iter().position(|f| *f == "inet")?;
        let addr = fields.get(inet + 1)?.split('/').next()?;
        if addr.parse::<IpAddr>().ok()? == ip {
            fields.get(1).map(|dev| dev.trim_end_matches(':').to_string())
        } else {
            None
        }
    })
}

/// Whether `rdma link show` output has `device` up.
pub fn link_is_up(output: &str, device: &str) -> bool {
    let port_prefix = format!("{device}/");
    output.lines().any(|line| {
        line.contains("LINK_UP")
            && line
                .split_whitespace()
                .any(|tok| tok == device || tok.starts_with(&port_prefix))
    })
}

/// Drives one interface through the link state machine.
pub struct SoftRoceLink<'a> {
    shell: &'a mut dyn GuestShell,
    ip: IpAddr,
    device: String,
    state: RdmaLinkState,
}

impl<'a> SoftRoceLink<'a> {
    pub fn new(
        shell: &'a mut dyn GuestShell,
        ip: IpAddr,
        device: String,
    ) -> Self {
        Self { shell, ip, device, state: RdmaLinkState::ModuleAbsent }
    }

    fn transition(&mut self, next: RdmaLinkState) {
        debug!(
            ip = %self.ip, from = ?self.state, to = ?next,
            "softroce transition"
        );
        self.state = next;
    }

    fn degrade(&mut self, reason: impl Into<String>) -> RdmaLinkState {
        let reason = reason.into();
        error!(
            ip = %self.ip, device = %self.device, %reason,
            "softROCE configuration failed"
        );
        self.transition(RdmaLinkState::Degraded { reason });
        self.state.clone()
    }

    /// Runs the whole setup and returns the final state.
    pub fn establish(mut self) -> RdmaLinkState {
        info!(ip = %self.ip, device = %self.device, "configuring softROCE");

        let modprobe = format!("modprobe {RXE_MODULE}");
        if let Err(e) = self.shell.run_privileged(&modprobe) {
            return self
                .degrade(format!("{modprobe}: {}", e.diagnostic().trim()));
        }
        match self.shell.run_privileged(&format!("lsmod | grep {RXE_MODULE}"))
        {
            Ok(out) if out.stdout.contains(RXE_MODULE) => {
                self.transition(RdmaLinkState::ModuleLoaded)
            }
            _ => return self.degrade(format!("{RXE_MODULE} not loaded")),
        }

        let netdev = match self.shell.run("ip -o -4 addr") {
            Ok(out) => match netdev_for_ip(&out.stdout, self.ip) {
                Some(netdev) => netdev,
                None => return self.degrade("no interface holds the address"),
            },
            Err(e) => {
                return self.degrade(format!(
                    "listing interfaces: {}",
                    e.diagnostic().trim()
                ))
            }
        };
        debug!(ip = %self.ip, %netdev, "address belongs to interface");
        self.transition(RdmaLinkState::LinkRequested {
            netdev: netdev.clone(),
        });

        let add =
            format!("rdma link add {} type rxe netdev {netdev}", self.device);
        match self.shell.run_privileged(&add) {
            Ok(_) => {
                let device = self.device.clone();
                if self.confirm(&device) {
                    return self.confirmed(device);
                }
                warn!(
                    ip = %self.ip, %device,
                    "link added but not up, trying rxe_cfg"
                );
            }
            Err(e) => match LinkAddFailure::classify(&e) {
                LinkAddFailure::InvalidArgument => {
                    warn!(
                        ip = %self.ip,
                        "rdma link add rejected, trying rxe_cfg"
                    );
                }
                LinkAddFailure::Other(reason) => {
                    return self.degrade(format!("rdma link add: {reason}"));
                }
            },
        }

        self.fall_back(netdev)
    }

    /// `rxe_cfg` names the link after the interface.
    fn fall_back(mut self, netdev: String) -> RdmaLinkState {
        let add = format!("rxe_cfg add {netdev}");
        if let Err(e) = self.shell.run_privileged(&add) {
            return self
                .degrade(format!("rxe_cfg add: {}", e.diagnostic().trim()));
        }
        if self.confirm(&netdev) {
            return self.confirmed(netdev);
        }
        self.degrade("link never came up")
    }

    fn confirm(&mut self, device: &str) -> bool {
        let show = format!("rdma link show | grep {device}");
        match self.shell.run_privileged(&show) {
            Ok(out) => link_is_up(&out.stdout, device),
            Err(_) => false,
        }
    }

    fn confirmed(mut self, device: String) -> RdmaLinkState {
        info!(ip = %self.ip, %device, "softROCE link is up");
        self.transition(RdmaLinkState::LinkConfirmed { device });
        self.state
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::fakes::{failure, FakeExecutor};
    use crate::guest::SshShell;
    use crate::request::Credentials;

    const IP_ADDR: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: ens3    inet 192.168.122.10/24 brd 192.168.122.255 scope global dynamic ens3\\       valid_lft 3568sec
3: ens4    inet 192.168.122.100/24 brd 192.168.122.255 scope global dynamic ens4\\       valid_lft 3568sec
";

    #[test]
    fn netdev_matches_whole_address() {
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        let netdev = |s: &str| netdev_for_ip(IP_ADDR, ip(s));
        assert_eq!(netdev("192.168.122.10").as_deref(), Some("ens3"));
        assert_eq!(netdev("192.168.122.100").as_deref(), Some("ens4"));
        assert_eq!(netdev_for_ip(IP_ADDR, ip("192.168.122.1")), None);
    }

    #[test]
    fn link_state_parsing() {
        let show =
            "link mlx4_0/1 state ACTIVE physical_state LINK_UP netdev ens3\n";
        assert!(link_is_up(show, "mlx4_0"));
        assert!(!link_is_up(show, "mlx4_1"));

        let rxe = "link rxe0/1 state ACTIVE physical_state LINK_UP netdev ens3";
        assert!(link_is_up(rxe, "ens3"));
        let down = "link mlx4_0/1 state DOWN physical_state DISABLED";
        assert!(!link_is_up(down, "mlx4_0"));
    }

    /// A guest whose `rdma link add` answers with `add_result` and whose
    /// links come up for the devices in `up`.
    fn guest(
        add_result: Result<(), &'static str>,
        up: &'static [&'static str],
        rxe_cfg_ok: bool,
    ) -> FakeExecutor {
        FakeExecutor::new(move |call| {
            let cmd = call.command.as_str();
            if cmd.starts_with("modprobe") {
                Ok(CommandOutput::ok(""))
            } else if cmd.starts_with("lsmod") {
                Ok(CommandOutput::ok("rdma_rxe 126976 0\n"))
            } else if cmd == "ip -o -4 addr" {
                Ok(CommandOutput::ok(IP_ADDR))
            } else if cmd.starts_with("rdma link add") {
                add_result
                    .map(|_| CommandOutput::ok(""))
                    .map_err(|stderr| failure(cmd, 255, stderr))
            } else if cmd.starts_with("rxe_cfg add") {
                if rxe_cfg_ok {
                    Ok(CommandOutput::ok(""))
                } else {
                    Err(failure(cmd, 127, "rxe_cfg: command not found"))
                }
            } else if let Some(dev) =
                cmd.strip_prefix("rdma link show | grep ")
            {
                if up.iter().any(|d| *d == dev) {
                    Ok(CommandOutput::ok(format!(
                        "link {dev}/1 state ACTIVE physical_state LINK_UP \
                         netdev ens3\n"
                    )))
                } else {
                    Err(failure(cmd, 1, ""))
                }
            } else {
                Err(failure(cmd, 1, "unexpected"))
            }
        })
    }

    fn establish(exec: &FakeExecutor) -> RdmaLinkState {
        let creds = Credentials::new("root", "root");
        let ip: IpAddr = "192.168.122.10".parse().unwrap();
        let mut shell = SshShell::new(exec, ip, &creds);
        SoftRoceLink::new(&mut shell, ip, device_name(0)).establish()
    }

    fn confirmed(device: &str) -> RdmaLinkState {
        RdmaLinkState::LinkConfirmed { device: device.to_string() }
    }

    #[test]
    fn primary_form_confirms() {
        let exec = guest(Ok(()), &["mlx4_0"], false);
        assert_eq!(establish(&exec), confirmed("mlx4_0"));
        assert!(exec.commands_containing("rxe_cfg").is_empty());
    }

    #[test]
    fn invalid_argument_falls_back_to_rxe_cfg() {
        let exec = guest(Err("error: Invalid argument"), &["ens3"], true);
        assert_eq!(establish(&exec), confirmed("ens3"));
        assert_eq!(exec.commands_containing("rxe_cfg add ens3").len(), 1);
    }

    #[test]
    fn unconfirmed_link_falls_back_to_rxe_cfg() {
        let exec = guest(Ok(()), &["ens3"], true);
        assert_eq!(establish(&exec), confirmed("ens3"));
    }

    #[test]
    fn both_forms_failing_degrades() {
        let exec = guest(Err("error: Invalid argument"), &[], false);
        assert!(matches!(establish(&exec), RdmaLinkState::Degraded { .. }));
    }

    #[test]
    fn other_add_failures_do_not_fall_back() {
        let exec =
            guest(Err("error: Operation not permitted"), &["ens3"], true);
        assert!(matches!(establish(&exec), RdmaLinkState::Degraded { .. }));
        assert!(exec.commands_containing("rxe_cfg").is_empty());
    }
}
