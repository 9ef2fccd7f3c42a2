// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Construction of the qemu command line for one guest.

use camino::Utf8PathBuf;

use crate::executor::shell_quote;
use crate::net::MacAddr;
use crate::request::NICS_PER_VM;

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// One virtual NIC, attached to a host bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NicConfig {
    pub bridge: String,
    pub mac: MacAddr,
}

/// Everything that goes on a guest's qemu command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QemuCommand {
    /// Whether to run with `-enable-kvm`.
    pub kvm: bool,

    pub cpus: u32,

    /// Guest memory in MiB.
    pub ram_mib: u32,

    /// Whether disk writes are discarded on exit.
    pub snapshot: bool,

    /// The UNIX socket the qemu monitor listens on. Its path is unique per
    /// guest, which also makes it the handle used to find the qemu process.
    pub monitor: Utf8PathBuf,

    /// The qcow2 boot image.
    pub image: Utf8PathBuf,

    /// The kernel booted directly with `-kernel`.
    pub kernel: Utf8PathBuf,

    /// The guest block device holding the root filesystem.
    pub root_dev: String,

    pub nics: [NicConfig; NICS_PER_VM],

    /// The host directory exported read-only over 9p, and its mount tag.
    pub share_dir: Utf8PathBuf,
    pub share_tag: String,

    /// When set, the serial console is attached to `<prefix>.in` and
    /// `<prefix>.out`.
    pub serial_pipe: Option<Utf8PathBuf>,

    /// Extra disks attached behind a megasas controller.
    pub scsi_images: Vec<Utf8PathBuf>,
}

impl QemuCommand {
    /// The program and arguments, unquoted.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![QEMU_BINARY.to_string()];
        let mut push =
            |args: &[&str]| argv.extend(args.iter().map(|a| a.to_string()));

        if self.kvm {
            push(&["-enable-kvm"]);
        }
        push(&[
            "-smp",
            &self.cpus.to_string(),
            "-m",
            &format!("{}M", self.ram_mib),
            "-nographic",
        ]);
        if self.snapshot {
            push(&["-snapshot"]);
        }
        push(&["-monitor", &format!("unix:{},server,nowait", self.monitor)]);
        push(&[
            "-drive",
            &format!("id=d0,file={},if=none,format=qcow2", self.image),
            "-device",
            "virtio-blk-pci,drive=d0,scsi=off",
            "-kernel",
            self.kernel.as_str(),
            "-append",
            &format!("root=/dev/{} rw console=ttyS0", self.root_dev),
        ]);

        for (i, nic) in self.nics.iter().enumerate() {
            push(&[
                "-netdev",
                &format!("bridge,br={},id=id{i}", nic.bridge),
                "-device",
                &format!("virtio-net,netdev=id{i},mac={}", nic.mac),
            ]);
        }

        push(&[
            "-virtfs",
            &format!(
                "local,path={},mount_tag={},security_model=passthrough,id=d1,readonly",
                self.share_dir, self.share_tag
            ),
        ]);

        if let Some(pipe) = &self.serial_pipe {
            push(&["-serial", &format!("pipe:{pipe}")]);
        }

        if !self.scsi_images.is_empty() {
            push(&["-device", "megasas,id=scsi0"]);
            for (i, image) in self.scsi_images.iter().enumerate() {
                push(&[
                    "-device",
                    &format!(
                        "scsi-hd,drive=drive{i},bus=scsi0.0,channel=0,scsi-id={i},lun=0"
                    ),
                    "-drive",
                    &format!("file={image},if=none,id=drive{i}"),
                ]);
            }
        }

        argv
    }

    /// The command line as a single shell command. Arguments are quoted only
    /// where the shell would otherwise split or expand them.
    pub fn to_shell(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| {
                let plain = arg.chars().all(|c| {
                    c.is_ascii_alphanumeric() || "-_=,.:/+@%".contains(c)
                });
                if plain {
                    arg.clone()
                } else {
                    shell_quote(arg)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
