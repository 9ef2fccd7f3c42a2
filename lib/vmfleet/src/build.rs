// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building the guest kernel and out-of-tree modules.
//!
//! The kernel is built on the host and booted directly by qemu, while its
//! modules are installed into the class share directory that guests mount
//! over 9p.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::data_dir::DataDir;
use crate::executor::{shell_quote, ExecutionError, Executor};
use crate::request::{ClassProfile, KernelSource};

/// Options every guest kernel must have built in.
pub const BASE_CONFIG_OPTIONS: &[&str] = &[
    "CONFIG_NETWORK_FILESYSTEMS",
    "CONFIG_EXT4_FS",
    "CONFIG_IA32_EMULATION",
    "CONFIG_PCI",
    "CONFIG_VIRTIO_PCI",
    "CONFIG_VIRTIO",
    "CONFIG_VIRTIO_BALLOON",
    "CONFIG_VIRTIO_BLK",
    "CONFIG_VIRTIO_NET",
    "CONFIG_NET_9P",
    "CONFIG_NET_9P_VIRTIO",
    "CONFIG_9P_FS",
    "CONFIG_9P_FS_POSIX_ACL",
    "CONFIG_E100",
    "CONFIG_E1000",
    "CONFIG_E1000E",
    "CONFIG_NET_FAILOVER",
];

/// Extra options needed when guests get SCSI disks.
pub const SCSI_CONFIG_OPTIONS: &[&str] =
    &["CONFIG_SCSI", "CONFIG_BLK_DEV_SD", "CONFIG_MEGARAID_SAS"];

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build step `{step}` failed")]
    Step {
        step: &'static str,
        #[source]
        err: ExecutionError,
    },

    #[error("no kernel config at {path}")]
    NoConfig {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("I/O error on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("kernel config still lacks {0:?} after merging")]
    MissingOptions(Vec<String>),
}

/// The result of forcing options on in a kernel config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigPatch {
    pub text: String,
    /// Options whose line was rewritten.
    pub changed: Vec<String>,
    /// Options with no line at all.
    pub missing: Vec<String>,
}

/// Sets every option in `required` to `y` where `text` mentions it, either
/// as `OPT=<value>` or as `# OPT is not set`.
pub fn ensure_kernel_config(text: &str, required: &[&str]) -> ConfigPatch {
    let mut found = vec![false; required.len()];
    let mut changed = Vec::new();

    let lines: Vec<String> = text
        .lines()
        .map(|line| {
            let key = if let Some((key, _)) = line.split_once('=') {
                Some((key, false))
            } else {
                line.strip_prefix("# ")
                    .and_then(|rest| rest.strip_suffix(" is not set"))
                    .map(|key| (key, true))
            };

            let Some((key, unset)) = key else {
                return line.to_string();
            };
            let Some(idx) = required.iter().position(|opt| *opt == key) else {
                return line.to_string();
            };

            found[idx] = true;
            let wanted = format!("{key}=y");
            if unset || line != wanted {
                changed.push(key.to_string());
                wanted
            } else {
                line.to_string()
            }
        })
        .collect();

    let missing = required
        .iter()
        .zip(found)
        .filter(|(_, found)| !found)
        .map(|(opt, _)| opt.to_string())
        .collect();

    let mut text = lines.join("\n");
    text.push('\n');
    ConfigPatch { text, changed, missing }
}

/// Builds the kernel and modules for one class of guests.
pub struct KernelBuilder<'a> {
    exec: &'a dyn Executor,
    data_dir: &'a DataDir,
    profile: &'a ClassProfile,
}

impl<'a> KernelBuilder<'a> {
    pub fn new(
        exec: &'a dyn Executor,
        data_dir: &'a DataDir,
        profile: &'a ClassProfile,
    ) -> Self {
        Self { exec, data_dir, profile }
    }

    /// Where the kernel tree for `source` lives: the class kernel folder for
    /// cloned trees, the tree itself for local ones.
    pub fn kernel_tree(&self, source: &KernelSource) -> Utf8PathBuf {
        match source {
            KernelSource::Git(_) => self.profile.kernel_dir.clone(),
            KernelSource::Local(path) => path.clone(),
        }
    }

    fn run(&self, step: &'static str, cmd: &str) -> Result<(), BuildError> {
        self.exec
            .run_local(cmd)
            .map(|_| ())
            .map_err(|err| BuildError::Step { step, err })
    }

    /// Fetches, configures, and builds the kernel, then installs its modules
    /// into the class share directory.
    pub fn build_kernel(
        &self,
        source: &KernelSource,
        with_scsi: bool,
    ) -> Result<(), BuildError> {
        let _span =
            info_span!("build_kernel", class = %self.profile.class).entered();
        let tree = self.kernel_tree(source);

        if let KernelSource::Git(url) = source {
            self.clone_tree(url, &tree)?;
        }

        let mut required = BASE_CONFIG_OPTIONS.to_vec();
        if with_scsi {
            required.extend_from_slice(SCSI_CONFIG_OPTIONS);
        }
        self.configure(&tree, &required)?;

        info!(%tree, "building kernel, this takes a while");
        self.run("make", &format!("yes '' | make -C {tree} -j$(nproc)"))?;

        let built = tree.join("arch/x86_64/boot/bzImage");
        let target = self.profile.bz_image();
        std::fs::copy(&built, &target)
            .map_err(|err| BuildError::Io { path: built.clone(), err })?;
        info!(%target, "kernel image ready");

        let share = &self.profile.share_dir;
        match std::fs::remove_dir_all(share) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(BuildError::Io { path: share.clone(), err }),
        }
        std::fs::create_dir_all(share)
            .map_err(|err| BuildError::Io { path: share.clone(), err })?;

        info!(%share, "installing modules into share");
        self.run(
            "modules_install",
            &format!("make -C {tree} INSTALL_MOD_PATH={share} modules_install"),
        )
    }

    fn clone_tree(&self, url: &str, tree: &Utf8Path) -> Result<(), BuildError> {
        info!(url, %tree, "cloning kernel");
        self.run("clean", &format!("rm -rf {tree}/"))?;
        self.run("mkdir", &format!("mkdir -p {tree}"))?;
        self.run(
            "clone",
            &format!("git clone --depth=1 {} {tree}", shell_quote(url)),
        )?;
        self.run(
            "seed config",
            &format!("cp /boot/config-$(uname -r) {tree}/.config"),
        )
    }

    /// Forces `required` on in the tree's `.config`, merging in options the
    /// config does not mention at all.
    pub fn configure(
        &self,
        tree: &Utf8Path,
        required: &[&str],
    ) -> Result<(), BuildError> {
        let missing = self.patch_config(tree, required)?;
        if missing.is_empty() {
            return Ok(());
        }

        info!(?missing, "adding options the config lacks");
        let fragment = self.data_dir.root().join(".config-fragment");
        let body: String =
            missing.iter().map(|opt| format!("{opt}=y\n")).collect();
        std::fs::write(&fragment, body)
            .map_err(|err| BuildError::Io { path: fragment.clone(), err })?;
        self.run(
            "merge config",
            &format!(
                "cd {tree} && bash ./scripts/kconfig/merge_config.sh \
                 .config {fragment}"
            ),
        )?;

        let still_missing = self.patch_config(tree, required)?;
        if !still_missing.is_empty() {
            return Err(BuildError::MissingOptions(still_missing));
        }
        Ok(())
    }

    fn patch_config(
        &self,
        tree: &Utf8Path,
        required: &[&str],
    ) -> Result<Vec<String>, BuildError> {
        let path = tree.join(".config");
        let text = std::fs::read_to_string(&path)
            .map_err(|err| BuildError::NoConfig { path: path.clone(), err })?;

        let patch = ensure_kernel_config(&text, required);
        for opt in &patch.changed {
            info!(option = %opt, "enabled kernel option");
        }
        std::fs::write(&path, &patch.text)
            .map_err(|err| BuildError::Io { path: path.clone(), err })?;
        Ok(patch.missing)
    }

    /// Builds the out-of-tree module in `dir` against `tree` and installs it
    /// into the class share directory.
    pub fn build_module(
        &self,
        dir: &Utf8Path,
        tree: &Utf8Path,
    ) -> Result<(), BuildError> {
        let share = &self.profile.share_dir;
        info!(module = %dir, "building external module");
        if !dir.is_dir() {
            warn!(module = %dir, "module directory does not exist");
        }
        self.run("module make", &format!("cd {dir} && make KDIR={tree}"))?;
        self.run(
            "module install",
            &format!(
                "cd {dir} && make INSTALL_MOD_PATH={share} KDIR={tree} \
                 modules_install"
            ),
        )
    }
}
