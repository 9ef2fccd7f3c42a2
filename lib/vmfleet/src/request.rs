// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed launch requests and the small enums shared across the crate.

use std::collections::BTreeSet;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_dir::DataDir;

/// Every guest gets this many virtual NICs, each with its own MAC and IP.
pub const NICS_PER_VM: usize = 2;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("num_of_vm must be at least 1")]
    NoVms,

    #[error("num_of_cpu and ram_size must be non-zero")]
    NoResources,

    #[error("image path {0} does not name a qcow image")]
    NotQcow(Utf8PathBuf),

    #[error("no block device given")]
    NoBlockDevice,

    #[error("no username given")]
    NoUsername,

    #[error("no bridge given for NIC {0}")]
    NoBridge(usize),

    #[error("unknown {kind} {value:?}")]
    UnknownValue { kind: &'static str, value: String },
}

/// The two kinds of guest in a test setup. Each class has its own kernel
/// tree, module share, and 9p tag so that servers and storage targets can run
/// different kernels side by side.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VmClass {
    Server,
    Storage,
}

/// Data-directory folder names and the 9p tag used by one [`VmClass`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassFolders {
    pub kernel: &'static str,
    pub share: &'static str,
    pub tag: &'static str,
}

/// The resolved per-class locations for one launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassProfile {
    pub class: VmClass,
    pub kernel_dir: Utf8PathBuf,
    pub share_dir: Utf8PathBuf,
    pub tag: String,
}

impl ClassProfile {
    pub fn bz_image(&self) -> Utf8PathBuf {
        self.kernel_dir.join("bzImage")
    }
}

impl VmClass {
    pub fn name(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Storage => "storage",
        }
    }

    pub fn folders(self) -> ClassFolders {
        match self {
            Self::Server => ClassFolders {
                kernel: "serv_linux",
                share: "serv_vm_share",
                tag: "serverhost",
            },
            Self::Storage => ClassFolders {
                kernel: "stor_linux",
                share: "stor_vm_share",
                tag: "storehost",
            },
        }
    }

    pub fn profile(self, data_dir: &DataDir) -> ClassProfile {
        ClassProfile {
            class: self,
            kernel_dir: data_dir.kernel_dir(self),
            share_dir: data_dir.share_dir(self),
            tag: self.folders().tag.to_string(),
        }
    }
}

impl std::fmt::Display for VmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VmClass {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "storage" => Ok(Self::Storage),
            _ => Err(RequestError::UnknownValue {
                kind: "vm class",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether a guest's disk outlives it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmMode {
    /// Disk writes are discarded when the guest exits.
    #[default]
    Snapshot,
    /// The guest boots from its own copy of the image, kept in a numbered
    /// slot that later runs reuse.
    Persistent,
}

impl FromStr for VmMode {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(Self::Snapshot),
            "persistent" => Ok(Self::Persistent),
            _ => Err(RequestError::UnknownValue {
                kind: "mode",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OptionalFeature {
    /// Attach the guest's serial console to a pair of named pipes.
    Pipe,
}

impl FromStr for OptionalFeature {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipe" => Ok(Self::Pipe),
            _ => Err(RequestError::UnknownValue {
                kind: "optional feature",
                value: s.to_string(),
            }),
        }
    }
}

/// Guest login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Which parts of a launch to perform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildOption {
    /// Build the kernel and external modules, then launch.
    #[default]
    All,
    /// Build only the kernel, then launch.
    Kernel,
    /// Build only the external modules, then launch.
    Module,
    /// Launch with whatever was built before.
    Run,
}

impl BuildOption {
    pub fn builds_kernel(self) -> bool {
        matches!(self, Self::All | Self::Kernel)
    }

    pub fn builds_modules(self) -> bool {
        matches!(self, Self::All | Self::Module)
    }
}

impl FromStr for BuildOption {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "kernel" => Ok(Self::Kernel),
            "module" => Ok(Self::Module),
            "run" => Ok(Self::Run),
            _ => Err(RequestError::UnknownValue {
                kind: "build option",
                value: s.to_string(),
            }),
        }
    }
}

/// Where the guest kernel comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelSource {
    /// A git URL, shallow-cloned into the class kernel folder.
    Git(String),
    /// A kernel tree already on this host, built in place.
    Local(Utf8PathBuf),
}

impl KernelSource {
    /// Treats anything with a URL scheme and a host as a git remote and
    /// everything else as a local path.
    pub fn parse(code: &str) -> Self {
        let is_url = code
            .split_once("://")
            .map(|(scheme, rest)| {
                let scheme_char =
                    |c: char| c.is_ascii_alphanumeric() || "+-.".contains(c);
                let scheme_ok =
                    !scheme.is_empty() && scheme.chars().all(scheme_char);
                let host = rest.split('/').next().unwrap_or_default();
                scheme_ok && !host.is_empty()
            })
            .unwrap_or(false);

        if is_url {
            Self::Git(code.to_string())
        } else {
            Self::Local(Utf8PathBuf::from(code))
        }
    }
}

impl std::fmt::Display for KernelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git(url) => f.write_str(url),
            Self::Local(path) => write!(f, "{path}"),
        }
    }
}

/// Everything needed to build and boot one batch of guests of a single class.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub vm_class: VmClass,
    pub mode: VmMode,
    pub num_of_vm: u32,
    pub num_of_cpu: u32,
    /// Guest memory in MiB.
    pub ram_size: u32,
    pub qcow: Utf8PathBuf,
    /// The guest device holding the root filesystem, such as `vda`.
    pub block_dev: String,
    pub creds: Credentials,
    pub bridges: [String; NICS_PER_VM],
    pub kernel_code: Option<KernelSource>,
    pub modules: Vec<Utf8PathBuf>,
    pub optional: BTreeSet<OptionalFeature>,
    pub scsi_images: Vec<Utf8PathBuf>,
    pub build: BuildOption,
}

impl LaunchRequest {
    /// Checks the fields a launch cannot do without.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.num_of_vm == 0 {
            return Err(RequestError::NoVms);
        }
        if self.num_of_cpu == 0 || self.ram_size == 0 {
            return Err(RequestError::NoResources);
        }
        if !self.qcow.as_str().contains("qcow") {
            return Err(RequestError::NotQcow(self.qcow.clone()));
        }
        if self.block_dev.is_empty() {
            return Err(RequestError::NoBlockDevice);
        }
        if self.creds.username.is_empty() {
            return Err(RequestError::NoUsername);
        }
        if let Some(nic) =
            self.bridges.iter().position(|b| b.trim().is_empty())
        {
            return Err(RequestError::NoBridge(nic));
        }

        Ok(())
    }

    pub fn has_feature(&self, feature: OptionalFeature) -> bool {
        self.optional.contains(&feature)
    }
}
