// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use vmfleet::request::{
    BuildOption, Credentials, KernelSource, LaunchRequest, OptionalFeature,
    RequestError, VmClass, VmMode, NICS_PER_VM,
};

/// A fleet to bring up: how many guests of each class, and the profile each
/// class is built from.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct FleetConfig {
    /// Console log level, one of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub server: Option<ClassSection>,

    #[serde(default)]
    pub storage: Option<ClassSection>,

    #[serde(default, rename = "profile")]
    pub profiles: BTreeMap<String, VmProfile>,
}

/// The guests of one class.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ClassSection {
    /// The name of a `[profile.<name>]` table.
    pub profile: String,
    pub num_of_vm: u32,
}

/// Everything about a guest except how many of it there are.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct VmProfile {
    #[serde(default)]
    pub mode: VmMode,

    pub num_of_cpu: u32,

    /// Guest memory in MiB.
    pub ram_size: u32,

    pub qcow: Utf8PathBuf,
    pub block_dev: String,

    #[serde(default = "default_username")]
    pub username: String,
    pub password: String,

    /// The bridges the two NICs attach to. A single bridge is used for both.
    pub bridges: Vec<String>,

    /// A git URL to clone or a kernel tree on this host.
    #[serde(default)]
    pub kernel_code: Option<String>,

    /// Out-of-tree module directories built against the kernel.
    #[serde(default)]
    pub modules: Vec<Utf8PathBuf>,

    #[serde(default)]
    pub optional: BTreeSet<OptionalFeature>,

    #[serde(default)]
    pub scsi_images: Vec<Utf8PathBuf>,
}

fn default_username() -> String {
    "root".to_string()
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Profile {profile} for {class} guests is not defined")]
    UnknownProfile { class: VmClass, profile: String },

    #[error("Profile {0} needs one or two bridges")]
    Bridges(String),

    #[error("Profile {profile} is invalid: {err}")]
    Invalid {
        profile: String,
        #[source]
        err: RequestError,
    },
}

/// Parses and validates a fleet config file.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<FleetConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<FleetConfig>(&contents)?;
    Ok(cfg)
}

fn absolute(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl FleetConfig {
    /// The classes to launch, in launch order, skipping classes with no
    /// guests.
    pub fn classes(&self) -> impl Iterator<Item = (VmClass, &ClassSection)> {
        [(VmClass::Server, &self.server), (VmClass::Storage, &self.storage)]
            .into_iter()
            .filter_map(|(class, section)| Some((class, section.as_ref()?)))
            .filter(|(_, section)| section.num_of_vm > 0)
    }

    /// One launch request per class to launch. Relative paths are resolved
    /// against `base`.
    pub fn launch_requests(
        &self,
        base: &Utf8Path,
        build: BuildOption,
    ) -> Result<Vec<LaunchRequest>, ParseError> {
        self.classes()
            .map(|(class, section)| {
                let profile = self.profiles.get(&section.profile).ok_or_else(
                    || ParseError::UnknownProfile {
                        class,
                        profile: section.profile.clone(),
                    },
                )?;
                profile.to_request(
                    &section.profile,
                    class,
                    section.num_of_vm,
                    base,
                    build,
                )
            })
            .collect()
    }
}

impl VmProfile {
    pub fn to_request(
        &self,
        name: &str,
        class: VmClass,
        num_of_vm: u32,
        base: &Utf8Path,
        build: BuildOption,
    ) -> Result<LaunchRequest, ParseError> {
        let bridges: [String; NICS_PER_VM] = match self.bridges.as_slice() {
            [one] => [one.clone(), one.clone()],
            [first, second] => [first.clone(), second.clone()],
            _ => return Err(ParseError::Bridges(name.to_string())),
        };

        let kernel_code = self.kernel_code.as_deref().map(|code| {
            match KernelSource::parse(code) {
                KernelSource::Local(path) => {
                    KernelSource::Local(absolute(base, &path))
                }
                git => git,
            }
        });

        let request = LaunchRequest {
            vm_class: class,
            mode: self.mode,
            num_of_vm,
            num_of_cpu: self.num_of_cpu,
            ram_size: self.ram_size,
            qcow: absolute(base, &self.qcow),
            block_dev: self.block_dev.clone(),
            creds: Credentials::new(&self.username, &self.password),
            bridges,
            kernel_code,
            modules: self.modules.iter().map(|m| absolute(base, m)).collect(),
            optional: self.optional.clone(),
            scsi_images: self
                .scsi_images
                .iter()
                .map(|i| absolute(base, i))
                .collect(),
            build,
        };

        request.validate().map_err(|err| ParseError::Invalid {
            profile: name.to_string(),
            err,
        })?;
        Ok(request)
    }
}
