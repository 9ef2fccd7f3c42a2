// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The on-disk layout of the data directory shared by every invocation.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::request::VmClass;

/// Environment variable naming the directory under which the data directory
/// is created. Defaults to `$HOME`.
pub const DATA_ENV_VAR: &str = "VMFLEET_DATA";

const DATA_DIR_NAME: &str = "vmfleet_data";
const REGISTRY_FILE: &str = "vm_details.json";

#[derive(Debug, Error)]
pub enum DataDirError {
    #[error("{DATA_ENV_VAR} points to {0}, which is not a directory")]
    MissingBase(Utf8PathBuf),

    #[error("neither {DATA_ENV_VAR} nor HOME is set")]
    NoBase,

    #[error("data directory base {0:?} is not valid UTF-8")]
    NonUtf8(std::path::PathBuf),

    #[error("failed to create {path}")]
    Create {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDir {
    root: Utf8PathBuf,
}

impl DataDir {
    /// Uses `root` itself as the data directory.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the data directory from the environment: under
    /// `$VMFLEET_DATA` if it is set, under `$HOME` otherwise.
    pub fn from_env() -> Result<Self, DataDirError> {
        let base = match std::env::var_os(DATA_ENV_VAR) {
            Some(base) => {
                let base = utf8(base.into())?;
                if !base.is_dir() {
                    return Err(DataDirError::MissingBase(base));
                }
                base
            }
            None => match std::env::var_os("HOME") {
                Some(home) => utf8(home.into())?,
                None => return Err(DataDirError::NoBase),
            },
        };

        Ok(Self::new(base.join(DATA_DIR_NAME)))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn registry_file(&self) -> Utf8PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.root.join("logs")
    }

    pub fn pipes_dir(&self) -> Utf8PathBuf {
        self.root.join("vm_pipes")
    }

    pub fn monitors_dir(&self) -> Utf8PathBuf {
        self.root.join("vm_monitors")
    }

    pub fn images_dir(&self) -> Utf8PathBuf {
        self.root.join("vm_imgs")
    }

    /// The qemu monitor socket for the guest with the given id.
    pub fn monitor_socket(&self, uuid: &uuid::Uuid) -> Utf8PathBuf {
        self.monitors_dir().join(uuid.to_string())
    }

    /// Where the kernel tree (and built `bzImage`) for `class` lives.
    pub fn kernel_dir(&self, class: VmClass) -> Utf8PathBuf {
        self.root.join(class.folders().kernel)
    }

    /// The directory exported to guests of `class` over 9p.
    pub fn share_dir(&self, class: VmClass) -> Utf8PathBuf {
        self.root.join(class.folders().share)
    }

    /// Creates every directory in the layout that does not exist yet.
    pub fn create_layout(&self) -> Result<(), DataDirError> {
        let mut dirs = vec![
            self.root.clone(),
            self.logs_dir(),
            self.pipes_dir(),
            self.monitors_dir(),
            self.images_dir(),
        ];
        for class in [VmClass::Server, VmClass::Storage] {
            dirs.push(self.kernel_dir(class));
            dirs.push(self.share_dir(class));
        }

        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|err| {
                DataDirError::Create { path: dir.clone(), err }
            })?;
            debug!(%dir, "data directory ready");
        }

        Ok(())
    }
}

fn utf8(path: std::path::PathBuf) -> Result<Utf8PathBuf, DataDirError> {
    Utf8PathBuf::try_from(path)
        .map_err(|e| DataDirError::NonUtf8(e.into_path_buf()))
}
