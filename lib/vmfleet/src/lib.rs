// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Brings up batches of qemu guests for kernel development and testing,
//! configures them once they boot, and keeps track of them between runs.
//!
//! [`lifecycle::FleetController`] is the entry point. It binds a
//! [`request::LaunchRequest`], allocates identities for the batch, builds the
//! guest kernel if asked to, boots the guests, finds their addresses on the
//! host bridge, and records them in the registry under the data directory.

pub mod build;
pub mod console;
pub mod data_dir;
pub mod executor;
pub mod fakes;
pub mod guest;
pub mod identity;
pub mod launch;
pub mod lifecycle;
pub mod net;
pub mod post_boot;
pub mod registry;
pub mod request;
pub mod timing;

pub use data_dir::DataDir;
pub use lifecycle::{FleetController, LifecycleError, StartOutcome};
pub use request::{Credentials, LaunchRequest};
