#![deny(unused_extern_crates)]
#![deny(unused_crate_dependencies)]
#![deny(unsafe_code)]

use clap as _;
use clap_verbosity_flag as _;
use colored as _;
use eyre as _;
use tracing_subscriber as _;

#[cfg(test)]
use gantry_cli_test_utils as _;

pub mod bootstrap;
pub mod config;
mod error;
pub mod firewall;
pub mod gce;
pub mod image;
pub mod instance;
pub mod naming;
pub mod provisioner;
pub mod reaper;
pub mod ssh_keys;
pub mod teardown;

pub use bootstrap::{BootstrapState, RootAccess, SshRootAccess};
pub use config::{Config, FleetFile, HostSpec, Overrides, PortSpec};
pub use error::{Error, Result};
pub use gce::{Cloud, ComputeApi, GceClient};
pub use image::{ImageReference, OsFamily};
pub use instance::{BOOTSTRAP_USER, HostFailure, ProvisionedHost};
pub use provisioner::{GoogleCompute, Provisioner, RunReport, TestGroup};
pub use reaper::{ReapPolicy, ReapReport};
pub use ssh_keys::{KeyLocator, KeyPair};
pub use teardown::TeardownReport;

/// Spacing between polls of a long-running operation that has not finished
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
