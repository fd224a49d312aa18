//! gantry testing utilities
//!
//! Everything needed to drive the orchestrator without a cloud account:
//! - [`FakeCompute`]: an in-memory Compute Engine with call logging and fault injection
//! - [`RecordingRootAccess`]: a root-access collaborator that records instead of SSHing
//! - [`TestEnv`]: a temp directory holding an SSH key pair, plus config/provisioner builders

pub mod compute;
pub mod root_access;
pub mod test_env;

pub use compute::{FakeCompute, Fault, FaultKind};
pub use root_access::{RecordedStep, RecordingRootAccess};
pub use test_env::TestEnv;

/// Project the fake is seeded for
pub const PROJECT: &str = "acme";
/// Zone the fake is seeded for
pub const ZONE: &str = "us-central1-a";
