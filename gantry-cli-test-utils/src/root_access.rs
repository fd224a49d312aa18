//! Root access that records each step instead of running it over SSH

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use gantry::{Error, ProvisionedHost, Result, RootAccess};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStep {
    pub step: &'static str,
    pub instance_name: String,
    /// Account the step logged in as
    pub user: String,
    pub ssh_key: PathBuf,
}

/// Records every call; optionally fails one step for hosts whose logical
/// name matches.
#[derive(Default)]
pub struct RecordingRootAccess {
    steps: Mutex<Vec<RecordedStep>>,
    failing: Option<(String, &'static str)>,
}

impl RecordingRootAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `step` for the host called `host`.
    pub fn failing(host: &str, step: &'static str) -> Self {
        Self {
            steps: Mutex::default(),
            failing: Some((host.to_string(), step)),
        }
    }

    pub fn steps(&self) -> Vec<RecordedStep> {
        self.steps.lock().expect("recorder poisoned").clone()
    }

    /// Steps taken for one instance, in order
    pub fn steps_for(&self, instance_name: &str) -> Vec<&'static str> {
        self.steps()
            .into_iter()
            .filter(|s| s.instance_name == instance_name)
            .map(|s| s.step)
            .collect()
    }

    fn record(&self, step: &'static str, host: &ProvisionedHost) -> Result<()> {
        self.steps.lock().expect("recorder poisoned").push(RecordedStep {
            step,
            instance_name: host.instance_name.clone(),
            user: host.user.clone(),
            ssh_key: host.ssh_key.clone(),
        });

        match &self.failing {
            Some((name, failing_step)) if name == host.name() && *failing_step == step => {
                Err(Error::Bootstrap {
                    host: host.name().to_string(),
                    step,
                    message: "Permission denied (publickey)".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RootAccess for RecordingRootAccess {
    async fn copy_credentials_to_root(&self, host: &ProvisionedHost) -> Result<()> {
        self.record("copy_credentials_to_root", host)
    }

    async fn enable_root_login(&self, host: &ProvisionedHost) -> Result<()> {
        self.record("enable_root_login", host)
    }

    async fn close_connection(&self, host: &ProvisionedHost) -> Result<()> {
        self.record("close_connection", host)
    }
}
