//! The provisioning run: firewalls first, then every host in parallel.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{RootAccess, bootstrap_root};
use crate::config::{Config, HostSpec};
use crate::firewall::{create_external_firewall, create_internal_firewall};
use crate::gce::Cloud;
use crate::image::{ImageResolver, ImageSelector};
use crate::instance::{HostContext, HostFailure, ProvisionedHost, SharedNetwork, provision_host};
use crate::naming::{external_firewall_name, internal_firewall_name, new_test_group_id};
use crate::ssh_keys::KeyLocator;
use crate::teardown::{TeardownReport, teardown};
use crate::{Error, Result};

/// Brings fleets up and takes them down again.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a test group holding one host per spec.
    ///
    /// `Err` means nothing was created (bad configuration, unknown network).
    /// Once cloud resources exist the group always comes back in the
    /// [`RunReport`], with host failures and any group-level failure in it.
    async fn provision(&self, specs: &[HostSpec]) -> Result<RunReport>;

    async fn teardown(&self, group: &TestGroup) -> TeardownReport;
}

/// Everything created for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestGroup {
    pub id: String,
    pub project: String,
    pub zone: String,
    pub external_firewall: String,
    pub internal_firewall: String,
    pub hosts: Vec<ProvisionedHost>,
    /// Instances that exist (or may) without a finished host record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub untracked_instances: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TestGroup {
    pub fn new(id: impl Into<String>, project: impl Into<String>, zone: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            external_firewall: external_firewall_name(&id),
            internal_firewall: internal_firewall_name(&id),
            id,
            project: project.into(),
            zone: zone.into(),
            hosts: Vec::new(),
            untracked_instances: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Every instance teardown has to remove
    pub fn instance_names(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .map(|h| h.instance_name.as_str())
            .chain(self.untracked_instances.iter().map(String::as_str))
    }

    pub fn host(&self, name: &str) -> Option<&ProvisionedHost> {
        self.hosts.iter().find(|h| h.name() == name)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Result of a provisioning run: the group plus every host that failed.
#[derive(Debug)]
pub struct RunReport {
    pub group: TestGroup,
    pub failures: Vec<HostFailure>,
    /// Set when the run stopped before any host was started (a firewall
    /// could not be created); `group` still names what may exist.
    pub aborted: Option<Error>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }

    /// All-or-nothing view: the group only if every host came up.
    pub fn into_result(self) -> std::result::Result<TestGroup, RunReport> {
        if self.is_complete() {
            Ok(self.group)
        } else {
            Err(self)
        }
    }
}

/// [`Provisioner`] backed by Google Compute Engine.
pub struct GoogleCompute {
    cloud: Cloud,
    config: Config,
    root_access: Arc<dyn RootAccess>,
    keys: KeyLocator,
    cancel: CancellationToken,
}

impl GoogleCompute {
    pub fn new(cloud: Cloud, config: Config, root_access: Arc<dyn RootAccess>) -> Self {
        let keys = KeyLocator::new(config.keys.clone());
        Self {
            cloud,
            config,
            root_access,
            keys,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_key_locator(mut self, keys: KeyLocator) -> Self {
        self.keys = keys;
        self
    }

    /// Hosts not yet started when `cancel` fires fail with [`Error::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cloud(&self) -> &Cloud {
        &self.cloud
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Rebuild a group from the instances whose names carry its id.
    pub async fn discover_group(&self, group_id: &str) -> Result<TestGroup> {
        let prefix = format!("{group_id}-");
        let mut group = TestGroup::new(group_id, self.cloud.project(), self.cloud.zone());

        group.untracked_instances = self
            .cloud
            .api()
            .list_instances(self.cloud.project(), self.cloud.zone())
            .await?
            .into_iter()
            .map(|instance| instance.name)
            .filter(|name| name.starts_with(&prefix))
            .collect();

        tracing::info!(group = %group_id, instances = group.untracked_instances.len(), "discovered group");
        Ok(group)
    }

    async fn provision_one(
        &self,
        ctx: &HostContext<'_>,
        spec: &HostSpec,
    ) -> std::result::Result<ProvisionedHost, HostFailure> {
        if self.cancel.is_cancelled() {
            return Err(HostFailure {
                host: spec.name.clone(),
                instance_name: None,
                error: Error::Cancelled(spec.name.clone()),
            });
        }

        let mut host = provision_host(ctx, spec).await?;

        if let Err(error) = bootstrap_root(self.root_access.as_ref(), &mut host).await {
            return Err(HostFailure {
                host: spec.name.clone(),
                instance_name: Some(host.instance_name),
                error,
            });
        }

        tracing::info!(host = %host.name(), instance = %host.instance_name, ip = %host.ip, user = %host.user, "host ready");
        Ok(host)
    }
}

#[async_trait]
impl Provisioner for GoogleCompute {
    async fn provision(&self, specs: &[HostSpec]) -> Result<RunReport> {
        // configuration problems surface before anything is created
        for spec in specs {
            ImageSelector::for_host(spec)?;
        }
        if !specs.is_empty() {
            self.keys.key_pair()?;
        }

        let group_id = self
            .config
            .group_id
            .clone()
            .unwrap_or_else(new_test_group_id);
        let mut group = TestGroup::new(&group_id, self.cloud.project(), self.cloud.zone());
        tracing::info!(group = %group_id, hosts = specs.len(), "provisioning test group");

        let network = SharedNetwork::lookup(
            &self.cloud,
            &self.config.network,
            self.config.subnetwork.as_deref(),
        )
        .await?;

        let firewalls = async {
            create_external_firewall(&self.cloud, &group_id, &network.network, &self.config.ports)
                .await?;
            create_internal_firewall(&self.cloud, &group_id, &network.network).await
        };
        if let Err(e) = firewalls.await {
            tracing::error!(group = %group_id, error = %e, "firewall setup failed, no hosts started");
            return Ok(RunReport {
                group,
                failures: Vec::new(),
                aborted: Some(e),
            });
        }

        let images = ImageResolver::new();
        let ctx = HostContext {
            cloud: &self.cloud,
            config: &self.config,
            group_id: &group_id,
            network: &network,
            images: &images,
            keys: &self.keys,
        };

        let pending: Vec<_> = specs
            .iter()
            .map(|spec| Box::pin(self.provision_one(&ctx, spec)))
            .collect();
        let results: Vec<_> = futures_util::stream::iter(pending)
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(host) => group.hosts.push(host),
                Err(failure) => {
                    tracing::error!(group = %group_id, host = %failure.host, error = %failure.error, "host failed");
                    if let Some(instance) = &failure.instance_name {
                        group.untracked_instances.push(instance.clone());
                    }
                    failures.push(failure);
                }
            }
        }

        Ok(RunReport {
            group,
            failures,
            aborted: None,
        })
    }

    async fn teardown(&self, group: &TestGroup) -> TeardownReport {
        teardown(&self.cloud, group, self.config.parallelism).await
    }
}
