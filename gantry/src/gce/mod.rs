//! Google Compute Engine boundary
//!
//! [`ComputeApi`] is the set of resource operations the orchestrator consumes.
//! [`GceClient`] implements it over the v1 REST API; tests substitute an
//! in-memory fake. [`Cloud`] binds an implementation to a project and zone and
//! owns the "submit, wait, check for an embedded error" sequence that every
//! mutating call goes through.

mod auth;
mod rest;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use auth::{GcloudToken, StaticToken, TokenSource};
pub use rest::GceClient;
pub use types::*;

use crate::{Error, Result};

/// Firewalls every project starts with; the reaper never touches them.
pub const DEFAULT_FIREWALL_FILTER: &str = "name != default-allow-internal AND name != default-ssh";

/// Resource CRUD plus long-running-operation waits.
///
/// Mutating calls return an [`Operation`] that may still be running; callers
/// pass it to [`ComputeApi::wait_operation`] before relying on its effect.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_image(&self, project: &str, name: &str) -> Result<Image>;

    /// Latest non-deprecated image in `family`
    async fn get_image_from_family(&self, project: &str, family: &str) -> Result<Image>;

    async fn get_machine_type(&self, project: &str, zone: &str, name: &str)
    -> Result<MachineType>;

    async fn get_network(&self, project: &str, name: &str) -> Result<Network>;

    async fn get_subnetwork(&self, project: &str, region: &str, name: &str)
    -> Result<Subnetwork>;

    async fn get_firewall(&self, project: &str, name: &str) -> Result<Firewall>;

    async fn insert_firewall(&self, project: &str, firewall: &Firewall) -> Result<Operation>;

    async fn patch_firewall(
        &self,
        project: &str,
        name: &str,
        firewall: &Firewall,
    ) -> Result<Operation>;

    async fn delete_firewall(&self, project: &str, name: &str) -> Result<Operation>;

    async fn list_firewalls(&self, project: &str, filter: Option<&str>) -> Result<Vec<Firewall>>;

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation>;

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<Instance>;

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<Operation>;

    async fn list_instances(&self, project: &str, zone: &str) -> Result<Vec<Instance>>;

    /// Replaces the instance's metadata; `metadata.fingerprint` must be current.
    async fn set_instance_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Operation>;

    /// Replaces the instance's network tags; `tags.fingerprint` must be current.
    async fn set_instance_tags(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<Operation>;

    async fn list_disks(&self, project: &str, zone: &str) -> Result<Vec<Disk>>;

    async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> Result<Operation>;

    /// Block until `operation` is done or `deadline` passes.
    ///
    /// Returns the finished operation (which may carry an embedded error), or
    /// [`Error::OperationTimeout`] when the deadline expires first.
    async fn wait_operation(
        &self,
        project: &str,
        operation: &Operation,
        deadline: Duration,
    ) -> Result<Operation>;
}

/// A [`ComputeApi`] bound to one project and zone.
#[derive(Clone)]
pub struct Cloud {
    api: Arc<dyn ComputeApi>,
    project: String,
    zone: String,
    operation_timeout: Duration,
}

impl std::fmt::Debug for Cloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cloud")
            .field("project", &self.project)
            .field("zone", &self.zone)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl Cloud {
    pub fn new(
        api: Arc<dyn ComputeApi>,
        project: impl Into<String>,
        zone: impl Into<String>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            api,
            project: project.into(),
            zone: zone.into(),
            operation_timeout,
        }
    }

    pub fn api(&self) -> &dyn ComputeApi {
        self.api.as_ref()
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Region of the configured zone
    pub fn region(&self) -> &str {
        region_of(&self.zone)
    }

    /// Wait for `operation` and turn an embedded error into [`Error::Operation`].
    pub async fn complete(&self, resource: &str, operation: Operation) -> Result<Operation> {
        let done = if operation.is_done() {
            operation
        } else {
            self.api
                .wait_operation(&self.project, &operation, self.operation_timeout)
                .await?
        };

        if let Some(err) = done.first_error() {
            return Err(Error::Operation {
                resource: resource.to_string(),
                code: err.code.clone(),
                message: err.message.clone(),
            });
        }

        Ok(done)
    }
}

/// `us-central1-a` -> `us-central1`
pub fn region_of(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, _)) if region.contains('-') => region,
        _ => zone,
    }
}

/// Poll `fetch` until it reports a finished operation or `deadline` passes.
///
/// `fetch` is expected to block server side for a while (the `wait` endpoint
/// returns after at most a couple of minutes); `interval` only spaces out
/// calls that come back early without progress.
pub(crate) async fn poll_until_done<F, Fut>(
    operation: &Operation,
    deadline: Duration,
    interval: Duration,
    mut fetch: F,
) -> Result<Operation>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Operation>>,
{
    let started = tokio::time::Instant::now();
    let timed_out = || Error::OperationTimeout {
        operation: operation.name.clone(),
        waited: started.elapsed(),
    };

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(timed_out());
        }

        let current = match tokio::time::timeout(remaining, fetch()).await {
            Ok(result) => result?,
            Err(_) => return Err(timed_out()),
        };

        if current.is_done() {
            return Ok(current);
        }

        tracing::trace!(operation = %current.name, status = ?current.status, "operation still running");
        let remaining = deadline.saturating_sub(started.elapsed());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn region_drops_zone_letter() {
        assert_eq!(region_of("us-central1-a"), "us-central1");
        assert_eq!(region_of("us-west1-b"), "us-west1");
        assert_eq!(region_of("europe-west1-c"), "europe-west1");
        assert_eq!(region_of("asia-east1-a"), "asia-east1");
    }

    fn op(status: OperationStatus) -> Operation {
        Operation {
            name: "operation-42".into(),
            status,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polling_returns_once_operation_is_done() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let done = poll_until_done(
            &op(OperationStatus::Pending),
            Duration::from_secs(60),
            Duration::from_secs(5),
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(op(OperationStatus::Running))
                    } else {
                        Ok(op(OperationStatus::Done))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert!(done.is_done());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_surfaces_a_timeout_instead_of_guessing() {
        let err = poll_until_done(
            &op(OperationStatus::Pending),
            Duration::from_secs(30),
            Duration::from_secs(5),
            || async { Ok(op(OperationStatus::Running)) },
        )
        .await
        .unwrap_err();

        match err {
            Error::OperationTimeout { operation, waited } => {
                assert_eq!(operation, "operation-42");
                assert!(waited >= Duration::from_secs(30));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_a_hung_request() {
        let err = poll_until_done(
            &op(OperationStatus::Pending),
            Duration::from_secs(10),
            Duration::from_secs(1),
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(op(OperationStatus::Done))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::OperationTimeout { .. }));
    }
}
