//! Removing everything a test group created.

use futures_util::StreamExt;

use crate::firewall::delete_firewall;
use crate::gce::Cloud;
use crate::provisioner::TestGroup;
use crate::{Error, Result};

/// Outcome of a teardown. Failures never stop the remaining deletes.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    /// Resources that were already gone
    pub missing: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, name: String, result: Result<bool>) {
        match result {
            Ok(true) => self.deleted.push(name),
            Ok(false) => self.missing.push(name),
            Err(e) => {
                tracing::error!(resource = %name, error = %e, "teardown step failed");
                self.failed.push((name, e));
            }
        }
    }
}

/// Delete the group's firewalls, then all of its instances concurrently.
///
/// Boot disks go with their instances (they are created auto-delete).
pub async fn teardown(cloud: &Cloud, group: &TestGroup, parallelism: usize) -> TeardownReport {
    let mut report = TeardownReport::default();

    for name in [&group.external_firewall, &group.internal_firewall] {
        let result = delete_firewall(cloud, name).await;
        report.record(name.clone(), result);
    }

    let results: Vec<(String, Result<bool>)> =
        futures_util::stream::iter(group.instance_names().map(str::to_string))
            .map(|name| async move {
                let result = delete_instance(cloud, &name).await;
                (name, result)
            })
            .buffer_unordered(parallelism.max(1))
            .collect()
            .await;

    for (name, result) in results {
        report.record(name, result);
    }

    tracing::info!(
        group = %group.id,
        deleted = report.deleted.len(),
        missing = report.missing.len(),
        failed = report.failed.len(),
        "teardown finished"
    );
    report
}

/// Delete instance `name`. Returns `false` when it was already gone.
pub async fn delete_instance(cloud: &Cloud, name: &str) -> Result<bool> {
    let result = match cloud
        .api()
        .delete_instance(cloud.project(), cloud.zone(), name)
        .await
    {
        Ok(op) => cloud.complete(name, op).await.map(|_| ()),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::info!(instance = %name, "deleted instance");
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(instance = %name, "instance already gone");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
