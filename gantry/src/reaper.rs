//! Age-based cleanup of resources abandoned by earlier runs.
//!
//! Independent of any one run: it lists what exists, deletes what is older
//! than the threshold, and treats a resource vanishing underneath it (another
//! run's teardown, a concurrent sweep) as success.

use chrono::{DateTime, Utc};

use crate::gce::{Cloud, DEFAULT_FIREWALL_FILTER};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    Disk,
    Firewall,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Instance => "instance",
            Self::Disk => "disk",
            Self::Firewall => "firewall",
        })
    }
}

/// What counts as a zombie.
#[derive(Debug, Clone)]
pub struct ReapPolicy {
    pub max_age: chrono::Duration,
    /// Only consider resources whose name starts with this
    pub name_prefix: Option<String>,
}

impl ReapPolicy {
    /// Fails unless `hours` is positive and fits a [`chrono::Duration`].
    pub fn older_than_hours(hours: i64) -> Result<Self> {
        if hours <= 0 {
            return Err(Error::config(format!(
                "max age must be a positive number of hours, got {hours}"
            )));
        }
        let max_age = chrono::Duration::try_hours(hours)
            .ok_or_else(|| Error::config(format!("max age of {hours} hours is out of range")))?;
        Ok(Self {
            max_age,
            name_prefix: None,
        })
    }

    fn is_zombie(&self, name: &str, created: Option<&str>, now: DateTime<Utc>) -> bool {
        if let Some(prefix) = &self.name_prefix {
            if !name.starts_with(prefix.as_str()) {
                return false;
            }
        }

        match created.map(DateTime::parse_from_rfc3339) {
            Some(Ok(created)) => now.signed_duration_since(created) > self.max_age,
            Some(Err(e)) => {
                tracing::warn!(resource = %name, error = %e, "unparseable creation timestamp, keeping");
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReapReport {
    pub deleted: Vec<(ResourceKind, String)>,
    /// Resources younger than the threshold (or outside the prefix)
    pub kept: usize,
    pub failed: Vec<(ResourceKind, String, Error)>,
}

/// Delete zombie instances, then unattached zombie disks, then zombie
/// firewalls (the project's default rules are never listed).
pub async fn sweep(cloud: &Cloud, policy: &ReapPolicy, now: DateTime<Utc>) -> Result<ReapReport> {
    let api = cloud.api();
    let mut report = ReapReport::default();

    for instance in api.list_instances(cloud.project(), cloud.zone()).await? {
        if !policy.is_zombie(&instance.name, instance.creation_timestamp.as_deref(), now) {
            report.kept += 1;
            continue;
        }
        let result = match api
            .delete_instance(cloud.project(), cloud.zone(), &instance.name)
            .await
        {
            Ok(op) => cloud.complete(&instance.name, op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        record(&mut report, ResourceKind::Instance, instance.name, result);
    }

    for disk in api.list_disks(cloud.project(), cloud.zone()).await? {
        if !disk.users.is_empty()
            || !policy.is_zombie(&disk.name, disk.creation_timestamp.as_deref(), now)
        {
            report.kept += 1;
            continue;
        }
        let result = match api
            .delete_disk(cloud.project(), cloud.zone(), &disk.name)
            .await
        {
            Ok(op) => cloud.complete(&disk.name, op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        record(&mut report, ResourceKind::Disk, disk.name, result);
    }

    for firewall in api
        .list_firewalls(cloud.project(), Some(DEFAULT_FIREWALL_FILTER))
        .await?
    {
        if !policy.is_zombie(&firewall.name, firewall.creation_timestamp.as_deref(), now) {
            report.kept += 1;
            continue;
        }
        let result = match api.delete_firewall(cloud.project(), &firewall.name).await {
            Ok(op) => cloud.complete(&firewall.name, op).await.map(|_| ()),
            Err(e) => Err(e),
        };
        record(&mut report, ResourceKind::Firewall, firewall.name, result);
    }

    Ok(report)
}

fn record(report: &mut ReapReport, kind: ResourceKind, name: String, result: Result<()>) {
    match result {
        Ok(()) => {
            tracing::info!(%kind, resource = %name, "reaped");
            report.deleted.push((kind, name));
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(%kind, resource = %name, "already gone");
            report.deleted.push((kind, name));
        }
        Err(e) => {
            tracing::error!(%kind, resource = %name, error = %e, "failed to reap");
            report.failed.push((kind, name, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-04-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn age_is_measured_from_creation_timestamp() {
        let policy = ReapPolicy::older_than_hours(3).unwrap();
        assert!(policy.is_zombie("old", Some("2024-04-15T01:59:00.000-07:00"), now()));
        assert!(!policy.is_zombie("new", Some("2024-04-15T11:00:00.000Z"), now()));
        assert!(!policy.is_zombie("edge", Some("2024-04-15T09:00:00Z"), now()));
    }

    #[test]
    fn max_age_must_be_positive_and_in_range() {
        for hours in [0, -1, i64::MIN, i64::MAX] {
            let err = ReapPolicy::older_than_hours(hours).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{hours}: {err:?}");
        }
        let week = ReapPolicy::older_than_hours(168).unwrap();
        assert_eq!(week.max_age, chrono::Duration::days(7));
    }

    #[test]
    fn missing_or_bad_timestamps_are_kept() {
        let policy = ReapPolicy::older_than_hours(1).unwrap();
        assert!(!policy.is_zombie("x", None, now()));
        assert!(!policy.is_zombie("x", Some("yesterday"), now()));
    }

    #[test]
    fn prefix_limits_the_sweep() {
        let policy = ReapPolicy {
            name_prefix: Some("gantry-".into()),
            ..ReapPolicy::older_than_hours(1).unwrap()
        };
        let old = Some("2024-04-01T00:00:00Z");
        assert!(policy.is_zombie("gantry-0badf00d-external", old, now()));
        assert!(!policy.is_zombie("prod-db", old, now()));
    }
}
