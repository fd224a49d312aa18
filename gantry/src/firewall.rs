//! The two firewall rules that scope a test group.
//!
//! `<group>-external` admits the configured ports plus SSH from anywhere;
//! `<group>-internal` opens everything between members of the group. Both
//! target the group id as a network tag, so they apply to an instance only
//! once that tag is set on it.

use crate::config::PortSpec;
use crate::gce::{Allowed, Cloud, Firewall};
use crate::naming::{external_firewall_name, internal_firewall_name};
use crate::Result;

const ANYWHERE: &str = "0.0.0.0/0";
const INGRESS: &str = "INGRESS";

/// Protocols the API accepts only without a port list
const PORTLESS_PROTOS: [&str; 4] = ["icmp", "esp", "ah", "ipip"];

/// Collapse `port/proto` entries into one allow entry per protocol.
///
/// Protocol order follows first appearance. An entry of `-1` (or a portless
/// protocol) opens the whole protocol, which drops its port list.
pub fn allowed_list(ports: &[PortSpec]) -> Vec<Allowed> {
    let mut allowed: Vec<(Allowed, bool)> = Vec::new();

    for spec in ports {
        let all = spec.is_all_ports() || PORTLESS_PROTOS.contains(&spec.proto.as_str());
        let idx = match allowed.iter().position(|(a, _)| a.ip_protocol == spec.proto) {
            Some(idx) => idx,
            None => {
                allowed.push((
                    Allowed {
                        ip_protocol: spec.proto.clone(),
                        ports: Vec::new(),
                    },
                    false,
                ));
                allowed.len() - 1
            }
        };

        let (entry, open) = &mut allowed[idx];
        if all {
            *open = true;
            entry.ports.clear();
        } else if !*open && !entry.ports.contains(&spec.port) {
            entry.ports.push(spec.port.clone());
        }
    }

    allowed.into_iter().map(|(a, _)| a).collect()
}

pub fn external_rule(group_id: &str, network_link: &str, ports: &[PortSpec]) -> Firewall {
    let mut all = ports.to_vec();
    if !all.contains(&PortSpec::ssh()) {
        all.push(PortSpec::ssh());
    }

    Firewall {
        name: external_firewall_name(group_id),
        network: Some(network_link.to_string()),
        direction: Some(INGRESS.to_string()),
        allowed: allowed_list(&all),
        source_ranges: vec![ANYWHERE.to_string()],
        target_tags: vec![group_id.to_string()],
        ..Default::default()
    }
}

pub fn internal_rule(group_id: &str, network_link: &str) -> Firewall {
    let mesh = [
        PortSpec::new("1-65535", "tcp"),
        PortSpec::new("1-65535", "udp"),
        PortSpec::new("-1", "icmp"),
    ];

    Firewall {
        name: internal_firewall_name(group_id),
        network: Some(network_link.to_string()),
        direction: Some(INGRESS.to_string()),
        allowed: allowed_list(&mesh),
        source_tags: vec![group_id.to_string()],
        target_tags: vec![group_id.to_string()],
        ..Default::default()
    }
}

pub async fn create_external_firewall(
    cloud: &Cloud,
    group_id: &str,
    network_link: &str,
    ports: &[PortSpec],
) -> Result<Firewall> {
    apply(cloud, external_rule(group_id, network_link, ports)).await
}

pub async fn create_internal_firewall(
    cloud: &Cloud,
    group_id: &str,
    network_link: &str,
) -> Result<Firewall> {
    apply(cloud, internal_rule(group_id, network_link)).await
}

/// Insert `rule` and wait for it; a rule left over under the same name is
/// patched to match instead.
async fn apply(cloud: &Cloud, rule: Firewall) -> Result<Firewall> {
    let inserted = match cloud.api().insert_firewall(cloud.project(), &rule).await {
        Ok(op) => cloud.complete(&rule.name, op).await.map(|_| ()),
        Err(e) => Err(e),
    };

    match inserted {
        Ok(()) => {
            tracing::info!(firewall = %rule.name, "created firewall");
        }
        Err(e) if e.is_already_exists() => {
            tracing::warn!(firewall = %rule.name, "firewall already exists, patching it");
            let op = cloud
                .api()
                .patch_firewall(cloud.project(), &rule.name, &rule)
                .await?;
            cloud.complete(&rule.name, op).await?;
        }
        Err(e) => return Err(e),
    }

    Ok(rule)
}

/// Delete firewall `name`. Returns `false` when it was already gone.
pub async fn delete_firewall(cloud: &Cloud, name: &str) -> Result<bool> {
    let result = match cloud.api().delete_firewall(cloud.project(), name).await {
        Ok(op) => cloud.complete(name, op).await.map(|_| ()),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::info!(firewall = %name, "deleted firewall");
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(firewall = %name, "firewall already gone");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(list: &[&str]) -> Vec<PortSpec> {
        crate::config::parse_ports(list).unwrap()
    }

    #[test]
    fn allow_entries_group_by_protocol() {
        let allowed = allowed_list(&ports(&["80/tcp", "53/udp", "443/tcp", "80/tcp"]));
        assert_eq!(
            allowed,
            vec![
                Allowed {
                    ip_protocol: "tcp".into(),
                    ports: vec!["80".into(), "443".into()],
                },
                Allowed {
                    ip_protocol: "udp".into(),
                    ports: vec!["53".into()],
                },
            ]
        );
    }

    #[test]
    fn portless_protocols_and_minus_one_open_everything() {
        let allowed = allowed_list(&ports(&["-1/icmp", "0/esp", "22/tcp", "-1/tcp"]));
        assert_eq!(allowed.len(), 3);
        assert!(allowed.iter().all(|a| a.ports.is_empty()), "{allowed:?}");
    }

    #[test]
    fn external_rule_always_admits_ssh_from_anywhere() {
        let fw = external_rule("gantry-0badf00d", "net-link", &ports(&["8140/tcp"]));
        assert_eq!(fw.name, "gantry-0badf00d-external");
        assert_eq!(fw.source_ranges, vec!["0.0.0.0/0"]);
        assert_eq!(fw.target_tags, vec!["gantry-0badf00d"]);
        assert!(fw.source_tags.is_empty());
        assert_eq!(fw.allowed.len(), 1);
        assert_eq!(fw.allowed[0].ports, vec!["8140", "22"]);

        let bare = external_rule("gantry-0badf00d", "net-link", &[]);
        assert_eq!(bare.allowed[0].ports, vec!["22"]);

        let dup = external_rule("gantry-0badf00d", "net-link", &ports(&["22/tcp"]));
        assert_eq!(dup.allowed[0].ports, vec!["22"]);
    }

    #[test]
    fn internal_rule_is_a_tag_scoped_mesh() {
        let fw = internal_rule("gantry-0badf00d", "net-link");
        assert_eq!(fw.name, "gantry-0badf00d-internal");
        assert_eq!(fw.source_tags, vec!["gantry-0badf00d"]);
        assert_eq!(fw.target_tags, vec!["gantry-0badf00d"]);
        assert!(fw.source_ranges.is_empty());

        let protos: Vec<_> = fw.allowed.iter().map(|a| a.ip_protocol.as_str()).collect();
        assert_eq!(protos, vec!["tcp", "udp", "icmp"]);
        assert_eq!(fw.allowed[0].ports, vec!["1-65535"]);
        assert!(fw.allowed[2].ports.is_empty());
    }
}
