//! Run configuration.
//!
//! Two layers feed a run: a TOML fleet file and command-line flags (each backed
//! by an environment variable). They are merged exactly once by
//! [`Config::build`], which also performs every check that can be made without
//! talking to the cloud. The resulting [`Config`] is never mutated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::naming::{MAX_GROUP_ID_LEN, is_valid_resource_name};
use crate::ssh_keys::KeySearch;
use crate::{Error, Result};

pub const DEFAULT_ZONE: &str = "us-central1-a";
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_MACHINE_TYPE: &str = "e2-standard-4";
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PARALLELISM: usize = 8;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Protocols a firewall allow entry may name
pub const VALID_PROTOS: [&str; 7] = ["tcp", "udp", "icmp", "esp", "ah", "ipip", "sctp"];

/// One `port/proto` entry of the external firewall's allow-list.
///
/// `port` is kept as written: a single port, a `low-high` range, or `-1`
/// meaning every port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: String,
    pub proto: String,
}

impl PortSpec {
    pub fn new(port: impl Into<String>, proto: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            proto: proto.into(),
        }
    }

    /// `22/tcp`, the entry every external firewall carries
    pub fn ssh() -> Self {
        Self::new("22", "tcp")
    }

    /// Does this entry cover every port of its protocol?
    pub fn is_all_ports(&self) -> bool {
        self.port == "-1"
    }
}

impl std::str::FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let [port, proto] = parts.as_slice() else {
            return Err(Error::InvalidPort(format!(
                "Invalid format for port {s}. Should be 'port/proto'"
            )));
        };

        if port.is_empty() {
            return Err(Error::InvalidPort(format!(
                "Invalid format for port {s}. Should be 'port/proto'"
            )));
        }

        if !VALID_PROTOS.contains(proto) {
            return Err(Error::InvalidPort(format!(
                "Invalid value '{proto}' for protocol in '{s}'. Must be one of {}",
                VALID_PROTOS.join(", ")
            )));
        }

        if !is_valid_port(port) {
            return Err(Error::InvalidPort(format!(
                "Invalid port '{port}' in '{s}'. Must be -1, a port or a range within 0-65535"
            )));
        }

        Ok(Self::new(*port, *proto))
    }
}

/// `-1`, a single port, or an ascending `lo-hi` range.
fn is_valid_port(port: &str) -> bool {
    if port == "-1" {
        return true;
    }
    let number = |p: &str| {
        if p.starts_with('+') {
            None
        } else {
            p.parse::<u16>().ok()
        }
    };
    match port.split_once('-') {
        Some((lo, hi)) => matches!((number(lo), number(hi)), (Some(lo), Some(hi)) if lo <= hi),
        None => number(port).is_some(),
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

/// Parse a list of `port/proto` entries; each entry may itself be comma separated.
pub fn parse_ports<S: AsRef<str>>(entries: &[S]) -> Result<Vec<PortSpec>> {
    let mut ports = Vec::new();
    for entry in entries {
        for part in entry.as_ref().split(',') {
            if part.trim().is_empty() {
                continue;
            }
            let spec: PortSpec = part.parse()?;
            if !ports.contains(&spec) {
                ports.push(spec);
            }
        }
    }
    Ok(ports)
}

/// Caller's description of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    /// Logical name used in reports and as the default custom hostname
    pub name: String,
    /// Exact image, `name` or `project/name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Image family, `family` or `project/family`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    /// Boot volume size in GB; the image minimum wins when larger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<u64>,
    #[serde(default)]
    pub disable_root_ssh: bool,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

impl HostSpec {
    /// A host selecting `family`, with every other field defaulted.
    pub fn from_family(name: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            family: Some(family.into()),
            machine_type: None,
            volume_size: None,
            disable_root_ssh: false,
            user: default_user(),
            hostname: None,
        }
    }

    /// A host pinned to an exact `image`, with every other field defaulted.
    pub fn from_image(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            family: None,
            ..Self::from_family(name, String::new())
        }
    }
}

/// The TOML fleet file.
///
/// ```toml
/// project = "acme"
/// zone = "us-central1-a"
/// ports = ["80/tcp", "8140/tcp"]
///
/// [[hosts]]
/// name = "primary"
/// family = "debian-cloud/debian-12"
///
/// [[hosts]]
/// name = "agent"
/// image = "windows-cloud/windows-server-2022-dc-v20240415"
/// user = "Administrator"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetFile {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    pub machine_type: Option<String>,
    pub set_hostname: Option<bool>,
    pub ssh_private_key: Option<PathBuf>,
    pub ssh_public_key: Option<PathBuf>,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
}

impl FleetFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(e.message().to_string()))
    }
}

/// Values given on the command line or in the environment.
///
/// Every field is optional; present values win over the fleet file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub network: Option<String>,
    pub subnetwork: Option<String>,
    pub ports: Vec<String>,
    pub machine_type: Option<String>,
    pub set_hostname: bool,
    /// Private key path from the environment, searched first
    pub env_private_key: Option<PathBuf>,
    pub ssh_private_key: Option<PathBuf>,
    pub ssh_public_key: Option<PathBuf>,
    pub group_id: Option<String>,
    pub parallelism: Option<usize>,
    pub operation_timeout: Option<Duration>,
}

/// Everything a run needs to know, validated.
#[derive(Debug, Clone)]
pub struct Config {
    pub project: String,
    pub zone: String,
    pub network: String,
    pub subnetwork: Option<String>,
    /// Extra allow entries for the external firewall (22/tcp is always added)
    pub ports: Vec<PortSpec>,
    /// Overrides every host's machine type when set
    pub machine_type: Option<String>,
    pub set_hostname: bool,
    pub keys: KeySearch,
    /// Reuse this id instead of generating one
    pub group_id: Option<String>,
    pub parallelism: usize,
    pub operation_timeout: Duration,
    pub hosts: Vec<HostSpec>,
}

impl Config {
    pub fn build(overrides: Overrides, file: FleetFile) -> Result<Self> {
        let project = overrides
            .project
            .or(file.project)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                Error::config("a project id is required (--project or GANTRY_GCE_PROJECT)")
            })?;

        let zone = overrides
            .zone
            .or(file.zone)
            .unwrap_or_else(|| DEFAULT_ZONE.to_string());
        if zone.trim().is_empty() {
            return Err(Error::config("zone must not be empty"));
        }

        let network = overrides
            .network
            .or(file.network)
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string());

        let mut port_entries = file.ports;
        port_entries.extend(overrides.ports);
        let ports = parse_ports(&port_entries)?;

        if let Some(group_id) = overrides.group_id.as_deref() {
            validate_group_id(group_id)?;
        }

        let parallelism = overrides.parallelism.unwrap_or(DEFAULT_PARALLELISM);
        if parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }

        for (i, host) in file.hosts.iter().enumerate() {
            validate_host(host)?;
            if file.hosts[..i].iter().any(|h| h.name == host.name) {
                return Err(Error::config(format!("duplicate host name '{}'", host.name)));
            }
        }

        Ok(Self {
            project,
            zone,
            network,
            subnetwork: overrides.subnetwork.or(file.subnetwork),
            ports,
            machine_type: overrides.machine_type.or(file.machine_type),
            set_hostname: overrides.set_hostname || file.set_hostname.unwrap_or(false),
            keys: KeySearch {
                env_private_key: overrides.env_private_key,
                private_key: overrides.ssh_private_key.or(file.ssh_private_key),
                public_key: overrides.ssh_public_key.or(file.ssh_public_key),
            },
            group_id: overrides.group_id,
            parallelism,
            operation_timeout: overrides
                .operation_timeout
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT),
            hosts: file.hosts,
        })
    }

    /// Machine type for `host`: global override, then the host's own, then the default.
    pub fn machine_type_for<'a>(&'a self, host: &'a HostSpec) -> &'a str {
        self.machine_type
            .as_deref()
            .or(host.machine_type.as_deref())
            .unwrap_or(DEFAULT_MACHINE_TYPE)
    }
}

fn validate_group_id(group_id: &str) -> Result<()> {
    if !is_valid_resource_name(group_id) {
        return Err(Error::config(format!(
            "group id '{group_id}' must be lowercase letters, digits and dashes, starting with a letter"
        )));
    }
    if group_id.len() > MAX_GROUP_ID_LEN {
        return Err(Error::config(format!(
            "group id '{group_id}' is longer than {MAX_GROUP_ID_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_host(host: &HostSpec) -> Result<()> {
    if host.name.trim().is_empty() {
        return Err(Error::config("every host needs a name"));
    }

    match (&host.image, &host.family) {
        (Some(_), Some(_)) => Err(Error::MissingImageSelector {
            host: host.name.clone(),
            reason: "specify either image or family, not both",
        }),
        (None, None) => Err(Error::MissingImageSelector {
            host: host.name.clone(),
            reason: "you must specify either an image or a family",
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(p: &str) -> Overrides {
        Overrides {
            project: Some(p.into()),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_every_valid_protocol() {
        for proto in VALID_PROTOS {
            let spec: PortSpec = format!("80/{proto}").parse().unwrap();
            assert_eq!(spec.proto, proto);
        }
        let range: PortSpec = "1-65535/udp".parse().unwrap();
        assert_eq!(range.port, "1-65535");
    }

    #[test]
    fn rejects_port_without_protocol() {
        let err = "22".parse::<PortSpec>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid format for port 22. Should be 'port/proto'"
        );
        assert!("22/tcp/x".parse::<PortSpec>().is_err());
        assert!("/tcp".parse::<PortSpec>().is_err());
    }

    #[test]
    fn rejects_ports_outside_the_valid_range() {
        let err = "abc/tcp".parse::<PortSpec>().unwrap_err();
        assert!(matches!(err, Error::InvalidPort(_)));
        assert_eq!(
            err.to_string(),
            "Invalid port 'abc' in 'abc/tcp'. Must be -1, a port or a range within 0-65535"
        );
        for bad in ["70000/tcp", "80-/tcp", "-80/tcp", "90-80/udp", "+80/tcp", "-2/icmp"] {
            assert!(bad.parse::<PortSpec>().is_err(), "{bad} should be rejected");
        }
        for good in ["-1/tcp", "0/esp", "65535/udp", "8000-8100/tcp", "443-443/tcp"] {
            assert!(good.parse::<PortSpec>().is_ok(), "{good} should be accepted");
        }
    }

    #[test]
    fn rejects_unknown_protocol_naming_the_allowed_set() {
        let err = "22/invalid".parse::<PortSpec>().unwrap_err().to_string();
        assert!(
            err.starts_with("Invalid value 'invalid' for protocol in '22/invalid'. Must be one of"),
            "{err}"
        );
        assert!(err.contains("sctp"), "{err}");
    }

    #[test]
    fn port_lists_split_on_commas_and_dedupe() {
        let ports = parse_ports(&["80/tcp,443/tcp", "80/tcp", " 8140/tcp "]).unwrap();
        assert_eq!(
            ports,
            vec![
                PortSpec::new("80", "tcp"),
                PortSpec::new("443", "tcp"),
                PortSpec::new("8140", "tcp"),
            ]
        );
    }

    #[test]
    fn fleet_file_parses_hosts_with_defaults() {
        let file = FleetFile::from_toml_str(
            r#"
project = "acme"
ports = ["8140/tcp"]

[[hosts]]
name = "primary"
family = "debian-12"

[[hosts]]
name = "agent"
image = "windows-cloud/windows-server-2022-dc-v20240415"
user = "Administrator"
volume_size = 80
disable_root_ssh = true
"#,
        )
        .unwrap();

        assert_eq!(file.project.as_deref(), Some("acme"));
        assert_eq!(file.hosts.len(), 2);
        assert_eq!(file.hosts[0].user, "root");
        assert_eq!(file.hosts[0].family.as_deref(), Some("debian-12"));
        assert_eq!(file.hosts[1].volume_size, Some(80));
        assert!(file.hosts[1].disable_root_ssh);
    }

    #[test]
    fn fleet_file_rejects_unknown_keys() {
        let err = FleetFile::from_toml_str("projekt = \"acme\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[test]
    fn flags_win_over_file() {
        let file = FleetFile {
            project: Some("from-file".into()),
            zone: Some("europe-west1-b".into()),
            ports: vec!["80/tcp".into()],
            ..Default::default()
        };
        let overrides = Overrides {
            project: Some("from-flag".into()),
            ports: vec!["443/tcp".into()],
            ..Default::default()
        };

        let config = Config::build(overrides, file).unwrap();
        assert_eq!(config.project, "from-flag");
        assert_eq!(config.zone, "europe-west1-b");
        assert_eq!(config.network, DEFAULT_NETWORK);
        assert_eq!(
            config.ports,
            vec![PortSpec::new("80", "tcp"), PortSpec::new("443", "tcp")]
        );
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::build(project("acme"), FleetFile::default()).unwrap();
        assert_eq!(config.zone, DEFAULT_ZONE);
        assert_eq!(config.network, "default");
        assert_eq!(config.subnetwork, None);
        assert_eq!(config.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(config.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
        assert!(!config.set_hostname);
    }

    #[test]
    fn project_is_required() {
        let err = Config::build(Overrides::default(), FleetFile::default()).unwrap_err();
        assert!(err.to_string().contains("project"), "{err}");

        let blank = Config::build(project("  "), FleetFile::default()).unwrap_err();
        assert!(matches!(blank, Error::Config(_)));
    }

    #[test]
    fn bad_port_fails_the_whole_build() {
        let overrides = Overrides {
            ports: vec!["22/bogus".into()],
            ..project("acme")
        };
        let err = Config::build(overrides, FleetFile::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidPort(_)));
    }

    #[test]
    fn hosts_need_exactly_one_image_selector() {
        let mut neither = HostSpec::from_family("web", "debian-12");
        neither.family = None;
        let err = Config::build(
            project("acme"),
            FleetFile {
                hosts: vec![neither],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("you must specify either an image or a family"),
            "{err}"
        );

        let mut both = HostSpec::from_family("web", "debian-12");
        both.image = Some("debian-12-bookworm-v20240415".into());
        let err = Config::build(
            project("acme"),
            FleetFile {
                hosts: vec![both],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingImageSelector { .. }));
    }

    #[test]
    fn duplicate_host_names_are_rejected() {
        let file = FleetFile {
            hosts: vec![
                HostSpec::from_family("web", "debian-12"),
                HostSpec::from_family("web", "debian-12"),
            ],
            ..Default::default()
        };
        assert!(Config::build(project("acme"), file).is_err());
    }

    #[test]
    fn group_id_must_be_a_usable_prefix() {
        let with = |id: &str| Overrides {
            group_id: Some(id.into()),
            ..project("acme")
        };
        assert!(Config::build(with("ci-run-42"), FleetFile::default()).is_ok());
        assert!(Config::build(with("CI_RUN"), FleetFile::default()).is_err());
        assert!(Config::build(with(&"a".repeat(51)), FleetFile::default()).is_err());
    }

    #[test]
    fn machine_type_precedence() {
        let mut host = HostSpec::from_family("web", "debian-12");
        let config = Config::build(project("acme"), FleetFile::default()).unwrap();
        assert_eq!(config.machine_type_for(&host), DEFAULT_MACHINE_TYPE);

        host.machine_type = Some("n2-standard-2".into());
        assert_eq!(config.machine_type_for(&host), "n2-standard-2");

        let forced = Config::build(
            Overrides {
                machine_type: Some("e2-micro".into()),
                ..project("acme")
            },
            FleetFile::default(),
        )
        .unwrap();
        assert_eq!(forced.machine_type_for(&host), "e2-micro");
    }
}
