//! Creating one instance for one host spec.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{Config, DEFAULT_NETWORK, HostSpec};
use crate::gce::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, Cloud, Instance, Metadata,
    MetadataItem, NetworkInterface, Tags, last_segment,
};
use crate::image::{ImageReference, ImageResolver, ImageSelector, OsFamily};
use crate::naming::new_host_id;
use crate::ssh_keys::{KeyLocator, KeyPair};
use crate::{Error, Result};

/// Unprivileged account used to log in before root access is set up
pub const BOOTSTRAP_USER: &str = "google_compute";

/// Appended to custom hostnames that are not already fully qualified
pub const HOSTNAME_DOMAIN: &str = "gantry.test";

const NETWORK_TIER: &str = "STANDARD";
const EXTERNAL_NAT: &str = "External NAT";

const WINDOWS_SPECIALIZE_CMD: &str = "start /wait googet -noconfirm=true update && start /wait googet -noconfirm=true install google-compute-engine-ssh";
const WINDOWS_SPECIALIZE_PS1: &str = r#"[Environment]::SetEnvironmentVariable( "PATH", "$ENV:PATH;C:\Program Files\OpenSSH", [EnvironmentVariableTarget]::Machine )"#;

/// A host that has an instance behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedHost {
    pub spec: HostSpec,
    pub instance_name: String,
    pub ip: String,
    pub image: ImageReference,
    pub machine_type: String,
    /// The account the instance was provisioned for
    pub initial_user: String,
    /// The account to log in as now
    pub user: String,
    /// The private key to log in with now
    pub ssh_key: PathBuf,
    pub keys: KeyPair,
}

impl ProvisionedHost {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn os_family(&self) -> OsFamily {
        self.image.os_family()
    }
}

/// Why one host did not come up.
#[derive(Debug)]
pub struct HostFailure {
    pub host: String,
    /// Set when an instance exists (or may exist) and needs tearing down
    pub instance_name: Option<String>,
    pub error: Error,
}

impl std::fmt::Display for HostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance_name {
            Some(instance) => write!(f, "{} ({instance}): {}", self.host, self.error),
            None => write!(f, "{}: {}", self.host, self.error),
        }
    }
}

/// Network and subnetwork every instance of a run attaches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedNetwork {
    pub network: String,
    pub subnetwork: String,
}

impl SharedNetwork {
    /// Resolve the configured network and pick its subnetwork.
    ///
    /// The `default` network uses the region's `default` subnetwork; any other
    /// network without an explicit subnetwork uses its first one in the run's
    /// region.
    pub async fn lookup(cloud: &Cloud, network: &str, subnetwork: Option<&str>) -> Result<Self> {
        let net = cloud
            .api()
            .get_network(cloud.project(), network)
            .await
            .map_err(|e| rename_not_found(e, "network", network))?;

        let subnetwork_name = match subnetwork {
            Some(name) => name.to_string(),
            None if network == DEFAULT_NETWORK => DEFAULT_NETWORK.to_string(),
            None => {
                let in_region = format!("/regions/{}/subnetworks/", cloud.region());
                net.subnetworks
                    .iter()
                    .find(|url| url.contains(&in_region))
                    .map(|url| last_segment(url).to_string())
                    .ok_or_else(|| {
                        Error::config(format!(
                            "Unable to find a subnetwork in region {} of provided network {network}",
                            cloud.region()
                        ))
                    })?
            }
        };

        let sub = cloud
            .api()
            .get_subnetwork(cloud.project(), cloud.region(), &subnetwork_name)
            .await
            .map_err(|e| rename_not_found(e, "subnetwork", &subnetwork_name))?;

        tracing::debug!(network = %net.name, subnetwork = %sub.name, "using shared network");
        Ok(Self {
            network: net.self_link,
            subnetwork: sub.self_link,
        })
    }
}

fn rename_not_found(err: Error, kind: &'static str, name: &str) -> Error {
    if err.is_not_found() {
        Error::not_found(kind, name)
    } else {
        err
    }
}

/// Superuser names and an empty name are swapped for [`BOOTSTRAP_USER`].
pub fn initial_login_user(requested: &str) -> &str {
    if requested.is_empty()
        || requested == OsFamily::Unix.superuser()
        || requested == OsFamily::Windows.superuser()
    {
        BOOTSTRAP_USER
    } else {
        requested
    }
}

/// Never smaller than the image requires.
pub fn boot_size(requested: Option<u64>, image_minimum: u64) -> u64 {
    requested.map_or(image_minimum, |size| size.max(image_minimum))
}

/// The API wants a fully qualified hostname.
pub fn custom_hostname(spec: &HostSpec) -> String {
    let name = spec.hostname.as_deref().unwrap_or(&spec.name);
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.{HOSTNAME_DOMAIN}")
    }
}

/// Metadata items pushed to every new instance.
pub fn build_metadata(user: &str, public_key: &str, os: OsFamily) -> Vec<MetadataItem> {
    let mut items = vec![
        MetadataItem::new("ssh-keys", format!("{user}:{}", public_key.trim())),
        MetadataItem::new("enable-oslogin", "FALSE"),
    ];

    if os == OsFamily::Windows {
        items.push(MetadataItem::new("enable-windows-ssh", "TRUE"));
        items.push(MetadataItem::new(
            "sysprep-specialize-script-cmd",
            WINDOWS_SPECIALIZE_CMD,
        ));
        items.push(MetadataItem::new(
            "sysprep-specialize-script-ps1",
            WINDOWS_SPECIALIZE_PS1,
        ));
    }

    items
}

pub fn instance_request(
    name: &str,
    machine_type_link: &str,
    image: &ImageReference,
    disk_size_gb: u64,
    network: &SharedNetwork,
    hostname: Option<String>,
) -> Instance {
    Instance {
        name: name.to_string(),
        machine_type: machine_type_link.to_string(),
        disks: vec![AttachedDisk {
            boot: true,
            auto_delete: true,
            initialize_params: Some(AttachedDiskInitializeParams {
                disk_size_gb,
                source_image: image.self_link.clone(),
            }),
        }],
        network_interfaces: vec![NetworkInterface {
            network: network.network.clone(),
            subnetwork: network.subnetwork.clone(),
            access_configs: vec![AccessConfig {
                name: Some(EXTERNAL_NAT.to_string()),
                network_tier: Some(NETWORK_TIER.to_string()),
                nat_ip: None,
            }],
        }],
        tags: Some(Tags {
            items: vec![name.to_string()],
            fingerprint: None,
        }),
        hostname,
        ..Default::default()
    }
}

/// What every host of a run shares.
pub struct HostContext<'a> {
    pub cloud: &'a Cloud,
    pub config: &'a Config,
    pub group_id: &'a str,
    pub network: &'a SharedNetwork,
    pub images: &'a ImageResolver,
    pub keys: &'a KeyLocator,
}

/// Create, tag and configure the instance for `spec`.
///
/// On failure the returned [`HostFailure`] names the instance when one was
/// submitted, so teardown can remove it.
pub async fn provision_host(
    ctx: &HostContext<'_>,
    spec: &HostSpec,
) -> std::result::Result<ProvisionedHost, HostFailure> {
    let mut submitted = None;
    provision(ctx, spec, &mut submitted)
        .await
        .map_err(|error| HostFailure {
            host: spec.name.clone(),
            instance_name: submitted,
            error,
        })
}

async fn provision(
    ctx: &HostContext<'_>,
    spec: &HostSpec,
    submitted: &mut Option<String>,
) -> Result<ProvisionedHost> {
    let cloud = ctx.cloud;
    let api = cloud.api();

    let selector = ImageSelector::for_host(spec)?;
    let keys = ctx.keys.key_pair()?;
    let public_key = keys.public_key_contents()?;

    let machine_type_name = ctx.config.machine_type_for(spec);
    let machine_type = api
        .get_machine_type(cloud.project(), cloud.zone(), machine_type_name)
        .await
        .map_err(|e| rename_not_found(e, "machine type", machine_type_name))?;

    let image = ctx.images.resolve(cloud, &selector).await?;
    let disk_size = boot_size(spec.volume_size, image.disk_size_gb);

    let instance_name = new_host_id(ctx.group_id);
    let hostname = ctx.config.set_hostname.then(|| custom_hostname(spec));
    let request = instance_request(
        &instance_name,
        &machine_type.self_link,
        &image,
        disk_size,
        ctx.network,
        hostname,
    );

    *submitted = Some(instance_name.clone());
    let op = api
        .insert_instance(cloud.project(), cloud.zone(), &request)
        .await?;
    cloud.complete(&instance_name, op).await?;
    tracing::info!(host = %spec.name, instance = %instance_name, image = %image.name, disk_size, "created instance");

    let created = api
        .get_instance(cloud.project(), cloud.zone(), &instance_name)
        .await?;
    let ip = created
        .nat_ip()
        .map(str::to_string)
        .ok_or_else(|| Error::NoExternalAddress(instance_name.clone()))?;

    let initial_user = initial_login_user(&spec.user).to_string();
    let items = build_metadata(&initial_user, &public_key, image.os_family());

    tokio::try_join!(
        add_group_tag(cloud, &created, ctx.group_id),
        replace_metadata(cloud, &created, items),
    )?;

    Ok(ProvisionedHost {
        spec: spec.clone(),
        instance_name,
        ip,
        image,
        machine_type: machine_type.name,
        user: initial_user.clone(),
        initial_user,
        ssh_key: keys.private_key.clone(),
        keys,
    })
}

/// Append the group tag so the group's firewalls apply.
async fn add_group_tag(cloud: &Cloud, instance: &Instance, group_id: &str) -> Result<()> {
    let mut tags = instance.tags.clone().unwrap_or_default();
    if !tags.items.iter().any(|t| t == group_id) {
        tags.items.push(group_id.to_string());
    }

    let op = cloud
        .api()
        .set_instance_tags(cloud.project(), cloud.zone(), &instance.name, &tags)
        .await?;
    cloud.complete(&instance.name, op).await?;
    tracing::debug!(instance = %instance.name, group = %group_id, "added group tag");
    Ok(())
}

/// Replace all metadata on `instance` with `items`.
async fn replace_metadata(cloud: &Cloud, instance: &Instance, items: Vec<MetadataItem>) -> Result<()> {
    let metadata = Metadata {
        items,
        fingerprint: instance.metadata.as_ref().and_then(|m| m.fingerprint.clone()),
    };

    let op = cloud
        .api()
        .set_instance_metadata(cloud.project(), cloud.zone(), &instance.name, &metadata)
        .await?;
    cloud.complete(&instance.name, op).await?;
    tracing::debug!(instance = %instance.name, keys = metadata.items.len(), "set instance metadata");
    Ok(())
}
