use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use gantry::gce::{GcloudToken, StaticToken, TokenSource};
use gantry::provisioner::Provisioner;
use gantry_utils::RetryConfig;

mod output;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    use clap::Parser;

    let cli = Cli::parse();

    // RUST_LOG wins over -v/-q, e.g. RUST_LOG="gantry=debug"
    let level = cli.verbose.log_level_filter().to_string().to_lowercase();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = tokio_util::sync::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, no new hosts will be started");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Provision {
            state,
            all_or_nothing,
        } => provision(cli.global, &state, all_or_nothing, cancel).await,
        Command::Teardown { state } => teardown(cli.global, state.as_deref()).await,
        Command::Reap {
            max_age_hours,
            prefix,
        } => reap(cli.global, max_age_hours, prefix).await,
        Command::CheckConfig => check_config(cli.global),
    }
}

async fn provision(
    global: GlobalArgs,
    state: &Path,
    all_or_nothing: bool,
    cancel: tokio_util::sync::CancellationToken,
) -> eyre::Result<()> {
    let config = global.config(None)?;
    if config.hosts.is_empty() {
        eyre::bail!("no hosts to provision; add [[hosts]] to the fleet file");
    }

    let hosts = config.hosts.clone();
    let provisioner = global.provisioner(config)?.with_cancellation(cancel);

    let report = provisioner.provision(&hosts).await?;
    report
        .group
        .save(state)
        .wrap_err_with(|| format!("failed to write state file {}", state.display()))?;
    output::run_report(&report, state);

    if report.is_complete() {
        return Ok(());
    }

    if all_or_nothing {
        tracing::warn!(group = %report.group.id, "tearing down partial group");
        let teardown = provisioner.teardown(&report.group).await;
        output::teardown_report(&teardown);
        if teardown.is_clean() {
            if let Err(e) = std::fs::remove_file(state) {
                tracing::warn!(path = %state.display(), error = %e, "failed to remove state file");
            }
        }
    }

    if let Some(error) = report.aborted {
        return Err(eyre::Report::new(error).wrap_err("provisioning aborted before any host started"));
    }
    eyre::bail!("{} of {} hosts failed", report.failures.len(), hosts.len())
}

async fn teardown(global: GlobalArgs, state: Option<&Path>) -> eyre::Result<()> {
    let saved = match state {
        Some(path) => Some(
            gantry::TestGroup::load(path)
                .wrap_err_with(|| format!("failed to read state file {}", path.display()))?,
        ),
        None => None,
    };

    let config = global.config(saved.as_ref())?;
    let group_id = config.group_id.clone();
    let provisioner = global.provisioner(config)?;

    let group = match (saved, group_id) {
        (Some(group), _) => group,
        (None, Some(id)) => provisioner.discover_group(&id).await?,
        (None, None) => eyre::bail!("pass --state or --group-id to choose what to tear down"),
    };

    let report = provisioner.teardown(&group).await;
    output::teardown_report(&report);

    if !report.is_clean() {
        eyre::bail!("{} resources could not be deleted", report.failed.len());
    }
    if let Some(path) = state {
        std::fs::remove_file(path)
            .wrap_err_with(|| format!("failed to remove state file {}", path.display()))?;
    }
    Ok(())
}

async fn reap(global: GlobalArgs, max_age_hours: i64, prefix: Option<String>) -> eyre::Result<()> {
    let config = global.config(None)?;
    let cloud = global.cloud(&config)?;

    let policy = gantry::ReapPolicy {
        name_prefix: prefix,
        ..gantry::ReapPolicy::older_than_hours(max_age_hours)?
    };
    let report = gantry::reaper::sweep(&cloud, &policy, chrono::Utc::now()).await?;
    output::reap_report(&report);

    if !report.failed.is_empty() {
        eyre::bail!("{} resources could not be reaped", report.failed.len());
    }
    Ok(())
}

fn check_config(global: GlobalArgs) -> eyre::Result<()> {
    let config = global.config(None)?;
    let keys = gantry::KeyLocator::new(config.keys.clone()).key_pair();
    output::config_summary(&config, &keys);
    keys?;
    Ok(())
}

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct GlobalArgs {
    #[arg(
        long,
        short('f'),
        global = true,
        env = "GANTRY_FLEET",
        help = "TOML file with [[hosts]] and default settings."
    )]
    fleet: Option<PathBuf>,
    #[arg(long, global = true, env = "GANTRY_GCE_PROJECT", help = "Google Cloud project id.")]
    project: Option<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GCE_ZONE",
        help = "Zone to create instances in. [default: us-central1-a]"
    )]
    zone: Option<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GCE_NETWORK",
        help = "VPC network for the instances. [default: default]"
    )]
    network: Option<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GCE_SUBNETWORK",
        help = "Subnetwork to attach to. Inferred from the network if not given."
    )]
    subnetwork: Option<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GCE_PORTS",
        value_delimiter = ',',
        help = "Extra port/proto pairs to open to the world, e.g. 80/tcp,8140/tcp. 22/tcp is always open."
    )]
    ports: Vec<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GCE_MACHINE_TYPE",
        help = "Machine type for every host, overriding the fleet file."
    )]
    machine_type: Option<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_SET_GCE_HOSTNAME",
        help = "Set each instance's hostname from the host spec."
    )]
    set_hostname: bool,
    #[arg(long, global = true, help = "Private SSH key, used when no other key is found.")]
    ssh_private_key: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Public SSH key, used when <private key>.pub does not exist."
    )]
    ssh_public_key: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GCE_ACCESS_TOKEN",
        hide_env_values = true,
        help = "OAuth2 access token. Taken from `gcloud auth print-access-token` if not given."
    )]
    access_token: Option<String>,
    #[arg(
        long,
        global = true,
        env = "GANTRY_GROUP_ID",
        help = "Test group id to reuse (provision) or to discover (teardown)."
    )]
    group_id: Option<String>,
    #[arg(long, global = true, help = "How many hosts to work on at once. [default: 8]")]
    parallelism: Option<usize>,
    #[arg(
        long,
        global = true,
        help = "Give up on a cloud operation after this many seconds. [default: 600]"
    )]
    operation_timeout_secs: Option<u64>,
}

impl GlobalArgs {
    /// Merge flags, the fleet file and (for teardown) a saved group.
    fn config(&self, saved: Option<&gantry::TestGroup>) -> eyre::Result<gantry::Config> {
        let file = match &self.fleet {
            Some(path) => gantry::FleetFile::load(path)?,
            None => gantry::FleetFile::default(),
        };

        let overrides = gantry::Overrides {
            project: self
                .project
                .clone()
                .or_else(|| saved.map(|g| g.project.clone())),
            zone: self.zone.clone().or_else(|| saved.map(|g| g.zone.clone())),
            network: self.network.clone(),
            subnetwork: self.subnetwork.clone(),
            ports: self.ports.clone(),
            machine_type: self.machine_type.clone(),
            set_hostname: self.set_hostname,
            env_private_key: std::env::var_os("GANTRY_GCE_SSH_PRIVATE_KEY").map(PathBuf::from),
            ssh_private_key: self.ssh_private_key.clone(),
            ssh_public_key: self.ssh_public_key.clone(),
            group_id: self.group_id.clone(),
            parallelism: self.parallelism,
            operation_timeout: self.operation_timeout_secs.map(Duration::from_secs),
        };

        Ok(gantry::Config::build(overrides, file)?)
    }

    fn cloud(&self, config: &gantry::Config) -> eyre::Result<gantry::Cloud> {
        let tokens: Arc<dyn TokenSource> = match &self.access_token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(GcloudToken::new()),
        };
        let client = gantry::GceClient::new(tokens, RetryConfig::default())?;

        Ok(gantry::Cloud::new(
            Arc::new(client),
            config.project.clone(),
            config.zone.clone(),
            config.operation_timeout,
        ))
    }

    fn provisioner(&self, config: gantry::Config) -> eyre::Result<gantry::GoogleCompute> {
        let cloud = self.cloud(&config)?;
        let root_access = gantry::SshRootAccess::new(std::env::temp_dir().join("gantry-ssh"))?;
        Ok(gantry::GoogleCompute::new(cloud, config, Arc::new(root_access)))
    }
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    #[clap(about = "Create the firewalls and instances for every host in the fleet file")]
    Provision {
        #[arg(
            long,
            default_value = "gantry-state.json",
            help = "Where to write the provisioned group, for a later teardown."
        )]
        state: PathBuf,
        #[arg(long, help = "Tear everything down again if any host fails.")]
        all_or_nothing: bool,
    },
    #[clap(about = "Delete a test group's firewalls and instances")]
    Teardown {
        #[arg(
            long,
            help = "State file written by `gantry provision`. Without it, --group-id is used to find the instances."
        )]
        state: Option<PathBuf>,
    },
    #[clap(about = "Delete instances, disks and firewalls older than a threshold")]
    Reap {
        #[arg(long, default_value_t = 24, help = "Age in hours after which a resource is reaped.")]
        max_age_hours: i64,
        #[arg(long, help = "Only reap resources whose name starts with this.")]
        prefix: Option<String>,
    },
    #[clap(about = "Validate configuration and SSH keys without touching the cloud")]
    CheckConfig,
}
