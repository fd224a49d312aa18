//! Granting root (or Administrator) SSH access on a fresh instance.
//!
//! New instances only accept the unprivileged bootstrap user. The handshake
//! logs in as that user, installs the run's public key for the superuser,
//! enables superuser login, then drops the cached connection so the next
//! session authenticates as the user the host asked for.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use gantry_utils::{RetryConfig, ps_quote, retry_if, sh_quote};

use crate::image::OsFamily;
use crate::instance::ProvisionedHost;
use crate::{Error, Result};

/// The remote-shell side of the handshake.
#[async_trait]
pub trait RootAccess: Send + Sync {
    /// Make the host's key pair valid for the superuser account.
    async fn copy_credentials_to_root(&self, host: &ProvisionedHost) -> Result<()>;

    /// Allow the superuser to log in over SSH.
    async fn enable_root_login(&self, host: &ProvisionedHost) -> Result<()>;

    /// Drop any cached connection to `host`.
    async fn close_connection(&self, host: &ProvisionedHost) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Provisioned,
    KeyStaged,
    RootEnabled,
    ConnectionReset,
    /// The host asked for root SSH to stay disabled
    Skipped,
}

/// Run the handshake on `host`, leaving it logged in as the requested user.
///
/// Hosts with `disable_root_ssh` are left with the bootstrap user.
pub async fn bootstrap_root(
    access: &dyn RootAccess,
    host: &mut ProvisionedHost,
) -> Result<BootstrapState> {
    if host.spec.disable_root_ssh {
        tracing::info!(host = %host.name(), user = %host.initial_user, "not enabling root ssh as disable_root_ssh is set");
        host.user = host.initial_user.clone();
        return Ok(BootstrapState::Skipped);
    }

    let mut state = BootstrapState::Provisioned;
    let requested = match host.spec.user.as_str() {
        "" => host.os_family().superuser().to_string(),
        user => user.to_string(),
    };

    host.user = host.initial_user.clone();
    host.ssh_key = host.keys.private_key.clone();

    access.copy_credentials_to_root(host).await?;
    state = advance(host, state, BootstrapState::KeyStaged);

    access.enable_root_login(host).await?;
    state = advance(host, state, BootstrapState::RootEnabled);

    host.user = requested;

    if let Err(e) = access.close_connection(host).await {
        tracing::warn!(host = %host.name(), error = %e, "failed to close bootstrap connection");
    }
    state = advance(host, state, BootstrapState::ConnectionReset);

    Ok(state)
}

fn advance(host: &ProvisionedHost, from: BootstrapState, to: BootstrapState) -> BootstrapState {
    tracing::debug!(host = %host.name(), instance = %host.instance_name, ?from, ?to, "bootstrap");
    to
}

const WINDOWS_ADMIN_KEYS: &str = r"C:\ProgramData\ssh\administrators_authorized_keys";

/// [`RootAccess`] over the system `ssh` client.
///
/// Each host gets a `ControlMaster` socket so the handshake steps share one
/// authenticated session. Commands are retried while sshd on the new instance
/// is still coming up.
#[derive(Debug, Clone)]
pub struct SshRootAccess {
    control_dir: PathBuf,
    connect_timeout_secs: u16,
    retry: RetryConfig,
}

impl SshRootAccess {
    pub fn new(control_dir: impl Into<PathBuf>) -> Result<Self> {
        let control_dir = control_dir.into();
        std::fs::create_dir_all(&control_dir)?;

        Ok(Self {
            control_dir,
            connect_timeout_secs: 10,
            retry: RetryConfig {
                max_attempts: 30,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 1.5,
                jitter: true,
            },
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn control_path(&self, host: &ProvisionedHost) -> PathBuf {
        self.control_dir.join(&host.instance_name)
    }

    /// Arguments shared by every invocation for `host`
    fn base_args(&self, host: &ProvisionedHost) -> Vec<String> {
        ssh_base_args(
            &self.control_path(host),
            &host.ssh_key,
            self.connect_timeout_secs,
        )
    }

    async fn run(&self, host: &ProvisionedHost, step: &'static str, command: String) -> Result<()> {
        let mut args = self.base_args(host);
        args.push(format!("{}@{}", host.user, host.ip));
        args.push(command);

        let label = format!("{step} on {}", host.instance_name);
        retry_if(&self.retry, &label, |e: &SshFailure| e.unreachable, || {
            run_ssh(&args)
        })
        .await
        .map_err(|e| Error::Bootstrap {
            host: host.name().to_string(),
            step,
            message: e.message,
        })
    }
}

#[async_trait]
impl RootAccess for SshRootAccess {
    async fn copy_credentials_to_root(&self, host: &ProvisionedHost) -> Result<()> {
        let public_key = host.keys.public_key_contents()?;
        let command = match host.os_family() {
            OsFamily::Unix => unix_copy_key(&public_key),
            OsFamily::Windows => windows_copy_key(&public_key),
        };
        self.run(host, "copy credentials to root", command).await
    }

    async fn enable_root_login(&self, host: &ProvisionedHost) -> Result<()> {
        let command = match host.os_family() {
            OsFamily::Unix => unix_enable_root(),
            OsFamily::Windows => windows_enable_admin(),
        };
        self.run(host, "enable root login", command).await
    }

    async fn close_connection(&self, host: &ProvisionedHost) -> Result<()> {
        let control = self.control_path(host);
        if !control.exists() {
            return Ok(());
        }

        let output = tokio::process::Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg("-O")
            .arg("exit")
            .arg(format!("{}@{}", host.initial_user, host.ip))
            .output()
            .await?;

        if !output.status.success() {
            tracing::debug!(
                instance = %host.instance_name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "no control master to close"
            );
        }
        Ok(())
    }
}

fn ssh_base_args(control_path: &Path, key: &Path, connect_timeout_secs: u16) -> Vec<String> {
    [
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={connect_timeout_secs}"),
        "-o".to_string(),
        "ConnectionAttempts=1".to_string(),
        // instance IPs are recycled between runs
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "ControlMaster=auto".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        "ControlPersist=120".to_string(),
        "-i".to_string(),
        key.display().to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
    ]
    .into()
}

#[derive(Debug)]
struct SshFailure {
    /// ssh itself could not connect (exit status 255)
    unreachable: bool,
    message: String,
}

impl std::fmt::Display for SshFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

async fn run_ssh(args: &[String]) -> std::result::Result<(), SshFailure> {
    let output = tokio::process::Command::new("ssh")
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| SshFailure {
            unreachable: false,
            message: format!("failed to run ssh: {e}"),
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(SshFailure {
        unreachable: output.status.code() == Some(255),
        message: match output.status.code() {
            Some(code) => format!("exit status {code}: {stderr}"),
            None => format!("terminated by signal: {stderr}"),
        },
    })
}

fn unix_copy_key(public_key: &str) -> String {
    let script = format!(
        "sudo mkdir -p /root/.ssh && \
         printf '%s\\n' {} | sudo tee /root/.ssh/authorized_keys >/dev/null && \
         sudo chown -R root:root /root/.ssh && \
         sudo chmod 700 /root/.ssh && \
         sudo chmod 600 /root/.ssh/authorized_keys",
        sh_quote(public_key.trim())
    );
    format!("sh -c {}", sh_quote(&script))
}

fn unix_enable_root() -> String {
    let script = "sudo sed -i -e 's/^#\\{0,1\\}PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config && \
         (sudo systemctl restart sshd || sudo systemctl restart ssh || sudo service sshd restart || sudo service ssh restart)";
    format!("sh -c {}", sh_quote(script))
}

fn powershell(script: &str) -> String {
    format!("powershell -NoProfile -NonInteractive -Command \"{script}\"")
}

fn windows_copy_key(public_key: &str) -> String {
    let target = ps_quote(WINDOWS_ADMIN_KEYS);
    powershell(&format!(
        "Set-Content -Encoding ascii -Path {target} -Value {}; \
         icacls {target} /inheritance:r /grant 'Administrators:F' /grant 'SYSTEM:F'",
        ps_quote(public_key.trim())
    ))
}

fn windows_enable_admin() -> String {
    powershell("net user Administrator /active:yes; Restart-Service sshd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostSpec;
    use crate::image::ImageReference;
    use crate::instance::BOOTSTRAP_USER;
    use crate::ssh_keys::KeyPair;
    use std::sync::Mutex;

    fn host(user: &str, disable_root_ssh: bool) -> ProvisionedHost {
        let mut spec = HostSpec::from_family("web", "debian-12");
        spec.user = user.to_string();
        spec.disable_root_ssh = disable_root_ssh;
        ProvisionedHost {
            spec,
            instance_name: "gantry-0badf00d-abcdefghijkl".into(),
            ip: "203.0.113.10".into(),
            image: ImageReference {
                project: "debian-cloud".into(),
                name: "debian-12-bookworm-v20240415".into(),
                self_link: String::new(),
                disk_size_gb: 10,
                family: Some("debian-12".into()),
            },
            machine_type: "e2-standard-4".into(),
            initial_user: BOOTSTRAP_USER.into(),
            user: BOOTSTRAP_USER.into(),
            ssh_key: PathBuf::from("/stale/key"),
            keys: KeyPair {
                private_key: PathBuf::from("/keys/id"),
                public_key: PathBuf::from("/keys/id.pub"),
            },
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String, PathBuf)>>,
        fail_enable: bool,
    }

    impl Recorder {
        fn record(&self, step: &str, host: &ProvisionedHost) {
            self.calls
                .lock()
                .unwrap()
                .push((step.into(), host.user.clone(), host.ssh_key.clone()));
        }
    }

    #[async_trait]
    impl RootAccess for Recorder {
        async fn copy_credentials_to_root(&self, host: &ProvisionedHost) -> Result<()> {
            self.record("copy", host);
            Ok(())
        }

        async fn enable_root_login(&self, host: &ProvisionedHost) -> Result<()> {
            self.record("enable", host);
            if self.fail_enable {
                return Err(Error::Bootstrap {
                    host: host.name().into(),
                    step: "enable root login",
                    message: "sudo: a password is required".into(),
                });
            }
            Ok(())
        }

        async fn close_connection(&self, host: &ProvisionedHost) -> Result<()> {
            self.record("close", host);
            Ok(())
        }
    }

    #[tokio::test]
    async fn handshake_runs_as_bootstrap_user_then_restores() {
        let access = Recorder::default();
        let mut host = host("root", false);

        let state = bootstrap_root(&access, &mut host).await.unwrap();
        assert_eq!(state, BootstrapState::ConnectionReset);
        assert_eq!(host.user, "root");
        assert_eq!(host.ssh_key, PathBuf::from("/keys/id"));

        let calls = access.calls.lock().unwrap();
        let steps: Vec<_> = calls.iter().map(|(s, ..)| s.as_str()).collect();
        assert_eq!(steps, vec!["copy", "enable", "close"]);
        assert_eq!(calls[0].1, BOOTSTRAP_USER);
        assert_eq!(calls[0].2, PathBuf::from("/keys/id"));
        assert_eq!(calls[1].1, BOOTSTRAP_USER);
        assert_eq!(calls[2].1, "root");
    }

    #[tokio::test]
    async fn disabled_root_ssh_skips_everything() {
        let access = Recorder::default();
        let mut host = host("root", true);

        let state = bootstrap_root(&access, &mut host).await.unwrap();
        assert_eq!(state, BootstrapState::Skipped);
        assert_eq!(host.user, BOOTSTRAP_USER);
        assert!(access.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_step_stops_before_restoring_user() {
        let access = Recorder {
            fail_enable: true,
            ..Default::default()
        };
        let mut host = host("root", false);

        let err = bootstrap_root(&access, &mut host).await.unwrap_err();
        assert!(err.to_string().contains("enable root login"), "{err}");
        assert_eq!(host.user, BOOTSTRAP_USER);
        assert_eq!(access.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn ssh_args_use_batch_mode_identity_and_control_socket() {
        let args = ssh_base_args(Path::new("/tmp/ctl/gantry-1"), Path::new("/keys/id"), 10);
        let joined = args.join(" ");
        assert!(joined.contains("BatchMode=yes"), "{joined}");
        assert!(joined.contains("ControlPath=/tmp/ctl/gantry-1"), "{joined}");
        assert!(joined.contains("-i /keys/id -o IdentitiesOnly=yes"), "{joined}");
    }

    #[test]
    fn unix_key_copy_quotes_the_key() {
        let cmd = unix_copy_key("ssh-ed25519 AAAA ci@example\n");
        assert!(cmd.starts_with("sh -c '"), "{cmd}");
        assert!(cmd.contains("ssh-ed25519 AAAA ci@example"), "{cmd}");
        assert!(cmd.contains("/root/.ssh/authorized_keys"), "{cmd}");
    }

    #[test]
    fn windows_commands_go_through_powershell() {
        let cmd = windows_copy_key("ssh-ed25519 AAAA ci@example");
        assert!(cmd.starts_with("powershell -NoProfile"), "{cmd}");
        assert!(cmd.contains("administrators_authorized_keys"), "{cmd}");
        assert!(windows_enable_admin().contains("Administrator /active:yes"));
    }
}
