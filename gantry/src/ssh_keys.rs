//! Locating the SSH key pair used to reach new instances.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name gcloud gives the key it generates for Compute Engine
pub const DEFAULT_KEY_NAME: &str = "google_compute_engine";

/// Where to look for the key pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySearch {
    /// Checked first (`GANTRY_GCE_SSH_PRIVATE_KEY`)
    pub env_private_key: Option<PathBuf>,
    /// Checked after the per-user default
    pub private_key: Option<PathBuf>,
    /// Used only when `<private>.pub` does not exist
    pub public_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

impl KeyPair {
    /// Contents of the public key file, trailing newline removed
    pub fn public_key_contents(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.public_key)?.trim().to_string())
    }
}

/// `~/.ssh/google_compute_engine`, when a home directory is known
pub fn default_private_key() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh").join(DEFAULT_KEY_NAME))
}

/// Resolves the key pair once and hands the same answer to every host of a run.
#[derive(Debug)]
pub struct KeyLocator {
    search: KeySearch,
    user_default: Option<PathBuf>,
    resolved: OnceLock<KeyPair>,
}

impl KeyLocator {
    pub fn new(search: KeySearch) -> Self {
        Self::with_user_default(search, default_private_key())
    }

    pub fn with_user_default(search: KeySearch, user_default: Option<PathBuf>) -> Self {
        Self {
            search,
            user_default,
            resolved: OnceLock::new(),
        }
    }

    pub fn key_pair(&self) -> Result<KeyPair> {
        if let Some(pair) = self.resolved.get() {
            return Ok(pair.clone());
        }

        let private_key = self.locate_private_key()?;
        let public_key = self.locate_public_key(&private_key)?;
        tracing::debug!(private = ?private_key, public = ?public_key, "resolved ssh key pair");

        Ok(self
            .resolved
            .get_or_init(|| KeyPair {
                private_key,
                public_key,
            })
            .clone())
    }

    pub fn private_key(&self) -> Result<PathBuf> {
        Ok(self.key_pair()?.private_key)
    }

    pub fn public_key(&self) -> Result<PathBuf> {
        Ok(self.key_pair()?.public_key)
    }

    fn locate_private_key(&self) -> Result<PathBuf> {
        let tried: Vec<PathBuf> = [
            self.search.env_private_key.as_ref(),
            self.user_default.as_ref(),
            self.search.private_key.as_ref(),
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();

        first_existing(tried, "private")
    }

    fn locate_public_key(&self, private_key: &Path) -> Result<PathBuf> {
        let mut derived = private_key.as_os_str().to_owned();
        derived.push(".pub");

        let mut tried = vec![PathBuf::from(derived)];
        if let Some(configured) = &self.search.public_key {
            if !tried.contains(configured) {
                tried.push(configured.clone());
            }
        }

        first_existing(tried, "public")
    }
}

fn first_existing(candidates: Vec<PathBuf>, kind: &'static str) -> Result<PathBuf> {
    match candidates.iter().find(|p| p.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(Error::KeyNotFound {
            kind,
            tried: candidates,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("ssh-ed25519 AAAA {name}\n")).unwrap();
        path
    }

    #[test]
    fn env_override_wins_over_default_and_configured() {
        let dir = tempfile::tempdir().unwrap();
        let env_key = touch(dir.path(), "env_key");
        touch(dir.path(), "env_key.pub");
        let default = touch(dir.path(), "google_compute_engine");
        let configured = touch(dir.path(), "configured");

        let locator = KeyLocator::with_user_default(
            KeySearch {
                env_private_key: Some(env_key.clone()),
                private_key: Some(configured),
                public_key: None,
            },
            Some(default),
        );
        assert_eq!(locator.private_key().unwrap(), env_key);
        assert_eq!(locator.public_key().unwrap(), dir.path().join("env_key.pub"));
    }

    #[test]
    fn configured_key_is_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let configured = touch(dir.path(), "id_ci");
        touch(dir.path(), "id_ci.pub");

        let locator = KeyLocator::with_user_default(
            KeySearch {
                env_private_key: Some(dir.path().join("missing")),
                private_key: Some(configured.clone()),
                public_key: None,
            },
            Some(dir.path().join("google_compute_engine")),
        );
        assert_eq!(locator.private_key().unwrap(), configured);
    }

    #[test]
    fn public_key_override_used_when_derived_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let private = touch(dir.path(), "id_ci");
        let public = touch(dir.path(), "elsewhere.pub");

        let locator = KeyLocator::with_user_default(
            KeySearch {
                private_key: Some(private),
                public_key: Some(public.clone()),
                ..Default::default()
            },
            None,
        );
        let pair = locator.key_pair().unwrap();
        assert_eq!(pair.public_key, public);
        assert_eq!(pair.public_key_contents().unwrap(), "ssh-ed25519 AAAA elsewhere.pub");
    }

    #[test]
    fn missing_keys_list_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let locator = KeyLocator::with_user_default(
            KeySearch {
                env_private_key: Some(a.clone()),
                private_key: Some(b.clone()),
                public_key: None,
            },
            None,
        );

        match locator.private_key().unwrap_err() {
            Error::KeyNotFound { kind, tried } => {
                assert_eq!(kind, "private");
                assert_eq!(tried, vec![a, b]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_public_key_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let private = touch(dir.path(), "lonely");
        let locator = KeyLocator::with_user_default(
            KeySearch {
                private_key: Some(private),
                ..Default::default()
            },
            None,
        );

        let err = locator.key_pair().unwrap_err();
        assert!(err.to_string().contains("public SSH key"), "{err}");
        assert!(err.to_string().contains("lonely.pub"), "{err}");
    }

    #[test]
    fn resolution_is_cached_for_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let private = touch(dir.path(), "id_ci");
        let public = touch(dir.path(), "id_ci.pub");

        let locator = KeyLocator::with_user_default(
            KeySearch {
                private_key: Some(private.clone()),
                ..Default::default()
            },
            None,
        );
        let first = locator.key_pair().unwrap();

        std::fs::remove_file(&private).unwrap();
        std::fs::remove_file(&public).unwrap();
        assert_eq!(locator.key_pair().unwrap(), first);
        assert_eq!(locator.private_key().unwrap(), private);
    }
}
