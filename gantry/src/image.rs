//! Turning a host's `image` / `family` selector into a concrete boot image.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::config::HostSpec;
use crate::gce::Cloud;
use crate::{Error, Result};

/// Public image projects whose images boot Windows
pub const WINDOWS_IMAGE_PROJECTS: [&str; 2] = ["windows-cloud", "windows-sql-cloud"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    pub fn from_project(project: &str) -> Self {
        if WINDOWS_IMAGE_PROJECTS.contains(&project) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// The account the caller usually means when asking for full privileges
    pub fn superuser(self) -> &'static str {
        match self {
            Self::Unix => "root",
            Self::Windows => "Administrator",
        }
    }
}

/// What a host asked for, before any lookup.
///
/// A `project/` prefix names the image project; without it the run's own
/// project is searched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSelector {
    Image {
        project: Option<String>,
        name: String,
    },
    Family {
        project: Option<String>,
        family: String,
    },
}

impl ImageSelector {
    /// Fails before any network call when the host names neither or both.
    pub fn for_host(host: &HostSpec) -> Result<Self> {
        match (host.image.as_deref(), host.family.as_deref()) {
            (Some(image), None) => {
                let (project, name) = split_project(image);
                Ok(Self::Image { project, name })
            }
            (None, Some(family)) => {
                let (project, family) = split_project(family);
                Ok(Self::Family { project, family })
            }
            (Some(_), Some(_)) => Err(Error::MissingImageSelector {
                host: host.name.clone(),
                reason: "specify either image or family, not both",
            }),
            (None, None) => Err(Error::MissingImageSelector {
                host: host.name.clone(),
                reason: "you must specify either an image or a family",
            }),
        }
    }

    pub fn project<'a>(&'a self, default_project: &'a str) -> &'a str {
        match self {
            Self::Image { project, .. } | Self::Family { project, .. } => {
                project.as_deref().unwrap_or(default_project)
            }
        }
    }
}

impl std::fmt::Display for ImageSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, project, name) = match self {
            Self::Image { project, name } => ("image", project, name),
            Self::Family { project, family } => ("family", project, family),
        };
        match project {
            Some(project) => write!(f, "{kind} {project}/{name}"),
            None => write!(f, "{kind} {name}"),
        }
    }
}

fn split_project(selector: &str) -> (Option<String>, String) {
    match selector.split_once('/') {
        Some((project, name)) => (Some(project.to_string()), name.to_string()),
        None => (None, selector.to_string()),
    }
}

/// A concrete image a boot disk can be created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub project: String,
    pub name: String,
    pub self_link: String,
    /// Smallest boot disk the image fits on, in GB
    pub disk_size_gb: u64,
    /// Family the image was picked from, if resolved that way
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

impl ImageReference {
    pub fn os_family(&self) -> OsFamily {
        OsFamily::from_project(&self.project)
    }
}

/// Resolves selectors, remembering each answer for the rest of the run.
///
/// Families are rolling pointers; caching means every host of one group that
/// asks for the same family boots the same image. Each selector has its own
/// cell, so only callers asking for the same selector wait on each other.
/// Failed lookups are not remembered.
#[derive(Debug, Default)]
pub struct ImageResolver {
    cache: Mutex<HashMap<(String, ImageSelector), Arc<OnceCell<ImageReference>>>>,
}

impl ImageResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, cloud: &Cloud, selector: &ImageSelector) -> Result<ImageReference> {
        let project = selector.project(cloud.project()).to_string();
        let cell = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((project.clone(), selector.clone()))
            .or_default()
            .clone();

        cell.get_or_try_init(|| fetch(cloud, project, selector))
            .await
            .cloned()
    }
}

async fn fetch(cloud: &Cloud, project: String, selector: &ImageSelector) -> Result<ImageReference> {
    let (image, family) = match selector {
        ImageSelector::Image { name, .. } => {
            let image = cloud
                .api()
                .get_image(&project, name)
                .await
                .map_err(|e| not_found_as(e, "image", &project, name))?;
            (image, None)
        }
        ImageSelector::Family { family, .. } => {
            let image = cloud
                .api()
                .get_image_from_family(&project, family)
                .await
                .map_err(|e| not_found_as(e, "image family", &project, family))?;
            (image, Some(family.clone()))
        }
    };

    if let Some(deprecated) = &image.deprecated {
        tracing::warn!(image = %image.name, state = %deprecated.state, "image is deprecated");
    }

    let reference = ImageReference {
        project,
        name: image.name,
        self_link: image.self_link,
        disk_size_gb: image.disk_size_gb,
        family: family.or(image.family),
    };
    tracing::info!(%selector, image = %reference.name, project = %reference.project, "resolved image");
    Ok(reference)
}

fn not_found_as(err: Error, kind: &'static str, project: &str, name: &str) -> Error {
    if err.is_not_found() {
        Error::not_found(kind, format!("{project}/{name}"))
    } else {
        err
    }
}
