//! Static configuration for an update controller: where manifests live,
//! which keys sign them, and how aggressively to look for updates.

use std::path::PathBuf;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdaterError};
use crate::signer::PublicKey;

/// Where a manifest is fetched from: a literal URL, or a shorthand that
/// expands to the latest (or paginated, for prerelease scanning)
/// GitHub Releases entry for `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Url(String),
    GitHubRepo { owner: String, repo: String },
}

impl ManifestSource {
    /// Parse either a bare URL or a `github:owner/repo` shorthand.
    pub fn parse(spec: &str) -> Result<Self> {
        if let Some(rest) = spec.strip_prefix("github:") {
            let (owner, repo) = rest
                .split_once('/')
                .ok_or_else(|| UpdaterError::ConfigInvalid(format!("malformed github source: {spec}")))?;
            if owner.is_empty() || repo.is_empty() {
                return Err(UpdaterError::ConfigInvalid(format!(
                    "malformed github source: {spec}"
                )));
            }
            Ok(ManifestSource::GitHubRepo {
                owner: owner.to_string(),
                repo: repo.to_string(),
            })
        } else {
            Ok(ManifestSource::Url(spec.to_string()))
        }
    }
}

/// Deserialized form of [`ManifestSource`], since the enum's GitHub variant
/// isn't a natural fit for a single TOML/JSON string field otherwise.
impl<'de> Deserialize<'de> for ManifestSource {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ManifestSource::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ManifestSource {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ManifestSource::Url(url) => serializer.serialize_str(url),
            ManifestSource::GitHubRepo { owner, repo } => {
                serializer.serialize_str(&format!("github:{owner}/{repo}"))
            }
        }
    }
}

/// Static configuration for an [`crate::controller::UpdateController`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// The running application's current version, used for "is this newer"
    /// comparisons and substituted into `didLastUpdateFail` bookkeeping.
    pub version: Version,
    /// Signify public keys any manifest must verify against. At least one
    /// signature must match at least one key.
    pub public_keys: Vec<PublicKeyConfig>,
    /// Where to fetch manifests from, tried in order until one parses and
    /// verifies.
    pub manifests: Vec<ManifestSource>,
    /// If true, nightly/prerelease manifests are eligible even without
    /// `allow_prerelease`.
    #[serde(default)]
    pub nightly: bool,
    /// If true, GitHub prerelease entries are considered when resolving a
    /// `github:` manifest source.
    #[serde(default)]
    pub allow_prerelease: bool,
    /// If true, a successful [`crate::controller::UpdateController::download`]
    /// arms the exit hook on its own; otherwise the embedder must call
    /// `schedule_install_on_quit`/`quit_and_install` explicitly. Defaults to
    /// `false`: installing and relaunching without an explicit call is a
    /// meaningful behavior change for the host application to opt into.
    #[serde(default)]
    pub auto_install: bool,
    /// Where downloaded artifacts and the in-progress `UpdateInfo` record
    /// are stored.
    #[serde(default = "default_downloads_directory")]
    pub downloads_directory: PathBuf,
}

/// `<cache dir>/updatekit/updates`, or a temp-dir fallback if the platform
/// has no cache directory (the same `dirs::cache_dir()` fallback pattern the
/// teacher's own `pypi.rs`/`commands.rs` use for their cache locations).
fn default_downloads_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("updatekit")
        .join("updates")
}

/// A base64 signify public key, as stored in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKeyConfig(pub String);

impl UpdaterConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| UpdaterError::ConfigInvalid(e.to_string()))
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| UpdaterError::ConfigInvalid(e.to_string()))
    }

    /// Decode and return this configuration's public keys.
    pub fn decode_public_keys(&self) -> Result<Vec<PublicKey>> {
        self.public_keys
            .iter()
            .map(|k| PublicKey::from_base64(&k.0))
            .collect()
    }
}
