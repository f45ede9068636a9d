//! Signed update manifests: a small text format whose signed region must be
//! reconstructable byte-for-byte from the parsed representation.
//!
//! Wire format:
//!
//! ```text
//! untrusted comment: <arbitrary>
//! <base64 signature>
//! <signed body>
//! ```
//!
//! The signed body is everything from the third line onward, rejoined with
//! `\n`. Signature verification runs over those exact bytes; parsing then
//! trims and drops empty lines and reads the rest as `key: value` pairs.

use std::collections::BTreeMap;

use semver::Version;

use crate::error::{Result, UpdaterError};
use crate::signer::{self, PublicKey, SecretKey};

const COMMENT_LINE: &str = "untrusted comment: Peerio Updater manifest";

/// File/size/digest triple for one manifest platform entry. Any subset may
/// be present; `spec.md` treats "all three or none" as an invariant that
/// `serialize` upholds but does not require `loadFromString` to enforce on
/// externally supplied text, so accessors simply return `None` for any
/// missing field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformEntry {
    pub file: Option<String>,
    pub size: Option<String>,
    pub sha512: Option<String>,
}

impl PlatformEntry {
    fn is_complete(&self) -> bool {
        self.file.is_some() && self.size.is_some() && self.sha512.is_some()
    }
}

/// A parsed, signature-verified update manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    version: String,
    urgency: Option<String>,
    date: Option<String>,
    changelog: Option<String>,
    platforms: BTreeMap<String, PlatformEntry>,
    extra: BTreeMap<String, String>,
}

enum Key<'a> {
    Version,
    Urgency,
    Date,
    Changelog,
    PlatformFile(&'a str),
    PlatformSize(&'a str),
    PlatformSha512(&'a str),
    Extra,
}

fn classify(key: &str) -> Key<'_> {
    match key {
        "version" => Key::Version,
        "urgency" => Key::Urgency,
        "date" => Key::Date,
        "changelog" => Key::Changelog,
        _ => {
            if let Some(platform) = key.strip_suffix("-file") {
                Key::PlatformFile(platform)
            } else if let Some(platform) = key.strip_suffix("-size") {
                Key::PlatformSize(platform)
            } else if let Some(platform) = key.strip_suffix("-sha512") {
                Key::PlatformSha512(platform)
            } else {
                Key::Extra
            }
        }
    }
}

impl Manifest {
    /// Parse and signature-verify a manifest from its wire text.
    pub fn load_from_string(public_keys: &[PublicKey], text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() < 3 {
            return Err(UpdaterError::BadManifest(
                "manifest must have at least 3 lines".to_string(),
            ));
        }
        let signature_b64 = lines[1];
        let signed_body = lines[2..].join("\n");

        signer::verify(public_keys, signature_b64, &signed_body)?;

        let mut version = None;
        let mut urgency = None;
        let mut date = None;
        let mut changelog = None;
        let mut platforms: BTreeMap<String, PlatformEntry> = BTreeMap::new();
        let mut extra = BTreeMap::new();

        for raw_line in signed_body.split('\n') {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (key, value) = match trimmed.find(':') {
                Some(idx) => (trimmed[..idx].trim(), trimmed[idx + 1..].trim()),
                None => (trimmed, ""),
            };

            match classify(key) {
                Key::Version => version = Some(value.to_string()),
                Key::Urgency => urgency = Some(value.to_string()),
                Key::Date => date = Some(value.to_string()),
                Key::Changelog => changelog = Some(value.to_string()),
                Key::PlatformFile(platform) => {
                    platforms.entry(platform.to_string()).or_default().file = Some(value.to_string());
                }
                Key::PlatformSize(platform) => {
                    platforms.entry(platform.to_string()).or_default().size = Some(value.to_string());
                }
                Key::PlatformSha512(platform) => {
                    platforms.entry(platform.to_string()).or_default().sha512 =
                        Some(value.to_string());
                }
                Key::Extra => {
                    extra.insert(key.to_string(), value.to_string());
                }
            }
        }

        let version = version
            .ok_or_else(|| UpdaterError::InvalidVersion("manifest has no version key".to_string()))?;
        Version::parse(&version).map_err(|e| UpdaterError::InvalidVersion(e.to_string()))?;

        Ok(Manifest {
            version,
            urgency,
            date,
            changelog,
            platforms,
            extra,
        })
    }

    /// Serialize this manifest's signed body, sign it, and prepend the
    /// comment/signature preamble.
    pub fn serialize(&self, secret_key: &SecretKey) -> String {
        let body = self.serialize_body();
        let signature = signer::sign(secret_key, &body);
        format!("{COMMENT_LINE}\n{signature}\n{body}")
    }

    fn serialize_body(&self) -> String {
        let mut lines = vec![String::new()];

        lines.push(format!("version: {}", self.version));
        if let Some(urgency) = &self.urgency {
            lines.push(format!("urgency: {urgency}"));
        }
        if let Some(date) = &self.date {
            lines.push(format!("date: {date}"));
        }
        if let Some(changelog) = &self.changelog {
            lines.push(format!("changelog: {changelog}"));
        }

        let mut remaining: BTreeMap<String, String> = BTreeMap::new();
        for (platform, entry) in &self.platforms {
            if let Some(file) = &entry.file {
                remaining.insert(format!("{platform}-file"), file.clone());
            }
            if let Some(size) = &entry.size {
                remaining.insert(format!("{platform}-size"), size.clone());
            }
            if let Some(sha512) = &entry.sha512 {
                remaining.insert(format!("{platform}-sha512"), sha512.clone());
            }
        }
        for (key, value) in &self.extra {
            remaining.insert(key.clone(), value.clone());
        }

        let mut previous_prefix: Option<String> = None;
        for (key, value) in &remaining {
            let prefix = key.split('-').next().unwrap_or(key).to_string();
            if let Some(prev) = &previous_prefix {
                if *prev != prefix {
                    lines.push(String::new());
                }
            }
            previous_prefix = Some(prefix);
            lines.push(format!("{key}: {value}"));
        }

        lines.push(String::new());
        lines.join("\n")
    }

    /// The manifest's declared semver version.
    pub fn version(&self) -> Version {
        Version::parse(&self.version).expect("version was validated at parse time")
    }

    /// Stored urgency string, defaulting to `"mandatory"`.
    pub fn urgency(&self) -> &str {
        self.urgency.as_deref().unwrap_or("mandatory")
    }

    /// If urgency is `"optional since <version>"` and `<version>` is valid
    /// semver, returns that version. Otherwise `None`.
    pub fn optional_since(&self) -> Option<Version> {
        let rest = self.urgency().strip_prefix("optional since ")?;
        Version::parse(rest.trim()).ok()
    }

    /// True if this update must be installed before `current` can continue
    /// to be considered current: either urgency is (or defaults to)
    /// mandatory, urgency has no parseable "optional since" version, or
    /// `current` predates the optional-since version.
    pub fn is_mandatory_since(&self, current: &Version) -> bool {
        match self.optional_since() {
            None => true,
            Some(since) => current < &since,
        }
    }

    /// True if this manifest's version is strictly greater than `current`.
    pub fn is_newer_version_than(&self, current: &Version) -> bool {
        &self.version() > current
    }

    /// The `date` value, if present.
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    /// The `changelog` URL, if present.
    pub fn changelog(&self) -> Option<&str> {
        self.changelog.as_deref()
    }

    fn platform_entry(&self, platform: &str) -> Option<&PlatformEntry> {
        self.platforms.get(platform)
    }

    /// The `<platform>-file` value.
    pub fn file(&self, platform: &str) -> Option<&str> {
        self.platform_entry(platform)?.file.as_deref()
    }

    /// The `<platform>-size` value, parsed as a decimal `u64`.
    pub fn size(&self, platform: &str) -> Option<u64> {
        self.platform_entry(platform)?.size.as_deref()?.parse().ok()
    }

    /// The `<platform>-sha512` value.
    pub fn sha512(&self, platform: &str) -> Option<&str> {
        self.platform_entry(platform)?.sha512.as_deref()
    }

    /// True if `platform` has a complete file/size/sha512 triple.
    pub fn has_platform(&self, platform: &str) -> bool {
        self.platform_entry(platform)
            .map(PlatformEntry::is_complete)
            .unwrap_or(false)
    }

    /// Construct a manifest directly (for building a manifest to sign and
    /// serialize, rather than one parsed from the wire).
    pub fn builder(version: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(version.into())
    }
}

/// Builder for assembling a [`Manifest`] before signing it.
pub struct ManifestBuilder {
    version: String,
    urgency: Option<String>,
    date: Option<String>,
    changelog: Option<String>,
    platforms: BTreeMap<String, PlatformEntry>,
    extra: BTreeMap<String, String>,
}

impl ManifestBuilder {
    fn new(version: String) -> Self {
        Self {
            version,
            urgency: None,
            date: None,
            changelog: None,
            platforms: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn urgency(mut self, urgency: impl Into<String>) -> Self {
        self.urgency = Some(urgency.into());
        self
    }

    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn changelog(mut self, changelog: impl Into<String>) -> Self {
        self.changelog = Some(changelog.into());
        self
    }

    pub fn platform(
        mut self,
        platform: impl Into<String>,
        file: impl Into<String>,
        size: u64,
        sha512: impl Into<String>,
    ) -> Self {
        self.platforms.insert(
            platform.into(),
            PlatformEntry {
                file: Some(file.into()),
                size: Some(size.to_string()),
                sha512: Some(sha512.into()),
            },
        );
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Manifest> {
        Version::parse(&self.version).map_err(|e| UpdaterError::InvalidVersion(e.to_string()))?;
        Ok(Manifest {
            version: self.version,
            urgency: self.urgency,
            date: self.date,
            changelog: self.changelog,
            platforms: self.platforms,
            extra: self.extra,
        })
    }
}
