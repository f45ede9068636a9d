use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// The full error taxonomy for the update pipeline.
///
/// Every variant here corresponds to one of the error kinds the update
/// pipeline can surface; callers are expected to match on these rather than
/// parse error strings.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// Startup configuration failed validation (e.g. no manifest URLs).
    #[error("invalid updater configuration: {0}")]
    ConfigInvalid(String),

    /// A signify key or signature buffer had the wrong length.
    #[error("expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    /// A signify buffer declared an algorithm tag other than `Ed`.
    #[error("unknown signify algorithm tag: {0:?}")]
    UnknownAlgorithm([u8; 2]),

    /// A secret key declared an encrypted KDF, which this crate cannot handle.
    #[error("secret key is KDF-encrypted, which is unsupported")]
    UnsupportedKDF,

    /// A secret key's embedded checksum didn't match its key material.
    #[error("secret key checksum mismatch")]
    ChecksumMismatch,

    /// None of the configured public keys matched a signature's key number.
    #[error("no configured public key matches this signature's key number")]
    NoMatchingKey,

    /// A signature failed Ed25519 verification.
    #[error("signature verification failed")]
    InvalidSignature,

    /// A manifest's text structure could not be parsed.
    #[error("malformed manifest: {0}")]
    BadManifest(String),

    /// A manifest's `version` key was missing or not valid semver.
    #[error("invalid or missing manifest version: {0}")]
    InvalidVersion(String),

    /// The host OS/architecture has no corresponding manifest platform key.
    #[error("unsupported platform")]
    UnsupportedPlatform,

    /// An HTTP request resolved to 404.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A fetch followed more redirects than permitted.
    #[error("too many redirects for {0}")]
    TooManyRedirects(String),

    /// A redirect (or the initial request) targeted a non-HTTPS URL.
    #[error("refusing non-https URL: {0}")]
    UnsafeRedirect(String),

    /// The response `Content-Type` didn't match what the caller expected.
    #[error("unexpected content-type: expected {expected}, got {actual}")]
    UnexpectedContentType { expected: String, actual: String },

    /// A text/JSON response exceeded the maximum buffered size.
    #[error("response exceeded maximum buffered size")]
    ResponseTooLarge,

    /// A network-level request failure (after retries were exhausted).
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// A request timed out (after retries were exhausted).
    #[error("request timed out: {0}")]
    RequestTimeout(String),

    /// `download()` was called with no pending `newVersion`.
    #[error("no update is available to download")]
    NoUpdate,

    /// The manifest has no file/size/sha512 triple for the requested platform.
    #[error("manifest has no artifact for platform {0}")]
    NoPlatformFile(String),

    /// A downloaded artifact's digest didn't match the manifest.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// A downloaded artifact's size didn't match the manifest.
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A download was requested while one was already in flight.
    #[error("a download is already in progress")]
    DownloadInProgress,

    /// The persisted `update-info.json` file was missing or malformed.
    #[error("update info invalid or missing: {0}")]
    UpdateInfoInvalid(String),

    /// No installer is registered for the host platform.
    #[error("no installer registered for this platform")]
    UnknownPlatformInstaller,

    /// `quit_and_install`/`quit_and_retry_install` was called with nothing
    /// downloaded or scheduled.
    #[error("no update artifact is scheduled to install")]
    NothingToInstall,

    /// An I/O error that doesn't fit a more specific variant above.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A path was expected to live under the downloads directory but didn't.
    #[error("path {0} is not under the downloads directory")]
    PathOutsideDownloads(PathBuf),
}
