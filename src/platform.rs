//! Maps the host OS/architecture to the manifest platform key used in
//! `<platform>-file`/`<platform>-size`/`<platform>-sha512` entries.

use crate::error::{Result, UpdaterError};

/// Resolve the manifest platform tag for the host this binary is running on.
///
/// - macOS → `"mac"`
/// - Linux → `"linux-<arch>"` (`x64`, `arm64`, `ia32`, ...)
/// - Windows → `"windows"`
/// - anything else → `UnsupportedPlatform`
pub fn host_platform_key() -> Result<String> {
    #[cfg(target_os = "macos")]
    {
        return Ok("mac".to_string());
    }

    #[cfg(target_os = "windows")]
    {
        return Ok("windows".to_string());
    }

    #[cfg(target_os = "linux")]
    {
        return Ok(format!("linux-{}", arch_tag()));
    }

    #[allow(unreachable_code)]
    Err(UpdaterError::UnsupportedPlatform)
}

#[cfg(target_os = "linux")]
fn arch_tag() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        "x64"
    }
    #[cfg(target_arch = "aarch64")]
    {
        "arm64"
    }
    #[cfg(target_arch = "x86")]
    {
        "ia32"
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "x86")))]
    {
        std::env::consts::ARCH
    }
}
