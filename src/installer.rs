//! The narrow boundary between the update controller and the host
//! application's platform-specific install mechanics (codesign
//! verification, package-manager invocation, replacing the running binary).
//! The controller never touches installation itself; it hands a verified
//! artifact to whatever implements this trait.

use std::path::Path;

use crate::error::Result;

/// Installs a verified update artifact. Implementations are expected to be
/// platform-specific (an macOS `.pkg` installer, an MSI invocation, an
/// AppImage swap, ...); the controller only knows this interface.
pub trait Installer: Send + Sync {
    /// Install the artifact at `artifact_path`. If `restart` is true, the
    /// implementation should relaunch the application once installation
    /// completes; if false, it should leave that to the caller.
    fn install(&self, artifact_path: &Path, restart: bool) -> Result<()>;
}

/// An [`Installer`] that does nothing but record the last call it received.
/// Not behind a `test-util`-style feature gate: integration tests under
/// `tests/` link against this crate as an ordinary dependency, so anything
/// gated on `#[cfg(test)]` inside this crate would be invisible to them.
/// Kept as a plain, always-available type instead, the same way the rest of
/// this crate's modules expose small test doubles alongside their real
/// implementation.
pub struct NoopInstaller {
    calls: std::sync::Mutex<Vec<(std::path::PathBuf, bool)>>,
}

impl Default for NoopInstaller {
    fn default() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl NoopInstaller {
    pub fn calls(&self) -> Vec<(std::path::PathBuf, bool)> {
        self.calls.lock().expect("mutex poisoned").clone()
    }
}

impl Installer for NoopInstaller {
    fn install(&self, artifact_path: &Path, restart: bool) -> Result<()> {
        self.calls
            .lock()
            .expect("mutex poisoned")
            .push((artifact_path.to_path_buf(), restart));
        Ok(())
    }
}

/// A one-shot callback the controller hands to [`OnShutdown::register`],
/// to be run exactly once when the host is about to quit.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// The host's "before-quit" signal, as an injected callback interface
/// rather than global mutable state. The controller calls `register` at
/// most once per process (the exit hook "installs once"); the
/// implementation is expected to cancel the host's own quit, run
/// `callback`, and only then let the application actually exit.
pub trait OnShutdown: Send + Sync {
    fn register(&self, callback: ShutdownCallback);
}

/// The fallback used when no host integration is wired up: there is no
/// "before-quit" signal to hook, so this waits on the process's own
/// termination signal (Ctrl-C/SIGINT) and runs the callback immediately
/// before letting the process die, per spec's "if no host integration is
/// available, wire to process exit".
#[derive(Default)]
pub struct ProcessExitOnShutdown;

impl OnShutdown for ProcessExitOnShutdown {
    fn register(&self, callback: ShutdownCallback) {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            callback();
        });
    }
}
