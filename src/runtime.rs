//! Process-wide singleton state behind one seam (spec §9 "Global
//! process-wide state"): `process.env`, cwd, PATH derivation, and SIGINT.
//!
//! The executor and child-process runner take a `&dyn Runtime` (or
//! `Arc<dyn Runtime>`) instead of reading `std::env`/`std::process` directly,
//! so test code can supply a fake one instead of mutating the real process
//! environment.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::path::AbsDirPath;

#[async_trait]
pub trait Runtime: Send + Sync {
    fn env_var(&self, name: &str) -> Option<String>;

    fn path_var(&self) -> Option<String>;

    fn current_dir(&self) -> AbsDirPath;

    fn platform(&self) -> &str;

    fn arch(&self) -> &str;

    /// Resolves on SIGINT (Ctrl+C) / the platform equivalent. Callers loop on
    /// this so a second signal can escalate a graceful cancellation to a
    /// forceful one (spec §4.6 "Cancellation").
    async fn interrupted(&self);
}

/// The real process: reads `std::env`, awaits `tokio::signal::ctrl_c`.
pub struct ProcessRuntime {
    platform: String,
    arch: String,
}

impl ProcessRuntime {
    pub fn host() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::host()
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn path_var(&self) -> Option<String> {
        std::env::var("PATH").ok()
    }

    fn current_dir(&self) -> AbsDirPath {
        AbsDirPath::current().expect("process has a working directory")
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    async fn interrupted(&self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// A `Runtime` with fixed, in-memory answers. Never interrupts on its own;
/// tests that need to exercise cancellation drive the executor's
/// `request_cancel` directly instead of going through this trait.
#[derive(Clone, Debug)]
pub struct FakeRuntime {
    env: HashMap<String, String>,
    path: Option<String>,
    cwd: std::path::PathBuf,
    platform: String,
    arch: String,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            path: None,
            cwd: std::path::PathBuf::from("/"),
            platform: "linux".to_string(),
            arch: "x86_64".to_string(),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>, arch: impl Into<String>) -> Self {
        self.platform = platform.into();
        self.arch = arch.into();
        self
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn env_var(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn path_var(&self) -> Option<String> {
        self.path.clone()
    }

    fn current_dir(&self) -> AbsDirPath {
        AbsDirPath::try_from(self.cwd.clone()).expect("FakeRuntime cwd must be absolute")
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    async fn interrupted(&self) {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_runtime_falls_back_to_none_for_unset_vars() {
        let runtime = FakeRuntime::new().with_env("FOO", "bar");
        assert_eq!(runtime.env_var("FOO").as_deref(), Some("bar"));
        assert_eq!(runtime.env_var("MISSING"), None);
    }
}
