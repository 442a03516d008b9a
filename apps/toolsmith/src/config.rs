//! # Configuration
//!
//! Settings come from a TOML file, then environment overrides, then
//! command-line flags.
//!
//! The file is the first of:
//! 1. `--config <path>`
//! 2. `$TOOLSMITH_CONFIG`
//! 3. `<home>/config.toml`, if it exists
//!
//! ```toml
//! home = "/var/lib/toolsmith"
//!
//! [remote]
//! url = "http://memory.internal:7878"
//! api_key = "secret"
//! timeout_ms = 3000
//!
//! [backend]
//! rustc = "rustc"
//! opt_level = "2"
//!
//! [cache]
//! lock_timeout_ms = 120000
//! ```
//!
//! Environment overrides: `TOOLSMITH_HOME`, `TOOLSMITH_REMOTE_URL`,
//! `TOOLSMITH_API_KEY`, `TOOLSMITH_RUSTC`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolsmith_core::{RustcBackend, ToolsmithError};

/// Name of the config file looked up under the home directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 120_000;

// =============================================================================
// CONFIG SECTIONS
// =============================================================================

/// The networked memory server to mirror into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
        }
    }
}

/// The code generation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub rustc: String,
    pub opt_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            rustc: "rustc".to_string(),
            opt_level: "2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub lock_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

/// Complete toolsmith configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root for the build cache and the memory file.
    pub home: Option<PathBuf>,
    pub remote: RemoteConfig,
    pub backend: BackendConfig,
    pub cache: CacheConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ToolsmithError> {
        toml::from_str(text).map_err(|e| ToolsmithError::Parse {
            detail: format!("invalid config: {e}"),
        })
    }

    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<Self, ToolsmithError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ToolsmithError::Storage(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from the process environment and the given flags.
    pub fn load(config_flag: Option<&Path>, home_flag: Option<&Path>) -> Result<Self, ToolsmithError> {
        Self::load_with(config_flag, home_flag, |key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_with<F>(
        config_flag: Option<&Path>,
        home_flag: Option<&Path>,
        env: F,
    ) -> Result<Self, ToolsmithError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = config_flag
            .map(Path::to_path_buf)
            .or_else(|| env("TOOLSMITH_CONFIG").map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                // the home that decides where config.toml lives cannot come from config.toml
                let home = home_flag
                    .map(Path::to_path_buf)
                    .or_else(|| env("TOOLSMITH_HOME").map(PathBuf::from))
                    .unwrap_or_else(|| default_home(&env));
                let candidate = home.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(&env);
        if let Some(home) = home_flag {
            config.home = Some(home.to_path_buf());
        }
        Ok(config)
    }

    /// Apply `TOOLSMITH_*` overrides. Empty values are ignored.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(home) = get("TOOLSMITH_HOME") {
            self.home = Some(PathBuf::from(home));
        }
        if let Some(url) = get("TOOLSMITH_REMOTE_URL") {
            self.remote.url = Some(url);
        }
        if let Some(key) = get("TOOLSMITH_API_KEY") {
            self.remote.api_key = Some(key);
        }
        if let Some(rustc) = get("TOOLSMITH_RUSTC") {
            self.backend.rustc = rustc;
        }
    }

    /// The resolved home directory.
    pub fn home(&self) -> PathBuf {
        self.home
            .clone()
            .unwrap_or_else(|| default_home(&|key: &str| std::env::var(key).ok()))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.lock_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }

    /// The remote url, if one is configured.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    pub fn rustc_backend(&self) -> RustcBackend {
        RustcBackend::new(&self.backend.rustc, self.backend.opt_level.as_str())
    }
}

/// `$HOME/.toolsmith`, or `.toolsmith` in the working directory.
fn default_home<F>(env: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    env("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".toolsmith"))
        .unwrap_or_else(|| PathBuf::from(".toolsmith"))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use toolsmith_core::ErrorKind;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(None, Some(dir.path()), env_of(&[])).unwrap();
        assert_eq!(config.home.as_deref(), Some(dir.path()));
        assert_eq!(config.remote.timeout_ms, 3000);
        assert_eq!(config.cache.lock_timeout_ms, 120_000);
        assert_eq!(config.backend.rustc, "rustc");
        assert!(config.remote_url().is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [remote]
            url = "http://localhost:7878"
            "#,
        )
        .unwrap();
        assert_eq!(config.remote_url(), Some("http://localhost:7878"));
        assert_eq!(config.remote.timeout_ms, 3000);
        assert_eq!(config.backend.opt_level, "2");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("[remote]\nendpoint = \"x\"\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn home_config_file_is_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[backend]\nopt_level = \"0\"\n",
        )
        .unwrap();
        let home = dir.path().to_string_lossy().into_owned();
        let config = Config::load_with(None, None, env_of(&[("TOOLSMITH_HOME", &home)])).unwrap();
        assert_eq!(config.backend.opt_level, "0");
        assert_eq!(config.home(), dir.path());
    }

    #[test]
    fn env_overrides_file_and_flag_overrides_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "home = \"/from/file\"\n[remote]\nurl = \"http://file\"\napi_key = \"file-key\"\n",
        )
        .unwrap();
        let env = env_of(&[
            ("TOOLSMITH_CONFIG", path.to_str().unwrap()),
            ("TOOLSMITH_REMOTE_URL", "http://env"),
            ("TOOLSMITH_API_KEY", ""),
            ("TOOLSMITH_RUSTC", "/opt/rustc"),
        ]);

        let config = Config::load_with(None, None, &env).unwrap();
        assert_eq!(config.home(), PathBuf::from("/from/file"));
        assert_eq!(config.remote_url(), Some("http://env"));
        // empty env values do not clear file values
        assert_eq!(config.remote.api_key.as_deref(), Some("file-key"));
        assert_eq!(config.backend.rustc, "/opt/rustc");

        let flagged = Config::load_with(None, Some(Path::new("/from/flag")), &env).unwrap();
        assert_eq!(flagged.home(), PathBuf::from("/from/flag"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load_with(Some(Path::new("/nonexistent/toolsmith.toml")), None, env_of(&[]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
    }
}
