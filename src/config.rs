//! Run-scoped configuration snapshot.
//!
//! Settings are merged once per run, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. `<config_dir>/boxpm/config.json`
//! 3. `<project>/.boxpmrc.json`
//! 4. `BOXPM_REGISTRY`, `BOXPM_TOKEN`, `BOXPM_CONCURRENCY`
//!
//! The result is immutable and shared through an `Arc`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use crate::http::RetryPolicy;
use crate::runtime::Runtime;

pub const DEFAULT_REGISTRY: &str = "https://registry.boxpm.dev";
pub const MODULES_DIR: &str = "modules";
pub const PROJECT_CONFIG_FILE: &str = ".boxpmrc.json";
pub const DEFAULT_ENGINE: &str = "boxlang";
const DEFAULT_CONCURRENCY: usize = 8;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub registry_url: String,
    pub token: Option<String>,
    pub fetch_concurrency: usize,
    pub install_concurrency: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// A failing hook fails the operation instead of warning.
    pub hooks_fatal: bool,
    pub ignore_scripts: bool,
    /// Install local-path dependencies as symlinks instead of copies.
    pub link_local_paths: bool,
    /// Key of the host runtime in a package's `engines` block.
    pub engine_name: String,
    /// Version of the host runtime, checked against `engines`.
    pub engine_version: Option<semver::Version>,
    pub modules_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY.to_string(),
            token: None,
            fetch_concurrency: DEFAULT_CONCURRENCY,
            install_concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            hooks_fatal: false,
            ignore_scripts: false,
            link_local_paths: false,
            engine_name: DEFAULT_ENGINE.to_string(),
            engine_version: None,
            modules_dir: MODULES_DIR.to_string(),
        }
    }
}

/// On-disk form; every field is optional so files can be layered.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SettingsFile {
    registry: Option<String>,
    token: Option<String>,
    fetch_concurrency: Option<usize>,
    install_concurrency: Option<usize>,
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    hooks_fatal: Option<bool>,
    ignore_scripts: Option<bool>,
    link_local_paths: Option<bool>,
    engine: Option<String>,
    engine_version: Option<String>,
}

impl Settings {
    /// Merge every configuration layer for the project at `project_dir`.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime + ?Sized>(runtime: &R, project_dir: &Path) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(config_dir) = runtime.config_dir() {
            settings.merge_file(runtime, &config_dir.join("boxpm").join("config.json"))?;
        }
        settings.merge_file(runtime, &project_dir.join(PROJECT_CONFIG_FILE))?;
        settings.merge_env(runtime)?;

        debug!(
            "Settings: registry={} fetch_concurrency={} install_concurrency={}",
            settings.registry_url, settings.fetch_concurrency, settings.install_concurrency
        );
        Ok(settings)
    }

    fn merge_file<R: Runtime + ?Sized>(&mut self, runtime: &R, path: &Path) -> Result<()> {
        if !runtime.exists(path) {
            return Ok(());
        }
        debug!("Loading settings from {:?}", path);
        let content = runtime.read_to_string(path)?;
        let file: SettingsFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {:?}", path))?;
        self.apply(file)
            .with_context(|| format!("Invalid settings in {:?}", path))
    }

    fn apply(&mut self, file: SettingsFile) -> Result<()> {
        if let Some(registry) = file.registry {
            self.registry_url = registry.trim_end_matches('/').to_string();
        }
        if let Some(token) = file.token {
            self.token = Some(token);
        }
        if let Some(n) = file.fetch_concurrency {
            self.fetch_concurrency = n.max(1);
        }
        if let Some(n) = file.install_concurrency {
            self.install_concurrency = n.max(1);
        }
        if let Some(n) = file.retries {
            self.retry.attempts = n.max(1);
        }
        if let Some(ms) = file.retry_delay_ms {
            self.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = file.timeout_secs {
            self.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(flag) = file.hooks_fatal {
            self.hooks_fatal = flag;
        }
        if let Some(flag) = file.ignore_scripts {
            self.ignore_scripts = flag;
        }
        if let Some(flag) = file.link_local_paths {
            self.link_local_paths = flag;
        }
        if let Some(engine) = file.engine {
            self.engine_name = engine;
        }
        if let Some(version) = file.engine_version {
            let version = semver::Version::parse(version.trim_start_matches('v'))
                .with_context(|| format!("Invalid engineVersion '{}'", version))?;
            self.engine_version = Some(version);
        }
        Ok(())
    }

    fn merge_env<R: Runtime + ?Sized>(&mut self, runtime: &R) -> Result<()> {
        if let Ok(registry) = runtime.env_var("BOXPM_REGISTRY") {
            self.registry_url = registry.trim_end_matches('/').to_string();
        }
        if let Ok(token) = runtime.env_var("BOXPM_TOKEN")
            && !token.is_empty()
        {
            debug!("Using BOXPM_TOKEN for authentication: {}", mask(&token));
            self.token = Some(token);
        }
        if let Ok(concurrency) = runtime.env_var("BOXPM_CONCURRENCY") {
            let n: usize = concurrency
                .trim()
                .parse()
                .with_context(|| format!("Invalid BOXPM_CONCURRENCY '{}'", concurrency))?;
            self.fetch_concurrency = n.max(1);
            self.install_concurrency = n.max(1);
        }
        Ok(())
    }
}

fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}*********{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use mockall::predicate::eq;
    use std::env::VarError;
    use std::path::PathBuf;

    fn runtime_with_env(vars: &'static [(&'static str, &'static str)]) -> MockRuntime {
        let mut runtime = MockRuntime::new();
        runtime.expect_env_var().returning(move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .ok_or(VarError::NotPresent)
        });
        runtime
    }

    #[test]
    fn test_defaults_without_any_layer() {
        let mut runtime = runtime_with_env(&[]);
        runtime.expect_config_dir().returning(|| None);
        runtime.expect_exists().returning(|_| false);

        let settings = Settings::load(&runtime, Path::new("/proj")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.registry_url, DEFAULT_REGISTRY);
    }

    #[test]
    fn test_project_file_overrides_user_file_and_env_overrides_both() {
        let mut runtime = runtime_with_env(&[
            ("BOXPM_TOKEN", "env-token-123456"),
            ("BOXPM_CONCURRENCY", "3"),
        ]);
        runtime
            .expect_config_dir()
            .returning(|| Some(PathBuf::from("/home/u/.config")));
        runtime.expect_exists().returning(|_| true);
        runtime
            .expect_read_to_string()
            .with(eq(PathBuf::from("/home/u/.config/boxpm/config.json")))
            .returning(|_| {
                Ok(r#"{"registry": "https://user.example/", "token": "user", "hooksFatal": true}"#
                    .into())
            });
        runtime
            .expect_read_to_string()
            .with(eq(PathBuf::from("/proj/.boxpmrc.json")))
            .returning(|_| {
                Ok(r#"{"registry": "https://project.example", "engineVersion": "v5.1.0"}"#.into())
            });

        let settings = Settings::load(&runtime, Path::new("/proj")).unwrap();
        assert_eq!(settings.registry_url, "https://project.example");
        assert_eq!(settings.token.as_deref(), Some("env-token-123456"));
        assert!(settings.hooks_fatal);
        assert_eq!(settings.fetch_concurrency, 3);
        assert_eq!(settings.install_concurrency, 3);
        assert_eq!(settings.engine_version, Some(semver::Version::new(5, 1, 0)));
    }

    #[test]
    fn test_registry_env_strips_trailing_slash() {
        let mut runtime = runtime_with_env(&[("BOXPM_REGISTRY", "http://localhost:8080/")]);
        runtime.expect_config_dir().returning(|| None);
        runtime.expect_exists().returning(|_| false);

        let settings = Settings::load(&runtime, Path::new("/proj")).unwrap();
        assert_eq!(settings.registry_url, "http://localhost:8080");
    }

    #[test]
    fn test_invalid_concurrency_is_an_error() {
        let mut runtime = runtime_with_env(&[("BOXPM_CONCURRENCY", "many")]);
        runtime.expect_config_dir().returning(|| None);
        runtime.expect_exists().returning(|_| false);

        let err = Settings::load(&runtime, Path::new("/proj")).unwrap_err();
        assert!(err.to_string().contains("BOXPM_CONCURRENCY"));
    }

    #[test]
    fn test_invalid_settings_file_is_an_error() {
        let mut runtime = runtime_with_env(&[]);
        runtime.expect_config_dir().returning(|| None);
        runtime.expect_exists().returning(|_| true);
        runtime
            .expect_read_to_string()
            .returning(|_| Ok("not json".into()));

        let err = Settings::load(&runtime, Path::new("/proj")).unwrap_err();
        assert!(err.to_string().contains("Failed to parse settings file"));
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("abc"), "***");
        assert_eq!(mask("abcdefghijkl"), "abcd*********kl");
    }
}
