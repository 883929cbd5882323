use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detector::DetectorConfig;
use crate::plugin::PluginBinding;
use crate::reconciler::ReconcilerConfig;
use crate::steward::MergeMethod;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".drover";

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_poll_timeout_secs() -> u64 {
    20
}

fn default_tick_budget_secs() -> u64 {
    60
}

fn default_max_workers() -> usize {
    4
}

fn default_max_consecutive_same_status() -> usize {
    5
}

fn default_max_cycle_repetitions() -> usize {
    3
}

fn default_max_history_size() -> usize {
    64
}

fn default_runtime_plugin() -> String {
    "local".to_string()
}

fn default_scm_plugin() -> String {
    "github".to_string()
}

fn default_tracker_plugin() -> String {
    "github".to_string()
}

fn default_notifier_plugin() -> String {
    "log".to_string()
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_test_command() -> String {
    "cargo test".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_tick_budget_secs")]
    pub tick_budget_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            tick_budget_secs: default_tick_budget_secs(),
            max_workers: default_max_workers(),
        }
    }
}

impl ReconcilerSettings {
    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            tick_budget: Duration::from_secs(self.tick_budget_secs),
            max_workers: self.max_workers,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectorSettings {
    #[serde(default = "default_max_consecutive_same_status")]
    pub max_consecutive_same_status: usize,
    #[serde(default = "default_max_cycle_repetitions")]
    pub max_cycle_repetitions: usize,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            max_consecutive_same_status: default_max_consecutive_same_status(),
            max_cycle_repetitions: default_max_cycle_repetitions(),
            max_history_size: default_max_history_size(),
        }
    }
}

impl DetectorSettings {
    pub fn to_detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            max_consecutive_same_status: self.max_consecutive_same_status,
            max_cycle_repetitions: self.max_cycle_repetitions,
            max_history_size: self.max_history_size,
        }
    }
}

/// Default plugin names per capability; projects may override per field.
#[derive(Debug, Deserialize)]
pub struct PluginDefaults {
    #[serde(default = "default_runtime_plugin")]
    pub runtime: String,
    #[serde(default = "default_scm_plugin")]
    pub scm: String,
    #[serde(default = "default_tracker_plugin")]
    pub tracker: String,
    #[serde(default = "default_notifier_plugin")]
    pub notifier: String,
}

impl Default for PluginDefaults {
    fn default() -> Self {
        Self {
            runtime: default_runtime_plugin(),
            scm: default_scm_plugin(),
            tracker: default_tracker_plugin(),
            notifier: default_notifier_plugin(),
        }
    }
}

/// One supervised project.
///
/// ```toml
/// [projects.parser]
/// repo_path = "/work/parser"
/// target_branch = "main"
/// test_command = "cargo test --workspace"
/// merge_method = "squash"
/// notifier = "log"
/// ```
#[derive(Debug, Deserialize)]
pub struct ProjectSettings {
    pub repo_path: PathBuf,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default = "default_test_command")]
    pub test_command: String,
    #[serde(default)]
    pub merge_method: MergeMethod,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub scm: Option<String>,
    #[serde(default)]
    pub tracker: Option<String>,
    #[serde(default)]
    pub notifier: Option<String>,
}

impl ProjectSettings {
    /// Effective plugin binding: the project's overrides over the defaults.
    pub fn binding(&self, defaults: &PluginDefaults) -> PluginBinding {
        PluginBinding {
            runtime: self.runtime.clone().unwrap_or_else(|| defaults.runtime.clone()),
            scm: self.scm.clone().unwrap_or_else(|| defaults.scm.clone()),
            tracker: self.tracker.clone().unwrap_or_else(|| defaults.tracker.clone()),
            notifier: self.notifier.clone().unwrap_or_else(|| defaults.notifier.clone()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub plugins: PluginDefaults,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSettings>,
}

impl Config {
    /// Search upward from `start` for a `.drover/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((Config::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.reconciler.poll_interval_secs, 15);
        assert_eq!(config.reconciler.poll_timeout_secs, 20);
        assert_eq!(config.reconciler.tick_budget_secs, 60);
        assert_eq!(config.reconciler.max_workers, 4);
        assert_eq!(config.detector.max_consecutive_same_status, 5);
        assert_eq!(config.detector.max_cycle_repetitions, 3);
        assert_eq!(config.detector.max_history_size, 64);
        assert_eq!(config.plugins.runtime, "local");
        assert_eq!(config.plugins.scm, "github");
        assert_eq!(config.plugins.tracker, "github");
        assert_eq!(config.plugins.notifier, "log");
        assert!(config.projects.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[reconciler]
poll_interval_secs = 30
poll_timeout_secs = 10
tick_budget_secs = 120
max_workers = 8

[detector]
max_consecutive_same_status = 4
max_cycle_repetitions = 2
max_history_size = 128

[plugins]
runtime = "cloud"
scm = "gitlab"
tracker = "jira"
notifier = "chat"

[projects.parser]
repo_path = "/work/parser"
target_branch = "develop"
test_command = "cargo test --workspace"
merge_method = "fast-forward"
notifier = "log"

[projects.indexer]
repo_path = "/work/indexer"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.reconciler.poll_interval_secs, 30);
        assert_eq!(config.reconciler.max_workers, 8);
        assert_eq!(config.detector.max_cycle_repetitions, 2);
        assert_eq!(config.plugins.runtime, "cloud");

        let parser = &config.projects["parser"];
        assert_eq!(parser.target_branch, "develop");
        assert_eq!(parser.merge_method, MergeMethod::FastForward);

        let binding = parser.binding(&config.plugins);
        assert_eq!(binding.runtime, "cloud");
        assert_eq!(binding.notifier, "log");

        let indexer = &config.projects["indexer"];
        assert_eq!(indexer.target_branch, "main");
        assert_eq!(indexer.test_command, "cargo test");
        assert_eq!(indexer.merge_method, MergeMethod::Squash);
        assert_eq!(indexer.binding(&config.plugins).notifier, "chat");
    }

    #[test]
    fn settings_convert_to_component_configs() {
        let config = Config::default();
        let reconciler = config.reconciler.to_reconciler_config();
        assert_eq!(reconciler.poll_interval, Duration::from_secs(15));
        assert_eq!(reconciler.max_workers, 4);

        let detector = config.detector.to_detector_config();
        assert_eq!(detector.max_consecutive_same_status, 5);
        assert_eq!(detector.max_history_size, 64);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = Config::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.reconciler.poll_interval_secs, 15);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join(CONFIG_FILENAME),
            "[reconciler]\npoll_interval_secs = 7\n",
        )
        .unwrap();

        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = Config::load(&nested).unwrap();
        assert_eq!(config.reconciler.poll_interval_secs, 7);
        assert!(path.unwrap().ends_with(".drover/config.toml"));
    }

    #[test]
    fn parse_rejects_malformed_config() {
        let err = toml::from_str::<Config>("[projects.broken]\ntarget_branch = 5\n")
            .unwrap_err()
            .to_string();
        assert!(!err.is_empty());
    }
}
