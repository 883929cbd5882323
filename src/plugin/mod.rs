//! Capability contracts for external collaborators.
//!
//! The core never talks to a concrete backend. Every external concern is a
//! trait here (runtime, SCM host, issue tracker, notifier, agent probe,
//! terminal multiplexer, workspace provisioning), implemented by swappable
//! adapters and resolved by name through an explicit [`PluginRegistry`]
//! constructed once at process start. Wire details (HTTP, CLI) belong to the
//! adapters, never to the core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Opaque reference to a live compute backend. Owned by the runtime plugin;
/// the core only stores and passes it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHandle(String);

impl RuntimeHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    None,
    Pending,
    Passing,
    Failing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    None,
    Pending,
    Approved,
    ChangesRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Draft,
    Closed,
    Merged,
}

/// PR correlation data as reported by the SCM host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
    pub state: PrState,
    pub ci_status: CiStatus,
    pub review_decision: ReviewDecision,
}

/// SCM-reported readiness for automated merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReadiness {
    pub mergeable: bool,
    pub ci_status: CiStatus,
    pub review_decision: ReviewDecision,
    /// Human-readable blockers (conflicts, missing approvals, failed checks).
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub cpu_percent: f64,
    pub memory_mb: u64,
}

/// A user-facing notification about a session.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyEvent {
    pub session_id: String,
    pub title: String,
    pub body: String,
}

/// An action an operator can take from a notification (adapter-rendered).
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyAction {
    pub label: String,
    pub command: String,
}

/// Compute backend hosting one agent per session.
pub trait Runtime: Send + Sync {
    fn create(&self, session_id: &str, project_id: &str) -> Result<RuntimeHandle>;
    fn destroy(&self, handle: &RuntimeHandle) -> Result<()>;
    fn is_alive(&self, handle: &RuntimeHandle) -> Result<bool>;
    /// Most recent `lines` of agent output.
    fn get_output(&self, handle: &RuntimeHandle, lines: usize) -> Result<String>;
    fn get_metrics(&self, handle: &RuntimeHandle) -> Result<RuntimeMetrics>;
    fn send_message(&self, handle: &RuntimeHandle, text: &str) -> Result<()>;
}

impl std::fmt::Debug for dyn Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Runtime")
    }
}

/// Source-control host: PR discovery, CI and review state, merge actions.
pub trait Scm: Send + Sync {
    fn detect_pr(&self, project_id: &str, branch: &str) -> Result<Option<PrInfo>>;
    fn pr_state(&self, project_id: &str, number: u64) -> Result<PrState>;
    fn ci_summary(&self, project_id: &str, number: u64) -> Result<CiStatus>;
    fn review_decision(&self, project_id: &str, number: u64) -> Result<ReviewDecision>;
    fn mergeability(&self, project_id: &str, number: u64) -> Result<MergeReadiness>;
    fn merge_pr(&self, project_id: &str, number: u64) -> Result<()>;
    fn close_pr(&self, project_id: &str, number: u64) -> Result<()>;
}

/// Issue tracker the sessions report against.
pub trait Tracker: Send + Sync {
    fn get_issue(&self, project_id: &str, issue_id: &str) -> Result<Issue>;
    fn is_completed(&self, project_id: &str, issue_id: &str) -> Result<bool>;
    fn list_issues(&self, project_id: &str) -> Result<Vec<Issue>>;
    fn update_issue(&self, project_id: &str, issue: &Issue) -> Result<()>;
    fn create_issue(&self, project_id: &str, title: &str, body: &str) -> Result<Issue>;
}

/// Outbound operator notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotifyEvent) -> Result<()>;
    fn notify_with_actions(&self, event: &NotifyEvent, actions: &[NotifyAction]) -> Result<()>;
}

/// Agent-specific liveness/activity probing beyond raw runtime output.
pub trait Agent: Send + Sync {
    fn is_active(&self, handle: &RuntimeHandle) -> Result<bool>;
}

/// Terminal session multiplexing for operator attach/inspection.
pub trait Terminal: Send + Sync {
    fn open(&self, session_id: &str, command: &str) -> Result<()>;
    fn capture(&self, session_id: &str, lines: usize) -> Result<String>;
    fn kill(&self, session_id: &str) -> Result<()>;
}

/// Isolated working-copy provisioning for a session.
pub trait Workspace: Send + Sync {
    fn provision(&self, project_id: &str, session_id: &str) -> Result<PathBuf>;
    fn teardown(&self, project_id: &str, session_id: &str) -> Result<()>;
}

/// Contract errors: a capability name that nothing registered under.
/// These indicate a setup bug and are never recovered at runtime.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no {capability} plugin registered under name '{name}'")]
    Missing { capability: &'static str, name: String },
}

/// Plugin names a project binds to, one per capability the loop polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginBinding {
    pub runtime: String,
    pub scm: String,
    pub tracker: String,
    pub notifier: String,
}

/// The resolved plugin set for one project.
#[derive(Clone)]
pub struct PluginSet {
    pub runtime: Arc<dyn Runtime>,
    pub scm: Arc<dyn Scm>,
    pub tracker: Arc<dyn Tracker>,
    pub notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet").finish_non_exhaustive()
    }
}

/// Name-to-implementation lookup per capability.
///
/// An explicit value, constructed once in `main` and passed by reference to
/// whatever needs capability lookup. There is deliberately no process-wide
/// registry singleton.
#[derive(Default)]
pub struct PluginRegistry {
    runtimes: HashMap<String, Arc<dyn Runtime>>,
    scms: HashMap<String, Arc<dyn Scm>>,
    trackers: HashMap<String, Arc<dyn Tracker>>,
    notifiers: HashMap<String, Arc<dyn Notifier>>,
    agents: HashMap<String, Arc<dyn Agent>>,
    terminals: HashMap<String, Arc<dyn Terminal>>,
    workspaces: HashMap<String, Arc<dyn Workspace>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_runtime(&mut self, name: impl Into<String>, plugin: Arc<dyn Runtime>) {
        self.runtimes.insert(name.into(), plugin);
    }

    pub fn register_scm(&mut self, name: impl Into<String>, plugin: Arc<dyn Scm>) {
        self.scms.insert(name.into(), plugin);
    }

    pub fn register_tracker(&mut self, name: impl Into<String>, plugin: Arc<dyn Tracker>) {
        self.trackers.insert(name.into(), plugin);
    }

    pub fn register_notifier(&mut self, name: impl Into<String>, plugin: Arc<dyn Notifier>) {
        self.notifiers.insert(name.into(), plugin);
    }

    pub fn register_agent(&mut self, name: impl Into<String>, plugin: Arc<dyn Agent>) {
        self.agents.insert(name.into(), plugin);
    }

    pub fn register_terminal(&mut self, name: impl Into<String>, plugin: Arc<dyn Terminal>) {
        self.terminals.insert(name.into(), plugin);
    }

    pub fn register_workspace(&mut self, name: impl Into<String>, plugin: Arc<dyn Workspace>) {
        self.workspaces.insert(name.into(), plugin);
    }

    pub fn runtime(&self, name: &str) -> Result<Arc<dyn Runtime>, PluginError> {
        self.runtimes.get(name).cloned().ok_or(PluginError::Missing {
            capability: "runtime",
            name: name.to_string(),
        })
    }

    pub fn scm(&self, name: &str) -> Result<Arc<dyn Scm>, PluginError> {
        self.scms.get(name).cloned().ok_or(PluginError::Missing {
            capability: "scm",
            name: name.to_string(),
        })
    }

    pub fn tracker(&self, name: &str) -> Result<Arc<dyn Tracker>, PluginError> {
        self.trackers.get(name).cloned().ok_or(PluginError::Missing {
            capability: "tracker",
            name: name.to_string(),
        })
    }

    pub fn notifier(&self, name: &str) -> Result<Arc<dyn Notifier>, PluginError> {
        self.notifiers.get(name).cloned().ok_or(PluginError::Missing {
            capability: "notifier",
            name: name.to_string(),
        })
    }

    pub fn agent(&self, name: &str) -> Result<Arc<dyn Agent>, PluginError> {
        self.agents.get(name).cloned().ok_or(PluginError::Missing {
            capability: "agent",
            name: name.to_string(),
        })
    }

    pub fn terminal(&self, name: &str) -> Result<Arc<dyn Terminal>, PluginError> {
        self.terminals.get(name).cloned().ok_or(PluginError::Missing {
            capability: "terminal",
            name: name.to_string(),
        })
    }

    pub fn workspace(&self, name: &str) -> Result<Arc<dyn Workspace>, PluginError> {
        self.workspaces.get(name).cloned().ok_or(PluginError::Missing {
            capability: "workspace",
            name: name.to_string(),
        })
    }

    /// Resolve a project's binding into a concrete plugin set.
    pub fn bind(&self, binding: &PluginBinding) -> Result<PluginSet, PluginError> {
        Ok(PluginSet {
            runtime: self.runtime(&binding.runtime)?,
            scm: self.scm(&binding.scm)?,
            tracker: self.tracker(&binding.tracker)?,
            notifier: self.notifier(&binding.notifier)?,
        })
    }
}

/// Built-in notifier that emits through the process log stream.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotifyEvent) -> Result<()> {
        info!(session = %event.session_id, title = %event.title, "{}", event.body);
        Ok(())
    }

    fn notify_with_actions(&self, event: &NotifyEvent, actions: &[NotifyAction]) -> Result<()> {
        let labels: Vec<&str> = actions.iter().map(|a| a.label.as_str()).collect();
        info!(
            session = %event.session_id,
            title = %event.title,
            actions = ?labels,
            "{}",
            event.body
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubNotifier;

    impl Notifier for StubNotifier {
        fn notify(&self, _event: &NotifyEvent) -> Result<()> {
            Ok(())
        }

        fn notify_with_actions(&self, _event: &NotifyEvent, _actions: &[NotifyAction]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_returns_registered_plugin() {
        let mut registry = PluginRegistry::new();
        registry.register_notifier("log", Arc::new(LogNotifier));
        assert!(registry.notifier("log").is_ok());
    }

    #[test]
    fn missing_plugin_names_capability_and_name() {
        let registry = PluginRegistry::new();
        let err = registry.runtime("cloud").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no runtime plugin registered under name 'cloud'"
        );
    }

    #[test]
    fn bind_fails_on_first_missing_capability() {
        let mut registry = PluginRegistry::new();
        registry.register_notifier("log", Arc::new(StubNotifier));
        let binding = PluginBinding {
            runtime: "local".to_string(),
            scm: "github".to_string(),
            tracker: "github".to_string(),
            notifier: "log".to_string(),
        };
        let err = registry.bind(&binding).unwrap_err().to_string();
        assert!(err.contains("runtime"));
        assert!(err.contains("local"));
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut registry = PluginRegistry::new();
        registry.register_notifier("log", Arc::new(StubNotifier));
        registry.register_notifier("log", Arc::new(LogNotifier));
        // Replacement is silent; last registration wins.
        assert!(registry.notifier("log").is_ok());
    }
}
