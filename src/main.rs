mod cli;
mod config;
mod detector;
mod plugin;
mod reconciler;
mod session;
mod steward;
mod transition;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use config::Config;
use detector::CycleDetector;
use plugin::{LogNotifier, PluginRegistry};
use reconciler::{ProjectContext, Reconciler};
use steward::{MergeMethod, MergeSteward};

#[derive(Debug, PartialEq, Eq)]
struct SessionSpec {
    project: String,
    branch: Option<String>,
    issue: Option<String>,
}

fn parse_session_spec(raw: &str) -> Result<SessionSpec> {
    let mut parts = raw.splitn(3, ':');
    let project = parts.next().unwrap_or_default().trim();
    if project.is_empty() {
        bail!("invalid --session '{raw}': expected PROJECT:BRANCH[:ISSUE]");
    }
    let branch = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let issue = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    Ok(SessionSpec {
        project: project.to_string(),
        branch,
        issue,
    })
}

/// The process-wide registry, built once and passed by reference. Backend
/// adapters register here; the log notifier is always available.
fn build_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register_notifier("log", Arc::new(LogNotifier));
    registry
}

fn build_projects(config: &Config, registry: &PluginRegistry) -> Result<Vec<ProjectContext>> {
    let mut projects = Vec::new();
    for (id, settings) in &config.projects {
        let binding = settings.binding(&config.plugins);
        let plugins = registry
            .bind(&binding)
            .with_context(|| format!("failed to bind plugins for project '{id}'"))?;
        projects.push(ProjectContext {
            id: id.clone(),
            repo_path: settings.repo_path.clone(),
            target_branch: settings.target_branch.clone(),
            test_command: settings.test_command.clone(),
            merge_method: settings.merge_method,
            plugins,
        });
    }
    Ok(projects)
}

fn method_label(method: MergeMethod) -> &'static str {
    match method {
        MergeMethod::Squash => "squash",
        MergeMethod::MergeCommit => "merge-commit",
        MergeMethod::FastForward => "fast-forward",
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults — no .drover/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<28} {value}\n"));
}

fn render_config_human(config: &Config, config_path: Option<&Path>) -> String {
    let mut output = String::new();

    output.push_str("Reconciler\n");
    push_kv(&mut output, "poll_interval", format!("{}s", config.reconciler.poll_interval_secs));
    push_kv(&mut output, "poll_timeout", format!("{}s", config.reconciler.poll_timeout_secs));
    push_kv(&mut output, "tick_budget", format!("{}s", config.reconciler.tick_budget_secs));
    push_kv(&mut output, "max_workers", config.reconciler.max_workers);
    output.push('\n');

    output.push_str("Detector\n");
    push_kv(
        &mut output,
        "max_consecutive_same_status",
        config.detector.max_consecutive_same_status,
    );
    push_kv(
        &mut output,
        "max_cycle_repetitions",
        config.detector.max_cycle_repetitions,
    );
    push_kv(&mut output, "max_history_size", config.detector.max_history_size);
    output.push('\n');

    output.push_str("Plugin Defaults\n");
    push_kv(&mut output, "runtime", &config.plugins.runtime);
    push_kv(&mut output, "scm", &config.plugins.scm);
    push_kv(&mut output, "tracker", &config.plugins.tracker);
    push_kv(&mut output, "notifier", &config.plugins.notifier);
    output.push('\n');

    output.push_str("Projects\n");
    if config.projects.is_empty() {
        output.push_str("  (none configured)\n");
    }
    for (id, project) in &config.projects {
        output.push_str(&format!("  {id}\n"));
        push_kv(&mut output, "  repo_path", project.repo_path.display());
        push_kv(&mut output, "  target_branch", &project.target_branch);
        push_kv(&mut output, "  test_command", &project.test_command);
        push_kv(&mut output, "  merge_method", method_label(project.merge_method));
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "config", config_source_label(config_path));

    output
}

fn render_config_json(config: &Config, config_path: Option<&Path>) -> Result<String> {
    let projects: serde_json::Map<String, serde_json::Value> = config
        .projects
        .iter()
        .map(|(id, project)| {
            let binding = project.binding(&config.plugins);
            (
                id.clone(),
                serde_json::json!({
                    "repo_path": project.repo_path.display().to_string(),
                    "target_branch": project.target_branch,
                    "test_command": project.test_command,
                    "merge_method": method_label(project.merge_method),
                    "plugins": {
                        "runtime": binding.runtime,
                        "scm": binding.scm,
                        "tracker": binding.tracker,
                        "notifier": binding.notifier,
                    },
                }),
            )
        })
        .collect();

    let payload = serde_json::json!({
        "reconciler": {
            "poll_interval_secs": config.reconciler.poll_interval_secs,
            "poll_timeout_secs": config.reconciler.poll_timeout_secs,
            "tick_budget_secs": config.reconciler.tick_budget_secs,
            "max_workers": config.reconciler.max_workers,
        },
        "detector": {
            "max_consecutive_same_status": config.detector.max_consecutive_same_status,
            "max_cycle_repetitions": config.detector.max_cycle_repetitions,
            "max_history_size": config.detector.max_history_size,
        },
        "plugins": {
            "runtime": config.plugins.runtime,
            "scm": config.plugins.scm,
            "tracker": config.plugins.tracker,
            "notifier": config.plugins.notifier,
        },
        "projects": projects,
        "source_path": config_source_label(config_path),
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "drover=warn",
        0 => "drover=info",
        1 => "drover=debug",
        _ => "drover=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = Config::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .drover/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            sessions,
            interval,
            workers,
        } => {
            if config.projects.is_empty() {
                bail!("no projects configured; add [projects.<id>] to .drover/config.toml");
            }

            let registry = build_registry();
            let projects = build_projects(&config, &registry)?;

            let mut reconciler_config = config.reconciler.to_reconciler_config();
            if let Some(secs) = interval {
                reconciler_config.poll_interval = Duration::from_secs(secs);
            }
            if let Some(count) = workers {
                reconciler_config.max_workers = count.max(1);
            }

            let reconciler = Reconciler::new(
                reconciler_config,
                projects,
                CycleDetector::new(config.detector.to_detector_config()),
                MergeSteward::default(),
            );

            for raw in &sessions {
                let spec = parse_session_spec(raw)?;
                let id = reconciler.spawn_session(&spec.project, None, spec.branch, spec.issue)?;
                info!(session = %id, "session spawned from command line");
            }

            let stop = Arc::new(AtomicBool::new(false));
            let stop_for_handler = stop.clone();
            ctrlc::set_handler(move || {
                stop_for_handler.store(true, Ordering::Relaxed);
            })
            .context("failed to install Ctrl-C handler")?;

            reconciler.run(&stop);
        }
        Command::Config { json } => {
            let rendered = if json {
                render_config_json(&config, config_path.as_deref())?
            } else {
                render_config_human(&config, config_path.as_deref())
            };
            println!("{rendered}");
        }
    }

    Ok(())
}
