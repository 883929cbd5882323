//! Isolated test-then-merge for session branches.
//!
//! A merge candidate is never tested in the operator's checkout. The steward
//! fetches the remote, adds a disposable git worktree pinned to the source
//! branch, runs the project's test command there, merges into the target by
//! the configured method and pushes, then removes the worktree. Removal is
//! attempted exactly once per invocation, on every exit path; a cleanup
//! failure never masks the protocol error.
//!
//! All subprocess execution goes through an injected [`CommandRunner`] so
//! the protocol is testable without real processes.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Subprocess execution port. The steward never shells out directly.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandResult>;
}

/// Process-backed runner. Kills the child when the timeout elapses.
#[derive(Debug, Default, Clone)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let mut child = Command::new(program)
            .current_dir(cwd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run command '{}' in {}", program, cwd.display()))?;

        // Drain pipes on their own threads so a chatty child cannot block
        // on a full pipe buffer while we poll for exit.
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf);
            buf
        });
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf);
            buf
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().with_context(|| {
                format!("failed to wait for command '{}' in {}", program, cwd.display())
            })? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "command '{}' timed out after {}s",
                    program,
                    timeout.as_secs()
                );
            }
            std::thread::sleep(Duration::from_millis(25));
        };

        Ok(CommandResult {
            status_success: status.success(),
            stdout: stdout_thread.join().unwrap_or_default(),
            stderr: stderr_thread.join().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMethod {
    #[default]
    Squash,
    MergeCommit,
    FastForward,
}

#[derive(Debug, Clone)]
pub struct MergeParams {
    pub repo_path: PathBuf,
    pub source_branch: String,
    pub target_branch: String,
    pub test_command: String,
    pub merge_method: MergeMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: bool,
}

/// Disposable worktree location for one invocation. Never escapes
/// `test_then_merge`.
#[derive(Debug)]
struct WorktreeHandle {
    temp_dir: PathBuf,
}

impl WorktreeHandle {
    fn allocate() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join(format!("drover-merge-{}", Uuid::new_v4())),
        }
    }
}

/// Performs the isolated test-then-merge protocol.
pub struct MergeSteward<R: CommandRunner = ShellCommandRunner> {
    runner: R,
    step_timeout: Duration,
}

impl Default for MergeSteward {
    fn default() -> Self {
        Self::new(ShellCommandRunner)
    }
}

impl<R: CommandRunner> MergeSteward<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            step_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run the full protocol: fetch, disposable worktree, tests, merge,
    /// push. The first error aborts the remaining steps and propagates to
    /// the caller unchanged, after the worktree removal has been attempted.
    pub fn test_then_merge(&self, params: &MergeParams) -> Result<MergeOutcome> {
        let worktree = WorktreeHandle::allocate();
        debug!(
            source = %params.source_branch,
            target = %params.target_branch,
            worktree = %worktree.temp_dir.display(),
            "starting test-then-merge"
        );

        let protocol = self.run_protocol(params, &worktree);

        if let Err(e) = self.remove_worktree(params, &worktree) {
            warn!(
                error = %e,
                worktree = %worktree.temp_dir.display(),
                "worktree removal failed"
            );
        }

        protocol?;
        Ok(MergeOutcome { merged: true })
    }

    fn run_protocol(&self, params: &MergeParams, worktree: &WorktreeHandle) -> Result<()> {
        let worktree_path = worktree.temp_dir.to_string_lossy().to_string();

        self.git(&params.repo_path, &["fetch", "origin"])?;
        self.git(
            &params.repo_path,
            &[
                "worktree",
                "add",
                "--detach",
                worktree_path.as_str(),
                params.source_branch.as_str(),
            ],
        )?;

        // Test gate before any merge, inside the disposable worktree.
        let tests = self.runner.run(
            "sh",
            &["-lc".to_string(), params.test_command.clone()],
            &worktree.temp_dir,
            self.step_timeout,
        )?;
        if !tests.status_success {
            bail!(
                "test command failed for branch '{}': {}",
                params.source_branch,
                failure_detail(&tests)
            );
        }

        let onto = format!("origin/{}", params.target_branch);
        self.git(&worktree.temp_dir, &["checkout", "--detach", onto.as_str()])?;

        let message = format!(
            "merge {} into {}",
            params.source_branch, params.target_branch
        );
        match params.merge_method {
            MergeMethod::Squash => {
                self.git(
                    &worktree.temp_dir,
                    &["merge", "--squash", params.source_branch.as_str()],
                )?;
                self.git(&worktree.temp_dir, &["commit", "-m", message.as_str()])?;
            }
            MergeMethod::MergeCommit => {
                self.git(
                    &worktree.temp_dir,
                    &[
                        "merge",
                        "--no-ff",
                        params.source_branch.as_str(),
                        "-m",
                        message.as_str(),
                    ],
                )?;
            }
            MergeMethod::FastForward => {
                self.git(
                    &worktree.temp_dir,
                    &["merge", "--ff-only", params.source_branch.as_str()],
                )?;
            }
        }

        let refspec = format!("HEAD:{}", params.target_branch);
        self.git(&worktree.temp_dir, &["push", "origin", refspec.as_str()])?;

        Ok(())
    }

    fn remove_worktree(&self, params: &MergeParams, worktree: &WorktreeHandle) -> Result<()> {
        let worktree_path = worktree.temp_dir.to_string_lossy().to_string();
        self.git(
            &params.repo_path,
            &["worktree", "remove", "--force", worktree_path.as_str()],
        )
        .map(|_| ())
    }

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<CommandResult> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.runner.run("git", &args, cwd, self.step_timeout)?;
        if !output.status_success {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                failure_detail(&output)
            );
        }
        Ok(output)
    }
}

fn failure_detail(output: &CommandResult) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}
