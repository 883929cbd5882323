//! Session model and in-memory store.
//!
//! A session is one tracked unit of agent work: spawn, code, open a PR, pass
//! CI, get reviewed, merge, clean up. Sessions live in process memory only;
//! reaching a terminal status moves them to a read-only archived collection
//! (a logical move, never deletion).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugin::{PrInfo, RuntimeHandle};

/// Session status. Closed set; the transition function is exhaustive over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Spawning,
    Working,
    PrOpen,
    CiFailed,
    ReviewPending,
    ChangesRequested,
    Approved,
    Mergeable,
    Merging,
    Merged,
    Killed,
    Stuck,
    Cleanup,
    Done,
    Terminated,
}

impl SessionStatus {
    /// Terminal statuses are archived and never polled again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Merged | Self::Killed | Self::Done | Self::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Working => "working",
            Self::PrOpen => "pr_open",
            Self::CiFailed => "ci_failed",
            Self::ReviewPending => "review_pending",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Mergeable => "mergeable",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Killed => "killed",
            Self::Stuck => "stuck",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked unit of agent work.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub branch: String,
    pub pr: Option<PrInfo>,
    pub issue_id: Option<String>,
    /// Opaque reference into the runtime plugin; owned by that plugin.
    pub runtime_handle: Option<RuntimeHandle>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Open extension bag for plugins and operators.
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, branch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            status: SessionStatus::Spawning,
            branch: branch.into(),
            pr: None,
            issue_id: None,
            runtime_handle: None,
            created_at: now,
            last_activity_at: now,
            metadata: BTreeMap::new(),
        }
    }
}

/// In-memory session table, partitioned into active and archived.
///
/// Mutated only by the reconciliation loop. Archived sessions are read-only
/// and excluded from polling.
#[derive(Debug, Default)]
pub struct SessionStore {
    active: HashMap<String, Session>,
    archived: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. Ids are unique process-wide, archived included.
    pub fn insert(&mut self, session: Session) -> Result<()> {
        let id = session.id.clone();
        if self.active.contains_key(&id) || self.archived.contains_key(&id) {
            bail!("session id '{id}' already exists");
        }
        self.active.insert(id, session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.active.get(id).or_else(|| self.archived.get(id))
    }

    /// Mutable access to an active session. Archived sessions are read-only.
    pub fn get_active_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.active.get_mut(id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn archived_len(&self) -> usize {
        self.archived.len()
    }

    /// Move a terminal session into the archive. No-op on unknown ids;
    /// refuses sessions that have not reached a terminal status.
    pub fn archive(&mut self, id: &str) -> Result<()> {
        let Some(session) = self.active.get(id) else {
            return Ok(());
        };
        if !session.status.is_terminal() {
            bail!(
                "refusing to archive session '{}' in non-terminal status {}",
                id,
                session.status
            );
        }
        let session = self.active.remove(id).expect("checked above");
        self.archived.insert(id.to_string(), session);
        Ok(())
    }

    pub fn is_archived(&self, id: &str) -> bool {
        self.archived.contains_key(id)
    }
}
