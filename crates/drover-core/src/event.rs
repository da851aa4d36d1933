//! Domain events announced to observers.
//!
//! An [`Event`] describes what changed; at most the relevant references are
//! populated. Events are immutable once built and are shared by reference
//! between subscribers.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::Status;

/// A change notification: some combination of build, repository and task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Build the change belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    /// Repository the change belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<Repo>,

    /// Task (dispatched work item) that changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

impl Event {
    /// Creates a task event.
    pub fn task(task: Task) -> Self {
        Self {
            task: Some(task),
            ..Default::default()
        }
    }

    /// Attaches a build.
    pub fn with_build(mut self, build: Build) -> Self {
        self.build = Some(build);
        self
    }

    /// Attaches a repository.
    pub fn with_repo(mut self, repo: Repo) -> Self {
        self.repo = Some(repo);
        self
    }
}

/// Build reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// Build number within the repository.
    pub number: i64,

    /// Build status.
    pub status: Status,

    /// Start time (Unix seconds).
    #[serde(default)]
    pub started: i64,

    /// Finish time (Unix seconds).
    #[serde(default)]
    pub finished: i64,
}

/// Repository reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Owner or namespace.
    pub owner: String,

    /// Repository name.
    pub name: String,
}

impl Repo {
    /// Parses `owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Returns `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Task reference: one work item as seen by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Work item id.
    pub id: String,

    /// Current status.
    pub status: Status,

    /// Endpoint the task runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Failing step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,

    /// Error message for infrastructure failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Start time (Unix seconds).
    #[serde(default)]
    pub started: i64,

    /// Finish time (Unix seconds).
    #[serde(default)]
    pub finished: i64,
}

impl Task {
    /// Creates a running task stamped with the current time.
    pub fn running(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Status::Running,
            endpoint: Some(endpoint.into()),
            failed_step: None,
            error: None,
            started: Utc::now().timestamp(),
            finished: 0,
        }
    }

    /// Marks the task finished with the given status.
    pub fn finish(mut self, status: Status) -> Self {
        self.status = status;
        self.finished = Utc::now().timestamp();
        self
    }
}
