//! Materialization status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a query materialization as seen by the orchestrator.
///
/// `Hit` and `Done` both mean the manifest exists; the object store, not the
/// in-memory registry, is authoritative for completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryStatus {
    /// The manifest already existed when the request was submitted.
    Hit,
    /// A materialization is in progress (here or on another node).
    Running,
    /// The materialization completed and the manifest was published.
    Done,
    /// The materialization failed; the error message is recorded.
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
