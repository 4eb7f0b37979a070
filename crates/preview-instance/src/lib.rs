use std::fmt;

use chrono::{DateTime, Utc};

/// Pull request number. Keys the instance registry and names the on-disk site directory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PrNumber(pub u64);

impl fmt::Display for PrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive fields of a pull request that a preview is built from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PrDetails {
    pub number: PrNumber,
    /// `owner/name` of the repository the head branch lives in (may be a fork).
    pub source_repo: String,
    pub branch: String,
    /// Owner of the repository the PR targets; comments are posted there.
    pub target_owner: String,
    pub target_repo: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// No site directory, no server.
    Absent,
    /// Site directory on disk, no server (stale timeout, failed activation).
    PresentInactive,
    /// Server running on a bound port with the stale timer armed.
    Active,
}

impl InstanceState {
    pub fn from_parts(directory_present: bool, server_active: bool) -> Self {
        match (directory_present, server_active) {
            (_, true) => InstanceState::Active,
            (true, false) => InstanceState::PresentInactive,
            (false, false) => InstanceState::Absent,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Absent => write!(f, "absent"),
            InstanceState::PresentInactive => write!(f, "present-inactive"),
            InstanceState::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub pr: PrNumber,
    pub state: InstanceState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Operations queued but not yet started.
    pub queued: usize,
}
