//! Deferred re-engagement: follow-up tasks and the loop that re-opens them.

pub mod engine;
pub mod followup;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::{Anomaly, AnomalyKey};

pub use self::engine::{run_followup_loop, run_once, ReopenedSession};
pub use self::followup::FollowUpScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    ShortTerm,
    MediumTerm,
    LongTerm,
    Yearly,
}

impl FollowUpKind {
    pub const ALL: [FollowUpKind; 4] = [
        FollowUpKind::ShortTerm,
        FollowUpKind::MediumTerm,
        FollowUpKind::LongTerm,
        FollowUpKind::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpKind::ShortTerm => "short_term",
            FollowUpKind::MediumTerm => "medium_term",
            FollowUpKind::LongTerm => "long_term",
            FollowUpKind::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for FollowUpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FollowUpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FollowUpKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown follow-up kind '{s}'"))
    }
}

/// A self-contained reminder to revisit a resolved anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub task_id: Uuid,
    pub anomaly_ref: AnomalyKey,
    pub anomaly: Anomaly,
    /// What the original session settled on, if anything.
    pub explanation: Option<String>,
    pub due_at: DateTime<Utc>,
    pub kind: FollowUpKind,
}
