use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent lifecycle status for a task row.
///
/// Transitions are strictly forward:
/// `pending → downloading → {completed | failed} → {sent | notified}`.
/// Any other edge is rejected by the store (see [`TaskStatus::can_transition_to`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    /// Terminal: artifact (or size warning) delivered to the requester.
    Sent,
    /// Terminal: failure notice delivered to the requester.
    Notified,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Sent => "sent",
            TaskStatus::Notified => "notified",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "downloading" => TaskStatus::Downloading,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "sent" => TaskStatus::Sent,
            "notified" => TaskStatus::Notified,
            _ => return None,
        })
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Downloading)
                | (TaskStatus::Downloading, TaskStatus::Completed)
                | (TaskStatus::Downloading, TaskStatus::Failed)
                | (TaskStatus::Completed, TaskStatus::Sent)
                | (TaskStatus::Failed, TaskStatus::Notified)
        )
    }
}

/// Core persisted task record (one user-submitted download request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonically assigned by the store.
    pub id: i64,
    pub user_id: i64,
    pub url: String,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    /// Changes on every status transition.
    pub updated_at: DateTime<Utc>,

    /// Set iff status ∈ {completed, sent}.
    pub file_path: Option<String>,
    /// Set iff status ∈ {failed, notified}.
    pub error_message: Option<String>,
}

/// Per-user rate accounting. Created lazily on first request, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStat {
    pub user_id: i64,
    /// Lifetime count of tasks that reached `completed`.
    pub downloads_count: i64,
    pub last_request: DateTime<Utc>,
    /// Accepted requests in the current hour bucket.
    pub requests_hour: i64,
    /// Hour-bucket label (`year-month-day-hour`) the counter was last reset against.
    pub last_hour_reset: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Downloading,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Sent,
            TaskStatus::Notified,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::from_str("queued"), None);
    }

    #[test]
    fn only_forward_edges_are_legal() {
        use TaskStatus::*;

        let all = [Pending, Downloading, Completed, Failed, Sent, Notified];
        let legal = [
            (Pending, Downloading),
            (Downloading, Completed),
            (Downloading, Failed),
            (Completed, Sent),
            (Failed, Notified),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn no_task_regresses() {
        use TaskStatus::*;
        assert!(!Downloading.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Downloading));
        assert!(!Sent.can_transition_to(Completed));
        assert!(!Notified.can_transition_to(Failed));
    }
}
