use serde::Serialize;

/// Lifecycle of a stream job as seen by progress reporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    Processing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl StreamStatus {
    /// No further progress follows a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamStatus::Completed | StreamStatus::Failed | StreamStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Processing => "PROCESSING",
            StreamStatus::Completed => "COMPLETED",
            StreamStatus::Failed => "FAILED",
            StreamStatus::Cancelling => "CANCELLING",
            StreamStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!StreamStatus::Processing.is_terminal());
        assert!(!StreamStatus::Cancelling.is_terminal());
        assert!(StreamStatus::Completed.is_terminal());
        assert!(StreamStatus::Failed.is_terminal());
        assert!(StreamStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_display_matches_serde() {
        for status in [
            StreamStatus::Processing,
            StreamStatus::Completed,
            StreamStatus::Failed,
            StreamStatus::Cancelling,
            StreamStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
