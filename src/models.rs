use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Flag {
    pub name: String,
    pub description: String,
    pub color: String,
    pub is_active: bool,
}

/// Snapshot of one inbox message, fetched once per sort run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    pub thread_id: String,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub snippet: Option<String>,
    pub body_plain: Option<String>,
}

impl EmailMessage {
    pub fn subject_str(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }

    pub fn from_str(&self) -> &str {
        self.from_address.as_deref().unwrap_or("")
    }

    /// Body text for scoring: the plain part when present, else the snippet.
    pub fn body_str(&self) -> &str {
        self.body_plain
            .as_deref()
            .or(self.snippet.as_deref())
            .unwrap_or("")
    }
}

/// Provider-side label, reduced to what reconciliation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLabel {
    pub id: String,
    pub name: String,
}

/// One row of the label cache (flag name -> Gmail label id).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LabelCacheRow {
    pub label_name: String,
    pub label_id: String,
    pub label_color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortingSession {
    pub session_id: String,
    pub email: String,
    pub status: String,
    pub start_time: Option<chrono::NaiveDateTime>,
    pub end_time: Option<chrono::NaiveDateTime>,
    pub total_emails: i64,
    pub processed_emails: i64,
    pub error_message: Option<String>,
    pub flags_used: String,
}

impl SortingSession {
    /// Flag names recorded at run start, in the order they were used.
    pub fn flag_names(&self) -> Vec<String> {
        self.flags_used
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect()
    }
}

/// Explicit partial update for a session row. Only the listed fields
/// can change after creation; a terminal status also stamps end_time.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub total_emails: Option<i64>,
    pub processed_emails: Option<i64>,
    pub error_message: Option<String>,
}

impl SessionUpdate {
    pub fn progress(processed: i64) -> Self {
        Self {
            processed_emails: Some(processed),
            ..Self::default()
        }
    }

    pub fn completed(processed: i64) -> Self {
        Self {
            status: Some(SessionStatus::Completed),
            processed_emails: Some(processed),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Failed,
    Skipped,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Success => "success",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
            ProcessingStatus::Error => "error",
        }
    }
}

/// One append-only audit row per message per run.
#[derive(Debug, Clone)]
pub struct ProcessingLogEntry {
    pub email_id: String,
    pub email_subject: Option<String>,
    pub email_from: Option<String>,
    pub assigned_label: Option<String>,
    pub confidence_score: f64,
    pub status: ProcessingStatus,
    pub error_details: Option<String>,
}

/// Ranked AI suggestion of an existing flag for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagSuggestion {
    pub flag_name: String,
    pub confidence: f64,
    pub reason: String,
}
