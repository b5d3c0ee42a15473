use crate::models::{
    Flag, LabelCacheRow, ProcessingLogEntry, SessionStatus, SessionUpdate, SortingSession,
};
use anyhow::Result;
use sqlx::{Row, sqlite::SqlitePool};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        for statement in schema.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    // ---- user flags ----

    pub async fn upsert_flag(&self, email: &str, flag: &Flag) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_flags (email, flag_name, flag_description, flag_color, is_active)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(email, flag_name) DO UPDATE SET
             flag_description=excluded.flag_description, flag_color=excluded.flag_color,
             is_active=excluded.is_active, updated_at=CURRENT_TIMESTAMP",
        )
        .bind(email)
        .bind(&flag.name)
        .bind(&flag.description)
        .bind(&flag.color)
        .bind(flag.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active flags for one account, ordered by name so scoring
    /// tie-breaks are deterministic across runs.
    pub async fn get_active_flags(&self, email: &str) -> Result<Vec<Flag>> {
        let rows = sqlx::query(
            "SELECT flag_name, flag_description, flag_color, is_active
             FROM user_flags
             WHERE email = ? AND is_active = 1
             ORDER BY flag_name ASC",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(flag_from_row).collect())
    }

    pub async fn get_all_flags(&self, email: &str) -> Result<Vec<Flag>> {
        let rows = sqlx::query(
            "SELECT flag_name, flag_description, flag_color, is_active
             FROM user_flags
             WHERE email = ?
             ORDER BY flag_name ASC",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(flag_from_row).collect())
    }

    // ---- label cache ----

    pub async fn get_label_cache(&self, email: &str) -> Result<Vec<LabelCacheRow>> {
        let rows = sqlx::query(
            "SELECT label_name, label_id, label_color
             FROM gmail_labels
             WHERE email = ?
             ORDER BY label_name ASC",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LabelCacheRow {
                label_name: row.get(0),
                label_id: row.get(1),
                label_color: row.get(2),
            })
            .collect())
    }

    pub async fn upsert_label_cache(
        &self,
        email: &str,
        label_name: &str,
        label_id: &str,
        label_color: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO gmail_labels (email, label_name, label_id, label_color)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(email, label_name) DO UPDATE SET
             label_id=excluded.label_id, label_color=excluded.label_color,
             updated_at=CURRENT_TIMESTAMP",
        )
        .bind(email)
        .bind(label_name)
        .bind(label_id)
        .bind(label_color)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_label_cache(&self, email: &str, label_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM gmail_labels WHERE email = ? AND label_name = ?")
            .bind(email)
            .bind(label_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- sorting sessions ----

    pub async fn create_session(&self, email: &str, flags_used: &str) -> Result<String> {
        let session_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sorting_sessions (session_id, email, flags_used, status)
             VALUES (?, ?, ?, 'running')",
        )
        .bind(&session_id)
        .bind(email)
        .bind(flags_used)
        .execute(&self.pool)
        .await?;
        Ok(session_id)
    }

    /// Applies a partial update in one statement. The WHERE clause
    /// requires the row to still be running, so terminal sessions
    /// cannot be mutated.
    pub async fn apply_session_update(
        &self,
        session_id: &str,
        update: &SessionUpdate,
    ) -> Result<()> {
        let status = update.status.map(|s| s.as_str());
        let terminal = matches!(
            update.status,
            Some(SessionStatus::Completed) | Some(SessionStatus::Failed)
        );
        sqlx::query(
            "UPDATE sorting_sessions SET
                 status = COALESCE(?, status),
                 total_emails = COALESCE(?, total_emails),
                 processed_emails = COALESCE(?, processed_emails),
                 error_message = COALESCE(?, error_message),
                 end_time = CASE WHEN ? THEN CURRENT_TIMESTAMP ELSE end_time END
             WHERE session_id = ? AND status = 'running'",
        )
        .bind(status)
        .bind(update.total_emails)
        .bind(update.processed_emails)
        .bind(&update.error_message)
        .bind(terminal)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SortingSession>> {
        let row = sqlx::query(
            "SELECT session_id, email, status, start_time, end_time,
                    total_emails, processed_emails, error_message, flags_used
             FROM sorting_sessions
             WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(session_from_row))
    }

    pub async fn latest_session(&self, email: &str) -> Result<Option<SortingSession>> {
        let row = sqlx::query(
            "SELECT session_id, email, status, start_time, end_time,
                    total_emails, processed_emails, error_message, flags_used
             FROM sorting_sessions
             WHERE email = ?
             ORDER BY start_time DESC, rowid DESC
             LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(session_from_row))
    }

    pub async fn latest_completed_session(&self, email: &str) -> Result<Option<SortingSession>> {
        let row = sqlx::query(
            "SELECT session_id, email, status, start_time, end_time,
                    total_emails, processed_emails, error_message, flags_used
             FROM sorting_sessions
             WHERE email = ? AND status = 'completed'
             ORDER BY start_time DESC, rowid DESC
             LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(session_from_row))
    }

    pub async fn session_history(&self, email: &str, limit: i64) -> Result<Vec<SortingSession>> {
        let rows = sqlx::query(
            "SELECT session_id, email, status, start_time, end_time,
                    total_emails, processed_emails, error_message, flags_used
             FROM sorting_sessions
             WHERE email = ?
             ORDER BY start_time DESC, rowid DESC
             LIMIT ?",
        )
        .bind(email)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(session_from_row).collect())
    }

    // ---- processing log ----

    pub async fn insert_log_entry(
        &self,
        session_id: &str,
        entry: &ProcessingLogEntry,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO email_processing_log
             (session_id, email_id, email_subject, email_from, assigned_label,
              confidence_score, status, error_details)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(&entry.email_id)
        .bind(&entry.email_subject)
        .bind(&entry.email_from)
        .bind(&entry.assigned_label)
        .bind(entry.confidence_score)
        .bind(entry.status.as_str())
        .bind(&entry.error_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session_log(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, Option<String>, Option<String>, Option<String>, f64, String)>> {
        let rows = sqlx::query(
            "SELECT email_id, email_subject, email_from, assigned_label, confidence_score, status
             FROM email_processing_log
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get(0),
                    row.get(1),
                    row.get(2),
                    row.get(3),
                    row.get(4),
                    row.get(5),
                )
            })
            .collect())
    }

    /// Entries a revert must undo: successfully labeled messages only.
    pub async fn successful_log_entries(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT email_id, assigned_label
             FROM email_processing_log
             WHERE session_id = ? AND status = 'success' AND assigned_label IS NOT NULL
             ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| (row.get(0), row.get(1))).collect())
    }
}

fn flag_from_row(row: sqlx::sqlite::SqliteRow) -> Flag {
    Flag {
        name: row.get(0),
        description: row.get(1),
        color: row.get(2),
        is_active: row.get(3),
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> SortingSession {
    SortingSession {
        session_id: row.get(0),
        email: row.get(1),
        status: row.get(2),
        start_time: row.get(3),
        end_time: row.get(4),
        total_emails: row.get(5),
        processed_emails: row.get(6),
        error_message: row.get(7),
        flags_used: row.get(8),
    }
}
