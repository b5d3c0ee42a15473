use crate::categorize::{Categorizer, MARKETING_LABEL, MARKETING_LABEL_COLOR, normalize_flag_name};
use crate::config::SortConfig;
use crate::db::Database;
use crate::gemini::KeywordEnhancer;
use crate::gmail::MailProvider;
use crate::models::{
    Flag, ProcessingLogEntry, ProcessingStatus, SessionUpdate, SortingSession,
};
use crate::reconcile::LabelReconciler;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Sort,
    Revert,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub email: String,
    pub kind: RunKind,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a run is already in flight for {0}")]
    AlreadyRunning(String),
    #[error("run queue is closed")]
    QueueClosed,
}

/// Executes sort and revert runs against injected capabilities. One
/// instance per worker; no process-wide state.
pub struct Runner {
    db: Arc<Database>,
    provider: Arc<dyn MailProvider>,
    enhancer: Arc<dyn KeywordEnhancer>,
    settings: SortConfig,
}

impl Runner {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn MailProvider>,
        enhancer: Arc<dyn KeywordEnhancer>,
        settings: SortConfig,
    ) -> Self {
        Self {
            db,
            provider,
            enhancer,
            settings,
        }
    }

    async fn pace(&self) {
        tokio::time::sleep(Duration::from_millis(self.settings.api_delay_ms)).await;
    }

    /// Runs a full sort. The session row is created before any
    /// provider work, so even a crash mid-run leaves a durable record;
    /// any error escaping the run body marks it failed.
    pub async fn perform_sort(&self, email: &str) -> Result<String> {
        let flags = self.db.get_active_flags(email).await?;
        let flag_names: Vec<String> = flags.iter().map(|f| f.name.clone()).collect();
        let session_id = self.db.create_session(email, &flag_names.join(",")).await?;
        info!(session = %session_id, flags = flag_names.len(), "sort run started");

        if let Err(e) = self.sort_session(&session_id, email, &flags, &flag_names).await {
            error!(session = %session_id, "sort run failed: {:#}", e);
            self.db
                .apply_session_update(&session_id, &SessionUpdate::failed(format!("{:#}", e)))
                .await?;
        }
        Ok(session_id)
    }

    async fn sort_session(
        &self,
        session_id: &str,
        email: &str,
        flags: &[Flag],
        flag_names: &[String],
    ) -> Result<()> {
        if flags.is_empty() {
            self.db
                .apply_session_update(session_id, &SessionUpdate::failed("No active flags found"))
                .await?;
            return Ok(());
        }

        let reconciler = LabelReconciler::new(&self.db, self.provider.as_ref(), email);
        let mapping = reconciler
            .reconcile(flag_names)
            .await
            .context("Failed to reconcile labels")?;
        if mapping.is_empty() {
            self.db
                .apply_session_update(
                    session_id,
                    &SessionUpdate::failed("Failed to create or verify labels"),
                )
                .await?;
            return Ok(());
        }
        if mapping.len() < flag_names.len() {
            warn!(
                session = %session_id,
                resolved = mapping.len(),
                wanted = flag_names.len(),
                "partial label mapping, affected messages will be skipped"
            );
        }

        let message_ids = self
            .provider
            .list_message_ids(&self.settings.query, self.settings.max_messages)
            .await
            .context("Failed to list messages")?;
        self.db
            .apply_session_update(
                session_id,
                &SessionUpdate {
                    total_emails: Some(message_ids.len() as i64),
                    ..Default::default()
                },
            )
            .await?;

        if message_ids.is_empty() {
            self.db
                .apply_session_update(session_id, &SessionUpdate::completed(0))
                .await?;
            return Ok(());
        }

        let mut processed = 0i64;
        for message_id in &message_ids {
            let entry = self
                .process_message(message_id, flags, &mapping, &reconciler)
                .await;
            self.db.insert_log_entry(session_id, &entry).await?;
            processed += 1;
            self.db
                .apply_session_update(session_id, &SessionUpdate::progress(processed))
                .await?;
            self.pace().await;
        }

        self.db
            .apply_session_update(session_id, &SessionUpdate::completed(processed))
            .await?;
        info!(session = %session_id, processed, "sort run completed");
        Ok(())
    }

    /// Always yields exactly one log entry; any fault is folded into an
    /// `error` entry so a bad message cannot abort the run.
    async fn process_message(
        &self,
        message_id: &str,
        flags: &[Flag],
        mapping: &HashMap<String, String>,
        reconciler: &LabelReconciler<'_>,
    ) -> ProcessingLogEntry {
        match self
            .try_process_message(message_id, flags, mapping, reconciler)
            .await
        {
            Ok(entry) => entry,
            Err(e) => ProcessingLogEntry {
                email_id: message_id.to_string(),
                email_subject: None,
                email_from: None,
                assigned_label: None,
                confidence_score: 0.0,
                status: ProcessingStatus::Error,
                error_details: Some(format!("{:#}", e)),
            },
        }
    }

    async fn try_process_message(
        &self,
        message_id: &str,
        flags: &[Flag],
        mapping: &HashMap<String, String>,
        reconciler: &LabelReconciler<'_>,
    ) -> Result<ProcessingLogEntry> {
        let message = self.provider.fetch_message(message_id).await?;
        let categorizer = Categorizer::new(self.enhancer.as_ref());
        let (category, confidence) = categorizer.categorize(&message, flags).await;

        let mut entry = ProcessingLogEntry {
            email_id: message.id.clone(),
            email_subject: message.subject.clone(),
            email_from: message.from_address.clone(),
            assigned_label: None,
            confidence_score: confidence,
            status: ProcessingStatus::Skipped,
            error_details: None,
        };

        match category {
            // Junk goes to the synthetic marketing label, never to the
            // flag's own label.
            Some(category) if normalize_flag_name(&category) == "junk" => {
                match reconciler
                    .ensure_label(MARKETING_LABEL, MARKETING_LABEL_COLOR)
                    .await
                {
                    Ok(label_id) => {
                        if self.provider.add_label(&message.id, &label_id).await.is_ok() {
                            entry.assigned_label = Some(MARKETING_LABEL.to_string());
                            entry.status = ProcessingStatus::Success;
                        } else {
                            entry.assigned_label = Some(MARKETING_LABEL.to_string());
                            entry.status = ProcessingStatus::Failed;
                            entry.error_details =
                                Some("Failed to apply Marketing Mails label".to_string());
                        }
                    }
                    Err(e) => {
                        entry.assigned_label = Some(category);
                        entry.status = ProcessingStatus::Failed;
                        entry.error_details =
                            Some(format!("Failed to create Marketing Mails label: {:#}", e));
                    }
                }
            }
            Some(category) if mapping.contains_key(&category) => {
                let label_id = &mapping[&category];
                if self.provider.add_label(&message.id, label_id).await.is_ok() {
                    entry.assigned_label = Some(category);
                    entry.status = ProcessingStatus::Success;
                } else {
                    entry.assigned_label = Some(category);
                    entry.status = ProcessingStatus::Failed;
                    entry.error_details = Some("Failed to apply label".to_string());
                }
            }
            _ => {
                entry.error_details = Some("No matching category or low confidence".to_string());
            }
        }

        Ok(entry)
    }

    /// Reverts the most recent completed run: removes the labels its
    /// successful log entries applied, best-effort, and records the
    /// outcome as a new session.
    pub async fn perform_revert(&self, email: &str) -> Result<String> {
        let original = self
            .db
            .latest_completed_session(email)
            .await?
            .context("No completed sorting session to revert")?;

        let revert_id = self
            .db
            .create_session(email, &format!("REVERT:{}", original.session_id))
            .await?;
        info!(
            session = %revert_id,
            reverting = %original.session_id,
            "revert run started"
        );

        if let Err(e) = self.revert_session(&revert_id, email, &original).await {
            error!(session = %revert_id, "revert run failed: {:#}", e);
            self.db
                .apply_session_update(&revert_id, &SessionUpdate::failed(format!("{:#}", e)))
                .await?;
        }
        Ok(revert_id)
    }

    async fn revert_session(
        &self,
        revert_id: &str,
        email: &str,
        original: &SortingSession,
    ) -> Result<()> {
        let eligible = self
            .db
            .successful_log_entries(&original.session_id)
            .await?;
        self.db
            .apply_session_update(
                revert_id,
                &SessionUpdate {
                    total_emails: Some(eligible.len() as i64),
                    ..Default::default()
                },
            )
            .await?;

        if eligible.is_empty() {
            self.db
                .apply_session_update(revert_id, &SessionUpdate::completed(0))
                .await?;
            return Ok(());
        }

        let reconciler = LabelReconciler::new(&self.db, self.provider.as_ref(), email);
        let mut mapping = reconciler
            .reconcile(&original.flag_names())
            .await
            .context("Failed to re-derive label mapping")?;
        match reconciler
            .ensure_label(MARKETING_LABEL, MARKETING_LABEL_COLOR)
            .await
        {
            Ok(label_id) => {
                mapping.insert(MARKETING_LABEL.to_string(), label_id);
            }
            Err(e) => warn!("marketing label unavailable for revert: {:#}", e),
        }

        let mut reverted = 0i64;
        for (message_id, assigned_label) in &eligible {
            match mapping.get(assigned_label) {
                Some(label_id) => {
                    match self.provider.remove_label(message_id, label_id).await {
                        Ok(()) => reverted += 1,
                        Err(e) => {
                            warn!(message = %message_id, label = %assigned_label, "failed to remove label: {:#}", e);
                        }
                    }
                }
                None => {
                    warn!(message = %message_id, label = %assigned_label, "no label mapping, cannot revert");
                }
            }
            self.pace().await;
        }

        self.db
            .apply_session_update(revert_id, &SessionUpdate::completed(reverted))
            .await?;
        info!(session = %revert_id, reverted, of = eligible.len(), "revert run completed");
        Ok(())
    }
}

/// Hands run requests to a single worker task. Session rows are the
/// only progress signal a trigger gets back; an enqueue for a user
/// with a run already in flight is rejected instead of racing it.
pub struct Dispatcher {
    tx: mpsc::Sender<RunRequest>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn spawn(runner: Runner) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RunRequest>(16);
        let active = Arc::new(Mutex::new(HashSet::new()));
        let worker_active = active.clone();

        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let outcome = match request.kind {
                    RunKind::Sort => runner.perform_sort(&request.email).await,
                    RunKind::Revert => runner.perform_revert(&request.email).await,
                };
                if let Err(e) = outcome {
                    // Nothing durable exists for this failure; it only
                    // surfaces in the logs.
                    error!(email = %request.email, "run aborted before a session existed: {:#}", e);
                }
                worker_active.lock().unwrap().remove(&request.email);
            }
        });

        (Self { tx, active }, handle)
    }

    pub async fn enqueue(&self, request: RunRequest) -> Result<(), DispatchError> {
        {
            let mut active = self.active.lock().unwrap();
            if !active.insert(request.email.clone()) {
                return Err(DispatchError::AlreadyRunning(request.email));
            }
        }

        let email = request.email.clone();
        if self.tx.send(request).await.is_err() {
            self.active.lock().unwrap().remove(&email);
            return Err(DispatchError::QueueClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailMessage, FlagSuggestion, ProviderLabel};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    struct NoEnhancer;

    #[async_trait]
    impl KeywordEnhancer for NoEnhancer {
        fn is_available(&self) -> bool {
            false
        }
        async fn enhance_keywords(&self, _: &str, _: &str, _: &str) -> Vec<String> {
            Vec::new()
        }
        async fn suggest_flags(&self, _: &str, _: &[String]) -> Vec<FlagSuggestion> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct MailboxState {
        labels: Vec<ProviderLabel>,
        messages: Vec<EmailMessage>,
        next_id: usize,
        added: Vec<(String, String)>,
        removed: Vec<(String, String)>,
    }

    #[derive(Default)]
    struct FakeMailbox {
        state: Mutex<MailboxState>,
        // Closed gate makes runs block inside list_labels, for
        // exercising the dispatcher's single-flight guard.
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeMailbox {
        fn with_messages(messages: Vec<EmailMessage>) -> Self {
            let mailbox = Self::default();
            mailbox.state.lock().unwrap().messages = messages;
            mailbox
        }

        fn label_id(&self, name: &str) -> Option<String> {
            self.state
                .lock()
                .unwrap()
                .labels
                .iter()
                .find(|l| l.name == name)
                .map(|l| l.id.clone())
        }

        fn added(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().added.clone()
        }

        fn removed(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().removed.clone()
        }
    }

    #[async_trait]
    impl MailProvider for FakeMailbox {
        async fn profile_email(&self) -> Result<String> {
            Ok("a@b.c".to_string())
        }

        async fn list_labels(&self) -> Result<Vec<ProviderLabel>> {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            Ok(self.state.lock().unwrap().labels.clone())
        }

        async fn create_label(&self, name: &str) -> Result<ProviderLabel> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let label = ProviderLabel {
                id: format!("Label_{}", state.next_id),
                name: name.to_string(),
            };
            state.labels.push(label.clone());
            Ok(label)
        }

        async fn rename_label(&self, label_id: &str, new_name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let label = state
                .labels
                .iter_mut()
                .find(|l| l.id == label_id)
                .ok_or_else(|| anyhow::anyhow!("no such label"))?;
            label.name = new_name.to_string();
            Ok(())
        }

        async fn list_message_ids(&self, _: &str, max_results: u32) -> Result<Vec<String>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .messages
                .iter()
                .take(max_results as usize)
                .map(|m| m.id.clone())
                .collect())
        }

        async fn fetch_message(&self, id: &str) -> Result<EmailMessage> {
            self.state
                .lock()
                .unwrap()
                .messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such message {}", id))
        }

        async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .added
                .push((message_id.to_string(), label_id.to_string()));
            Ok(())
        }

        async fn remove_label(&self, message_id: &str, label_id: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .removed
                .push((message_id.to_string(), label_id.to_string()));
            Ok(())
        }
    }

    fn message(id: &str, subject: &str, from: &str, body: &str) -> EmailMessage {
        EmailMessage {
            id: id.to_string(),
            thread_id: format!("t-{}", id),
            subject: Some(subject.to_string()),
            from_address: Some(from.to_string()),
            snippet: None,
            body_plain: Some(body.to_string()),
        }
    }

    fn flag(name: &str, description: &str) -> Flag {
        Flag {
            name: name.to_string(),
            description: description.to_string(),
            color: "#808080".to_string(),
            is_active: true,
        }
    }

    async fn test_db() -> Arc<Database> {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.run_migrations().await.unwrap();
        Arc::new(db)
    }

    fn settings() -> SortConfig {
        SortConfig {
            query: "in:inbox".to_string(),
            max_messages: 100,
            api_delay_ms: 0,
        }
    }

    fn runner(db: Arc<Database>, provider: Arc<FakeMailbox>) -> Runner {
        Runner::new(db, provider, Arc::new(NoEnhancer), settings())
    }

    #[tokio::test]
    async fn test_sort_run_applies_labels_and_logs_every_message() {
        let db = test_db().await;
        db.upsert_flag("a@b.c", &flag("Urgent", "high priority emails"))
            .await
            .unwrap();
        let provider = Arc::new(FakeMailbox::with_messages(vec![
            message("m1", "URGENT: deadline today!!!", "boss@co.com", "now"),
            message("m2", "lunch?", "friend@home.net", "see you"),
        ]));
        let runner = runner(db.clone(), provider.clone());

        let session_id = runner.perform_sort("a@b.c").await.unwrap();

        let session = db.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, "completed");
        assert_eq!(session.total_emails, 2);
        assert_eq!(session.processed_emails, 2);
        assert_eq!(session.flags_used, "Urgent");

        let log = db.session_log(&session_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].3.as_deref(), Some("Urgent"));
        assert_eq!(log[0].5, "success");
        assert_eq!(log[1].3, None);
        assert_eq!(log[1].5, "skipped");

        let urgent_id = provider.label_id("Urgent").unwrap();
        assert_eq!(provider.added(), vec![("m1".to_string(), urgent_id)]);
    }

    #[tokio::test]
    async fn test_junk_routes_to_marketing_label() {
        let db = test_db().await;
        db.upsert_flag("a@b.c", &flag("Junk", "marketing and promotional emails"))
            .await
            .unwrap();
        let provider = Arc::new(FakeMailbox::with_messages(vec![message(
            "m1",
            "Weekly Newsletter: big sale",
            "noreply@shop.com",
            "unsubscribe anytime",
        )]));
        let runner = runner(db.clone(), provider.clone());

        let session_id = runner.perform_sort("a@b.c").await.unwrap();

        let log = db.session_log(&session_id).await.unwrap();
        assert_eq!(log[0].3.as_deref(), Some(MARKETING_LABEL));
        assert_eq!(log[0].5, "success");

        let marketing_id = provider.label_id(MARKETING_LABEL).unwrap();
        let junk_id = provider.label_id("Junk").unwrap();
        assert_eq!(provider.added(), vec![("m1".to_string(), marketing_id)]);
        assert_ne!(provider.added()[0].1, junk_id);
    }

    #[tokio::test]
    async fn test_sort_without_active_flags_fails_session() {
        let db = test_db().await;
        let provider = Arc::new(FakeMailbox::default());
        let runner = runner(db.clone(), provider);

        let session_id = runner.perform_sort("a@b.c").await.unwrap();
        let session = db.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, "failed");
        assert_eq!(session.error_message.as_deref(), Some("No active flags found"));
    }

    #[tokio::test]
    async fn test_sort_with_empty_inbox_completes_with_zero() {
        let db = test_db().await;
        db.upsert_flag("a@b.c", &flag("Urgent", "high priority emails"))
            .await
            .unwrap();
        let provider = Arc::new(FakeMailbox::default());
        let runner = runner(db.clone(), provider);

        let session_id = runner.perform_sort("a@b.c").await.unwrap();
        let session = db.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, "completed");
        assert_eq!(session.total_emails, 0);
        assert_eq!(session.processed_emails, 0);
    }

    #[tokio::test]
    async fn test_unfetchable_message_logs_error_and_run_continues() {
        let db = test_db().await;
        db.upsert_flag("a@b.c", &flag("Urgent", "high priority emails"))
            .await
            .unwrap();
        let provider = Arc::new(FakeMailbox::with_messages(vec![
            message("m1", "URGENT: deadline today!!!", "boss@co.com", "now"),
        ]));

        // Wrapper that lists one extra id with no backing message.
        struct ListExtra(Arc<FakeMailbox>);

        #[async_trait]
        impl MailProvider for ListExtra {
            async fn profile_email(&self) -> Result<String> {
                self.0.profile_email().await
            }
            async fn list_labels(&self) -> Result<Vec<ProviderLabel>> {
                self.0.list_labels().await
            }
            async fn create_label(&self, name: &str) -> Result<ProviderLabel> {
                self.0.create_label(name).await
            }
            async fn rename_label(&self, id: &str, name: &str) -> Result<()> {
                self.0.rename_label(id, name).await
            }
            async fn list_message_ids(&self, q: &str, max: u32) -> Result<Vec<String>> {
                let mut ids = self.0.list_message_ids(q, max).await?;
                ids.push("ghost".to_string());
                Ok(ids)
            }
            async fn fetch_message(&self, id: &str) -> Result<EmailMessage> {
                self.0.fetch_message(id).await
            }
            async fn add_label(&self, m: &str, l: &str) -> Result<()> {
                self.0.add_label(m, l).await
            }
            async fn remove_label(&self, m: &str, l: &str) -> Result<()> {
                self.0.remove_label(m, l).await
            }
        }

        let runner = Runner::new(
            db.clone(),
            Arc::new(ListExtra(provider.clone())),
            Arc::new(NoEnhancer),
            settings(),
        );

        let session_id = runner.perform_sort("a@b.c").await.unwrap();
        let session = db.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, "completed");
        assert_eq!(session.total_emails, 2);
        assert_eq!(session.processed_emails, 2);

        let log = db.session_log(&session_id).await.unwrap();
        assert_eq!(log[0].5, "success");
        assert_eq!(log[1].0, "ghost");
        assert_eq!(log[1].5, "error");
    }

    #[tokio::test]
    async fn test_revert_removes_only_successful_entries() {
        let db = test_db().await;
        db.upsert_flag("a@b.c", &flag("Urgent", "high priority emails"))
            .await
            .unwrap();
        let provider = Arc::new(FakeMailbox::with_messages(vec![
            message("m1", "URGENT: deadline today!!!", "boss@co.com", "now"),
            message("m2", "lunch?", "friend@home.net", "see you"),
        ]));
        let runner = runner(db.clone(), provider.clone());

        let sort_id = runner.perform_sort("a@b.c").await.unwrap();
        let urgent_id = provider.label_id("Urgent").unwrap();

        let revert_id = runner.perform_revert("a@b.c").await.unwrap();
        assert_ne!(revert_id, sort_id);

        // Only m1 was labeled, so only m1 is unlabeled.
        assert_eq!(provider.removed(), vec![("m1".to_string(), urgent_id)]);

        let revert = db.get_session(&revert_id).await.unwrap().unwrap();
        assert_eq!(revert.status, "completed");
        assert_eq!(revert.flags_used, format!("REVERT:{}", sort_id));
        assert_eq!(revert.total_emails, 1);
        assert_eq!(revert.processed_emails, 1);
    }

    #[tokio::test]
    async fn test_revert_with_no_eligible_entries_records_empty_session() {
        let db = test_db().await;
        let provider = Arc::new(FakeMailbox::default());
        let runner = runner(db.clone(), provider.clone());

        // A completed session whose only entries are non-revertable.
        let sort_id = db.create_session("a@b.c", "Urgent").await.unwrap();
        db.insert_log_entry(
            &sort_id,
            &ProcessingLogEntry {
                email_id: "m1".to_string(),
                email_subject: None,
                email_from: None,
                assigned_label: None,
                confidence_score: 0.0,
                status: ProcessingStatus::Skipped,
                error_details: None,
            },
        )
        .await
        .unwrap();
        db.apply_session_update(&sort_id, &SessionUpdate::completed(1))
            .await
            .unwrap();

        let revert_id = runner.perform_revert("a@b.c").await.unwrap();
        let revert = db.get_session(&revert_id).await.unwrap().unwrap();
        assert_eq!(revert.status, "completed");
        assert_eq!(revert.total_emails, 0);
        assert_eq!(revert.processed_emails, 0);
        assert!(provider.removed().is_empty());
    }

    #[tokio::test]
    async fn test_revert_counts_missing_mapping_as_failure() {
        let db = test_db().await;
        let provider = Arc::new(FakeMailbox::default());
        let runner = runner(db.clone(), provider.clone());

        let sort_id = db.create_session("a@b.c", "Urgent").await.unwrap();
        for (mid, label) in [("m1", "Urgent"), ("m2", "Ghost")] {
            db.insert_log_entry(
                &sort_id,
                &ProcessingLogEntry {
                    email_id: mid.to_string(),
                    email_subject: None,
                    email_from: None,
                    assigned_label: Some(label.to_string()),
                    confidence_score: 0.5,
                    status: ProcessingStatus::Success,
                    error_details: None,
                },
            )
            .await
            .unwrap();
        }
        db.apply_session_update(&sort_id, &SessionUpdate::completed(2))
            .await
            .unwrap();

        let revert_id = runner.perform_revert("a@b.c").await.unwrap();
        let revert = db.get_session(&revert_id).await.unwrap().unwrap();
        assert_eq!(revert.status, "completed");
        assert_eq!(revert.total_emails, 2);
        // "Ghost" never maps to a label, so only one removal succeeds.
        assert_eq!(revert.processed_emails, 1);
        assert_eq!(provider.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_revert_without_completed_session_is_an_error() {
        let db = test_db().await;
        let provider = Arc::new(FakeMailbox::default());
        let runner = runner(db.clone(), provider);

        assert!(runner.perform_revert("a@b.c").await.is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_rejects_overlapping_runs_for_one_user() {
        let db = test_db().await;
        db.upsert_flag("a@b.c", &flag("Urgent", "high priority emails"))
            .await
            .unwrap();

        let gate = Arc::new(Semaphore::new(0));
        let mut mailbox = FakeMailbox::default();
        mailbox.gate = Some(gate.clone());
        let provider = Arc::new(mailbox);

        let runner = Runner::new(db.clone(), provider, Arc::new(NoEnhancer), settings());
        let (dispatcher, handle) = Dispatcher::spawn(runner);

        dispatcher
            .enqueue(RunRequest {
                email: "a@b.c".to_string(),
                kind: RunKind::Sort,
            })
            .await
            .unwrap();

        // First run is parked on the gate inside reconciliation.
        let second = dispatcher
            .enqueue(RunRequest {
                email: "a@b.c".to_string(),
                kind: RunKind::Sort,
            })
            .await;
        assert!(matches!(second, Err(DispatchError::AlreadyRunning(_))));

        // A different user is not blocked.
        dispatcher
            .enqueue(RunRequest {
                email: "other@b.c".to_string(),
                kind: RunKind::Sort,
            })
            .await
            .unwrap();

        gate.add_permits(8);
        drop(dispatcher);
        handle.await.unwrap();
    }
}
