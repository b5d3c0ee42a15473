use crate::db::Database;
use crate::gmail::MailProvider;
use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{info, warn};

/// Gmail system label names a user flag may not shadow. A colliding
/// flag keeps its own name internally but gets a disambiguated name
/// for all provider-facing operations.
const RESERVED_LABEL_NAMES: &[&str] = &["important", "spam", "inbox", "sent", "draft", "trash"];

pub fn provider_label_name(flag_name: &str) -> String {
    if RESERVED_LABEL_NAMES.contains(&flag_name.to_lowercase().as_str()) {
        format!("{} Emails", flag_name)
    } else {
        flag_name.to_string()
    }
}

const DEFAULT_LABEL_COLOR: &str = "#808080";

/// Keeps the user's Gmail labels aligned with their flag set: reuses
/// labels that already exist, renames labels orphaned by a flag
/// rename, creates what is missing, and prunes stale cache rows.
pub struct LabelReconciler<'a> {
    db: &'a Database,
    provider: &'a dyn MailProvider,
    email: &'a str,
}

impl<'a> LabelReconciler<'a> {
    pub fn new(db: &'a Database, provider: &'a dyn MailProvider, email: &'a str) -> Self {
        Self { db, provider, email }
    }

    /// Returns flag name -> label id for every flag that could be
    /// resolved. A flag missing from the result failed to reconcile;
    /// callers must treat a short result as partial failure.
    pub async fn reconcile(&self, flag_names: &[String]) -> Result<HashMap<String, String>> {
        let provider_labels = self.provider.list_labels().await?;
        let by_name: HashMap<&str, &str> = provider_labels
            .iter()
            .map(|l| (l.name.as_str(), l.id.as_str()))
            .collect();
        let provider_ids: HashSet<&str> =
            provider_labels.iter().map(|l| l.id.as_str()).collect();

        let cache = self.db.get_label_cache(self.email).await?;
        let active: HashSet<&str> = flag_names.iter().map(String::as_str).collect();
        let colors: HashMap<String, String> = self
            .db
            .get_all_flags(self.email)
            .await?
            .into_iter()
            .map(|f| (f.name, f.color))
            .collect();

        // Cached labels no longer tied to an active flag but still
        // present on the provider are rename candidates.
        let mut orphans: VecDeque<_> = cache
            .iter()
            .filter(|row| {
                !active.contains(row.label_name.as_str())
                    && provider_ids.contains(row.label_id.as_str())
            })
            .cloned()
            .collect();

        let mut mapping = HashMap::new();

        for name in flag_names {
            let display = provider_label_name(name);
            let color = colors
                .get(name)
                .map(String::as_str)
                .unwrap_or(DEFAULT_LABEL_COLOR);

            if let Some(id) = by_name.get(display.as_str()).or_else(|| by_name.get(name.as_str())) {
                self.db
                    .upsert_label_cache(self.email, name, id, color)
                    .await?;
                mapping.insert(name.clone(), id.to_string());
                continue;
            }

            if let Some(orphan) = orphans.pop_front() {
                match self.provider.rename_label(&orphan.label_id, &display).await {
                    Ok(()) => {
                        info!(
                            from = %orphan.label_name,
                            to = %name,
                            label_id = %orphan.label_id,
                            "renamed orphaned label"
                        );
                        self.db
                            .delete_label_cache(self.email, &orphan.label_name)
                            .await?;
                        self.db
                            .upsert_label_cache(self.email, name, &orphan.label_id, color)
                            .await?;
                        mapping.insert(name.clone(), orphan.label_id);
                        continue;
                    }
                    Err(e) => {
                        warn!(flag = %name, "label rename failed, creating instead: {:#}", e);
                    }
                }
            }

            match self.provider.create_label(&display).await {
                Ok(label) => {
                    self.db
                        .upsert_label_cache(self.email, name, &label.id, color)
                        .await?;
                    mapping.insert(name.clone(), label.id);
                }
                Err(e) => {
                    // Left out of the mapping; the sort run logs the
                    // affected messages instead of aborting.
                    warn!(flag = %name, "failed to create label: {:#}", e);
                }
            }
        }

        // Prune stale cache rows; the provider labels themselves are
        // left untouched.
        for row in &cache {
            if !active.contains(row.label_name.as_str()) {
                self.db
                    .delete_label_cache(self.email, &row.label_name)
                    .await?;
            }
        }

        Ok(mapping)
    }

    /// Get-or-create for one standalone label (used for the synthetic
    /// marketing label), through the same cache.
    pub async fn ensure_label(&self, name: &str, color: &str) -> Result<String> {
        let provider_labels = self.provider.list_labels().await?;
        if let Some(label) = provider_labels.iter().find(|l| l.name == name) {
            self.db
                .upsert_label_cache(self.email, name, &label.id, color)
                .await?;
            return Ok(label.id.clone());
        }

        let created = self.provider.create_label(name).await?;
        self.db
            .upsert_label_cache(self.email, name, &created.id, color)
            .await?;
        Ok(created.id)
    }
}
