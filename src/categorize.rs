use crate::gemini::KeywordEnhancer;
use crate::models::{EmailMessage, Flag, FlagSuggestion};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Minimum winning score for a message to be assigned a flag at all.
pub const CONFIDENCE_THRESHOLD: f64 = 0.15;

/// Synthetic label junk-classified mail is routed to instead of the
/// flag's own label.
pub const MARKETING_LABEL: &str = "Marketing Mails";
pub const MARKETING_LABEL_COLOR: &str = "#ff6b35";

/// Lowercase, with spaces and underscores collapsed to dashes, so
/// "Follow Up" and "follow_up" both hit the "follow-up" tables.
pub fn normalize_flag_name(name: &str) -> String {
    name.to_lowercase().replace([' ', '_'], "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Urgent,
    Important,
    Business,
    FollowUp,
    Junk,
}

impl Category {
    fn from_normalized(name: &str) -> Option<Self> {
        match name {
            "urgent" => Some(Category::Urgent),
            "important" => Some(Category::Important),
            "business" => Some(Category::Business),
            "follow-up" => Some(Category::FollowUp),
            "junk" => Some(Category::Junk),
            _ => None,
        }
    }
}

/// How one flag is scored: against the static per-category tables, or
/// against the user's own description (optionally AI-enhanced).
#[derive(Debug, Clone, PartialEq)]
pub enum ScoringStrategy {
    Predefined(Option<Category>),
    Custom(String),
}

/// Placeholder descriptions the flag editor seeds the built-in flags
/// with. A description equal to one of these (or empty) means the user
/// never customized it, so the predefined tables apply.
const DEFAULT_DESCRIPTIONS: &[&str] = &[
    "high priority emails",
    "important business emails",
    "emails requiring follow-up",
    "marketing and promotional emails",
    "business and work-related emails",
    "emails to archive",
];

impl ScoringStrategy {
    pub fn for_flag(flag: &Flag) -> Self {
        let description = flag.description.trim().to_lowercase();
        if description.is_empty() || DEFAULT_DESCRIPTIONS.contains(&description.as_str()) {
            ScoringStrategy::Predefined(Category::from_normalized(&normalize_flag_name(
                &flag.name,
            )))
        } else {
            ScoringStrategy::Custom(description)
        }
    }
}

struct KeywordTable {
    subject: &'static [&'static str],
    body: &'static [&'static str],
    sender: &'static [&'static str],
    domain: &'static [&'static str],
}

const URGENT_KEYWORDS: KeywordTable = KeywordTable {
    subject: &["urgent", "asap", "immediate", "emergency", "critical", "deadline", "rush", "priority"],
    body: &["urgent", "asap", "immediately", "emergency", "critical", "deadline", "rush", "priority", "time-sensitive"],
    sender: &["boss", "manager", "ceo", "director", "admin", "support"],
    domain: &["emergency", "alert", "critical"],
};

const IMPORTANT_KEYWORDS: KeywordTable = KeywordTable {
    subject: &["important", "meeting", "conference", "presentation", "project", "report", "review", "approval"],
    body: &["important", "meeting", "conference", "presentation", "project", "report", "review", "approval", "decision"],
    sender: &["client", "customer", "partner", "vendor", "stakeholder"],
    domain: &["business", "corporate", "company"],
};

const BUSINESS_KEYWORDS: KeywordTable = KeywordTable {
    subject: &["business", "meeting", "conference", "presentation", "project", "report", "review", "approval", "client", "work"],
    body: &["business", "meeting", "conference", "presentation", "project", "report", "review", "approval", "decision", "client", "work", "professional"],
    sender: &["client", "customer", "partner", "vendor", "stakeholder", "business", "company"],
    domain: &["business", "corporate", "company", "work", "professional"],
};

const FOLLOWUP_KEYWORDS: KeywordTable = KeywordTable {
    subject: &["follow up", "follow-up", "reminder", "checking in", "status", "update", "progress"],
    body: &["follow up", "follow-up", "reminder", "checking in", "status", "update", "progress", "next steps"],
    sender: &["team", "colleague", "coordinator"],
    domain: &["team", "project", "collaboration"],
};

const JUNK_KEYWORDS: KeywordTable = KeywordTable {
    subject: &["newsletter", "notification", "receipt", "confirmation", "invoice", "statement", "update"],
    body: &["newsletter", "notification", "receipt", "confirmation", "invoice", "statement", "unsubscribe"],
    sender: &["no-reply", "noreply", "automated", "system", "notification"],
    domain: &["newsletter", "marketing", "promo", "deals", "promotion", "sale", "discount", "offer", "coupon", "advertisement", "unsubscribe"],
};

fn keyword_table(category: Category) -> &'static KeywordTable {
    match category {
        Category::Urgent => &URGENT_KEYWORDS,
        Category::Important => &IMPORTANT_KEYWORDS,
        Category::Business => &BUSINESS_KEYWORDS,
        Category::FollowUp => &FOLLOWUP_KEYWORDS,
        Category::Junk => &JUNK_KEYWORDS,
    }
}

const STOP_WORDS: &[&str] = &[
    "or", "and", "the", "a", "an", "to", "for", "of", "in", "on", "at", "with", "by",
];

fn regexes(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

// Inputs are lowercased before matching, so the patterns are written
// lowercase rather than compiled case-insensitive.
static URGENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"\b(urgent|asap|immediate|emergency)\b",
        r"\b(deadline|due|expires?)\b",
        r"\b(action required|time sensitive)\b",
        r"[!]{2,}",
        r"\b(final notice|last chance)\b",
    ])
});

static IMPORTANT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"\b(meeting|conference|presentation)\b",
        r"\b(project|proposal|contract)\b",
        r"\b(approval|decision|review)\b",
        r"\b(client|customer|partner)\b",
    ])
});

static FOLLOWUP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"\b(follow.?up|reminder|checking in)\b",
        r"\b(status|update|progress)\b",
        r"\b(next steps|action items)\b",
        r"\bre:\s",
        r"\bfwd:\s",
    ])
});

static JUNK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"\b(newsletter|notification|receipt)\b",
        r"\b(confirmation|invoice|statement)\b",
        r"\b(unsubscribe|opt.?out|preferences)\b",
        r"\b(automated|system|no.?reply|noreply)\b",
        r"\b(marketing|promo|promotion|promotional)\b",
        r"\b(sale|discount|offer|deal|coupon)\b",
        r"\b(advertisement|ad|sponsor|featured)\b",
        r"\b(limited.?time|expires?|hurry)\b",
        r"\b(free.?shipping|%\s*off|save\s*\$)\b",
        r"\b(subscribe|mailing.?list|newsletter)\b",
    ])
});

static MARKETING_SENDER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"@.*marketing\.",
        r"@.*promo\.",
        r"@.*newsletter\.",
        r"@.*deals\.",
        r"@.*offers?\.",
        r"noreply@",
        r"no-reply@",
        r"donotreply@",
    ])
});

static TIME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    regexes(&[
        r"\b(today|tonight|tomorrow)\b",
        r"\b(this week|next week)\b",
        r"\b(deadline|due date|expires?)\b",
    ])
});

/// Substring match with singular/plural fuzzing: "invoice" hits a text
/// containing "invoices" and the other way around.
fn fuzzy_contains(text: &str, keyword: &str) -> bool {
    if text.contains(keyword) {
        return true;
    }
    if let Some(singular) = keyword.strip_suffix('s') {
        if !singular.is_empty() && text.contains(singular) {
            return true;
        }
        false
    } else {
        text.contains(&format!("{}s", keyword))
    }
}

fn urgency_score(subject: &str, body: &str) -> f64 {
    const HIGH_URGENCY: &[&str] = &["urgent", "asap", "immediate", "emergency", "critical"];
    const MEDIUM_URGENCY: &[&str] = &["important", "priority", "deadline", "time-sensitive"];

    let text = format!("{} {}", subject, body);
    let mut score: f64 = 0.0;

    for word in HIGH_URGENCY {
        if text.contains(word) {
            score += 0.3;
        }
    }
    for word in MEDIUM_URGENCY {
        if text.contains(word) {
            score += 0.2;
        }
    }
    if text.contains("!!!") || text.contains("???") {
        score += 0.2;
    }
    for pattern in TIME_PATTERNS.iter() {
        if pattern.is_match(&text) {
            score += 0.15;
        }
    }

    score.min(1.0)
}

fn pattern_bonus(category: Category, subject: &str, body: &str, sender: &str) -> f64 {
    let mut score: f64 = 0.0;
    match category {
        Category::Urgent => {
            let text = format!("{} {}", subject, body);
            for pattern in URGENT_PATTERNS.iter() {
                if pattern.is_match(&text) {
                    score += 0.2;
                }
            }
        }
        Category::Important => {
            let text = format!("{} {}", subject, body);
            for pattern in IMPORTANT_PATTERNS.iter() {
                if pattern.is_match(&text) {
                    score += 0.15;
                }
            }
        }
        Category::FollowUp => {
            let text = format!("{} {}", subject, body);
            for pattern in FOLLOWUP_PATTERNS.iter() {
                if pattern.is_match(&text) {
                    score += 0.2;
                }
            }
        }
        Category::Junk => {
            let text = format!("{} {} {}", subject, body, sender);
            for pattern in JUNK_PATTERNS.iter() {
                if pattern.is_match(&text) {
                    score += 0.3;
                }
            }
            for pattern in MARKETING_SENDER_PATTERNS.iter() {
                if pattern.is_match(sender) {
                    score += 0.4;
                }
            }
        }
        Category::Business => {}
    }
    score.min(1.0)
}

pub struct Categorizer<'a> {
    enhancer: &'a dyn KeywordEnhancer,
}

impl<'a> Categorizer<'a> {
    pub fn new(enhancer: &'a dyn KeywordEnhancer) -> Self {
        Self { enhancer }
    }

    /// Assigns the message to at most one flag with a confidence in
    /// [0, 1]. Never fails: any internal fault scores as no match.
    pub async fn categorize(
        &self,
        message: &EmailMessage,
        flags: &[Flag],
    ) -> (Option<String>, f64) {
        let subject = message.subject_str().to_lowercase();
        let sender = message.from_str().to_lowercase();
        let body = message.body_str().to_lowercase();
        let domain = sender.split('@').nth(1).unwrap_or("");

        let mut best: Option<(&str, f64)> = None;

        for flag in flags {
            let normalized = normalize_flag_name(&flag.name);
            let score = match ScoringStrategy::for_flag(flag) {
                ScoringStrategy::Custom(description) => {
                    self.score_custom(&description, &normalized, &subject, &body)
                        .await
                }
                ScoringStrategy::Predefined(category) => {
                    score_predefined(category, &normalized, &subject, &body, &sender, domain)
                }
            };
            let score = score.min(1.0);
            debug!(flag = %flag.name, score, "scored flag");

            // First flag reaching the maximum wins; callers pass flags
            // in name order, so ties are deterministic.
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((&flag.name, score));
            }
        }

        match best {
            Some((name, score)) if score >= CONFIDENCE_THRESHOLD => (Some(name.to_string()), score),
            _ => (None, 0.0),
        }
    }

    async fn score_custom(
        &self,
        description: &str,
        normalized_name: &str,
        subject: &str,
        body: &str,
    ) -> f64 {
        let enhanced = self
            .enhancer
            .enhance_keywords(description, subject, body)
            .await;
        let has_enhanced = !enhanced.is_empty();

        let mut keywords: Vec<String> = enhanced
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .collect();
        keywords.extend(
            description
                .split_whitespace()
                .filter(|w| w.len() > 1 && !STOP_WORDS.contains(w))
                .map(str::to_string),
        );

        let mut score = 0.0;
        if !keywords.is_empty() {
            let total = keywords.len() as f64;

            let subject_matches = keywords
                .iter()
                .filter(|k| fuzzy_contains(subject, k))
                .count() as f64;
            if subject_matches > 0.0 {
                let weight = if has_enhanced { 0.6 } else { 0.5 };
                score += ((subject_matches / total) * weight).min(weight);
            }

            let body_matches = keywords
                .iter()
                .filter(|k| fuzzy_contains(body, k))
                .count() as f64;
            if body_matches > 0.0 {
                let weight = if has_enhanced { 0.4 } else { 0.3 };
                score += ((body_matches / total) * weight).min(weight);
            }
        }

        if normalized_name == "urgent" {
            score += urgency_score(subject, body) * 0.2;
        }

        score
    }

    /// AI suggestions of existing flags for one message; empty when the
    /// enhancer is unavailable.
    pub async fn flag_suggestions(
        &self,
        message: &EmailMessage,
        flags: &[Flag],
    ) -> Vec<FlagSuggestion> {
        let content = format!(
            "Subject: {}\nFrom: {}\nBody: {}",
            message.subject_str(),
            message.from_str(),
            message.body_str()
        );
        let flag_names: Vec<String> = flags.iter().map(|f| f.name.clone()).collect();
        self.enhancer.suggest_flags(&content, &flag_names).await
    }
}

fn score_predefined(
    category: Option<Category>,
    normalized_name: &str,
    subject: &str,
    body: &str,
    sender: &str,
    domain: &str,
) -> f64 {
    let mut score = 0.0;

    if let Some(category) = category {
        let table = keyword_table(category);

        let subject_matches = table.subject.iter().filter(|k| subject.contains(*k)).count();
        if subject_matches > 0 {
            score += (subject_matches as f64 * 0.2).min(0.5);
        }

        let body_matches = table.body.iter().filter(|k| body.contains(*k)).count();
        if body_matches > 0 {
            score += (body_matches as f64 * 0.15).min(0.4);
        }

        let sender_matches = table.sender.iter().filter(|k| sender.contains(*k)).count();
        if sender_matches > 0 {
            score += (sender_matches as f64 * 0.1).min(0.2);
        }

        let domain_matches = table.domain.iter().filter(|k| domain.contains(*k)).count();
        if domain_matches > 0 {
            score += (domain_matches as f64 * 0.05).min(0.1);
        }

        score += pattern_bonus(category, subject, body, sender) * 0.3;
    }

    if normalized_name == "urgent" {
        score += urgency_score(subject, body) * 0.3;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubEnhancer {
        keywords: Vec<String>,
    }

    impl StubEnhancer {
        fn unavailable() -> Self {
            Self { keywords: Vec::new() }
        }
    }

    #[async_trait]
    impl KeywordEnhancer for StubEnhancer {
        fn is_available(&self) -> bool {
            !self.keywords.is_empty()
        }

        async fn enhance_keywords(&self, _: &str, _: &str, _: &str) -> Vec<String> {
            self.keywords.clone()
        }

        async fn suggest_flags(&self, _: &str, _: &[String]) -> Vec<FlagSuggestion> {
            Vec::new()
        }
    }

    fn message(subject: &str, from: &str, body: &str) -> EmailMessage {
        EmailMessage {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
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

    #[test]
    fn test_strategy_dispatch() {
        assert_eq!(
            ScoringStrategy::for_flag(&flag("Urgent", "High Priority Emails")),
            ScoringStrategy::Predefined(Some(Category::Urgent)),
        );
        assert_eq!(
            ScoringStrategy::for_flag(&flag("Receipts", "")),
            ScoringStrategy::Predefined(None),
        );
        assert_eq!(
            ScoringStrategy::for_flag(&flag("Receipts", "order receipts and invoices")),
            ScoringStrategy::Custom("order receipts and invoices".to_string()),
        );
    }

    #[test]
    fn test_normalize_flag_name() {
        assert_eq!(normalize_flag_name("Follow Up"), "follow-up");
        assert_eq!(normalize_flag_name("follow_up"), "follow-up");
        assert_eq!(normalize_flag_name("JUNK"), "junk");
    }

    #[test]
    fn test_fuzzy_contains_plural_both_ways() {
        assert!(fuzzy_contains("your invoices are attached", "invoice"));
        assert!(fuzzy_contains("the invoice is attached", "invoices"));
        assert!(!fuzzy_contains("nothing relevant here", "invoice"));
    }

    #[test]
    fn test_urgency_score_components() {
        let score = urgency_score("urgent: respond today!!!", "deadline is near");
        // urgent 0.3 + deadline 0.2 + !!! 0.2 + today 0.15 + deadline-pattern 0.15
        assert!(score > 0.9);
        assert!(score <= 1.0);
        assert_eq!(urgency_score("hello", "nothing pressing"), 0.0);
    }

    #[test]
    fn test_marketing_sender_pattern_bonus() {
        let with_sender = pattern_bonus(Category::Junk, "weekly newsletter", "", "noreply@shop.com");
        let without = pattern_bonus(Category::Junk, "weekly newsletter", "", "friend@shop.com");
        assert!(with_sender > without);
    }

    #[tokio::test]
    async fn test_urgent_default_description_example() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message("URGENT: deadline today!!!", "boss@co.com", "Need this now.");
        let flags = vec![flag("Urgent", "high priority emails")];

        let (winner, confidence) = categorizer.categorize(&msg, &flags).await;
        assert_eq!(winner.as_deref(), Some("Urgent"));
        assert!(confidence >= CONFIDENCE_THRESHOLD);
        assert!(confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_newsletter_scores_below_threshold_for_default_flags() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message("Weekly Newsletter", "noreply@shop.com", "This week's picks.");
        let flags = vec![
            flag("Follow-up", "emails requiring follow-up"),
            flag("Important", "important business emails"),
            flag("Urgent", "high priority emails"),
        ];

        let (winner, confidence) = categorizer.categorize(&msg, &flags).await;
        assert_eq!(winner, None);
        assert_eq!(confidence, 0.0);
    }

    #[tokio::test]
    async fn test_junk_flag_catches_marketing_mail() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message(
            "Weekly Newsletter: 20% discount inside",
            "noreply@shop.com",
            "Unsubscribe at any time.",
        );
        let flags = vec![flag("Junk", "marketing and promotional emails")];

        let (winner, confidence) = categorizer.categorize(&msg, &flags).await;
        assert_eq!(winner.as_deref(), Some("Junk"));
        assert!(confidence >= CONFIDENCE_THRESHOLD);
        assert_eq!(normalize_flag_name("Junk"), "junk");
    }

    #[tokio::test]
    async fn test_custom_description_fuzzy_match() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message("", "someone@example.com", "your invoices are due this month");
        let flags = vec![flag("Billing", "invoice payments")];

        // "invoice" fuzzy-matches "invoices"; 1 of 2 keywords at body
        // weight 0.3 lands exactly on the threshold.
        let (winner, confidence) = categorizer.categorize(&msg, &flags).await;
        assert_eq!(winner.as_deref(), Some("Billing"));
        assert!((confidence - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_enhanced_keywords_raise_weights() {
        let plain = StubEnhancer::unavailable();
        let enhanced = StubEnhancer {
            keywords: vec!["invoice".to_string(), "billing".to_string()],
        };
        let msg = message(
            "invoice for march",
            "someone@example.com",
            "billing statement attached",
        );
        let flags = vec![flag("Money", "invoice billing")];

        let (_, base) = Categorizer::new(&plain).categorize(&msg, &flags).await;
        let (_, boosted) = Categorizer::new(&enhanced).categorize(&msg, &flags).await;
        assert!(boosted > base);
    }

    #[tokio::test]
    async fn test_tie_break_prefers_first_flag() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message("", "someone@example.com", "the invoice is attached");
        let flags = vec![
            flag("Alpha", "invoice tracking"),
            flag("Beta", "invoice tracking"),
        ];

        let (winner, _) = categorizer.categorize(&msg, &flags).await;
        assert_eq!(winner.as_deref(), Some("Alpha"));
    }

    #[tokio::test]
    async fn test_empty_flag_set_returns_none() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message("anything", "a@b.c", "at all");

        let (winner, confidence) = categorizer.categorize(&msg, &[]).await;
        assert_eq!(winner, None);
        assert_eq!(confidence, 0.0);
    }

    #[tokio::test]
    async fn test_confidence_capped_at_one() {
        let enhancer = StubEnhancer::unavailable();
        let categorizer = Categorizer::new(&enhancer);
        let msg = message(
            "urgent asap immediate emergency critical deadline rush priority!!!",
            "boss@emergency.com",
            "urgent asap immediately emergency critical deadline rush priority time-sensitive due today",
        );
        let flags = vec![flag("Urgent", "high priority emails")];

        let (winner, confidence) = categorizer.categorize(&msg, &flags).await;
        assert_eq!(winner.as_deref(), Some("Urgent"));
        assert!(confidence <= 1.0);
    }
}
