use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gmail account the sorter operates on. When left empty, commands
    /// that authenticate fall back to the profile's address.
    pub account: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    /// Gemini API key; keyword enhancement is disabled when unset.
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub sort: SortConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    /// Gmail search query selecting the messages to sort.
    #[serde(default = "default_query")]
    pub query: String,
    /// Upper bound on messages fetched per run.
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    /// Delay between Gmail API calls, to stay under rate limits.
    #[serde(default = "default_api_delay_ms")]
    pub api_delay_ms: u64,
}

fn default_database_url() -> String {
    "sqlite:gsort.db?mode=rwc".to_string()
}

fn default_credentials_path() -> String {
    "credentials.json".to_string()
}

fn default_query() -> String {
    "in:inbox".to_string()
}

fn default_max_messages() -> u32 {
    100
}

fn default_api_delay_ms() -> u64 {
    100
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
            max_messages: default_max_messages(),
            api_delay_ms: default_api_delay_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: String::new(),
            database_url: default_database_url(),
            credentials_path: default_credentials_path(),
            gemini_api_key: None,
            sort: SortConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        use std::fs;
        if let Ok(content) = fs::read_to_string("settings.toml") {
            if let Ok(config) = toml::from_str(&content) {
                return config;
            }
        }
        Self::default()
    }
}
