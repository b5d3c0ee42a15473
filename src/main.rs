mod auth;
mod categorize;
mod config;
mod db;
mod gemini;
mod gmail;
mod models;
mod reconcile;
mod run;

use crate::categorize::Categorizer;
use crate::config::Config;
use crate::gemini::{GeminiClient, KeywordEnhancer};
use crate::gmail::{GmailClient, MailProvider};
use crate::models::Flag;
use crate::run::{Dispatcher, RunKind, RunRequest, Runner};
use anyhow::{Context, bail};
use google_gmail1::Gmail;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let debug_logging = std::env::args().any(|arg| arg == "--debug");

    tracing_subscriber::fmt()
        .with_max_level(if debug_logging {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    // Handle token reset
    if std::env::args().any(|arg| arg == "--reset-token") {
        auth::RingStorage.clear_token().await?;
        println!("Token cleared. Please restart without --reset-token to re-authenticate.");
        return Ok(());
    }

    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| !arg.starts_with("--"))
        .collect();
    let command = args.first().map(String::as_str).unwrap_or("status");

    let db = Arc::new(db::Database::new(&config.database_url).await?);
    db.run_migrations().await?;

    let account = config.account.clone();
    let require_account = || -> anyhow::Result<&str> {
        if account.is_empty() {
            bail!("No account configured; set `account` in settings.toml");
        }
        Ok(account.as_str())
    };

    match command {
        "flags" => {
            let email = require_account()?;
            for flag in db.get_all_flags(email).await? {
                let marker = if flag.is_active { "*" } else { " " };
                println!("{} {} ({}) - {}", marker, flag.name, flag.color, flag.description);
            }
        }
        "flag" => {
            let email = require_account()?;
            let name = args.get(1).context("Usage: gsort flag <name> <description> <color> [--inactive]")?;
            let description = args.get(2).cloned().unwrap_or_default();
            let color = args.get(3).cloned().unwrap_or_else(|| "#808080".to_string());
            let is_active = !std::env::args().any(|arg| arg == "--inactive");
            db.upsert_flag(
                email,
                &Flag {
                    name: name.clone(),
                    description,
                    color,
                    is_active,
                },
            )
            .await?;
            println!("Saved flag '{}'", name);
        }
        "status" => {
            let email = require_account()?;
            match db.latest_session(email).await? {
                Some(session) => print_session(&session),
                None => println!("No sessions yet"),
            }
        }
        "history" => {
            let email = require_account()?;
            let limit: i64 = args
                .get(1)
                .and_then(|n| n.parse().ok())
                .unwrap_or(10);
            for session in db.session_history(email, limit).await? {
                print_session(&session);
            }
        }
        "session" => {
            let session_id = args.get(1).context("Usage: gsort session <session-id>")?;
            let session = db
                .get_session(session_id)
                .await?
                .context("No such session")?;
            print_session(&session);
            for (id, subject, from, label, confidence, status) in
                db.session_log(session_id).await?
            {
                println!(
                    "  [{}] {} {:.2} {} <- {} / {}",
                    status,
                    label.as_deref().unwrap_or("-"),
                    confidence,
                    id,
                    from.as_deref().unwrap_or("?"),
                    subject.as_deref().unwrap_or("(no subject)"),
                );
            }
        }
        "sort" | "revert" => {
            let client = build_gmail_client(&config).await?;
            let email = resolve_account(&config, &client).await?;
            let enhancer: Arc<dyn KeywordEnhancer> =
                Arc::new(GeminiClient::new(config.gemini_api_key.clone()));
            let runner = Runner::new(db.clone(), Arc::new(client), enhancer, config.sort.clone());
            let (dispatcher, worker) = Dispatcher::spawn(runner);

            let kind = if command == "sort" {
                RunKind::Sort
            } else {
                RunKind::Revert
            };
            dispatcher
                .enqueue(RunRequest {
                    email: email.clone(),
                    kind,
                })
                .await?;
            drop(dispatcher);
            worker.await?;

            match db.latest_session(&email).await? {
                Some(session) => print_session(&session),
                None => println!("Run finished without a session record"),
            }
        }
        "suggest" => {
            let message_id = args.get(1).context("Usage: gsort suggest <message-id>")?;
            let client = build_gmail_client(&config).await?;
            let email = resolve_account(&config, &client).await?;
            let enhancer = GeminiClient::new(config.gemini_api_key.clone());
            if !enhancer.is_available() {
                bail!("AI suggestions need `gemini_api_key` in settings.toml");
            }

            let message = client.fetch_message(message_id).await?;
            let flags = db.get_active_flags(&email).await?;
            let categorizer = Categorizer::new(&enhancer);
            let suggestions = categorizer.flag_suggestions(&message, &flags).await;
            if suggestions.is_empty() {
                println!("No suggestions");
            }
            for suggestion in suggestions {
                println!(
                    "{} ({:.2}) - {}",
                    suggestion.flag_name, suggestion.confidence, suggestion.reason
                );
            }
        }
        _ => {
            eprintln!(
                "Usage: gsort [--debug] <command>\n\
                 \n\
                 Commands:\n\
                 \x20 sort                                   sort the inbox into flag labels\n\
                 \x20 revert                                 undo the last completed sort\n\
                 \x20 status                                 latest session state\n\
                 \x20 history [n]                            recent sessions\n\
                 \x20 session <id>                           per-message log of one session\n\
                 \x20 flags                                  list configured flags\n\
                 \x20 flag <name> <desc> <color> [--inactive] save a flag\n\
                 \x20 suggest <message-id>                   AI flag suggestions for a message\n\
                 \x20 --reset-token                          clear the stored OAuth token"
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

/// The configured account, or the authenticated profile's address when
/// settings.toml leaves `account` unset.
async fn resolve_account(config: &Config, client: &GmailClient) -> anyhow::Result<String> {
    if config.account.is_empty() {
        client.profile_email().await
    } else {
        Ok(config.account.clone())
    }
}

async fn build_gmail_client(config: &Config) -> anyhow::Result<GmailClient> {
    let secret = auth::Authenticator::load_secret(&config.credentials_path).await?;
    let authenticator = auth::Authenticator::authenticate(secret).await?;

    // Force the OAuth flow up front so the first API call never stalls
    // on user interaction.
    authenticator
        .token(auth::SCOPES)
        .await
        .context("Failed to obtain Gmail token")?;

    let hub = Gmail::new(
        hyper::Client::builder().build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .expect("Failed to load native roots")
                .https_only()
                .enable_http1()
                .build(),
        ),
        authenticator,
    );

    Ok(GmailClient::new(hub))
}

fn print_session(session: &crate::models::SortingSession) {
    let when = session
        .start_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{} [{}] {} {}/{} flags: {}{}",
        session.session_id,
        session.status,
        when,
        session.processed_emails,
        session.total_emails,
        session.flags_used,
        session
            .error_message
            .as_deref()
            .map(|e| format!(" error: {}", e))
            .unwrap_or_default(),
    );
}
