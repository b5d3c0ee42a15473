use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against sender or subject in the processing log.");
        std::process::exit(1);
    }

    let query = &args[1];
    let search_term = format!("%{}%", query);

    let database_url = "sqlite://gsort.db";
    let pool = SqlitePoolOptions::new()
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let rows = sqlx::query(
        "SELECT session_id, email_id, email_from, email_subject, assigned_label,
                confidence_score, status, error_details
         FROM email_processing_log
         WHERE email_from LIKE ? OR email_subject LIKE ?
         ORDER BY id DESC
         LIMIT 20",
    )
    .bind(&search_term)
    .bind(&search_term)
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("No log entries found matching '{}'", query);
        return Ok(());
    }

    for row in rows {
        let session_id: String = row.get(0);
        let email_id: String = row.get(1);
        let from: Option<String> = row.get(2);
        let subject: Option<String> = row.get(3);
        let label: Option<String> = row.get(4);
        let confidence: f64 = row.get(5);
        let status: String = row.get(6);
        let error: Option<String> = row.get(7);

        println!("Session: {}", session_id);
        println!("Message: {}", email_id);
        println!("From: {:?}", from);
        println!("Subject: {:?}", subject);
        println!(
            "Outcome: {} -> {:?} (confidence {:.2})",
            status, label, confidence
        );
        if let Some(error) = error {
            println!("Error: {}", error);
        }
        println!(
            "--------------------------------------------------------------------------------"
        );
    }

    Ok(())
}
