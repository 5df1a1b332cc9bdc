use anyhow::Result;
use console::style;
use grouplog_auth::{normalize_account, AccountStatus, Credential};
use serde_json::json;

use crate::commands::App;
use crate::ui;

fn status_label(status: Option<AccountStatus>) -> String {
    match status {
        Some(AccountStatus::Active) => style("active").green().to_string(),
        Some(AccountStatus::Expired) => style("expired").red().to_string(),
        Some(AccountStatus::Unavailable) => style("unavailable").yellow().to_string(),
        None => ui::dim("unchecked"),
    }
}

// Session blobs never leave the credentials file.
fn public_view(credential: &Credential) -> serde_json::Value {
    json!({
        "account": credential.account,
        "user_id": credential.user_id,
        "username": credential.username,
        "status": credential.status.map(|s| s.as_str()),
        "status_checked_at": credential.status_checked_at,
        "created_at": credential.created_at,
        "last_used_at": credential.last_used_at,
    })
}

pub async fn list(json: bool) -> Result<()> {
    let app = App::open().await?;
    let accounts = app.accounts().list_accounts().await;

    if json {
        let views: Vec<_> = accounts.iter().map(public_view).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if accounts.is_empty() {
        ui::info("No accounts yet. Add one with:");
        println!("    grouplog login <phone>");
        return Ok(());
    }

    ui::header("Accounts");
    for credential in &accounts {
        let username = credential
            .username
            .as_deref()
            .map(|u| format!("@{}", u))
            .unwrap_or_default();
        println!(
            "  {:<18} {:<20} {}",
            credential.account,
            username,
            status_label(credential.status)
        );
    }
    println!();
    Ok(())
}

/// Round-trip status check plus the last run of every conversation the
/// account has ingested.
pub async fn status(account: &str, json: bool) -> Result<()> {
    let app = App::open().await?;
    let status = app.sessions.check_status(account).await?;

    let key = normalize_account(account);
    let runs: Vec<_> = app
        .store
        .fetch_states()
        .await?
        .into_iter()
        .filter(|state| state.account == key)
        .collect();

    if json {
        let out = json!({
            "account": key,
            "status": status.as_str(),
            "runs": runs,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}  {}", style(&key).bold(), status_label(Some(status)));
    if status == AccountStatus::Expired {
        ui::warn("Session expired. Sign in again with `grouplog login`.");
    }

    if runs.is_empty() {
        ui::info(&ui::dim("No ingestion runs yet."));
        println!();
        return Ok(());
    }

    println!();
    for state in &runs {
        let title = match app.store.conversation(state.conversation_id).await? {
            Some(conversation) => conversation.title,
            None => state.conversation_id.to_string(),
        };
        let outcome = state.status.map(|s| s.as_str()).unwrap_or("never run");
        let finished = state
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<28} {:<16} {:>6} new {:>6} skipped {:>4} errors  {}",
            title,
            outcome,
            state.counts.processed,
            state.counts.skipped,
            state.counts.errored,
            ui::dim(&finished)
        );
    }
    println!();
    Ok(())
}

pub async fn validate(account: &str, conversation: &str) -> Result<()> {
    let app = App::open().await?;
    let spinner = ui::spinner(&format!("Resolving {}...", conversation));
    let resolved = app.sessions.validate_conversation(account, conversation).await;
    spinner.finish_and_clear();

    match resolved {
        Ok(raw) => {
            ui::success(&format!("{} is readable ({})", raw.title, raw.id));
            if let Some(count) = raw.participants_count {
                ui::info(&ui::dim(&format!("{} participants", count)));
            }
            Ok(())
        }
        Err(e) => {
            ui::error(&format!("Cannot read {}: {}", conversation, e));
            Err(e.into())
        }
    }
}

pub async fn remove(account: &str, yes: bool) -> Result<()> {
    let app = App::open().await?;
    let service = app.accounts();

    if !yes && !ui::prompt_confirm(&format!("Remove {} and forget its session?", account))? {
        ui::info("Cancelled.");
        return Ok(());
    }

    service.remove_account(account).await?;
    ui::success(&format!("{} removed.", account));
    ui::info("Ingested messages stay in the database.");
    Ok(())
}
