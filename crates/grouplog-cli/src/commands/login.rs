use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use grouplog_auth::{AuthError, Credential};
use grouplog_core::{AuthOutcome, AuthSecret, Challenge, IngestError};

use crate::commands::App;
use crate::ui;

const TOKEN_POLL: Duration = Duration::from_secs(3);

fn report(credential: &Credential) {
    ui::success(&format!("Signed in as {}", credential.account));
    if let Some(username) = &credential.username {
        ui::info(&ui::dim(&format!("@{} (user {})", username, credential.user_id)));
    }
}

/// Sign in with a one-time code, prompting for the second factor if needed.
pub async fn run(phone: &str) -> Result<()> {
    let app = App::open().await?;
    let accounts = app.accounts();

    let spinner = ui::spinner("Requesting code...");
    let challenge = accounts.add_account_with_code(phone).await;
    spinner.finish_and_clear();
    let challenge = challenge?;

    let code = ui::prompt_input("Code")?;
    let outcome = accounts
        .finish_add_account(
            &challenge,
            AuthSecret::Code {
                code: code.trim().to_string(),
                password: None,
            },
        )
        .await?;

    let credential = match outcome {
        AuthOutcome::Authorized(credential) => credential,
        AuthOutcome::PasswordNeeded(second) => {
            let password = ui::prompt_password("Two-step verification password")?;
            match accounts
                .finish_add_account(&second, AuthSecret::Password(password))
                .await?
            {
                AuthOutcome::Authorized(credential) => credential,
                AuthOutcome::PasswordNeeded(_) => return Err(anyhow!("password was not accepted")),
            }
        }
    };
    report(&credential);
    Ok(())
}

/// Sign in by scanning a login link from an already signed-in device.
pub async fn run_token() -> Result<()> {
    let app = App::open().await?;
    let accounts = app.accounts();
    let challenge = accounts.add_account_with_token().await?;

    let url = challenge
        .login_url()
        .ok_or_else(|| anyhow!("login token missing"))??;
    ui::header("Open this link on a signed-in device (Settings → Devices → Link Desktop Device):");
    println!("    {}", url);
    println!();

    let deadline = match &challenge {
        Challenge::Token { token, .. } => token.expires_at,
        _ => Utc::now(),
    };
    let spinner = ui::spinner("Waiting for the link to be scanned...");
    loop {
        match accounts.finish_add_account(&challenge, AuthSecret::Scanned).await {
            Ok(AuthOutcome::Authorized(credential)) => {
                spinner.finish_and_clear();
                report(&credential);
                return Ok(());
            }
            Ok(AuthOutcome::PasswordNeeded(_)) => {
                spinner.finish_and_clear();
                return Err(anyhow!("second factor is not supported for link sign-in"));
            }
            Err(IngestError::Auth(AuthError::Pending)) if Utc::now() < deadline => {
                tokio::time::sleep(TOKEN_POLL).await;
            }
            Err(IngestError::Auth(AuthError::Pending)) => {
                spinner.finish_and_clear();
                return Err(anyhow!("login link expired; run login-qr again"));
            }
            Err(e) => {
                spinner.finish_and_clear();
                return Err(e.into());
            }
        }
    }
}
