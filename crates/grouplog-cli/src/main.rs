use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

mod commands;
mod paths;
mod ui;

use commands::{ingest::IngestArgs, messages::MessagesArgs, parse_date};

#[derive(Parser)]
#[command(name = "grouplog")]
#[command(about = "Archive group conversations into a local database.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a code sent to the phone
    Login {
        #[arg(value_name = "PHONE")]
        phone: String,
    },

    /// Sign in by scanning a link from a signed-in device
    LoginQr,

    /// List signed-in accounts
    Accounts {
        #[arg(long)]
        json: bool,
    },

    /// Check an account's session and show its ingestion history
    Status {
        #[arg(value_name = "ACCOUNT")]
        account: String,
        #[arg(long)]
        json: bool,
    },

    /// Check that an account can read a conversation
    Validate {
        #[arg(value_name = "ACCOUNT")]
        account: String,
        /// Numeric id, @handle or invite link
        #[arg(value_name = "CONVERSATION", allow_negative_numbers = true)]
        conversation: String,
    },

    /// Fetch new messages from a conversation
    Ingest {
        /// Numeric id, @handle or invite link
        #[arg(value_name = "CONVERSATION", allow_negative_numbers = true)]
        conversation: String,
        /// Account to read with
        #[arg(long, short)]
        account: String,
        /// Start here instead of the stored position (YYYY-MM-DD or RFC 3339)
        #[arg(long, value_parser = parse_date)]
        since: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_date)]
        until: Option<DateTime<Utc>>,
        /// Walk the whole history again
        #[arg(long)]
        full: bool,
        #[arg(long)]
        no_reactions: bool,
        /// Skip attachment downloads
        #[arg(long)]
        no_media: bool,
        /// Use the account's long-lived connection instead of a throwaway one
        #[arg(long)]
        primary: bool,
        /// Emit machine-readable progress and result lines
        #[arg(long)]
        json: bool,
    },

    /// Show stored messages
    Messages {
        #[arg(value_name = "CONVERSATION_ID", allow_negative_numbers = true)]
        conversation_id: i64,
        #[arg(long)]
        tag: Option<String>,
        /// Only messages that mention someone
        #[arg(long)]
        mentions: bool,
        #[arg(long, value_parser = parse_date)]
        since: Option<DateTime<Utc>>,
        #[arg(long, short = 'n', default_value = "50")]
        limit: u32,
        #[arg(long)]
        json: bool,
    },

    /// Sign out and forget an account
    RemoveAccount {
        #[arg(value_name = "ACCOUNT")]
        account: String,
        /// Skip confirmation
        #[arg(long, short)]
        yes: bool,
    },

    /// Soft-delete a stored message
    DeleteMessage {
        #[arg(allow_negative_numbers = true)]
        conversation_id: i64,
        message_id: i64,
    },

    /// Soft-delete a participant and hide their messages
    DeleteParticipant { user_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Debug logs stay hidden unless RUST_LOG asks for them
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Login { phone } => commands::login::run(&phone).await,
        Commands::LoginQr => commands::login::run_token().await,
        Commands::Accounts { json } => commands::accounts::list(json).await,
        Commands::Status { account, json } => commands::accounts::status(&account, json).await,
        Commands::Validate {
            account,
            conversation,
        } => commands::accounts::validate(&account, &conversation).await,
        Commands::Ingest {
            conversation,
            account,
            since,
            until,
            full,
            no_reactions,
            no_media,
            primary,
            json,
        } => {
            commands::ingest::run(IngestArgs {
                conversation,
                account,
                since,
                until,
                full,
                no_reactions,
                no_media,
                primary,
                json,
            })
            .await
        }
        Commands::Messages {
            conversation_id,
            tag,
            mentions,
            since,
            limit,
            json,
        } => {
            commands::messages::run(MessagesArgs {
                conversation_id,
                tag,
                mentions,
                since,
                limit,
                json,
            })
            .await
        }
        Commands::RemoveAccount { account, yes } => commands::accounts::remove(&account, yes).await,
        Commands::DeleteMessage {
            conversation_id,
            message_id,
        } => commands::delete::message(conversation_id, message_id).await,
        Commands::DeleteParticipant { user_id } => commands::delete::participant(user_id).await,
    }
}
