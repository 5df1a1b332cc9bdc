use anyhow::Result;
use chrono::{DateTime, Utc};
use grouplog_store::MessageQuery;

use crate::commands::App;
use crate::ui;

pub struct MessagesArgs {
    pub conversation_id: i64,
    pub tag: Option<String>,
    pub mentions: bool,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
    pub json: bool,
}

pub async fn run(args: MessagesArgs) -> Result<()> {
    let app = App::open().await?;
    let query = MessageQuery {
        tag: args.tag,
        has_mention: args.mentions.then_some(true),
        since: args.since,
        limit: Some(args.limit),
        ..MessageQuery::conversation(args.conversation_id)
    };
    let messages = app.store.messages(&query).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        ui::info(&ui::dim("No matching messages."));
        return Ok(());
    }

    for message in &messages {
        let sender = match message.sender_id {
            Some(id) => match app.store.participant(id).await? {
                Some(p) => p.display_name(),
                None => id.to_string(),
            },
            None => "channel".to_string(),
        };
        let text = message
            .body
            .as_deref()
            .or(message.caption.as_deref())
            .unwrap_or("");
        println!(
            "{} {:<20} [{}] {}",
            ui::dim(&message.sent_at.format("%Y-%m-%d %H:%M").to_string()),
            sender,
            message.category.as_str(),
            text.lines().next().unwrap_or("")
        );
    }
    Ok(())
}
