use anyhow::Result;

use crate::commands::App;
use crate::ui;

/// Hide one message from queries; the row stays so reruns do not bring it back.
pub async fn message(conversation_id: i64, message_id: i64) -> Result<()> {
    let app = App::open().await?;
    if app.store.soft_delete_message(conversation_id, message_id).await? {
        ui::success(&format!("Message {} in {} deleted.", message_id, conversation_id));
    } else {
        ui::warn(&format!("No message {} in {}.", message_id, conversation_id));
    }
    Ok(())
}

/// Hide a participant and everything they sent.
pub async fn participant(user_id: i64) -> Result<()> {
    let app = App::open().await?;
    if app.store.soft_delete_participant(user_id).await? {
        ui::success(&format!("Participant {} deleted.", user_id));
    } else {
        ui::warn(&format!("No participant {}.", user_id));
    }
    Ok(())
}
