//! Per-message reaction sub-fetch.

use grouplog_client::RawReaction;
use grouplog_store::{CanonicalMessage, ReactionRecord, Store};
use tracing::debug;

use crate::classifier::participant_from;
use crate::error::StageError;
use crate::governor::Channel;
use crate::remote::Remote;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactionSummary {
    pub fetched: usize,
    /// New rows; re-fetching the same reactions inserts nothing.
    pub inserted: usize,
}

/// Stored emoji key: the emoji itself, or `custom:{id}` for custom ones.
fn emoji_key(reaction: &RawReaction) -> Option<String> {
    match (&reaction.emoji, reaction.custom_emoji_id) {
        (Some(emoji), _) if !emoji.is_empty() => Some(emoji.clone()),
        (_, Some(id)) => Some(format!("custom:{}", id)),
        _ => None,
    }
}

/// Fetch the reactions on `message` and persist the new ones.
pub async fn fetch_reactions(
    remote: &Remote<'_>,
    store: &Store,
    message: &CanonicalMessage,
) -> Result<ReactionSummary, StageError> {
    let api = remote.api;
    let (conversation_id, message_id) = (message.conversation_id, message.message_id);
    let reactions = remote
        .call(Channel::Reactions, || api.reactions(conversation_id, message_id))
        .await?;

    let mut summary = ReactionSummary {
        fetched: reactions.len(),
        inserted: 0,
    };
    for reaction in &reactions {
        let Some(emoji) = emoji_key(reaction) else {
            debug!(message_id, user_id = reaction.user.id, "reaction without emoji, skipping");
            continue;
        };
        store.upsert_participant(&participant_from(&reaction.user)).await?;
        let inserted = store
            .insert_reaction(&ReactionRecord {
                conversation_id,
                message_id,
                user_id: reaction.user.id,
                emoji,
                reacted_at: reaction.date,
            })
            .await?;
        if inserted {
            summary.inserted += 1;
        }
    }
    Ok(summary)
}
