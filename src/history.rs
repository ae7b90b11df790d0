//! Read-only history projections. Never creates chats.

use crate::{chat::ChatHistory, entity::UserId, error::Result, store::Store};

/// The chat `me` shares with `username`, if any (zero or one entries).
pub async fn shared_with(store: &Store, me: UserId, username: &str) -> Result<Vec<ChatHistory>> {
    let peer = store.get_user_by_username(username).await?;

    let mut histories = Vec::new();
    for chat in store.get_user_chats(me).await? {
        if chat.peer_of(me) == Some(peer.id) {
            histories.push(store.get_chat_history(&chat).await?);
        }
    }
    Ok(histories)
}

/// Every chat `me` takes part in, oldest chat first.
pub async fn all_chats(store: &Store, me: UserId) -> Result<Vec<ChatHistory>> {
    let mut histories = Vec::new();
    for chat in store.get_user_chats(me).await? {
        histories.push(store.get_chat_history(&chat).await?);
    }
    Ok(histories)
}
