use crate::{
    chat::{ChatSession, PairKey},
    entity::UserId,
    error::{ChatError, Result},
    store::Store,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error, info};

/// Finds the chat shared by two users, creating it on first contact.
///
/// Creation is serialized per unordered pair: concurrent first contacts of the
/// same two users wait on one lock and the later ones find the chat created by
/// the first. The storage layer additionally rejects a second chat for a pair;
/// that conflict is answered by re-reading the existing chat.
pub struct ChatResolver {
    store: Store,
    pair_locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatResolver {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, a: UserId, b: UserId) -> Result<ChatSession> {
        if a == b {
            return Err(ChatError::validation("a chat needs two distinct users"));
        }
        self.store.get_user_by_id(a).await?;
        self.store.get_user_by_id(b).await?;

        if let Some(chat) = self.find_shared(a, b).await? {
            return Ok(chat);
        }

        let key = PairKey::new(a, b);
        let lock = self.pair_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.create_if_missing(a, b).await
        };
        drop(lock);
        self.release_pair_lock(key);

        result
    }

    async fn create_if_missing(&self, a: UserId, b: UserId) -> Result<ChatSession> {
        if let Some(chat) = self.find_shared(a, b).await? {
            return Ok(chat);
        }

        match self.store.create_chat(a, b).await {
            Ok(chat) => {
                info!(chat_id = %chat.id, user_a = %a, user_b = %b, "created chat");
                Ok(chat)
            }
            Err(ChatError::Conflict(reason)) => {
                debug!(%reason, "chat created concurrently, re-reading");
                self.find_shared(a, b)
                    .await?
                    .ok_or(ChatError::Conflict(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Intersects both users' chat sets. More than one shared chat breaks the
    /// one-chat-per-pair invariant and is reported instead of resolved.
    async fn find_shared(&self, a: UserId, b: UserId) -> Result<Option<ChatSession>> {
        let chats_a = self.store.get_user_chats(a).await?;
        let chats_b: HashSet<_> = self
            .store
            .get_user_chats(b)
            .await?
            .into_iter()
            .map(|chat| chat.id)
            .collect();

        let mut shared: Vec<ChatSession> = chats_a
            .into_iter()
            .filter(|chat| chats_b.contains(&chat.id))
            .collect();

        match shared.len() {
            0 => Ok(None),
            1 => Ok(shared.pop()),
            n => {
                let ids: Vec<String> = shared.iter().map(|c| c.id.to_string()).collect();
                error!(user_a = %a, user_b = %b, chats = ?ids, "users share {} chats", n);
                Err(ChatError::Inconsistent(format!(
                    "users {} and {} share {} chats",
                    a, b, n
                )))
            }
        }
    }

    fn pair_lock(&self, key: PairKey) -> Arc<tokio::sync::Mutex<()>> {
        self.pair_locks.lock().entry(key).or_default().clone()
    }

    /// Drops the lock entry once no task holds or waits on it. Clones are only
    /// made under the map lock, so a strong count of one means the map owns the
    /// last reference.
    fn release_pair_lock(&self, key: PairKey) {
        let mut locks = self.pair_locks.lock();
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    fn pending_locks(&self) -> usize {
        self.pair_locks.lock().len()
    }
}
