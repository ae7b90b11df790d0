use crate::{
    chat::{ChatHistory, ChatId, ChatMessage, ChatSession, HistoryMessage, PairKey},
    entity::{User, UserId, UserInfo},
    error::{ChatError, Result as ChatResult},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};
use tracing::debug;
use uuid::Uuid;

/// An authenticated session token.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                pair_key TEXT NOT NULL UNIQUE,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_members (
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (chat_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_chat_members_user ON chat_members(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL REFERENCES users(id),
                content TEXT NOT NULL,
                created_at DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_created ON messages(chat_id, created_at, seq);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    /// Insert a new user. Fails with `Conflict` if the username is taken.
    pub async fn create_user(&self, username: &str, password_hash: &str) -> ChatResult<User> {
        let user = User {
            id: UserId::new(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, username, password_hash, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match ChatError::from(e) {
            ChatError::Conflict(_) => {
                ChatError::Conflict(format!("username {:?} is already taken", username))
            }
            other => other,
        })?;

        debug!(user_id = %user.id, username, "user created");
        Ok(user)
    }

    pub async fn get_user_by_id(&self, id: UserId) -> ChatResult<User> {
        sqlx::query(
            r#"
            SELECT id, username, password_hash, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| user_from_row(&row))
        .transpose()?
        .ok_or_else(|| ChatError::not_found(format!("user {}", id)))
    }

    pub async fn get_user_by_username(&self, username: &str) -> ChatResult<User> {
        sqlx::query(
            r#"
            SELECT id, username, password_hash, created_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| user_from_row(&row))
        .transpose()?
        .ok_or_else(|| ChatError::not_found(format!("user {:?}", username)))
    }

    // ---------------------------------------------------------------------
    // Chats
    // ---------------------------------------------------------------------

    /// Create a chat between two users.
    /// Fails with `Conflict` if the pair already has a chat.
    pub async fn create_chat(&self, a: UserId, b: UserId) -> ChatResult<ChatSession> {
        let chat = ChatSession::new(a, b);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chats (id, pair_key, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(chat.id.to_string())
        .bind(chat.pair_key().to_string())
        .bind(chat.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match ChatError::from(e) {
            ChatError::Conflict(_) => {
                ChatError::Conflict(format!("chat for pair {} already exists", chat.pair_key()))
            }
            other => other,
        })?;

        for member in chat.participants {
            sqlx::query("INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)")
                .bind(chat.id.to_string())
                .bind(member.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!(chat_id = %chat.id, pair = %chat.pair_key(), "chat created");
        Ok(chat)
    }

    /// All chats `user` participates in, oldest first.
    pub async fn get_user_chats(&self, user: UserId) -> ChatResult<Vec<ChatSession>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.created_at, other.user_id
            FROM chat_members me
            JOIN chats c ON c.id = me.chat_id
            JOIN chat_members other ON other.chat_id = c.id
            WHERE me.user_id = ?
            ORDER BY c.created_at ASC, c.id ASC
            "#,
        )
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await?;

        chats_from_rows(&rows)
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Persist a new message with the current time as its creation timestamp.
    pub async fn create_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        content: &str,
    ) -> ChatResult<ChatMessage> {
        let message = ChatMessage::new(chat_id, sender_id, content);
        self.insert_message(&message).await?;
        Ok(message)
    }

    /// Persist a fully built message, keeping its timestamp.
    pub async fn insert_message(&self, msg: &ChatMessage) -> ChatResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, sender_id, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(msg.id.to_string())
        .bind(msg.chat_id.to_string())
        .bind(msg.sender_id.to_string())
        .bind(&msg.content)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Messages of a chat ordered by creation time ascending, ties by insertion order.
    pub async fn get_chat_messages(&self, chat_id: ChatId) -> ChatResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_id, sender_id, content, created_at
            FROM messages
            WHERE chat_id = ?
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ChatMessage {
                    id: uuid_col(row, "id")?,
                    chat_id: ChatId(uuid_col(row, "chat_id")?),
                    sender_id: UserId(uuid_col(row, "sender_id")?),
                    content: row.try_get("content")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// A chat with participants and messages, each message annotated with its sender.
    pub async fn get_chat_history(&self, chat: &ChatSession) -> ChatResult<ChatHistory> {
        let mut participants = Vec::with_capacity(chat.participants.len());
        for id in chat.participants {
            participants.push(UserInfo::from(self.get_user_by_id(id).await?));
        }

        let messages = self
            .get_chat_messages(chat.id)
            .await?
            .into_iter()
            .map(|msg| {
                let sender = participants
                    .iter()
                    .find(|p| p.id == msg.sender_id)
                    .cloned()
                    .ok_or_else(|| {
                        ChatError::Inconsistent(format!(
                            "message {} in chat {} was sent by non-member {}",
                            msg.id, chat.id, msg.sender_id
                        ))
                    })?;
                Ok(HistoryMessage {
                    id: msg.id,
                    chat_id: msg.chat_id,
                    sender,
                    content: msg.content,
                    created_at: msg.created_at,
                })
            })
            .collect::<ChatResult<Vec<_>>>()?;

        Ok(ChatHistory {
            id: chat.id,
            participants,
            created_at: chat.created_at,
            messages,
        })
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    pub async fn create_session(&self, user_id: UserId, ttl: Duration) -> ChatResult<Session> {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ChatError::Internal(format!("invalid session ttl: {}", e)))?;
        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            user_id,
            created_at,
            expires_at: created_at + ttl,
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (token, user_id, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&session.token)
        .bind(session.user_id.to_string())
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn find_session(&self, token: &str) -> ChatResult<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT token, user_id, created_at, expires_at
            FROM sessions
            WHERE token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Session {
                token: row.try_get("token")?,
                user_id: UserId(uuid_col(&row, "user_id")?),
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    pub async fn delete_session(&self, token: &str) -> ChatResult<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn uuid_col(row: &SqliteRow, column: &str) -> ChatResult<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| {
        ChatError::Inconsistent(format!("column {} holds invalid uuid {:?}: {}", column, raw, e))
    })
}

fn user_from_row(row: &SqliteRow) -> ChatResult<User> {
    Ok(User {
        id: UserId(uuid_col(row, "id")?),
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Folds `(chat id, created_at, member)` rows into chats, keeping row order.
fn chats_from_rows(rows: &[SqliteRow]) -> ChatResult<Vec<ChatSession>> {
    let mut order = Vec::new();
    let mut members: HashMap<Uuid, (DateTime<Utc>, Vec<UserId>)> = HashMap::new();

    for row in rows {
        let id = uuid_col(row, "id")?;
        let member = UserId(uuid_col(row, "user_id")?);
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        members
            .entry(id)
            .or_insert_with(|| {
                order.push(id);
                (created_at, Vec::with_capacity(2))
            })
            .1
            .push(member);
    }

    order
        .into_iter()
        .map(|id| {
            let (created_at, users) = members.remove(&id).unwrap_or_default();
            match users.as_slice() {
                [a, b] => Ok(ChatSession {
                    id: ChatId(id),
                    participants: PairKey::new(*a, *b).members(),
                    created_at,
                }),
                other => Err(ChatError::Inconsistent(format!(
                    "chat {} has {} participants",
                    id,
                    other.len()
                ))),
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) async fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("courier-test.db")).await.unwrap();
    store.init().await.unwrap();
    (store, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let (store, _dir) = test_store().await;
        store.create_user("alice", "hash").await.unwrap();

        let err = store.create_user("alice", "other").await.unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn users_are_found_by_id_and_username() {
        let (store, _dir) = test_store().await;
        let alice = store.create_user("alice", "hash").await.unwrap();

        let by_id = store.get_user_by_id(alice.id).await.unwrap();
        let by_name = store.get_user_by_username("alice").await.unwrap();
        assert_eq!(by_id.id, alice.id);
        assert_eq!(by_name.id, alice.id);
        assert_eq!(by_name.password_hash, "hash");

        assert!(matches!(
            store.get_user_by_username("bob").await,
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            store.get_user_by_id(UserId::new()).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_chat_for_same_pair_is_rejected_by_storage() {
        let (store, _dir) = test_store().await;
        let a = store.create_user("alice", "h").await.unwrap();
        let b = store.create_user("bob", "h").await.unwrap();

        let chat = store.create_chat(a.id, b.id).await.unwrap();
        let err = store.create_chat(b.id, a.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)), "got {:?}", err);

        let chats = store.get_user_chats(a.id).await.unwrap();
        assert_eq!(chats, vec![chat]);
    }

    #[tokio::test]
    async fn user_chats_list_every_chat_with_both_participants() {
        let (store, _dir) = test_store().await;
        let a = store.create_user("alice", "h").await.unwrap();
        let b = store.create_user("bob", "h").await.unwrap();
        let c = store.create_user("carol", "h").await.unwrap();

        let ab = store.create_chat(a.id, b.id).await.unwrap();
        let ac = store.create_chat(a.id, c.id).await.unwrap();

        let chats = store.get_user_chats(a.id).await.unwrap();
        assert_eq!(chats.len(), 2);
        assert!(chats.contains(&ab) && chats.contains(&ac));
        assert_eq!(store.get_user_chats(b.id).await.unwrap(), vec![ab]);
    }

    #[tokio::test]
    async fn messages_come_back_in_timestamp_order() {
        let (store, _dir) = test_store().await;
        let a = store.create_user("alice", "h").await.unwrap();
        let b = store.create_user("bob", "h").await.unwrap();
        let chat = store.create_chat(a.id, b.id).await.unwrap();

        let at = |secs| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap();
        let mut third = ChatMessage::new(chat.id, a.id, "third");
        third.created_at = at(3);
        let mut first = ChatMessage::new(chat.id, b.id, "first");
        first.created_at = at(1);
        let mut second = ChatMessage::new(chat.id, a.id, "second");
        second.created_at = at(2);

        for msg in [&third, &first, &second] {
            store.insert_message(msg).await.unwrap();
        }

        let contents: Vec<String> = store
            .get_chat_messages(chat.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let (store, _dir) = test_store().await;
        let a = store.create_user("alice", "h").await.unwrap();
        let b = store.create_user("bob", "h").await.unwrap();
        let chat = store.create_chat(a.id, b.id).await.unwrap();

        let now = Utc::now();
        for content in ["one", "two", "three"] {
            let mut msg = ChatMessage::new(chat.id, a.id, content);
            msg.created_at = now;
            store.insert_message(&msg).await.unwrap();
        }

        let contents: Vec<String> = store
            .get_chat_messages(chat.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn history_annotates_each_message_with_sender() {
        let (store, _dir) = test_store().await;
        let a = store.create_user("alice", "h").await.unwrap();
        let b = store.create_user("bob", "h").await.unwrap();
        let chat = store.create_chat(a.id, b.id).await.unwrap();

        store.create_message(chat.id, a.id, "hi bob").await.unwrap();
        store.create_message(chat.id, b.id, "hi alice").await.unwrap();

        let history = store.get_chat_history(&chat).await.unwrap();
        assert_eq!(history.id, chat.id);
        assert_eq!(history.participants.len(), 2);
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[0].sender.username, "alice");
        assert_eq!(history.messages[1].sender.username, "bob");
    }

    #[tokio::test]
    async fn sessions_round_trip_and_delete() {
        let (store, _dir) = test_store().await;
        let a = store.create_user("alice", "h").await.unwrap();

        let session = store
            .create_session(a.id, Duration::from_secs(60))
            .await
            .unwrap();
        let found = store.find_session(&session.token).await.unwrap().unwrap();
        assert_eq!(found.user_id, a.id);
        assert!(found.expires_at > found.created_at);

        store.delete_session(&session.token).await.unwrap();
        assert!(store.find_session(&session.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_pool_surfaces_storage_error() {
        let (store, _dir) = test_store().await;
        store.close().await;

        let err = store.create_user("alice", "h").await.unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)), "got {:?}", err);
    }
}
