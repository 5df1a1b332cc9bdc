use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use crate::model::{
    CanonicalMessage, Category, ConversationRecord, FetchState, ItemErrorRecord, MediaFileRecord,
    MessageQuery, ParticipantRecord, ReactionRecord, RunCounts, RunStatus, StoredMessage,
    UpsertOutcome,
};

/// Timestamps are stored as second-precision RFC 3339 in UTC, which keeps
/// lexical and chronological order identical.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in store: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    conversation_id: i64,
    message_id: i64,
    sender_id: Option<i64>,
    sent_at: String,
    body: Option<String>,
    caption: Option<String>,
    category: String,
    has_attachment: bool,
    has_link: bool,
    has_sticker: bool,
    has_mention: bool,
    link: Option<String>,
    deep_link: String,
    grouped_id: Option<i64>,
    reply_to_message_id: Option<i64>,
    forwarded_from: Option<String>,
    soft_deleted: bool,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(StoredMessage {
            message_id: row.message_id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            sent_at: parse_ts(&row.sent_at)?,
            body: row.body,
            caption: row.caption,
            category: Category::from_str(&row.category).unwrap_or(Category::Unknown),
            has_attachment: row.has_attachment,
            has_link: row.has_link,
            has_sticker: row.has_sticker,
            has_mention: row.has_mention,
            link: row.link,
            deep_link: row.deep_link,
            grouped_id: row.grouped_id,
            reply_to_message_id: row.reply_to_message_id,
            forwarded_from: row.forwarded_from,
            soft_deleted: row.soft_deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FetchStateRow {
    conversation_id: i64,
    account: String,
    cursor_at: Option<String>,
    cursor_message_id: Option<i64>,
    processed: i64,
    skipped: i64,
    errored: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
    status: Option<String>,
}

impl TryFrom<FetchStateRow> for FetchState {
    type Error = anyhow::Error;

    fn try_from(row: FetchStateRow) -> Result<Self> {
        Ok(FetchState {
            conversation_id: row.conversation_id,
            account: row.account,
            cursor_at: parse_opt_ts(row.cursor_at)?,
            cursor_message_id: row.cursor_message_id,
            counts: RunCounts {
                processed: to_u64(row.processed),
                skipped: to_u64(row.skipped),
                errored: to_u64(row.errored),
            },
            started_at: parse_opt_ts(row.started_at)?,
            finished_at: parse_opt_ts(row.finished_at)?,
            status: row.status.as_deref().and_then(|s| RunStatus::from_str(s).ok()),
        })
    }
}

async fn write_participant(conn: &mut SqliteConnection, p: &ParticipantRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO participants (user_id, first_name, last_name, username, phone, is_bot, updated_at) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
        ON CONFLICT(user_id) DO UPDATE SET \
            first_name=excluded.first_name, \
            last_name=excluded.last_name, \
            username=excluded.username, \
            phone=COALESCE(excluded.phone, participants.phone), \
            is_bot=excluded.is_bot, \
            updated_at=excluded.updated_at",
    )
    .bind(p.user_id)
    .bind(&p.first_name)
    .bind(&p.last_name)
    .bind(&p.username)
    .bind(&p.phone)
    .bind(p.is_bot)
    .bind(ts(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// SQLite-backed persistence for conversations, participants, messages and
/// everything hanging off them.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS conversations (\
                id INTEGER PRIMARY KEY,\
                title TEXT NOT NULL,\
                handle TEXT,\
                last_fetch_position TEXT,\
                updated_at TEXT NOT NULL\
            )",
            "CREATE TABLE IF NOT EXISTS participants (\
                user_id INTEGER PRIMARY KEY,\
                first_name TEXT,\
                last_name TEXT,\
                username TEXT,\
                phone TEXT,\
                is_bot INTEGER NOT NULL DEFAULT 0,\
                soft_deleted INTEGER NOT NULL DEFAULT 0,\
                updated_at TEXT NOT NULL\
            )",
            "CREATE TABLE IF NOT EXISTS messages (\
                conversation_id INTEGER NOT NULL REFERENCES conversations(id),\
                message_id INTEGER NOT NULL,\
                sender_id INTEGER,\
                sent_at TEXT NOT NULL,\
                body TEXT,\
                caption TEXT,\
                category TEXT NOT NULL,\
                has_attachment INTEGER NOT NULL DEFAULT 0,\
                has_link INTEGER NOT NULL DEFAULT 0,\
                has_sticker INTEGER NOT NULL DEFAULT 0,\
                has_mention INTEGER NOT NULL DEFAULT 0,\
                link TEXT,\
                deep_link TEXT NOT NULL,\
                grouped_id INTEGER,\
                reply_to_message_id INTEGER,\
                forwarded_from TEXT,\
                soft_deleted INTEGER NOT NULL DEFAULT 0,\
                ingested_at TEXT NOT NULL,\
                PRIMARY KEY (conversation_id, message_id)\
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_sent ON messages(conversation_id, sent_at)",
            "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id)",
            "CREATE TABLE IF NOT EXISTS tags (\
                conversation_id INTEGER NOT NULL,\
                message_id INTEGER NOT NULL,\
                tag TEXT NOT NULL,\
                PRIMARY KEY (conversation_id, message_id, tag),\
                FOREIGN KEY (conversation_id, message_id) REFERENCES messages(conversation_id, message_id)\
            )",
            "CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag)",
            "CREATE TABLE IF NOT EXISTS mentions (\
                conversation_id INTEGER NOT NULL,\
                message_id INTEGER NOT NULL,\
                handle TEXT NOT NULL,\
                PRIMARY KEY (conversation_id, message_id, handle),\
                FOREIGN KEY (conversation_id, message_id) REFERENCES messages(conversation_id, message_id)\
            )",
            "CREATE TABLE IF NOT EXISTS reactions (\
                conversation_id INTEGER NOT NULL,\
                message_id INTEGER NOT NULL,\
                user_id INTEGER NOT NULL,\
                emoji TEXT NOT NULL,\
                reacted_at TEXT,\
                UNIQUE (conversation_id, message_id, user_id, emoji),\
                FOREIGN KEY (conversation_id, message_id) REFERENCES messages(conversation_id, message_id)\
            )",
            "CREATE TABLE IF NOT EXISTS media_files (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                conversation_id INTEGER NOT NULL,\
                message_id INTEGER NOT NULL,\
                file_id TEXT NOT NULL,\
                path TEXT NOT NULL,\
                size INTEGER,\
                mime_type TEXT,\
                category TEXT NOT NULL,\
                thumbnail_path TEXT,\
                downloaded_at TEXT NOT NULL,\
                UNIQUE (conversation_id, message_id, file_id),\
                FOREIGN KEY (conversation_id, message_id) REFERENCES messages(conversation_id, message_id)\
            )",
            "CREATE TABLE IF NOT EXISTS fetch_state (\
                conversation_id INTEGER NOT NULL,\
                account TEXT NOT NULL,\
                cursor_at TEXT,\
                cursor_message_id INTEGER,\
                processed INTEGER NOT NULL DEFAULT 0,\
                skipped INTEGER NOT NULL DEFAULT 0,\
                errored INTEGER NOT NULL DEFAULT 0,\
                started_at TEXT,\
                finished_at TEXT,\
                status TEXT,\
                PRIMARY KEY (conversation_id, account)\
            )",
            "CREATE TABLE IF NOT EXISTS guarded_actions (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                actor TEXT NOT NULL,\
                action TEXT NOT NULL,\
                target TEXT,\
                performed_at TEXT NOT NULL\
            )",
            "CREATE INDEX IF NOT EXISTS idx_guarded_actor ON guarded_actions(actor, performed_at)",
            "CREATE TABLE IF NOT EXISTS item_errors (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                conversation_id INTEGER NOT NULL,\
                message_id INTEGER,\
                stage TEXT NOT NULL,\
                error TEXT NOT NULL,\
                occurred_at TEXT NOT NULL\
            )",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- conversations & participants ----

    /// Insert or refresh a conversation's display fields. The fetch
    /// position is never touched here.
    pub async fn upsert_conversation(&self, conversation: &ConversationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (id, title, handle, updated_at) VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(id) DO UPDATE SET \
                title=excluded.title, \
                handle=excluded.handle, \
                updated_at=excluded.updated_at",
        )
        .bind(conversation.id)
        .bind(&conversation.title)
        .bind(&conversation.handle)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conversation(&self, id: i64) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, (i64, String, Option<String>, Option<String>)>(
            "SELECT id, title, handle, last_fetch_position FROM conversations WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, title, handle, position)| {
            Ok(ConversationRecord {
                id,
                title,
                handle,
                last_fetch_position: parse_opt_ts(position)?,
            })
        })
        .transpose()
    }

    pub async fn upsert_participant(&self, participant: &ParticipantRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_participant(&mut conn, participant).await
    }

    pub async fn participant(&self, user_id: i64) -> Result<Option<ParticipantRecord>> {
        let row = sqlx::query_as::<
            _,
            (i64, Option<String>, Option<String>, Option<String>, Option<String>, bool, bool),
        >(
            "SELECT user_id, first_name, last_name, username, phone, is_bot, soft_deleted \
            FROM participants WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(user_id, first_name, last_name, username, phone, is_bot, soft_deleted)| {
                ParticipantRecord {
                    user_id,
                    first_name,
                    last_name,
                    username,
                    phone,
                    is_bot,
                    soft_deleted,
                }
            },
        ))
    }

    // ---- messages ----

    /// Insert a message with its tags, mentions and sender as one
    /// transaction. An existing (conversation, message) key is left alone.
    #[instrument(skip(self, message), fields(conversation_id = message.conversation_id, message_id = message.message_id))]
    pub async fn upsert_message(&self, message: &CanonicalMessage) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM messages WHERE conversation_id = ?1 AND message_id = ?2",
        )
        .bind(message.conversation_id)
        .bind(message.message_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            debug!("message already stored");
            return Ok(UpsertOutcome::SkippedDuplicate);
        }

        sqlx::query(
            "INSERT INTO conversations (id, title, updated_at) VALUES (?1, '', ?2) \
            ON CONFLICT(id) DO NOTHING",
        )
        .bind(message.conversation_id)
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        if let Some(sender) = &message.sender {
            write_participant(&mut tx, sender).await?;
        }

        sqlx::query(
            "INSERT INTO messages (conversation_id, message_id, sender_id, sent_at, body, caption, \
                category, has_attachment, has_link, has_sticker, has_mention, link, deep_link, \
                grouped_id, reply_to_message_id, forwarded_from, ingested_at) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(message.conversation_id)
        .bind(message.message_id)
        .bind(message.sender.as_ref().map(|s| s.user_id))
        .bind(ts(message.sent_at))
        .bind(&message.body)
        .bind(&message.caption)
        .bind(message.category.as_str())
        .bind(message.has_attachment)
        .bind(message.has_link)
        .bind(message.has_sticker)
        .bind(message.has_mention)
        .bind(&message.link)
        .bind(&message.deep_link)
        .bind(message.grouped_id)
        .bind(message.reply_to_message_id)
        .bind(&message.forwarded_from)
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        for tag in &message.tags {
            sqlx::query(
                "INSERT OR IGNORE INTO tags (conversation_id, message_id, tag) VALUES (?1, ?2, ?3)",
            )
            .bind(message.conversation_id)
            .bind(message.message_id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        }

        for handle in &message.mentions {
            sqlx::query(
                "INSERT OR IGNORE INTO mentions (conversation_id, message_id, handle) VALUES (?1, ?2, ?3)",
            )
            .bind(message.conversation_id)
            .bind(message.message_id)
            .bind(handle)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(UpsertOutcome::Inserted)
    }

    pub async fn message_exists(&self, conversation_id: i64, message_id: i64) -> Result<bool> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM messages WHERE conversation_id = ?1 AND message_id = ?2",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Total rows for a conversation, soft-deleted included.
    pub async fn message_count(&self, conversation_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Returns false when no such message exists.
    #[instrument(skip(self))]
    pub async fn soft_delete_message(&self, conversation_id: i64, message_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET soft_deleted = 1 WHERE conversation_id = ?1 AND message_id = ?2",
        )
        .bind(conversation_id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn soft_delete_participant(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE participants SET soft_deleted = 1 WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Messages matching `query`, oldest first.
    pub async fn messages(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT m.conversation_id, m.message_id, m.sender_id, m.sent_at, m.body, m.caption, \
                m.category, m.has_attachment, m.has_link, m.has_sticker, m.has_mention, m.link, \
                m.deep_link, m.grouped_id, m.reply_to_message_id, m.forwarded_from, m.soft_deleted \
            FROM messages m LEFT JOIN participants p ON p.user_id = m.sender_id WHERE 1 = 1",
        );
        if !query.include_deleted {
            qb.push(" AND m.soft_deleted = 0 AND COALESCE(p.soft_deleted, 0) = 0");
        }
        if let Some(conversation_id) = query.conversation_id {
            qb.push(" AND m.conversation_id = ").push_bind(conversation_id);
        }
        if let Some(sender_id) = query.sender_id {
            qb.push(" AND m.sender_id = ").push_bind(sender_id);
        }
        if let Some(category) = query.category {
            qb.push(" AND m.category = ").push_bind(category.as_str());
        }
        if let Some(tag) = &query.tag {
            qb.push(
                " AND EXISTS (SELECT 1 FROM tags t WHERE t.conversation_id = m.conversation_id \
                AND t.message_id = m.message_id AND t.tag = ",
            )
            .push_bind(tag.trim_start_matches('#').to_lowercase())
            .push(")");
        }
        if let Some(has_mention) = query.has_mention {
            qb.push(" AND m.has_mention = ").push_bind(has_mention);
        }
        if let Some(since) = query.since {
            qb.push(" AND m.sent_at >= ").push_bind(ts(since));
        }
        if let Some(until) = query.until {
            qb.push(" AND m.sent_at <= ").push_bind(ts(until));
        }
        qb.push(" ORDER BY m.sent_at, m.message_id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<MessageRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    pub async fn tags(&self, conversation_id: i64, message_id: i64) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT tag FROM tags WHERE conversation_id = ?1 AND message_id = ?2 ORDER BY tag",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mentions(&self, conversation_id: i64, message_id: i64) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT handle FROM mentions WHERE conversation_id = ?1 AND message_id = ?2 ORDER BY handle",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn tag_count(&self, conversation_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ---- reactions ----

    /// Returns true if a new row was written.
    pub async fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO reactions (conversation_id, message_id, user_id, emoji, reacted_at) \
            VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(reaction.conversation_id)
        .bind(reaction.message_id)
        .bind(reaction.user_id)
        .bind(&reaction.emoji)
        .bind(reaction.reacted_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn reactions(&self, conversation_id: i64, message_id: i64) -> Result<Vec<ReactionRecord>> {
        let rows = sqlx::query_as::<_, (i64, i64, i64, String, Option<String>)>(
            "SELECT conversation_id, message_id, user_id, emoji, reacted_at FROM reactions \
            WHERE conversation_id = ?1 AND message_id = ?2 ORDER BY user_id, emoji",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(conversation_id, message_id, user_id, emoji, reacted_at)| {
                Ok(ReactionRecord {
                    conversation_id,
                    message_id,
                    user_id,
                    emoji,
                    reacted_at: parse_opt_ts(reacted_at)?,
                })
            })
            .collect()
    }

    pub async fn reaction_count(&self, conversation_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM reactions WHERE conversation_id = ?1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ---- media ----

    pub async fn record_media_file(&self, file: &MediaFileRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO media_files (conversation_id, message_id, file_id, path, size, mime_type, \
                category, thumbnail_path, downloaded_at) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
            ON CONFLICT(conversation_id, message_id, file_id) DO UPDATE SET \
                path=excluded.path, \
                size=excluded.size, \
                mime_type=excluded.mime_type, \
                category=excluded.category, \
                thumbnail_path=COALESCE(excluded.thumbnail_path, media_files.thumbnail_path)",
        )
        .bind(file.conversation_id)
        .bind(file.message_id)
        .bind(&file.file_id)
        .bind(&file.path)
        .bind(file.size.map(to_i64))
        .bind(&file.mime_type)
        .bind(file.category.as_str())
        .bind(&file.thumbnail_path)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn media_files(&self, conversation_id: i64, message_id: i64) -> Result<Vec<MediaFileRecord>> {
        let rows = sqlx::query_as::<
            _,
            (i64, i64, String, String, Option<i64>, Option<String>, String, Option<String>),
        >(
            "SELECT conversation_id, message_id, file_id, path, size, mime_type, category, thumbnail_path \
            FROM media_files WHERE conversation_id = ?1 AND message_id = ?2 ORDER BY id",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(conversation_id, message_id, file_id, path, size, mime_type, category, thumbnail_path)| {
                    MediaFileRecord {
                        conversation_id,
                        message_id,
                        file_id,
                        path,
                        size: size.map(to_u64),
                        mime_type,
                        category: Category::from_str(&category).unwrap_or(Category::Unknown),
                        thumbnail_path,
                    }
                },
            )
            .collect())
    }

    // ---- fetch state ----

    pub async fn fetch_state(&self, conversation_id: i64, account: &str) -> Result<Option<FetchState>> {
        let row = sqlx::query_as::<_, FetchStateRow>(
            "SELECT conversation_id, account, cursor_at, cursor_message_id, processed, skipped, \
                errored, started_at, finished_at, status \
            FROM fetch_state WHERE conversation_id = ?1 AND account = ?2",
        )
        .bind(conversation_id)
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FetchState::try_from).transpose()
    }

    pub async fn fetch_states(&self) -> Result<Vec<FetchState>> {
        let rows = sqlx::query_as::<_, FetchStateRow>(
            "SELECT conversation_id, account, cursor_at, cursor_message_id, processed, skipped, \
                errored, started_at, finished_at, status \
            FROM fetch_state ORDER BY conversation_id, account",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FetchState::try_from).collect()
    }

    /// Move the pair's cursor and the conversation's fetch position to the
    /// given message. Never moves either backwards.
    #[instrument(skip(self))]
    pub async fn advance_cursor(
        &self,
        conversation_id: i64,
        account: &str,
        at: DateTime<Utc>,
        message_id: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO fetch_state (conversation_id, account, cursor_at, cursor_message_id) \
            VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(conversation_id, account) DO UPDATE SET \
                cursor_at=excluded.cursor_at, \
                cursor_message_id=excluded.cursor_message_id \
            WHERE fetch_state.cursor_at IS NULL \
                OR fetch_state.cursor_at < excluded.cursor_at \
                OR (fetch_state.cursor_at = excluded.cursor_at \
                    AND COALESCE(fetch_state.cursor_message_id, 0) < excluded.cursor_message_id)",
        )
        .bind(conversation_id)
        .bind(account)
        .bind(ts(at))
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET last_fetch_position = ?2 \
            WHERE id = ?1 AND (last_fetch_position IS NULL OR last_fetch_position < ?2)",
        )
        .bind(conversation_id)
        .bind(ts(at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a run as started, clearing the previous run's counts.
    pub async fn begin_run(&self, conversation_id: i64, account: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO fetch_state (conversation_id, account, started_at, status) \
            VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(conversation_id, account) DO UPDATE SET \
                processed=0, skipped=0, errored=0, \
                started_at=excluded.started_at, \
                finished_at=NULL, \
                status=excluded.status",
        )
        .bind(conversation_id)
        .bind(account)
        .bind(ts(Utc::now()))
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        conversation_id: i64,
        account: &str,
        counts: RunCounts,
        status: RunStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE fetch_state SET processed = ?3, skipped = ?4, errored = ?5, \
                finished_at = ?6, status = ?7 \
            WHERE conversation_id = ?1 AND account = ?2",
        )
        .bind(conversation_id)
        .bind(account)
        .bind(to_i64(counts.processed))
        .bind(to_i64(counts.skipped))
        .bind(to_i64(counts.errored))
        .bind(ts(Utc::now()))
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- guarded actions ----

    pub async fn record_guarded_action(
        &self,
        actor: &str,
        action: &str,
        target: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO guarded_actions (actor, action, target, performed_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(actor)
        .bind(action)
        .bind(target)
        .bind(ts(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Timestamps of `actor`'s guarded actions at or after `since`, oldest first.
    pub async fn guarded_actions_since(
        &self,
        actor: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT performed_at FROM guarded_actions \
            WHERE actor = ?1 AND performed_at >= ?2 ORDER BY performed_at",
        )
        .bind(actor)
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|s| parse_ts(s)).collect()
    }

    // ---- item errors ----

    pub async fn log_item_error(
        &self,
        conversation_id: i64,
        message_id: Option<i64>,
        stage: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO item_errors (conversation_id, message_id, stage, error, occurred_at) \
            VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(conversation_id)
        .bind(message_id)
        .bind(stage)
        .bind(error)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn item_errors(&self, conversation_id: i64) -> Result<Vec<ItemErrorRecord>> {
        let rows = sqlx::query_as::<_, (i64, Option<i64>, String, String, String)>(
            "SELECT conversation_id, message_id, stage, error, occurred_at FROM item_errors \
            WHERE conversation_id = ?1 ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(conversation_id, message_id, stage, error, occurred_at)| {
                Ok(ItemErrorRecord {
                    conversation_id,
                    message_id,
                    stage,
                    error,
                    occurred_at: parse_ts(&occurred_at)?,
                })
            })
            .collect()
    }
}
