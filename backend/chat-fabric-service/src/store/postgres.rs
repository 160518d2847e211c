//! Postgres implementations of the durable store seams.
//!
//! Multi-row invariants (message + preview + unread counters, delete +
//! preview recompute) run inside one transaction. Per-row mutations use a
//! single `UPDATE ... RETURNING` so concurrent writers never lose updates.

use super::{ConversationDirectory, KeyLedgerStore, MessageStore, UserDirectory};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationSummary, Message, MessagePreview, MessageStatus, Reaction,
    StoredKeyRecord, UserDisplay,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio_postgres::Row;
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, text, media, status, \
     read_by, hidden_for, reply_to, reactions, edit_history, edited_at, expires_at, created_at, \
     client_temp_id";

fn json_column<T: DeserializeOwned>(row: &Row, column: &str) -> AppResult<T> {
    let value: Value = row.get(column);
    serde_json::from_value(value).map_err(|e| {
        AppError::Internal(format!("column {column} holds malformed json: {e}"))
    })
}

fn message_from_row(row: &Row) -> AppResult<Message> {
    let hidden_for: Vec<Uuid> = row.get("hidden_for");
    let status: String = row.get("status");

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        text: row.get("text"),
        media: json_column(row, "media")?,
        status: MessageStatus::parse(&status),
        read_by: json_column(row, "read_by")?,
        hidden_for: hidden_for.into_iter().collect(),
        reply_to: row.get("reply_to"),
        reactions: json_column(row, "reactions")?,
        edit_history: json_column(row, "edit_history")?,
        edited_at: row.get("edited_at"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
        client_temp_id: row.get("client_temp_id"),
    })
}

fn conversation_from_row(row: &Row) -> Conversation {
    Conversation {
        id: row.get("id"),
        participants: row.get("participants"),
        auto_delete_after_secs: row.get("auto_delete_after_secs"),
    }
}

/// `{ "<key>": value }`, for jsonb `||` patches keyed by an identity.
fn keyed_patch(key: &str, value: Value) -> Value {
    let mut object = Map::new();
    object.insert(key.to_string(), value);
    Value::Object(object)
}

fn direct_key(a: Uuid, b: Uuid) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}:{high}")
}

// ============================================================================
// Directories
// ============================================================================

#[derive(Clone)]
pub struct PgDirectory {
    pool: Pool,
}

impl PgDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationDirectory for PgDirectory {
    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, participants, auto_delete_after_secs FROM conversations WHERE id = $1",
                &[&conversation_id],
            )
            .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn conversations_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id FROM conversations WHERE $1 = ANY(participants) ORDER BY id",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn find_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<(Conversation, bool)> {
        let client = self.pool.get().await?;
        let key = direct_key(a, b);
        let participants = vec![a, b];

        let inserted = client
            .query_opt(
                r#"
                INSERT INTO conversations (id, participants, direct_key)
                VALUES ($1, $2, $3)
                ON CONFLICT (direct_key) DO NOTHING
                RETURNING id, participants, auto_delete_after_secs
                "#,
                &[&Uuid::new_v4(), &participants, &key],
            )
            .await?;
        if let Some(row) = inserted {
            return Ok((conversation_from_row(&row), true));
        }

        let row = client
            .query_one(
                "SELECT id, participants, auto_delete_after_secs FROM conversations WHERE direct_key = $1",
                &[&key],
            )
            .await?;
        Ok((conversation_from_row(&row), false))
    }
}

#[async_trait]
impl UserDirectory for PgDirectory {
    async fn display(&self, user_id: Uuid) -> AppResult<Option<UserDisplay>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT display_name, avatar_url FROM users WHERE id = $1",
                &[&user_id],
            )
            .await?;
        Ok(row.map(|r| UserDisplay {
            name: r.get("display_name"),
            avatar: r.get("avatar_url"),
        }))
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone)]
pub struct PgMessageStore {
    pool: Pool,
}

impl PgMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(
        &self,
        message: &Message,
        participants: &[Uuid],
        preview: &MessagePreview,
    ) -> AppResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let hidden_for: Vec<Uuid> = message.hidden_for.iter().copied().collect();
        let insert_sql = format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        );
        tx.execute(
            insert_sql.as_str(),
            &[
                &message.id,
                &message.conversation_id,
                &message.sender_id,
                &message.receiver_id,
                &message.text,
                &serde_json::to_value(&message.media)?,
                &message.status.as_str(),
                &serde_json::to_value(&message.read_by)?,
                &hidden_for,
                &message.reply_to,
                &serde_json::to_value(&message.reactions)?,
                &serde_json::to_value(&message.edit_history)?,
                &message.edited_at,
                &message.expires_at,
                &message.created_at,
                &message.client_temp_id,
            ],
        )
        .await?;

        tx.execute(
            "UPDATE conversations SET last_message = $2 WHERE id = $1",
            &[&message.conversation_id, &serde_json::to_value(preview)?],
        )
        .await?;

        let recipients: Vec<Uuid> = participants
            .iter()
            .copied()
            .filter(|p| *p != message.sender_id)
            .collect();
        tx.execute(
            r#"
            INSERT INTO conversation_unread (conversation_id, user_id, unread_count)
            SELECT $1, recipient, 1 FROM unnest($2::uuid[]) AS recipient
            ON CONFLICT (conversation_id, user_id)
            DO UPDATE SET unread_count = conversation_unread.unread_count + 1
            "#,
            &[&message.conversation_id, &recipients],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let row = client.query_opt(sql.as_str(), &[&message_id]).await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_many(&self, message_ids: &[Uuid]) -> AppResult<Vec<Message>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.pool.get().await?;
        let ids = message_ids.to_vec();
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ANY($1)");
        let rows = client.query(sql.as_str(), &[&ids]).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn list(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        now: DateTime<Utc>,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1
              AND NOT ($2 = ANY(hidden_for))
              AND (expires_at IS NULL OR expires_at > $3)
              AND ($4::timestamptz IS NULL OR created_at < $4)
            ORDER BY created_at DESC
            LIMIT $5
            "#
        );
        let rows = client
            .query(sql.as_str(), &[&conversation_id, &viewer, &now, &before, &limit])
            .await?;

        let mut page = rows
            .iter()
            .map(message_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        page.reverse();
        Ok(page)
    }

    async fn update_text(
        &self,
        message_id: Uuid,
        sealed_text: &str,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Option<Message>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // The SET list sees the pre-update row, so the old text is archived.
        let sql = format!(
            r#"
            UPDATE messages SET
                edit_history = CASE
                    WHEN text IS NULL THEN edit_history
                    ELSE edit_history || jsonb_build_array(
                        jsonb_build_object('text', text, 'replacedAt', $3::text))
                END,
                text = $2,
                edited_at = $4
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let replaced_at = edited_at.to_rfc3339();
        let Some(row) = tx
            .query_opt(
                sql.as_str(),
                &[&message_id, &sealed_text, &replaced_at, &edited_at],
            )
            .await?
        else {
            return Ok(None);
        };
        let updated = message_from_row(&row)?;

        tx.execute(
            r#"
            UPDATE conversations
            SET last_message = jsonb_set(last_message, '{text}', to_jsonb($2::text))
            WHERE id = $1 AND last_message->>'messageId' = $3
            "#,
            &[
                &updated.conversation_id,
                &sealed_text,
                &message_id.to_string(),
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn hide_for(&self, message_id: Uuid, viewer: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE messages SET hidden_for = array_append(hidden_for, $2)
                WHERE id = $1 AND NOT ($2 = ANY(hidden_for))
                "#,
                &[&message_id, &viewer],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn hard_delete(&self, message_id: Uuid) -> AppResult<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let Some(row) = tx
            .query_opt(
                "DELETE FROM messages WHERE id = $1 RETURNING conversation_id",
                &[&message_id],
            )
            .await?
        else {
            return Ok(false);
        };
        let conversation_id: Uuid = row.get("conversation_id");

        let was_preview = tx
            .query_opt(
                r#"
                SELECT 1 FROM conversations
                WHERE id = $1 AND last_message->>'messageId' = $2
                FOR UPDATE
                "#,
                &[&conversation_id, &message_id.to_string()],
            )
            .await?
            .is_some();

        if was_preview {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
                 ORDER BY created_at DESC LIMIT 1"
            );
            let next = match tx.query_opt(sql.as_str(), &[&conversation_id]).await? {
                Some(row) => Some(serde_json::to_value(MessagePreview::of(
                    &message_from_row(&row)?,
                ))?),
                None => None,
            };
            tx.execute(
                "UPDATE conversations SET last_message = $2 WHERE id = $1",
                &[&conversation_id, &next],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let reader_key = reader.to_string();
        let stamp = keyed_patch(&reader_key, serde_json::to_value(at)?);
        let rows = tx
            .query(
                r#"
                UPDATE messages
                SET read_by = read_by || $4::jsonb, status = 'delivered'
                WHERE conversation_id = $1
                  AND sender_id <> $2
                  AND NOT ($2 = ANY(hidden_for))
                  AND NOT (read_by ? $3)
                  AND (expires_at IS NULL OR expires_at > $5)
                RETURNING id, created_at
                "#,
                &[&conversation_id, &reader, &reader_key, &stamp, &at],
            )
            .await?;

        tx.execute(
            r#"
            INSERT INTO conversation_unread (conversation_id, user_id, unread_count)
            VALUES ($1, $2, 0)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET unread_count = 0
            "#,
            &[&conversation_id, &reader],
        )
        .await?;
        tx.commit().await?;

        let mut stamped: Vec<(DateTime<Utc>, Uuid)> = rows
            .iter()
            .map(|r| (r.get("created_at"), r.get("id")))
            .collect();
        stamped.sort();
        Ok(stamped.into_iter().map(|(_, id)| id).collect())
    }

    async fn set_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        reaction: Option<Reaction>,
    ) -> AppResult<Option<BTreeMap<Uuid, Reaction>>> {
        let client = self.pool.get().await?;
        let user_key = user_id.to_string();

        let row = match reaction {
            Some(reaction) => {
                let patch = keyed_patch(&user_key, serde_json::to_value(&reaction)?);
                client
                    .query_opt(
                        "UPDATE messages SET reactions = reactions || $2::jsonb \
                         WHERE id = $1 RETURNING reactions",
                        &[&message_id, &patch],
                    )
                    .await?
            }
            None => {
                client
                    .query_opt(
                        "UPDATE messages SET reactions = reactions - $2::text \
                         WHERE id = $1 RETURNING reactions",
                        &[&message_id, &user_key],
                    )
                    .await?
            }
        };

        row.as_ref()
            .map(|r| json_column(r, "reactions"))
            .transpose()
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &[Uuid],
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE expires_at IS NOT NULL AND expires_at <= $1 \
               AND NOT (id = ANY($3)) \
             ORDER BY expires_at LIMIT $2"
        );
        let rows = client.query(sql.as_str(), &[&now, &limit, &skip]).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn summary(&self, conversation_id: Uuid, viewer: Uuid) -> AppResult<ConversationSummary> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT c.last_message, COALESCE(u.unread_count, 0) AS unread_count
                FROM conversations c
                LEFT JOIN conversation_unread u
                  ON u.conversation_id = c.id AND u.user_id = $2
                WHERE c.id = $1
                "#,
                &[&conversation_id, &viewer],
            )
            .await?;

        let Some(row) = row else {
            return Ok(ConversationSummary {
                conversation_id,
                last_message: None,
                unread_count: 0,
            });
        };

        let last_message: Option<Value> = row.get("last_message");
        Ok(ConversationSummary {
            conversation_id,
            last_message: last_message.map(serde_json::from_value).transpose()?,
            unread_count: row.get("unread_count"),
        })
    }
}

// ============================================================================
// Key exchange ledger
// ============================================================================

#[derive(Clone)]
pub struct PgKeyLedger {
    pool: Pool,
}

impl PgKeyLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyLedgerStore for PgKeyLedger {
    async fn load(&self, conversation_id: Uuid) -> AppResult<Option<StoredKeyRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT record, revision FROM conversation_key_exchange WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut record: StoredKeyRecord = json_column(&row, "record")?;
        // The column is authoritative; the JSON copy may predate revisions.
        record.revision = row.get("revision");
        Ok(Some(record))
    }

    async fn compare_and_swap(
        &self,
        conversation_id: Uuid,
        expected_revision: i64,
        record: &StoredKeyRecord,
    ) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let body = serde_json::to_value(record)?;

        let written = if expected_revision == 0 {
            client
                .execute(
                    r#"
                    INSERT INTO conversation_key_exchange (conversation_id, record, revision)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (conversation_id) DO NOTHING
                    "#,
                    &[&conversation_id, &body, &record.revision],
                )
                .await?
        } else {
            client
                .execute(
                    r#"
                    UPDATE conversation_key_exchange
                    SET record = $2, revision = $3, updated_at = NOW()
                    WHERE conversation_id = $1 AND revision = $4
                    "#,
                    &[&conversation_id, &body, &record.revision, &expected_revision],
                )
                .await?
        };
        Ok(written == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(a, b), direct_key(b, a));
        assert_ne!(direct_key(a, b), direct_key(a, Uuid::new_v4()));
    }
}
