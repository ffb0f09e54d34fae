use std::collections::HashSet;

use core_types::{Conversation, ConversationId, Message, MessageId, ProfileId, Role, now};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info};

use crate::{
    DEFAULT_PAGE_SIZE, Result, SqliteStorage, StorageError, format_timestamp, parse_id,
    parse_timestamp,
};

impl SqliteStorage {
    pub async fn create_conversation(
        &self,
        title: impl Into<String>,
        profile_id: Option<ProfileId>,
    ) -> Result<Conversation> {
        let created_at = now();
        let conversation = Conversation {
            id: ConversationId::new_v4(),
            title: title.into(),
            created_at,
            updated_at: created_at,
            profile_id,
            messages: Vec::new(),
        };

        sqlx::query(
            r#"
            INSERT INTO conversations(id, title, created_at, updated_at, profile_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(&conversation.title)
        .bind(format_timestamp(&conversation.created_at))
        .bind(format_timestamp(&conversation.updated_at))
        .bind(profile_id.map(|id| id.to_string()))
        .execute(self.pool())
        .await?;

        info!(conversation_id = %conversation.id, "created conversation");
        Ok(conversation)
    }

    /// Loads a conversation together with its messages in timestamp order.
    pub async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, created_at, updated_at, profile_id
            FROM conversations
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut conversation = map_conversation_row(&row)?;
        conversation.messages = self.list_messages(id).await?;
        Ok(Some(conversation))
    }

    /// Most recently updated first; messages are not loaded.
    pub async fn list_conversations(&self, limit: u32, offset: u32) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, created_at, updated_at, profile_id
            FROM conversations
            ORDER BY updated_at DESC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(map_conversation_row).collect()
    }

    pub async fn update_conversation_title(
        &self,
        id: ConversationId,
        title: impl Into<String>,
    ) -> Result<()> {
        let title = title.into();
        let result = sqlx::query(
            r#"UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1"#,
        )
        .bind(id.to_string())
        .bind(&title)
        .bind(format_timestamp(&now()))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("conversation", id));
        }
        debug!(conversation_id = %id, "renamed conversation");
        Ok(())
    }

    pub async fn update_conversation_profile(
        &self,
        id: ConversationId,
        profile_id: Option<ProfileId>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE conversations SET profile_id = ?2, updated_at = ?3 WHERE id = ?1"#,
        )
        .bind(id.to_string())
        .bind(profile_id.map(|id| id.to_string()))
        .bind(format_timestamp(&now()))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("conversation", id));
        }
        debug!(conversation_id = %id, ?profile_id, "reassigned conversation profile");
        Ok(())
    }

    /// Removes the conversation; its messages go with it.
    pub async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM conversations WHERE id = ?1"#)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("conversation", id));
        }
        info!(conversation_id = %id, "deleted conversation");
        Ok(())
    }

    /// Inserts the message and bumps the conversation's `updated_at` in one
    /// transaction.
    pub async fn add_message(
        &self,
        message: &Message,
        conversation_id: ConversationId,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO messages(id, conversation_id, role, content, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(message.id.to_string())
        .bind(conversation_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(format_timestamp(&message.timestamp))
        .execute(&mut *tx)
        .await?;

        let bumped = sqlx::query(r#"UPDATE conversations SET updated_at = ?2 WHERE id = ?1"#)
            .bind(conversation_id.to_string())
            .bind(format_timestamp(&now()))
            .execute(&mut *tx)
            .await?;
        if bumped.rows_affected() == 0 {
            return Err(StorageError::not_found("conversation", conversation_id));
        }

        tx.commit().await?;
        debug!(%conversation_id, message_id = %message.id, role = %message.role, "appended message");
        Ok(())
    }

    pub async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, timestamp
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(map_message_row).collect()
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM messages WHERE id = ?1"#)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("message", id));
        }
        Ok(())
    }

    /// Case-insensitive substring search over titles and message bodies.
    /// A blank query lists the first page. Matching lowercases both sides
    /// with Unicode rules; SQLite's `LIKE` only folds ASCII.
    pub async fn search_conversations(&self, query: &str) -> Result<Vec<Conversation>> {
        if query.trim().is_empty() {
            return self.list_conversations(DEFAULT_PAGE_SIZE, 0).await;
        }
        let needle = query.to_lowercase();

        let rows = sqlx::query(
            r#"
            SELECT id, title, created_at, updated_at, profile_id
            FROM conversations
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        let conversations = rows
            .iter()
            .map(map_conversation_row)
            .collect::<Result<Vec<_>>>()?;

        let bodies = sqlx::query("SELECT conversation_id, content FROM messages")
            .fetch_all(self.pool())
            .await?;
        let mut by_body = HashSet::new();
        for row in &bodies {
            let content: String = row.try_get("content")?;
            if content.to_lowercase().contains(&needle) {
                by_body.insert(parse_id(&row.try_get::<String, _>("conversation_id")?)?);
            }
        }

        let hits: Vec<Conversation> = conversations
            .into_iter()
            .filter(|c| by_body.contains(&c.id) || c.title.to_lowercase().contains(&needle))
            .collect();
        debug!(hits = hits.len(), "conversation search");
        Ok(hits)
    }

    pub async fn count_conversations(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM conversations")
            .fetch_one(self.pool())
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }
}

fn map_conversation_row(row: &SqliteRow) -> Result<Conversation> {
    let profile_id: Option<String> = row.try_get("profile_id")?;
    Ok(Conversation {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        title: row.try_get("title")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        profile_id: profile_id.as_deref().map(parse_id).transpose()?,
        messages: Vec::new(),
    })
}

fn map_message_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        role: Role::from(row.try_get::<String, _>("role")?),
        content: row.try_get("content")?,
        timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use core_types::{ModelParameters, Profile};

    use super::*;

    fn profile(name: &str, is_default: bool) -> Profile {
        Profile {
            id: ProfileId::new_v4(),
            name: name.to_string(),
            model_name: "gpt-3.5-turbo".to_string(),
            api_endpoint: "https://api.openai.com/v1".to_string(),
            is_default,
            parameters: ModelParameters::default(),
        }
    }

    #[tokio::test]
    async fn add_message_appends_and_bumps_updated_at() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let p1 = profile("P1", true);
        storage.save_profile(&p1).await.expect("save profile");

        let c1 = storage
            .create_conversation("C1", Some(p1.id))
            .await
            .expect("create");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let hello = Message::user("Hello");
        storage.add_message(&hello, c1.id).await.expect("add");

        let loaded = storage
            .get_conversation(c1.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.messages, vec![hello]);
        assert_eq!(loaded.profile_id, Some(p1.id));
        assert!(loaded.updated_at > c1.updated_at);
        assert_eq!(loaded.created_at, c1.created_at);
    }

    #[tokio::test]
    async fn messages_come_back_in_timestamp_order() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let conversation = storage.create_conversation("order", None).await.expect("create");

        let mut late = Message::assistant("second");
        let early = Message::user("first");
        late.timestamp = early.timestamp + chrono::Duration::seconds(1);
        storage.add_message(&late, conversation.id).await.expect("add late");
        storage.add_message(&early, conversation.id).await.expect("add early");

        let messages = storage.list_messages(conversation.id).await.expect("list");
        assert_eq!(messages.len(), 2);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(messages[0].content, "first");
    }

    #[tokio::test]
    async fn add_message_to_missing_conversation_is_a_constraint_violation() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let err = storage
            .add_message(&Message::user("orphan"), ConversationId::new_v4())
            .await
            .expect_err("must fail");
        assert!(matches!(err, StorageError::ConstraintViolation(_)), "{err}");
        assert_eq!(storage.count_conversations().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn create_with_unknown_profile_is_rejected() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let err = storage
            .create_conversation("dangling", Some(ProfileId::new_v4()))
            .await
            .expect_err("must fail");
        assert!(matches!(err, StorageError::ConstraintViolation(_)), "{err}");
    }

    #[tokio::test]
    async fn rename_unknown_conversation_is_not_found() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let err = storage
            .update_conversation_title(ConversationId::new_v4(), "nope")
            .await
            .expect_err("must fail");
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert_eq!(storage.count_conversations().await.expect("count"), 0);

        let err = storage
            .update_conversation_profile(ConversationId::new_v4(), None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn rename_and_reassign_bump_updated_at() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let p = profile("P", true);
        storage.save_profile(&p).await.expect("save");
        let conversation = storage.create_conversation("old", None).await.expect("create");

        tokio::time::sleep(Duration::from_millis(5)).await;
        storage
            .update_conversation_title(conversation.id, "new")
            .await
            .expect("rename");
        let renamed = storage
            .get_conversation(conversation.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(renamed.title, "new");
        assert!(renamed.updated_at > conversation.updated_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        storage
            .update_conversation_profile(conversation.id, Some(p.id))
            .await
            .expect("reassign");
        let reassigned = storage
            .get_conversation(conversation.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(reassigned.profile_id, Some(p.id));
        assert!(reassigned.updated_at > renamed.updated_at);
    }

    #[tokio::test]
    async fn delete_conversation_cascades_to_messages() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let conversation = storage.create_conversation("gone", None).await.expect("create");
        let message = Message::user("bye");
        storage.add_message(&message, conversation.id).await.expect("add");

        storage
            .delete_conversation(conversation.id)
            .await
            .expect("delete");
        assert!(storage.get_conversation(conversation.id).await.expect("get").is_none());
        assert!(storage.list_messages(conversation.id).await.expect("list").is_empty());

        let orphans: i64 = sqlx::query("SELECT COUNT(*) AS count FROM messages")
            .fetch_one(storage.pool())
            .await
            .expect("count")
            .get("count");
        assert_eq!(orphans, 0);

        let err = storage
            .delete_conversation(conversation.id)
            .await
            .expect_err("second delete");
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_single_message() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let conversation = storage.create_conversation("edit", None).await.expect("create");
        let keep = Message::user("keep");
        let discarded = Message::assistant("discard");
        storage.add_message(&keep, conversation.id).await.expect("add");
        storage.add_message(&discarded, conversation.id).await.expect("add");

        storage.delete_message(discarded.id).await.expect("delete");
        let messages = storage.list_messages(conversation.id).await.expect("list");
        assert_eq!(messages, vec![keep]);
        assert!(matches!(
            storage.delete_message(discarded.id).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_orders_by_recent_activity_and_pages() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let first = storage.create_conversation("first", None).await.expect("create");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = storage.create_conversation("second", None).await.expect("create");
        tokio::time::sleep(Duration::from_millis(5)).await;
        storage
            .add_message(&Message::user("revive"), first.id)
            .await
            .expect("add");

        let listed = storage.list_conversations(10, 0).await.expect("list");
        let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(listed.iter().all(|c| c.messages.is_empty()));

        let page = storage.list_conversations(1, 1).await.expect("page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second.id);
        assert_eq!(storage.count_conversations().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn search_matches_titles_and_messages_case_insensitively() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let by_title = storage
            .create_conversation("Rust lifetimes", None)
            .await
            .expect("create");
        let by_body = storage.create_conversation("misc", None).await.expect("create");
        storage
            .add_message(&Message::user("tell me about RUST traits"), by_body.id)
            .await
            .expect("add");
        storage
            .add_message(&Message::assistant("rust traits are..."), by_body.id)
            .await
            .expect("add");
        let unrelated = storage.create_conversation("cooking", None).await.expect("create");

        let hits = storage.search_conversations("rust").await.expect("search");
        let ids: Vec<_> = hits.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2, "deduplicated union");
        assert!(ids.contains(&by_title.id));
        assert!(ids.contains(&by_body.id));
        assert!(!ids.contains(&unrelated.id));
        assert!(hits.windows(2).all(|w| w[0].updated_at >= w[1].updated_at));
    }

    #[tokio::test]
    async fn search_folds_non_ascii_case() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let by_title = storage
            .create_conversation("Über Größe", None)
            .await
            .expect("create");
        let by_body = storage.create_conversation("notes", None).await.expect("create");
        storage
            .add_message(&Message::user("ΣΟΦΙΑ and ÉCOLE"), by_body.id)
            .await
            .expect("add");

        let hits = storage.search_conversations("über").await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, by_title.id);

        let hits = storage.search_conversations("école").await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, by_body.id);
    }

    #[tokio::test]
    async fn search_keeps_surrounding_spaces_of_the_query() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        let spaced = storage
            .create_conversation("wild cat", None)
            .await
            .expect("create");
        storage.create_conversation("catalog", None).await.expect("create");

        let hits = storage.search_conversations(" cat").await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, spaced.id);
        assert_eq!(storage.search_conversations("cat").await.expect("search").len(), 2);
    }

    #[tokio::test]
    async fn search_treats_wildcards_literally() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        storage.create_conversation("100% done", None).await.expect("create");
        storage.create_conversation("1000 done", None).await.expect("create");

        let hits = storage.search_conversations("100%").await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "100% done");
        assert!(storage.search_conversations("_").await.expect("search").is_empty());
    }

    #[tokio::test]
    async fn blank_search_equals_first_page() {
        let storage = SqliteStorage::in_memory().await.expect("storage");
        for idx in 0..3 {
            storage
                .create_conversation(format!("c{idx}"), None)
                .await
                .expect("create");
        }
        let searched = storage.search_conversations("").await.expect("search");
        let listed = storage
            .list_conversations(DEFAULT_PAGE_SIZE, 0)
            .await
            .expect("list");
        assert_eq!(searched, listed);
        assert_eq!(storage.search_conversations("   ").await.expect("search"), listed);
    }
}
