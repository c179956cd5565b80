use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use sqlx::{
    Row, SqliteConnection,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::schema::{SchemaCapabilities, SchemaGeneration};
use super::{BranchDeletion, ChatStore, ForkWrite, NewBranch, StoreError, orphaned_messages};
use crate::domain::{
    Branch, BranchId, Conversation, ConversationDocument, ConversationId, Message, MessageId, Role,
    UserId,
};

const SCHEMA_VERSION: i64 = 2;

const MESSAGE_COLUMNS: &str =
    "m.id, m.conversation_id, m.role, m.content, m.parent_message_id, m.citations, m.created_at";

const BRANCH_COLUMNS: &str =
    "id, conversation_id, name, parent_branch_id, fork_message_id, is_active, created_at";

const CREATE_TABLES: &[(&str, &str)] = &[
    (
        "conversations",
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "messages",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY NOT NULL,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            parent_message_id TEXT NULL,
            citations TEXT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "branches",
        r#"
        CREATE TABLE IF NOT EXISTS branches (
            id TEXT PRIMARY KEY NOT NULL,
            conversation_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT 'Main',
            parent_branch_id TEXT NULL,
            fork_message_id TEXT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "message_branches",
        r#"
        CREATE TABLE IF NOT EXISTS message_branches (
            message_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (message_id, branch_id),
            FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
            FOREIGN KEY (branch_id) REFERENCES branches(id) ON DELETE CASCADE,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "conversation_documents",
        r#"
        CREATE TABLE IF NOT EXISTS conversation_documents (
            conversation_id TEXT NOT NULL,
            document TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (conversation_id, document),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    ),
];

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_branches_conversation ON branches(conversation_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_branches_branch ON message_branches(branch_id)",
    "CREATE INDEX IF NOT EXISTS idx_message_branches_conversation ON message_branches(conversation_id)",
];

pub struct SqliteChatStore {
    pool: SqlitePool,
    found: SchemaCapabilities,
}

impl SqliteChatStore {
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::connection(format!("Failed to create directory: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| StoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true);

        Self::connect(options).await
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::connection(format!("Invalid SQLite path: {e}")))?;

        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::connection(format!("Failed to connect to SQLite: {e}")))?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| StoreError::connection(format!("Failed to acquire connection: {e}")))?;

        let found = SchemaCapabilities::probe(&mut conn).await?;
        info!(
            target: "arbor::store::sqlite",
            generation = %found.generation(),
            "Opened conversation database"
        );
        Self::run_migrations(&mut conn, &found).await?;
        drop(conn);

        Ok(Self { pool, found })
    }

    /// Schema as it was before this process migrated it.
    pub fn found_schema(&self) -> &SchemaCapabilities {
        &self.found
    }

    pub fn found_generation(&self) -> SchemaGeneration {
        self.found.generation()
    }

    async fn run_migrations(
        conn: &mut SqliteConnection,
        found: &SchemaCapabilities,
    ) -> Result<(), StoreError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StoreError::migration(format!("Failed to read schema version: {e}")))?;

        if version > SCHEMA_VERSION {
            return Err(StoreError::migration(format!(
                "unsupported schema version {version}, max supported {SCHEMA_VERSION}"
            )));
        }

        for (table, ddl) in CREATE_TABLES {
            sqlx::query(ddl).execute(&mut *conn).await.map_err(|e| {
                StoreError::migration(format!("Failed to create {table} table: {e}"))
            })?;
        }

        for (table, column, declaration) in found.missing_columns() {
            debug!(
                target: "arbor::store::sqlite",
                table, column, "Adding column missing from older schema"
            );
            sqlx::query(&format!(
                "ALTER TABLE {table} ADD COLUMN {column} {declaration}"
            ))
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                StoreError::migration(format!("Failed to add {table}.{column}: {e}"))
            })?;
        }

        for ddl in CREATE_INDEXES {
            sqlx::query(ddl)
                .execute(&mut *conn)
                .await
                .map_err(|e| StoreError::migration(format!("Failed to create index: {e}")))?;
        }

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::migration(format!("Failed to record schema version: {e}")))?;

        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::database(format!("Failed to begin transaction: {e}")))
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // Rows written with SQLite's datetime('now').
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::serialization(format!("Invalid timestamp {value:?}: {e}")))
}

fn parse_id<T: From<Uuid>>(value: &str, column: &str) -> Result<T, StoreError> {
    Uuid::parse_str(value)
        .map(T::from)
        .map_err(|e| StoreError::serialization(format!("Invalid {column}: {e}")))
}

fn parse_optional_id<T: From<Uuid>>(
    value: Option<String>,
    column: &str,
) -> Result<Option<T>, StoreError> {
    value.map(|v| parse_id(&v, column)).transpose()
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
    let role: String = row.get("role");
    let citations: Option<String> = row.get("citations");
    let created_at: String = row.get("created_at");

    Ok(Message {
        id: parse_id(&row.get::<String, _>("id"), "message id")?,
        conversation_id: parse_id(&row.get::<String, _>("conversation_id"), "conversation_id")?,
        role: Role::from_str(&role)
            .map_err(|e| StoreError::serialization(format!("Invalid role {role:?}: {e}")))?,
        content: row.get("content"),
        parent_message_id: parse_optional_id(row.get("parent_message_id"), "parent_message_id")?,
        citations: citations
            .map(|c| serde_json::from_str(&c))
            .transpose()
            .map_err(|e| StoreError::serialization(format!("Invalid citations: {e}")))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_branch(row: &SqliteRow) -> Result<Branch, StoreError> {
    let created_at: String = row.get("created_at");
    Ok(Branch {
        id: parse_id(&row.get::<String, _>("id"), "branch id")?,
        conversation_id: parse_id(&row.get::<String, _>("conversation_id"), "conversation_id")?,
        name: row.get("name"),
        parent_branch_id: parse_optional_id(row.get("parent_branch_id"), "parent_branch_id")?,
        fork_message_id: parse_optional_id(row.get("fork_message_id"), "fork_message_id")?,
        is_active: row.get("is_active"),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, StoreError> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Conversation {
        id: parse_id(&row.get::<String, _>("id"), "conversation id")?,
        user_id: UserId::new(row.get::<String, _>("user_id")),
        title: row.get("title"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

async fn touch_conversation(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
        .bind(timestamp(Utc::now()))
        .bind(conversation_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::database(format!("Failed to touch conversation: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::conversation_not_found(conversation_id));
    }
    Ok(())
}

async fn insert_message_row(
    conn: &mut SqliteConnection,
    message: &Message,
) -> Result<(), StoreError> {
    let citations = message
        .citations
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::serialization(format!("Failed to serialize citations: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO messages (
            id, conversation_id, role, content, parent_message_id, citations, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.conversation_id.to_string())
    .bind(message.role.to_string())
    .bind(&message.content)
    .bind(message.parent_message_id.map(|id| id.to_string()))
    .bind(citations)
    .bind(timestamp(message.created_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to insert message: {e}")))?;

    Ok(())
}

async fn insert_assignment_row(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    message_id: MessageId,
    branch_id: BranchId,
) -> Result<bool, StoreError> {
    let now = timestamp(Utc::now());
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO message_branches (
            message_id, branch_id, conversation_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?4)
        "#,
    )
    .bind(message_id.to_string())
    .bind(branch_id.to_string())
    .bind(conversation_id.to_string())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to assign message: {e}")))?;

    Ok(result.rows_affected() > 0)
}

async fn insert_branch_rows(
    conn: &mut SqliteConnection,
    new_branch: &NewBranch,
) -> Result<(), StoreError> {
    let branch = &new_branch.branch;
    let conversation_id = branch.conversation_id.to_string();

    if branch.is_active {
        sqlx::query("UPDATE branches SET is_active = 0 WHERE conversation_id = ?1")
            .bind(&conversation_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::database(format!("Failed to deactivate branches: {e}")))?;
    }

    sqlx::query(
        r#"
        INSERT INTO branches (
            id, conversation_id, name, parent_branch_id, fork_message_id, is_active, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(branch.id.to_string())
    .bind(&conversation_id)
    .bind(&branch.name)
    .bind(branch.parent_branch_id.map(|id| id.to_string()))
    .bind(branch.fork_message_id.map(|id| id.to_string()))
    .bind(branch.is_active)
    .bind(timestamp(branch.created_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to insert branch: {e}")))?;

    for message_id in &new_branch.assign {
        insert_assignment_row(conn, branch.conversation_id, *message_id, branch.id).await?;
    }

    Ok(())
}

/// Deletes the released messages nothing refers to any more.
async fn delete_orphans(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    released: &[String],
) -> Result<u64, StoreError> {
    if released.is_empty() {
        return Ok(0);
    }
    let released: HashSet<MessageId> = released
        .iter()
        .map(|id| parse_id(id, "message_id"))
        .collect::<Result<_, _>>()?;

    let conversation = conversation_id.to_string();
    let still_assigned: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT message_id FROM message_branches WHERE conversation_id = ?1",
    )
    .bind(&conversation)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to load assignments: {e}")))?;
    let still_assigned: HashSet<MessageId> = still_assigned
        .iter()
        .map(|id| parse_id(id, "message_id"))
        .collect::<Result<_, _>>()?;

    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.conversation_id = ?1"
    ))
    .bind(&conversation)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StoreError::database(format!("Failed to load messages: {e}")))?;
    let messages = rows
        .iter()
        .map(row_to_message)
        .collect::<Result<Vec<_>, _>>()?;

    let orphans = orphaned_messages(&messages, &released, &still_assigned);
    for message_id in &orphans {
        sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(message_id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete message: {e}")))?;
    }
    if !orphans.is_empty() {
        debug!(
            target: "arbor::store::sqlite",
            %conversation_id,
            removed = orphans.len(),
            "Deleted messages left without a branch"
        );
    }
    Ok(orphans.len() as u64)
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
        main_branch: &Branch,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.user_id.as_str())
        .bind(&conversation.title)
        .bind(timestamp(conversation.created_at))
        .bind(timestamp(conversation.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::database(format!("Failed to create conversation: {e}")))?;

        insert_branch_rows(
            &mut tx,
            &NewBranch {
                branch: main_branch.clone(),
                assign: Vec::new(),
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit conversation: {e}")))
    }

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load conversation: {e}")))?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn list_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, created_at, updated_at
            FROM conversations
            WHERE user_id = ?1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to list conversations: {e}")))?;

        rows.iter().map(row_to_conversation).collect()
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<bool, StoreError> {
        let id = conversation_id.to_string();
        let mut tx = self.begin().await?;

        // Explicit deletes: tables from older builds were created without
        // cascading foreign keys.
        for table in [
            "message_branches",
            "conversation_documents",
            "branches",
            "messages",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE conversation_id = ?1"))
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::database(format!("Failed to delete {table}: {e}")))?;
        }

        let result = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete conversation: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit delete: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        touch_conversation(&mut tx, message.conversation_id).await?;
        insert_message_row(&mut tx, message).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit message: {e}")))
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"
        ))
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load message: {e}")))?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = ?1
            ORDER BY m.created_at ASC, m.rowid ASC
            "#
        ))
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn insert_branch(&self, new_branch: &NewBranch) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        touch_conversation(&mut tx, new_branch.branch.conversation_id).await?;
        insert_branch_rows(&mut tx, new_branch).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit branch: {e}")))
    }

    async fn get_branch(&self, branch_id: BranchId) -> Result<Option<Branch>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1"
        ))
        .bind(branch_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load branch: {e}")))?;

        row.as_ref().map(row_to_branch).transpose()
    }

    async fn list_branches(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Branch>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {BRANCH_COLUMNS}
            FROM branches
            WHERE conversation_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#
        ))
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to list branches: {e}")))?;

        rows.iter().map(row_to_branch).collect()
    }

    async fn activate_branch(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM branches WHERE id = ?1 AND conversation_id = ?2",
        )
        .bind(branch_id.to_string())
        .bind(conversation_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::database(format!("Failed to check branch: {e}")))?;

        if exists == 0 {
            return Err(StoreError::branch_not_found(branch_id));
        }

        sqlx::query(
            r#"
            UPDATE branches
            SET is_active = CASE WHEN id = ?1 THEN 1 ELSE 0 END
            WHERE conversation_id = ?2
            "#,
        )
        .bind(branch_id.to_string())
        .bind(conversation_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::database(format!("Failed to activate branch: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit activation: {e}")))
    }

    async fn delete_branch(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchDeletion, StoreError> {
        let conversation = conversation_id.to_string();
        let branch = branch_id.to_string();
        let mut tx = self.begin().await?;

        let was_active: Option<bool> = sqlx::query_scalar(
            "SELECT is_active FROM branches WHERE id = ?1 AND conversation_id = ?2",
        )
        .bind(&branch)
        .bind(&conversation)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load branch: {e}")))?;

        let Some(was_active) = was_active else {
            return Err(StoreError::branch_not_found(branch_id));
        };

        let siblings: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM branches WHERE conversation_id = ?1")
                .bind(&conversation)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::database(format!("Failed to count branches: {e}")))?;

        if siblings <= 1 {
            return Err(StoreError::LastBranch {
                conversation_id: conversation,
            });
        }

        let released: Vec<String> =
            sqlx::query_scalar("SELECT message_id FROM message_branches WHERE branch_id = ?1")
                .bind(&branch)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| StoreError::database(format!("Failed to load assignments: {e}")))?;

        let removed_assignments = sqlx::query("DELETE FROM message_branches WHERE branch_id = ?1")
            .bind(&branch)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete assignments: {e}")))?
            .rows_affected();

        sqlx::query("DELETE FROM branches WHERE id = ?1")
            .bind(&branch)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete branch: {e}")))?;

        let removed_messages = delete_orphans(&mut tx, conversation_id, &released).await?;

        let mut activated = None;
        if was_active {
            let next: Option<String> = sqlx::query_scalar(
                r#"
                SELECT id FROM branches
                WHERE conversation_id = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
                "#,
            )
            .bind(&conversation)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to pick next branch: {e}")))?;

            if let Some(next) = next {
                sqlx::query("UPDATE branches SET is_active = 1 WHERE id = ?1")
                    .bind(&next)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StoreError::database(format!("Failed to activate branch: {e}"))
                    })?;
                activated = Some(parse_id(&next, "branch id")?);
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit delete: {e}")))?;

        Ok(BranchDeletion {
            removed_assignments,
            removed_messages,
            activated,
        })
    }

    async fn commit_fork(&self, fork: &ForkWrite) -> Result<(), StoreError> {
        let conversation_id = fork.fork.branch.conversation_id;
        let mut tx = self.begin().await?;

        touch_conversation(&mut tx, conversation_id).await?;
        if let Some(snapshot) = &fork.snapshot {
            insert_branch_rows(&mut tx, snapshot).await?;
        }
        insert_branch_rows(&mut tx, &fork.fork).await?;
        if let Some(message) = &fork.message {
            insert_message_row(&mut tx, message).await?;
            insert_assignment_row(&mut tx, conversation_id, message.id, fork.fork.branch.id)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit fork: {e}")))
    }

    async fn assign(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        branch_id: BranchId,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;

        let message_exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE id = ?1")
            .bind(message_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to check message: {e}")))?;
        if message_exists == 0 {
            return Err(StoreError::message_not_found(message_id));
        }

        let branch_exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM branches WHERE id = ?1")
            .bind(branch_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to check branch: {e}")))?;
        if branch_exists == 0 {
            return Err(StoreError::branch_not_found(branch_id));
        }

        let inserted = insert_assignment_row(&mut tx, conversation_id, message_id, branch_id).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit assignment: {e}")))?;
        Ok(inserted)
    }

    async fn assigned_messages(&self, branch_id: BranchId) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            INNER JOIN message_branches mb ON mb.message_id = m.id
            WHERE mb.branch_id = ?1
            ORDER BY m.created_at ASC, m.rowid ASC
            "#
        ))
        .bind(branch_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load branch messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn unassigned_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages m
            WHERE m.conversation_id = ?1
              AND NOT EXISTS (
                SELECT 1 FROM message_branches mb WHERE mb.message_id = m.id
              )
            ORDER BY m.created_at ASC, m.rowid ASC
            "#
        ))
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load unassigned messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn count_assignments(&self, conversation_id: ConversationId) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_branches WHERE conversation_id = ?1")
                .bind(conversation_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to count assignments: {e}")))?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn materialize_fallback(
        &self,
        conversation_id: ConversationId,
    ) -> Result<u64, StoreError> {
        let id = conversation_id.to_string();
        let mut tx = self.begin().await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_branches WHERE conversation_id = ?1")
                .bind(&id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::database(format!("Failed to count assignments: {e}")))?;
        if existing > 0 {
            return Ok(0);
        }

        let now = timestamp(Utc::now());
        let written = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_branches (
                message_id, branch_id, conversation_id, created_at, updated_at
            )
            SELECT m.id, b.id, m.conversation_id, ?2, ?2
            FROM messages m
            INNER JOIN branches b ON b.conversation_id = m.conversation_id
            WHERE m.conversation_id = ?1
            "#,
        )
        .bind(&id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::database(format!("Failed to materialize assignments: {e}")))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit assignments: {e}")))?;

        if written > 0 {
            info!(
                target: "arbor::store::sqlite",
                %conversation_id,
                written,
                "Materialized assignments for a conversation without any"
            );
        }
        Ok(written)
    }

    async fn link_documents(
        &self,
        conversation_id: ConversationId,
        documents: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let id = conversation_id.to_string();

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE id = ?1")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to check conversation: {e}")))?;
        if exists == 0 {
            return Err(StoreError::conversation_not_found(conversation_id));
        }

        let now = timestamp(Utc::now());
        for document in documents {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO conversation_documents (conversation_id, document, linked_at)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(&id)
            .bind(document)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to link document: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::database(format!("Failed to commit documents: {e}")))
    }

    async fn conversation_documents(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, document, linked_at
            FROM conversation_documents
            WHERE conversation_id = ?1
            ORDER BY linked_at ASC, document ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load documents: {e}")))?;

        rows.iter()
            .map(|row| {
                let linked_at: String = row.get("linked_at");
                Ok(ConversationDocument {
                    conversation_id: parse_id(
                        &row.get::<String, _>("conversation_id"),
                        "conversation_id",
                    )?,
                    document: row.get("document"),
                    linked_at: parse_timestamp(&linked_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    async fn seeded() -> (SqliteChatStore, Conversation, Branch) {
        let store = SqliteChatStore::new_in_memory().await.unwrap();
        let conversation = Conversation::new(UserId::new("u1"), Some("Rust".to_string()));
        let main = Branch::main(conversation.id);
        store.create_conversation(&conversation, &main).await.unwrap();
        (store, conversation, main)
    }

    #[tokio::test]
    async fn test_sqlite_store_message_round_trip() {
        let (store, conversation, _) = seeded().await;
        let citations = serde_json::json!([{ "document": "guide.pdf", "distance": 0.12 }]);
        let message = Message::new(conversation.id, Role::Assistant, "answer", None)
            .with_citations(Some(citations.clone()));

        store.insert_message(&message).await.unwrap();

        let loaded = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "answer");
        assert_eq!(loaded.role, Role::Assistant);
        assert_eq!(loaded.citations, Some(citations));
    }

    #[tokio::test]
    async fn test_sqlite_store_rejects_message_for_unknown_conversation() {
        let store = SqliteChatStore::new_in_memory().await.unwrap();
        let message = Message::new(ConversationId::new(), Role::User, "hi", None);
        let err = store.insert_message(&message).await.unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_store_assign_is_idempotent() {
        let (store, conversation, main) = seeded().await;
        let message = Message::new(conversation.id, Role::User, "hi", None);
        store.insert_message(&message).await.unwrap();

        assert!(store.assign(conversation.id, message.id, main.id).await.unwrap());
        assert!(!store.assign(conversation.id, message.id, main.id).await.unwrap());
        assert_eq!(store.assigned_messages(main.id).await.unwrap().len(), 1);
        assert!(
            store
                .unassigned_messages(conversation.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_sqlite_store_single_active_branch_after_insert() {
        let (store, conversation, main) = seeded().await;
        let mut next = Branch::new(conversation.id, "Branch 2", Some(main.id));
        next.is_active = true;
        store
            .insert_branch(&NewBranch {
                branch: next.clone(),
                assign: Vec::new(),
            })
            .await
            .unwrap();

        let branches = store.list_branches(conversation.id).await.unwrap();
        assert_eq!(branches.len(), 2);
        assert!(!branches[0].is_active);
        assert!(branches[1].is_active);
        assert_eq!(branches[1].parent_branch_id, Some(main.id));
    }

    #[tokio::test]
    async fn test_sqlite_store_delete_active_branch_activates_another() {
        let (store, conversation, main) = seeded().await;
        let mut next = Branch::new(conversation.id, "Branch 2", Some(main.id));
        next.is_active = true;
        store
            .insert_branch(&NewBranch {
                branch: next.clone(),
                assign: Vec::new(),
            })
            .await
            .unwrap();

        let deletion = store.delete_branch(conversation.id, next.id).await.unwrap();
        assert_eq!(deletion.activated, Some(main.id));

        let err = store.delete_branch(conversation.id, main.id).await.unwrap_err();
        assert!(matches!(err, StoreError::LastBranch { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_store_delete_conversation_cascades() {
        let (store, conversation, main) = seeded().await;
        let message = Message::new(conversation.id, Role::User, "hi", None);
        store.insert_message(&message).await.unwrap();
        store.assign(conversation.id, message.id, main.id).await.unwrap();
        store
            .link_documents(conversation.id, &["a.pdf".to_string(), "a.pdf".to_string()])
            .await
            .unwrap();
        assert_eq!(
            store
                .conversation_documents(conversation.id)
                .await
                .unwrap()
                .len(),
            1
        );

        assert!(store.delete_conversation(conversation.id).await.unwrap());
        assert!(store.get_conversation(conversation.id).await.unwrap().is_none());
        assert!(store.get_message(message.id).await.unwrap().is_none());
        assert_eq!(store.count_assignments(conversation.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_store_upgrades_flat_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.db");
        let conversation_id = ConversationId::new();
        let branch_id = BranchId::new();
        let root = MessageId::new();
        let reply = MessageId::new();

        {
            let mut conn = SqliteConnection::connect_with(
                &SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true),
            )
            .await
            .unwrap();

            for ddl in [
                "CREATE TABLE conversations (id TEXT PRIMARY KEY, user_id TEXT NOT NULL, title TEXT NOT NULL, created_at TEXT NOT NULL, updated_at TEXT NOT NULL)",
                "CREATE TABLE messages (id TEXT PRIMARY KEY, conversation_id TEXT NOT NULL, role TEXT NOT NULL, content TEXT NOT NULL, parent_message_id TEXT NULL, created_at TEXT NOT NULL DEFAULT (datetime('now')))",
                "CREATE TABLE branches (id TEXT PRIMARY KEY, conversation_id TEXT NOT NULL, name TEXT NOT NULL, is_active INTEGER NOT NULL DEFAULT 1, created_at TEXT NOT NULL DEFAULT (datetime('now')))",
            ] {
                sqlx::query(ddl).execute(&mut conn).await.unwrap();
            }

            sqlx::query("INSERT INTO conversations VALUES (?1, 'u1', 'Legacy', datetime('now'), datetime('now'))")
                .bind(conversation_id.to_string())
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query("INSERT INTO branches (id, conversation_id, name) VALUES (?1, ?2, 'Main')")
                .bind(branch_id.to_string())
                .bind(conversation_id.to_string())
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query("INSERT INTO messages (id, conversation_id, role, content, parent_message_id) VALUES (?1, ?2, 'user', 'hello', NULL)")
                .bind(root.to_string())
                .bind(conversation_id.to_string())
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query("INSERT INTO messages (id, conversation_id, role, content, parent_message_id) VALUES (?1, ?2, 'assistant', 'hi there', ?3)")
                .bind(reply.to_string())
                .bind(conversation_id.to_string())
                .bind(root.to_string())
                .execute(&mut conn)
                .await
                .unwrap();
        }

        let store = SqliteChatStore::new(&path).await.unwrap();
        assert_eq!(store.found_generation(), SchemaGeneration::Flat);
        assert!(!store.found_schema().has_branch_hierarchy());

        let messages = store.messages_by_conversation(conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].parent_message_id, Some(root));
        assert_eq!(store.count_assignments(conversation_id).await.unwrap(), 0);

        let branch = store.get_branch(branch_id).await.unwrap().unwrap();
        assert!(branch.is_active);
        assert_eq!(branch.parent_branch_id, None);

        drop(store);
        let reopened = SqliteChatStore::new(&path).await.unwrap();
        assert_eq!(reopened.found_generation(), SchemaGeneration::Assignments);
    }
}
