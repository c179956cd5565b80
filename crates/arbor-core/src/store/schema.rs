//! Physical schema probing for the SQLite backend.
//!
//! Databases written by older builds only know messages with parent pointers
//! and flat branches. Probing tells the migrator which pieces are missing so
//! it can add exactly those, and tells callers which generation they opened.

use serde::Serialize;
use sqlx::{Row, SqliteConnection};
use std::collections::{HashMap, HashSet};
use strum_macros::Display;

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SchemaGeneration {
    /// Nothing has been created yet.
    Empty,
    /// Messages with parent pointers and branches, no assignment table.
    Flat,
    /// Many-to-many message/branch assignments.
    Assignments,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCapabilities {
    tables: HashMap<String, HashSet<String>>,
}

impl SchemaCapabilities {
    pub async fn probe(conn: &mut SqliteConnection) -> Result<Self, StoreError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StoreError::database(format!("Failed to list tables: {e}")))?;

        let names: Vec<String> = rows.iter().map(|row| row.get("name")).collect();

        let mut tables = HashMap::with_capacity(names.len());
        for name in names {
            // PRAGMA arguments cannot be bound; names come from sqlite_master.
            let columns = sqlx::query(&format!("PRAGMA table_info(\"{name}\")"))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| {
                    StoreError::database(format!("Failed to read columns of {name}: {e}"))
                })?
                .iter()
                .map(|row| row.get::<String, _>("name"))
                .collect::<HashSet<_>>();
            tables.insert(name, columns);
        }

        Ok(Self { tables })
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }

    pub fn has_assignments(&self) -> bool {
        self.has_table("message_branches")
    }

    pub fn has_branch_hierarchy(&self) -> bool {
        self.has_column("branches", "parent_branch_id")
            && self.has_column("branches", "fork_message_id")
    }

    pub fn has_citations(&self) -> bool {
        self.has_column("messages", "citations")
    }

    pub fn has_documents(&self) -> bool {
        self.has_table("conversation_documents")
    }

    pub fn generation(&self) -> SchemaGeneration {
        if !self.has_table("messages") {
            SchemaGeneration::Empty
        } else if self.has_assignments() {
            SchemaGeneration::Assignments
        } else {
            SchemaGeneration::Flat
        }
    }

    /// Columns that exist on an older table shape but need adding.
    pub(crate) fn missing_columns(&self) -> Vec<(&'static str, &'static str, &'static str)> {
        const EXPECTED: &[(&str, &str, &str)] = &[
            ("messages", "citations", "TEXT NULL"),
            ("branches", "parent_branch_id", "TEXT NULL"),
            ("branches", "fork_message_id", "TEXT NULL"),
        ];

        EXPECTED
            .iter()
            .filter(|(table, column, _)| self.has_table(table) && !self.has_column(table, column))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tables: &[(&str, &[&str])]) -> SchemaCapabilities {
        SchemaCapabilities {
            tables: tables
                .iter()
                .map(|(name, columns)| {
                    (
                        (*name).to_string(),
                        columns.iter().map(|c| (*c).to_string()).collect(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn empty_database_is_empty_generation() {
        assert_eq!(caps(&[]).generation(), SchemaGeneration::Empty);
    }

    #[test]
    fn flat_generation_reports_missing_columns() {
        let flat = caps(&[
            ("messages", &["id", "conversation_id", "parent_message_id"]),
            ("branches", &["id", "conversation_id", "name", "is_active"]),
        ]);

        assert_eq!(flat.generation(), SchemaGeneration::Flat);
        assert!(!flat.has_branch_hierarchy());
        let missing: Vec<_> = flat.missing_columns().iter().map(|(_, c, _)| *c).collect();
        assert_eq!(missing, vec!["citations", "parent_branch_id", "fork_message_id"]);
    }

    #[test]
    fn assignment_table_marks_current_generation() {
        let current = caps(&[
            ("messages", &["id", "citations"]),
            ("message_branches", &["message_id", "branch_id"]),
        ]);
        assert_eq!(current.generation(), SchemaGeneration::Assignments);
        assert!(current.has_citations());
    }
}
