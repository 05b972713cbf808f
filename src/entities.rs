//! Thin CRUD surfaces the Gateway exposes alongside the trading-state core:
//! scan settings and a wallet-config passthrough. These carry no business
//! logic of their own — they persist whatever the client sends as an
//! opaque JSON document, keyed by trading mode.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;

use crate::persistence::Db;

/// A single opaque-document table shared by the handful of "settings"
/// entities the UI reads/writes wholesale rather than field-by-field.
pub struct DocumentStore {
    db: Db,
}

impl DocumentStore {
    pub fn new(db: Db) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    key        TEXT NOT NULL,
                    body_json  TEXT NOT NULL,
                    updated_date TEXT NOT NULL,
                    PRIMARY KEY (collection, key)
                );
                "#,
            )?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    pub fn put(&self, collection: &str, key: &str, body: &Value) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (collection, key, body_json, updated_date) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(collection, key) DO UPDATE SET body_json = excluded.body_json, updated_date = excluded.updated_date",
                params![collection, key, body.to_string(), chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT body_json FROM documents WHERE collection = ?1 AND key = ?2")?;
            let raw: Option<String> = stmt.query_row(params![collection, key], |row| row.get(0)).optional()?;
            raw.map(|s| serde_json::from_str(&s).context("parsing stored document"))
                .transpose()
        })
    }

    pub fn list(&self, collection: &str) -> Result<Vec<Value>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT body_json FROM documents WHERE collection = ?1")?;
            let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(serde_json::from_str(&row?)?);
            }
            Ok(out)
        })
    }
}

pub type SharedDocumentStore = Arc<DocumentStore>;
