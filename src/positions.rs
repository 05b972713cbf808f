//! Position Manager (C4): the read merge-rule, the write model, and the
//! per-id advisory locking that keeps concurrent updates to the same
//! position from interleaving.

use anyhow::Result;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{Position, PositionStatus};
use crate::persistence::Db;

/// One advisory lock per position id, created on first touch and kept for
/// the life of the process. Guards the read-modify-write cycle in
/// `update_position` against two concurrent updates to the same row
/// clobbering each other (§5 concurrency model).
#[derive(Default)]
pub struct PositionLocks {
    locks: SyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl PositionLocks {
    fn get(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

pub struct PositionManager {
    db: Db,
    locks: PositionLocks,
    /// In-memory overlay (`M` in §4.4's merge algorithm): positions pushed
    /// here on create, ahead of the DB write, so a list() call landing in
    /// the narrow window before a fresh query can see the INSERT still
    /// returns it. Entries drop out once the DB catches up.
    memory: SyncMutex<Vec<Position>>,
}

impl PositionManager {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            locks: PositionLocks::default(),
            memory: SyncMutex::new(Vec::new()),
        }
    }

    pub async fn create(&self, mut position: Position) -> Result<Position, CoreError> {
        if position.entry_price <= 0.0 || position.quantity <= 0.0 {
            return Err(CoreError::Validation(vec![
                "entry_price and quantity must be positive".to_string(),
            ]));
        }
        position.exit_time = position.compute_exit_time();
        position.status = PositionStatus::Open;
        let now = chrono::Utc::now();
        position.created_date = now;
        position.updated_date = now;

        if let Some(existing) = self
            .db
            .get_position_by_position_id(&position.position_id)
            .map_err(CoreError::Persistence)?
        {
            return Err(CoreError::Duplicate(serde_json::to_value(existing).unwrap()));
        }

        // Memory first: closes the visibility race immediately, before the
        // DB write (and its own visibility check in §4.2) completes.
        self.memory.lock().push(position.clone());

        self.db.upsert_position(&position).map_err(CoreError::Persistence)?;
        Ok(position)
    }

    /// Read-modify-write under the position's advisory lock: load the
    /// current row, apply `mutate`, recompute `exit_time` if the inputs
    /// changed, and write back.
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> Result<Position, CoreError>
    where
        F: FnOnce(&mut Position),
    {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;

        let mut position = self
            .db
            .get_position_by_id(id)
            .map_err(CoreError::Persistence)?
            .ok_or_else(|| CoreError::NotFound(format!("position {id}")))?;

        mutate(&mut position);
        position.exit_time = position.compute_exit_time();
        position.updated_date = chrono::Utc::now();

        self.db.upsert_position(&position).map_err(CoreError::Persistence)?;
        Ok(position)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        let lock = self.locks.get(id);
        let _guard = lock.lock().await;
        self.memory.lock().retain(|p| p.id != id);
        self.db.delete_position(id).map_err(CoreError::Persistence)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Position>, CoreError> {
        self.db.get_position_by_id(id).map_err(CoreError::Persistence)
    }

    /// The merge-rule read (§4.4 steps 1-5): `D` is the fresh DB query, `M`
    /// is the in-memory overlay. `|D|=0 && |M|>0` keeps M outright (DB
    /// visibility lag); `|D|<|M|` unions D with the subset of M missing from
    /// D and created within the last 30s; otherwise D alone is authoritative
    /// and the overlay has caught up. Entries the DB has caught up on are
    /// pruned from the overlay so it doesn't grow unbounded.
    pub fn list(&self, trading_mode: Option<&str>) -> Result<Vec<Position>, CoreError> {
        let d = self.db.list_positions(trading_mode).map_err(CoreError::Persistence)?;
        let m: Vec<Position> = {
            let mem = self.memory.lock();
            mem.iter()
                .filter(|p| trading_mode.is_none() || trading_mode == Some(p.trading_mode.as_str()))
                .cloned()
                .collect()
        };

        let d_ids: std::collections::HashSet<Uuid> = d.iter().map(|p| p.id).collect();

        let mut result = if d.is_empty() && !m.is_empty() {
            m.clone()
        } else if d.len() < m.len() {
            let now = chrono::Utc::now();
            let m_recent: Vec<Position> = m
                .iter()
                .filter(|p| !d_ids.contains(&p.id) && (now - p.created_date) <= chrono::Duration::seconds(30))
                .cloned()
                .collect();
            let mut combined = d.clone();
            combined.extend(m_recent);
            combined
        } else {
            d.clone()
        };
        result.sort_by_key(|p| std::cmp::Reverse(p.created_date));

        // Drop overlay entries now visible in D; bounds memory growth.
        self.memory.lock().retain(|p| !d_ids.contains(&p.id));

        Ok(result)
    }

    pub fn filter(
        &self,
        trading_mode: Option<&str>,
        symbol: Option<&str>,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, CoreError> {
        let mut rows = self.list(trading_mode)?;
        if let Some(symbol) = symbol {
            rows.retain(|p| p.symbol.eq_ignore_ascii_case(symbol));
        }
        if let Some(status) = status {
            rows.retain(|p| p.status == status);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAnalytics, TradingMode};
    use chrono::Utc;

    fn sample_position(position_id: &str) -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            position_id: position_id.to_string(),
            symbol: "BTC/USDT".into(),
            trading_mode: TradingMode::Testnet,
            status: PositionStatus::Open,
            wallet_id: None,
            entry_price: 50_000.0,
            quantity: 0.01,
            entry_value: 500.0,
            current_price: None,
            unrealized_pnl: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_percent: None,
            trailing_activated: None,
            peak_price: None,
            trough_price: None,
            time_exit_hours: Some(12.0),
            exit_time: None,
            analytics: EntryAnalytics::default(),
            created_date: now,
            updated_date: now,
            entry_timestamp: now,
            last_price_update: None,
        }
    }

    #[tokio::test]
    async fn create_computes_exit_time_from_hours() {
        let db = Db::open_in_memory().unwrap();
        let mgr = PositionManager::new(db);
        let pos = sample_position("pm-1");
        let entry = pos.entry_timestamp;
        let created = mgr.create(pos).await.unwrap();
        assert_eq!(created.exit_time, Some(entry + chrono::Duration::hours(12)));
    }

    #[tokio::test]
    async fn duplicate_position_id_is_rejected_as_duplicate() {
        let db = Db::open_in_memory().unwrap();
        let mgr = PositionManager::new(db);
        mgr.create(sample_position("pm-dup")).await.unwrap();

        let second = mgr.create(sample_position("pm-dup")).await;
        assert!(matches!(second, Err(CoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn update_recomputes_exit_time_when_hours_changes() {
        let db = Db::open_in_memory().unwrap();
        let mgr = PositionManager::new(db);
        let created = mgr.create(sample_position("pm-update")).await.unwrap();

        let updated = mgr
            .update(created.id, |p| p.time_exit_hours = Some(1.0))
            .await
            .unwrap();
        assert_eq!(
            updated.exit_time,
            Some(created.entry_timestamp + chrono::Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn list_serves_overlay_row_before_db_write_lands() {
        // create() pushes to the overlay before the DB write, so a list()
        // call sees the row even without waiting on the DB's own visibility
        // check (§4.2's 50ms sleep + re-read).
        let db = Db::open_in_memory().unwrap();
        let mgr = PositionManager::new(db);
        let created = mgr.create(sample_position("pm-overlay")).await.unwrap();

        let rows = mgr.list(Some("testnet")).unwrap();
        assert!(rows.iter().any(|p| p.id == created.id));
    }

    #[tokio::test]
    async fn list_prunes_overlay_once_db_catches_up() {
        let db = Db::open_in_memory().unwrap();
        let mgr = PositionManager::new(db);
        mgr.create(sample_position("pm-catchup")).await.unwrap();

        // First list() call already saw the row land in D, so the overlay
        // should now be empty; a second call must not double-count it.
        let first = mgr.list(Some("testnet")).unwrap();
        let second = mgr.list(Some("testnet")).unwrap();
        assert_eq!(first.len(), second.len());
    }
}
