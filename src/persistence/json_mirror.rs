//! JSON file mirror of the SQLite tables, written atomically via a
//! `.backup` rename so a crash mid-write never leaves a truncated file.
//! The database is the source of truth whenever it is reachable; this
//! mirror exists so the service can still serve reads in file-only mode
//! and so an operator has a human-readable snapshot to inspect.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{Position, Strategy, Trade, WalletSnapshot};

pub struct JsonMirror {
    root: PathBuf,
}

impl JsonMirror {
    pub fn new(storage_dir: &str) -> Result<Self> {
        let root = PathBuf::from(storage_dir);
        fs::create_dir_all(&root).with_context(|| format!("creating storage dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn write_positions(&self, positions: &[Position]) -> Result<()> {
        self.write_atomic("positions.json", positions)
    }

    pub fn write_trades(&self, trades: &[Trade]) -> Result<()> {
        self.write_atomic("trades.json", trades)
    }

    pub fn write_strategies(&self, strategies: &[Strategy]) -> Result<()> {
        self.write_atomic("strategies.json", strategies)
    }

    pub fn write_wallet_snapshots(&self, snapshots: &[WalletSnapshot]) -> Result<()> {
        self.write_atomic("wallet_snapshots.json", snapshots)
    }

    pub fn read_positions(&self) -> Result<Vec<Position>> {
        self.read_or_empty("positions.json")
    }

    pub fn read_trades(&self) -> Result<Vec<Trade>> {
        self.read_or_empty("trades.json")
    }

    pub fn read_strategies(&self) -> Result<Vec<Strategy>> {
        self.read_or_empty("strategies.json")
    }

    /// Writes `<name>` by first writing a sibling `<name>.backup`, `fsync`ing
    /// it, then renaming it over the target. The rename is atomic on the
    /// same filesystem, so readers never observe a half-written file.
    fn write_atomic<T: serde::Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let target = self.root.join(name);
        let backup = self.root.join(format!("{name}.backup"));

        let json = serde_json::to_vec_pretty(value)?;
        {
            let file = fs::File::create(&backup)
                .with_context(|| format!("creating {}", backup.display()))?;
            use std::io::Write;
            let mut file = file;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&backup, &target)
            .with_context(|| format!("renaming {} -> {}", backup.display(), target.display()))?;
        Ok(())
    }

    fn read_or_empty<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let path: PathBuf = self.root.join(name);
        read_json_or_empty(&path)
    }
}

fn read_json_or_empty<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAnalytics, PositionStatus, TradingMode};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_position() -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            position_id: "p1".into(),
            symbol: "ETH/USDT".into(),
            trading_mode: TradingMode::Testnet,
            status: PositionStatus::Open,
            wallet_id: None,
            entry_price: 3000.0,
            quantity: 1.0,
            entry_value: 3000.0,
            current_price: None,
            unrealized_pnl: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_percent: None,
            trailing_activated: None,
            peak_price: None,
            trough_price: None,
            time_exit_hours: None,
            exit_time: None,
            analytics: EntryAnalytics::default(),
            created_date: now,
            updated_date: now,
            entry_timestamp: now,
            last_price_update: None,
        }
    }

    #[test]
    fn round_trips_positions_and_leaves_no_backup_file() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonMirror::new(dir.path().to_str().unwrap()).unwrap();
        let positions = vec![sample_position()];

        mirror.write_positions(&positions).unwrap();
        let back = mirror.read_positions().unwrap();

        assert_eq!(back.len(), 1);
        assert_eq!(back[0].position_id, "p1");
        assert!(!dir.path().join("positions.json.backup").exists());
        assert!(dir.path().join("positions.json").exists());
    }

    #[test]
    fn missing_file_reads_as_empty_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonMirror::new(dir.path().to_str().unwrap()).unwrap();
        let trades: Vec<Trade> = mirror.read_trades().unwrap();
        assert!(trades.is_empty());
    }
}
