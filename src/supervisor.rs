//! Task supervisor: preflight, task spawn set, disconnect monitor, and
//! graceful shutdown.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{apply_env_overrides, load_config, load_credentials};
use crate::exchange::gateway::Gateway;
use crate::jsonl::{now_s, JsonlLogger};
use crate::market::funding::FundingCache;
use crate::oms::{self, Oms};
use crate::risk::RiskGuards;
use crate::sim;
use crate::store::DataStore;
use crate::strategy::MmFundingStrategy;

const FUNDING_POLL_SEC: f64 = 60.0;
const CONSTRAINTS_REFRESH_SEC: f64 = 60.0;
const CONSTRAINTS_RETRY_SEC: f64 = 5.0;
const POSITIONS_SYNC_TIMEOUT_SEC: f64 = 10.0;
const STARTUP_WARMUP: Duration = Duration::from_secs(5);
const LOOP_LAG_INTERVAL: Duration = Duration::from_secs(1);
const LOOP_LAG_WARN_MS: f64 = 200.0;

fn log_dir() -> PathBuf {
    std::env::var("LOG_DIR")
        .or_else(|_| std::env::var("LOG_PATH")) // legacy name
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name).as_deref() {
        Ok("1") => true,
        Ok("0") => false,
        _ => default,
    }
}

/// Full bot lifecycle. Returns an error on any preflight failure; the
/// process exit code is non-zero in that case.
pub async fn run(config_path: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;
    apply_env_overrides(&mut config);
    let config = Arc::new(config);

    let dir = log_dir();
    let system_log = JsonlLogger::open(dir.join("system.jsonl"))?;
    let orders_log = JsonlLogger::open(dir.join("orders.jsonl"))?;
    let fills_log = JsonlLogger::open(dir.join("fills.jsonl"))?;
    let decision_log = JsonlLogger::open(dir.join("decision.jsonl"))?;

    // The probe starts before any network-bound startup step so the slow
    // parts of boot (credential load, cancel-all, preflights) are measured
    // too.
    let loop_lag_task = tokio::spawn(loop_lag_probe(system_log.clone()));

    system_log.log(json!({
        "event": "start",
        "intent": "SYSTEM",
        "source": "startup",
        "mode": "INIT",
        "reason": "start",
        "leg": "both",
        "data": {
            "symbol": config.symbols.perp.symbol,
            "dry_run": config.strategy.dry_run,
        },
    }));
    info!(
        symbol = %config.symbols.perp.symbol,
        dry_run = config.strategy.dry_run,
        "starting funding market maker"
    );

    // ── Credentials ──
    let force_private_off = env_flag("FORCE_PRIVATE_OFF", false);
    let creds = match load_credentials(&config.exchange) {
        Ok(creds) => Some(creds),
        Err(err) => {
            if config.strategy.dry_run {
                system_log.log(json!({
                    "event": "private_disabled",
                    "intent": "SYSTEM",
                    "source": "startup",
                    "mode": "INIT",
                    "reason": "missing_api_keys",
                    "leg": "private",
                    "data": { "error": err.to_string() },
                }));
                None
            } else {
                system_log.log(json!({
                    "event": "preflight_failed",
                    "intent": "SYSTEM",
                    "source": "startup",
                    "mode": "INIT",
                    "reason": "missing_credentials",
                    "leg": "private",
                }));
                return Err(err.context("live mode requires credentials"));
            }
        }
    };
    let private_enabled = creds.is_some() && !force_private_off;

    // ── Core components ──
    let store = Arc::new(DataStore::new());
    let (gateway, mut disconnect_rx) =
        Gateway::new(config.clone(), store.clone(), creds, system_log.clone());
    let risk = Arc::new(Mutex::new(RiskGuards::new(config.risk.clone())));
    let funding = Arc::new(FundingCache::new(
        gateway.clone(),
        system_log.clone(),
        FUNDING_POLL_SEC,
    ));
    let oms = Arc::new(tokio::sync::Mutex::new(Oms::new(
        gateway.clone(),
        config.clone(),
        risk.clone(),
        orders_log.clone(),
        fills_log.clone(),
    )));

    // ── Startup cancel-all + warmup ──
    if private_enabled {
        system_log.log(startup_cancel_event("startup_cancel_all_begin"));
        let ok = oms.lock().await.cancel_all("startup_cancel_all").await;
        if ok {
            system_log.log(startup_cancel_event("startup_cancel_all_done"));
        } else {
            system_log.log(startup_cancel_event("startup_cancel_all_failed"));
            bail!("startup cancel-all failed");
        }
        tokio::time::sleep(STARTUP_WARMUP).await;
    }

    // ── Constraints preflight ──
    if let Err(err) = gateway.load_constraints().await {
        system_log.log(json!({
            "event": "preflight_failed",
            "intent": "SYSTEM",
            "source": "startup",
            "mode": "INIT",
            "reason": "constraints_error",
            "leg": "both",
            "data": { "error": err.to_string() },
        }));
        return Err(err.context("constraints preflight"));
    }
    if !gateway.constraints().ready() {
        system_log.log(json!({
            "event": "preflight_failed",
            "intent": "SYSTEM",
            "source": "startup",
            "mode": "INIT",
            "reason": "constraints_not_ready",
            "leg": "both",
        }));
        bail!("constraints not ready");
    }

    // ── Position mode reconciliation ──
    if private_enabled && !config.strategy.dry_run {
        reconcile_pos_mode(&gateway, &system_log).await?;
    }

    // ── Funding preflight ──
    if let Err(err) = funding.update_once().await {
        system_log.log(json!({
            "event": "preflight_failed",
            "intent": "SYSTEM",
            "source": "startup",
            "mode": "INIT",
            "reason": "funding_error",
            "leg": "perp",
            "data": { "error": err.to_string() },
        }));
        return Err(err.context("funding preflight"));
    }
    if funding.last().is_none() && !config.strategy.dry_run {
        system_log.log(json!({
            "event": "preflight_failed",
            "intent": "SYSTEM",
            "source": "startup",
            "mode": "INIT",
            "reason": "funding_unavailable",
            "leg": "perp",
        }));
        bail!("funding unavailable");
    }

    // ── Task spawn set ──
    let strategy = MmFundingStrategy::new(
        config.clone(),
        funding.clone(),
        oms.clone(),
        risk.clone(),
        gateway.clone(),
        store.clone(),
        decision_log.clone(),
    );

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    tasks.push(("funding", tokio::spawn(funding.clone().run())));
    tasks.push(("strategy", tokio::spawn(strategy.run())));
    tasks.push(("loop_lag", loop_lag_task));

    {
        // Disconnect monitor: first uncontrolled disconnect halts risk and
        // pulls everything.
        let risk = risk.clone();
        let oms = oms.clone();
        let log = system_log.clone();
        tasks.push((
            "disconnect_monitor",
            tokio::spawn(async move {
                loop {
                    if *disconnect_rx.borrow() {
                        break;
                    }
                    if disconnect_rx.changed().await.is_err() {
                        return;
                    }
                }
                warn!("ws disconnect observed, halting");
                let newly = risk
                    .lock()
                    .map(|mut risk| risk.halt("ws_disconnect", now_s()))
                    .unwrap_or(false);
                if newly {
                    log.log(json!({
                        "event": "halted",
                        "intent": "SYSTEM",
                        "source": "runtime",
                        "mode": "HALTED",
                        "reason": "ws_disconnect",
                        "leg": "both",
                    }));
                }
                let mut oms = oms.lock().await;
                oms.cancel_all("ws_disconnect").await;
                oms.abort_open_tickets("halted");
            }),
        ));
    }

    if private_enabled {
        tasks.push((
            "fill_monitor",
            tokio::spawn(oms::monitor_fills(oms.clone(), store.clone())),
        ));
        tasks.push((
            "positions_sync",
            tokio::spawn(oms::sync_positions(
                oms.clone(),
                store.clone(),
                POSITIONS_SYNC_TIMEOUT_SEC,
                orders_log.clone(),
            )),
        ));
        tasks.push(("private_ws", tokio::spawn(gateway.clone().run_private_ws())));
    }
    tasks.push(("public_ws", tokio::spawn(gateway.clone().run_public_ws())));
    tasks.push((
        "constraints_refresh",
        tokio::spawn(
            gateway
                .clone()
                .refresh_constraints_loop(CONSTRAINTS_REFRESH_SEC, CONSTRAINTS_RETRY_SEC),
        ),
    ));
    if config.strategy.simulate_fills {
        tasks.push((
            "fill_injector",
            tokio::spawn(sim::run(
                oms.clone(),
                store.clone(),
                config.clone(),
                gateway.clone(),
            )),
        ));
    }

    // ── Run until interrupted ──
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(err) => error!(%err, "signal handler failed, shutting down"),
    }
    system_log.log(json!({
        "event": "shutdown",
        "intent": "SYSTEM",
        "source": "signal",
        "mode": "STOPPING",
        "reason": "cancelled",
        "leg": "both",
    }));

    for (name, task) in tasks {
        task.abort();
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                warn!(task = name, %err, "task ended abnormally");
            }
        }
    }
    Ok(())
}

fn startup_cancel_event(event: &str) -> serde_json::Value {
    json!({
        "event": event,
        "intent": "SYSTEM",
        "source": "startup",
        "mode": "INIT",
        "reason": "startup_cancel_all",
        "leg": "orders",
    })
}

/// Compare the account's position mode against the target; optionally set
/// it; fatal when the mismatch survives.
async fn reconcile_pos_mode(gateway: &Arc<Gateway>, log: &JsonlLogger) -> Result<()> {
    let target = std::env::var("TARGET_POS_MODE")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "one_way_mode".to_string());
    let auto_set = env_flag("AUTO_SET_POS_MODE", true);

    let mut current = gateway.get_pos_mode().await.unwrap_or(None);
    log.log(pos_mode_event("pos_mode", current.as_deref(), &target, auto_set));

    if let Some(seen) = &current {
        if *seen != target {
            if auto_set {
                let res = gateway.set_pos_mode(&target).await.context("set pos mode")?;
                log.log(json!({
                    "event": "pos_mode_set",
                    "intent": "SYSTEM",
                    "source": "startup",
                    "mode": "INIT",
                    "reason": "set",
                    "leg": "perp",
                    "data": { "target": target },
                    "res": res,
                }));
                current = gateway.get_pos_mode().await.unwrap_or(None);
                log.log(pos_mode_event("pos_mode", current.as_deref(), &target, auto_set));
            }
            if current.as_deref() != Some(target.as_str()) {
                log.log(json!({
                    "event": "preflight_failed",
                    "intent": "SYSTEM",
                    "source": "startup",
                    "mode": "INIT",
                    "reason": "pos_mode_mismatch",
                    "leg": "perp",
                    "data": { "current": current, "target": target },
                }));
                bail!("posMode mismatch: current={current:?} target={target}");
            }
        }
    }
    Ok(())
}

fn pos_mode_event(
    event: &str,
    current: Option<&str>,
    target: &str,
    auto_set: bool,
) -> serde_json::Value {
    json!({
        "event": event,
        "intent": "SYSTEM",
        "source": "startup",
        "mode": "INIT",
        "reason": "check",
        "leg": "perp",
        "data": { "current": current, "target": target, "auto_set": auto_set },
    })
}

/// Event-loop lag probe: a sleep that oversleeps by more than the warn
/// threshold indicates the loop is starved.
async fn loop_lag_probe(log: JsonlLogger) {
    let mut last = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(LOOP_LAG_INTERVAL).await;
        let now = tokio::time::Instant::now();
        let lag_ms =
            ((now - last).as_secs_f64() - LOOP_LAG_INTERVAL.as_secs_f64()).max(0.0) * 1000.0;
        if lag_ms >= LOOP_LAG_WARN_MS {
            warn!(lag_ms, "event loop lag");
            log.log(json!({
                "event": "loop_lag",
                "intent": "SYSTEM",
                "source": "runtime",
                "mode": "RUN",
                "reason": "loop_lag",
                "leg": "system",
                "data": { "lag_ms": lag_ms, "interval_s": LOOP_LAG_INTERVAL.as_secs_f64() },
            }));
        }
        last = now;
    }
}
