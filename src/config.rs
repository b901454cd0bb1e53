//! YAML configuration, environment overrides, and API credentials.

use std::path::Path;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;

// ─────────────────────────────────────────────────────────
// Config sections
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub base_url: String,
    pub ws_public: String,
    pub ws_private: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub api_passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolConfig {
    #[serde(rename = "instType")]
    pub inst_type: String,
    pub symbol: String,
    #[serde(rename = "productType", default)]
    pub product_type: Option<String>,
    #[serde(rename = "marginMode", default)]
    pub margin_mode: Option<String>,
    #[serde(rename = "marginCoin", default)]
    pub margin_coin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolsConfig {
    pub spot: SymbolConfig,
    pub perp: SymbolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub stale_sec: f64,
    #[serde(default)]
    pub book_stale_sec: Option<f64>,
    #[serde(default)]
    pub book_boot_timeout_sec: Option<f64>,
    #[serde(default = "default_controlled_grace")]
    pub controlled_reconnect_grace_sec: f64,
    pub max_unhedged_sec: f64,
    pub max_unhedged_notional: f64,
    pub max_position_notional: f64,
    pub cooldown_sec: f64,
    #[serde(default = "default_funding_stale")]
    pub funding_stale_sec: f64,
    #[serde(default = "default_reject_streak")]
    pub reject_streak_limit: u32,
}

impl RiskConfig {
    /// Staleness horizon for books: explicit override, else the generic one.
    pub fn book_stale_sec(&self) -> f64 {
        self.book_stale_sec.unwrap_or(self.stale_sec)
    }

    /// Deadline for the first book push after a public connect.
    pub fn book_boot_timeout(&self) -> f64 {
        self.book_boot_timeout_sec
            .unwrap_or_else(|| (self.book_stale_sec() * 2.0).max(3.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub enable_only_positive_funding: bool,
    pub min_funding_rate: f64,
    pub target_notional: f64,
    pub delta_tolerance: f64,
    pub obi_levels: usize,
    pub alpha_obi_bps: f64,
    pub gamma_inventory_bps: f64,
    pub base_half_spread_bps: f64,
    pub quote_refresh_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub simulate_fills: bool,
    #[serde(default = "default_sim_interval")]
    pub simulate_fill_interval_sec: f64,
    #[serde(default)]
    pub simulate_fill_qty: f64,
    #[serde(default = "default_sim_side")]
    pub simulate_fill_side: String,
    #[serde(default)]
    pub simulate_hedge_success: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgeConfig {
    pub use_spot_limit_ioc: bool,
    pub hedge_aggressive_bps: f64,
    #[serde(default = "default_hedge_deadline")]
    pub hedge_deadline_sec: f64,
    #[serde(default = "default_hedge_tries")]
    pub hedge_max_tries: u32,
    #[serde(default = "default_chase_slip")]
    pub hedge_chase_slip_bps: f64,
    #[serde(default = "default_true")]
    pub unwind_enable: bool,
    #[serde(default = "default_true")]
    pub halt_on_unwind_reject: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    pub fee_maker_perp_bps: f64,
    pub fee_taker_spot_bps: f64,
    pub slippage_bps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub symbols: SymbolsConfig,
    pub risk: RiskConfig,
    pub strategy: StrategyConfig,
    pub hedge: HedgeConfig,
    pub cost: CostConfig,
}

fn default_controlled_grace() -> f64 {
    3.0
}
fn default_funding_stale() -> f64 {
    120.0
}
fn default_reject_streak() -> u32 {
    3
}
fn default_hedge_deadline() -> f64 {
    1.5
}
fn default_hedge_tries() -> u32 {
    2
}
fn default_chase_slip() -> f64 {
    5.0
}
fn default_true() -> bool {
    true
}
fn default_sim_interval() -> f64 {
    5.0
}
fn default_sim_side() -> String {
    "both".to_string()
}

// ─────────────────────────────────────────────────────────
// Loading / overrides
// ─────────────────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: AppConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Apply the recognized environment overrides in place.
///
/// `DRY_RUN` (0/1) wins over `BOT_MODE` (dry/live), which wins over the
/// config file.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(symbol) = std::env::var("SYMBOL") {
        if !symbol.is_empty() {
            config.symbols.spot.symbol = symbol.clone();
            config.symbols.perp.symbol = symbol;
        }
    }
    if let Ok(product_type) = std::env::var("PRODUCT_TYPE") {
        if !product_type.is_empty() {
            config.symbols.perp.product_type = Some(product_type);
        }
    }
    if let Ok(margin_mode) = std::env::var("MARGIN_MODE") {
        if !margin_mode.is_empty() {
            config.symbols.perp.margin_mode = Some(margin_mode);
        }
    }
    if let Ok(margin_coin) = std::env::var("MARGIN_COIN") {
        if !margin_coin.is_empty() {
            config.symbols.perp.margin_coin = Some(margin_coin);
        }
    }

    match std::env::var("BOT_MODE").as_deref().map(str::trim) {
        Ok("dry") => config.strategy.dry_run = true,
        Ok("live") => config.strategy.dry_run = false,
        _ => {}
    }
    // DRY_RUN is the last word; only the two expected values override.
    match std::env::var("DRY_RUN").as_deref() {
        Ok("1") => config.strategy.dry_run = true,
        Ok("0") => config.strategy.dry_run = false,
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────

/// Bitget credentials triple. Secret material never leaves `SecretString`
/// except at the signing boundary.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: SecretString,
    pub api_passphrase: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

/// Resolve the credentials triple from config or environment.
/// Any missing piece is an error; the caller decides whether that is fatal
/// (live mode) or just disables the private stream (dry-run).
pub fn load_credentials(exchange: &ExchangeConfig) -> Result<Credentials> {
    let api_key = exchange
        .api_key
        .clone()
        .or_else(|| std::env::var("BITGET_API_KEY").ok())
        .filter(|v| !v.is_empty())
        .context("missing BITGET_API_KEY")?;
    let api_secret = exchange
        .api_secret
        .clone()
        .or_else(|| std::env::var("BITGET_API_SECRET").ok())
        .filter(|v| !v.is_empty())
        .context("missing BITGET_API_SECRET")?;
    let api_passphrase = exchange
        .api_passphrase
        .clone()
        .or_else(|| std::env::var("BITGET_API_PASSPHRASE").ok())
        .filter(|v| !v.is_empty())
        .context("missing BITGET_API_PASSPHRASE")?;

    Ok(Credentials {
        api_key,
        api_secret: api_secret.into(),
        api_passphrase: api_passphrase.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
exchange:
  name: bitget
  base_url: https://api.bitget.com
  ws_public: wss://ws.bitget.com/v2/ws/public
  ws_private: wss://ws.bitget.com/v2/ws/private
symbols:
  spot:
    instType: SPOT
    symbol: ETHUSDT
  perp:
    instType: USDT-FUTURES
    symbol: ETHUSDT
    productType: USDT-FUTURES
    marginMode: isolated
    marginCoin: USDT
risk:
  stale_sec: 2.0
  max_unhedged_sec: 2.0
  max_unhedged_notional: 200.0
  max_position_notional: 1000.0
  cooldown_sec: 5.0
strategy:
  enable_only_positive_funding: true
  min_funding_rate: 0.00001
  target_notional: 100.0
  delta_tolerance: 0.001
  obi_levels: 5
  alpha_obi_bps: 0.8
  gamma_inventory_bps: 1.0
  base_half_spread_bps: 2.0
  quote_refresh_ms: 500
  dry_run: true
hedge:
  use_spot_limit_ioc: true
  hedge_aggressive_bps: 5.0
cost:
  fee_maker_perp_bps: 2.0
  fee_taker_spot_bps: 10.0
  slippage_bps: 2.0
"#;

    fn parse() -> AppConfig {
        serde_yaml::from_str(YAML).unwrap()
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = parse();
        assert_eq!(config.symbols.perp.margin_coin.as_deref(), Some("USDT"));
        assert_eq!(config.risk.reject_streak_limit, 3);
        assert_eq!(config.risk.funding_stale_sec, 120.0);
        assert_eq!(config.hedge.hedge_max_tries, 2);
        assert!(config.hedge.unwind_enable);
        assert!(config.hedge.halt_on_unwind_reject);
        assert!(!config.strategy.simulate_fills);
    }

    #[test]
    fn test_book_boot_timeout_derivation() {
        let mut config = parse();
        // Derived: max(3, 2 * stale_sec) with stale_sec=2.0.
        assert!((config.risk.book_boot_timeout() - 4.0).abs() < 1e-9);
        config.risk.book_stale_sec = Some(0.5);
        assert!((config.risk.book_boot_timeout() - 3.0).abs() < 1e-9);
        config.risk.book_boot_timeout_sec = Some(7.5);
        assert!((config.risk.book_boot_timeout() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_section_is_error() {
        let broken = YAML.replace("cost:", "other:");
        assert!(serde_yaml::from_str::<AppConfig>(&broken).is_err());
    }
}
