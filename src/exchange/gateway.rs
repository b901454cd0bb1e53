//! Bitget V2 gateway: signed REST, public/private WebSocket lifecycles,
//! book bootstrap with channel fallback, and disconnect signalling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, Credentials};
use crate::constraints::{ConstraintsRegistry, InstrumentConstraints};
use crate::exchange::{auth, payloads};
use crate::jsonl::{now_ms, JsonlLogger};
use crate::store::{BookKey, DataStore};
use crate::types::{InstrumentKind, OrderRequest};
use crate::util::{first_f64, first_i64};

pub const BOOK_CHANNEL_PRIMARY: &str = "books";
pub const BOOK_CHANNEL_FALLBACK: &str = "books5";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

// ─────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────

struct GatewayState {
    public_channel: String,
    book_ready: bool,
    controlled_until_ms: i64,
    controlled_reason: Option<String>,
    /// (symbol, channel) pairs already reported as filter-unavailable.
    filter_warned: HashSet<(String, String)>,
}

enum SessionEnd {
    /// Book bootstrap missed its deadline; socket already unsubscribed/closed.
    BootstrapTimeout,
    /// Server closed or the stream ended.
    Closed,
}

pub struct Gateway {
    http: reqwest::Client,
    store: Arc<DataStore>,
    config: Arc<AppConfig>,
    creds: Option<Credentials>,
    log: JsonlLogger,
    disconnect_tx: watch::Sender<bool>,
    constraints: RwLock<ConstraintsRegistry>,
    state: Mutex<GatewayState>,
    /// Book keys that have received at least one push this connection.
    bootstrap_seen: Mutex<HashSet<BookKey>>,
}

impl Gateway {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<DataStore>,
        creds: Option<Credentials>,
        log: JsonlLogger,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        let gateway = Arc::new(Self {
            http: reqwest::Client::new(),
            store,
            config,
            creds,
            log,
            disconnect_tx,
            constraints: RwLock::new(ConstraintsRegistry::default()),
            state: Mutex::new(GatewayState {
                public_channel: BOOK_CHANNEL_PRIMARY.to_string(),
                book_ready: false,
                controlled_until_ms: 0,
                controlled_reason: None,
                filter_warned: HashSet::new(),
            }),
            bootstrap_seen: Mutex::new(HashSet::new()),
        });
        (gateway, disconnect_rx)
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn constraints(&self) -> ConstraintsRegistry {
        self.constraints.read().map(|guard| *guard).unwrap_or_default()
    }

    pub fn constraints_for(&self, kind: InstrumentKind) -> Option<InstrumentConstraints> {
        self.constraints().get(kind)
    }

    pub fn public_book_channel(&self) -> String {
        self.state
            .lock()
            .map(|state| state.public_channel.clone())
            .unwrap_or_else(|_| BOOK_CHANNEL_PRIMARY.to_string())
    }

    pub fn book_ready(&self) -> bool {
        self.state.lock().map(|state| state.book_ready).unwrap_or(false)
    }

    /// Called by the strategy when a snapshot had to drop the channel filter.
    /// Logged once per (symbol, channel).
    pub fn note_book_channel_filter_unavailable(
        &self,
        kind: InstrumentKind,
        symbol: &str,
        channel: &str,
    ) {
        if channel.is_empty() {
            return;
        }
        let newly = self
            .state
            .lock()
            .map(|mut state| {
                state
                    .filter_warned
                    .insert((symbol.to_string(), channel.to_string()))
            })
            .unwrap_or(false);
        if !newly {
            return;
        }
        self.log.log(json!({
            "event": "book_channel_filter_unavailable",
            "intent": "SYSTEM",
            "source": "marketdata",
            "mode": "RUN",
            "reason": "book_channel_filter_unavailable",
            "leg": "books",
            "data": { "inst_type": kind.as_str(), "symbol": symbol, "channel": channel },
        }));
    }

    // ─────────────────────────────────────────────────
    // REST plumbing
    // ─────────────────────────────────────────────────

    async fn rest_get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        let path_with_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let url = format!("{}{}", self.config.exchange.base_url, path_with_query);

        let mut request = self.http.get(&url);
        if let Some(creds) = &self.creds {
            let ts = now_ms();
            let sign = auth::sign(
                &creds.api_secret,
                &auth::rest_prehash(ts, "GET", &path_with_query, ""),
            );
            request = auth_headers(request, creds, ts, &sign);
        }
        let response = request.send().await.with_context(|| format!("GET {path}"))?;
        response
            .json::<Value>()
            .await
            .with_context(|| format!("GET {path}: malformed json"))
    }

    async fn rest_post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.config.exchange.base_url, path);
        let body_text = body.to_string();

        let mut request = self.http.post(&url).body(body_text.clone());
        request = request.header("Content-Type", "application/json");
        if let Some(creds) = &self.creds {
            let ts = now_ms();
            let sign = auth::sign(
                &creds.api_secret,
                &auth::rest_prehash(ts, "POST", path, &body_text),
            );
            request = auth_headers(request, creds, ts, &sign);
        }
        let response = request.send().await.with_context(|| format!("POST {path}"))?;
        response
            .json::<Value>()
            .await
            .with_context(|| format!("POST {path}: malformed json"))
    }

    // ─────────────────────────────────────────────────
    // REST surface
    // ─────────────────────────────────────────────────

    pub async fn fetch_spot_symbols(&self) -> Result<Value> {
        self.rest_get(
            "/api/v2/spot/public/symbols",
            &[("symbol", &self.config.symbols.spot.symbol)],
        )
        .await
    }

    pub async fn fetch_perp_contracts(&self) -> Result<Value> {
        let perp = &self.config.symbols.perp;
        self.rest_get(
            "/api/v2/mix/market/contracts",
            &[
                ("productType", perp.product_type.as_deref().unwrap_or_default()),
                ("symbol", &perp.symbol),
            ],
        )
        .await
    }

    pub async fn fetch_funding(&self) -> Result<Value> {
        let perp = &self.config.symbols.perp;
        self.rest_get(
            "/api/v2/mix/market/current-fund-rate",
            &[
                ("symbol", &perp.symbol),
                ("productType", perp.product_type.as_deref().unwrap_or_default()),
            ],
        )
        .await
    }

    pub async fn get_pos_mode(&self) -> Result<Option<String>> {
        let perp = &self.config.symbols.perp;
        let payload = self
            .rest_get(
                "/api/v2/mix/account/account",
                &[
                    ("productType", perp.product_type.as_deref().unwrap_or_default()),
                    ("symbol", &perp.symbol),
                    ("marginCoin", perp.margin_coin.as_deref().unwrap_or_default()),
                ],
            )
            .await?;

        let data = payload.get("data").unwrap_or(&Value::Null);
        let pos_mode = match data {
            Value::Object(row) => row.get("posMode").and_then(Value::as_str).map(str::to_string),
            Value::Array(rows) => rows
                .iter()
                .find(|row| row.get("symbol").and_then(Value::as_str) == Some(perp.symbol.as_str()))
                .or_else(|| rows.first())
                .and_then(|row| row.get("posMode"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        Ok(pos_mode)
    }

    pub async fn set_pos_mode(&self, pos_mode: &str) -> Result<Value> {
        let perp = &self.config.symbols.perp;
        let body = json!({
            "productType": perp.product_type,
            "posMode": pos_mode,
        });
        self.rest_post("/api/v2/mix/account/set-position-mode", &body).await
    }

    pub async fn place_order(&self, req: &OrderRequest) -> Result<Value> {
        let payload = payloads::place_order(
            req,
            &self.config.symbols.perp,
            self.constraints_for(req.kind).as_ref(),
        );
        self.rest_post(payloads::place_path(req.kind), &payload).await
    }

    pub async fn cancel_order(
        &self,
        kind: InstrumentKind,
        symbol: &str,
        order_id: Option<&str>,
        client_oid: Option<&str>,
    ) -> Result<Value> {
        let payload = payloads::cancel_order(
            kind,
            symbol,
            &self.config.symbols.perp,
            order_id,
            client_oid,
        );
        self.rest_post(payloads::cancel_path(kind), &payload).await
    }

    // ─────────────────────────────────────────────────
    // Constraints loading
    // ─────────────────────────────────────────────────

    /// Fetch and parse both legs' constraints. Each leg tolerates a partial
    /// or missing payload: the previous value is kept on failure.
    pub async fn load_constraints(&self) -> Result<ConstraintsRegistry> {
        let spot_symbol = self.config.symbols.spot.symbol.clone();
        let perp_symbol = self.config.symbols.perp.symbol.clone();

        let spot = self
            .fetch_spot_symbols()
            .await
            .ok()
            .and_then(|payload| find_row(&payload, "symbol", &spot_symbol))
            .map(|row| parse_spot_constraints(&row));
        let perp = self
            .fetch_perp_contracts()
            .await
            .ok()
            .and_then(|payload| find_row(&payload, "symbol", &perp_symbol))
            .map(|row| parse_perp_constraints(&row));

        if let Ok(mut registry) = self.constraints.write() {
            if spot.is_some() {
                registry.spot = spot;
            }
            if perp.is_some() {
                registry.perp = perp;
            }
        }
        Ok(self.constraints())
    }

    pub async fn refresh_constraints_loop(self: Arc<Self>, interval_sec: f64, retry_sec: f64) {
        loop {
            match self.load_constraints().await {
                Ok(registry) => {
                    self.log.log(json!({
                        "event": "constraints_loaded",
                        "intent": "SYSTEM",
                        "source": "rest",
                        "mode": "RUN",
                        "reason": "constraints_refresh",
                        "leg": "both",
                        "data": {
                            "spot_ready": registry.spot.map(|c| c.is_ready()).unwrap_or(false),
                            "perp_ready": registry.perp.map(|c| c.is_ready()).unwrap_or(false),
                        },
                    }));
                    tokio::time::sleep(Duration::from_secs_f64(interval_sec)).await;
                }
                Err(err) => {
                    self.log.log(json!({
                        "event": "constraints_error",
                        "intent": "SYSTEM",
                        "source": "rest",
                        "mode": "RUN",
                        "reason": "constraints_refresh",
                        "leg": "both",
                        "data": { "error": err.to_string() },
                    }));
                    tokio::time::sleep(Duration::from_secs_f64(retry_sec)).await;
                }
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Public WS: bootstrap + channel fallback
    // ─────────────────────────────────────────────────

    pub async fn run_public_ws(self: Arc<Self>) {
        let boot_timeout = Duration::from_secs_f64(self.config.risk.book_boot_timeout());
        let mut channel = BOOK_CHANNEL_PRIMARY.to_string();
        let mut fallback_tried = false;

        loop {
            self.set_public_channel(&channel);
            self.set_book_ready(false);

            match self.public_session(&channel, boot_timeout).await {
                Ok(SessionEnd::BootstrapTimeout) => {
                    if !fallback_tried {
                        fallback_tried = true;
                        self.log.log(json!({
                            "event": "book_fallback",
                            "intent": "SYSTEM",
                            "source": "ws_public",
                            "mode": "INIT",
                            "reason": "book_boot_timeout",
                            "leg": "books",
                            "from_channel": channel.clone(),
                            "to_channel": BOOK_CHANNEL_FALLBACK,
                        }));
                        // Stale rows from the abandoned channel must not
                        // satisfy later reads.
                        self.store.clear_books();
                        self.log.log(json!({
                            "event": "book_store_cleared",
                            "intent": "SYSTEM",
                            "source": "ws_public",
                            "mode": "INIT",
                            "reason": "filter_unavailable",
                            "leg": "books",
                            "cleared": true,
                        }));
                        // The planned close surfaces as a controlled
                        // disconnect, not as a halt trigger.
                        self.signal_ws_disconnect("public", Some("book_fallback"));
                        channel = BOOK_CHANNEL_FALLBACK.to_string();
                        // Reconnect immediately: the controlled window is
                        // already ticking.
                        continue;
                    }
                    self.log.log(json!({
                        "event": "book_fallback_failed",
                        "intent": "SYSTEM",
                        "source": "ws_public",
                        "mode": "INIT",
                        "reason": "book_boot_timeout",
                        "leg": "books",
                        "channel": channel.clone(),
                    }));
                    // The failed fallback escalates even inside the grace
                    // window.
                    self.clear_controlled_reconnect();
                    self.signal_ws_disconnect("public", Some("book_fallback_failed"));
                }
                Ok(SessionEnd::Closed) => {
                    self.signal_ws_disconnect("public", None);
                }
                Err(err) => {
                    self.signal_ws_disconnect("public", Some(&err.to_string()));
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn public_session(&self, channel: &str, boot_timeout: Duration) -> Result<SessionEnd> {
        let spot = &self.config.symbols.spot;
        let perp = &self.config.symbols.perp;
        let expected = vec![
            BookKey {
                inst_type: spot.inst_type.clone(),
                channel: channel.to_string(),
                inst_id: spot.symbol.clone(),
            },
            BookKey {
                inst_type: perp.inst_type.clone(),
                channel: channel.to_string(),
                inst_id: perp.symbol.clone(),
            },
        ];
        if let Ok(mut seen) = self.bootstrap_seen.lock() {
            seen.clear();
        }

        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            connect_async(&self.config.exchange.ws_public),
        )
        .await
        .context("public ws connect timeout")?;
        let (ws, response) = connect.context("public ws connect")?;
        info!(status = ?response.status(), channel, "public WS connected");
        let (mut write, mut read) = ws.split();

        let args: Vec<Value> = expected
            .iter()
            .map(|key| {
                json!({
                    "instType": key.inst_type,
                    "channel": key.channel,
                    "instId": key.inst_id,
                })
            })
            .collect();
        write
            .send(Message::Text(
                json!({ "op": "subscribe", "args": args.clone() }).to_string(),
            ))
            .await
            .context("public ws subscribe")?;
        self.log.log(json!({
            "event": "ws_public_connected",
            "intent": "SYSTEM",
            "source": "ws_public",
            "mode": "INIT",
            "reason": "connected",
            "leg": "books",
            "channel": channel,
        }));

        let boot_deadline = tokio::time::Instant::now() + boot_timeout;
        let mut bootstrapped = false;
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(boot_deadline), if !bootstrapped => {
                    self.log.log(json!({
                        "event": "book_boot_timeout",
                        "intent": "SYSTEM",
                        "source": "ws_public",
                        "mode": "INIT",
                        "reason": "book_boot_timeout",
                        "leg": "books",
                        "channel": channel,
                    }));
                    // Planned teardown: suppress the disconnect signal for
                    // the grace window, then unsubscribe and close.
                    self.enter_controlled_reconnect("book_fallback");
                    let _ = write
                        .send(Message::Text(
                            json!({ "op": "unsubscribe", "args": args.clone() }).to_string(),
                        ))
                        .await;
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::BootstrapTimeout);
                }
                _ = ping.tick() => {
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .context("public ws ping")?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "pong" {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        self.route_public(&value);
                        if !bootstrapped && self.bootstrap_complete(&expected) {
                            bootstrapped = true;
                            self.clear_controlled_reconnect();
                            self.set_book_ready(true);
                            self.log.log(json!({
                                "event": "book_bootstrap",
                                "intent": "SYSTEM",
                                "source": "ws_public",
                                "mode": "INIT",
                                "reason": "book_bootstrap",
                                "leg": "books",
                                "channel": channel,
                            }));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
    }

    fn route_public(&self, value: &Value) {
        if value.get("event").is_some() {
            debug!(?value, "public WS control message");
            return;
        }
        let Some(arg) = value.get("arg") else {
            return;
        };
        let (Some(inst_type), Some(channel), Some(inst_id)) = (
            arg.get("instType").and_then(Value::as_str),
            arg.get("channel").and_then(Value::as_str),
            arg.get("instId").and_then(Value::as_str),
        ) else {
            return;
        };
        if !channel.starts_with("books") {
            return;
        }
        let key = BookKey {
            inst_type: inst_type.to_string(),
            channel: channel.to_string(),
            inst_id: inst_id.to_string(),
        };
        let action = value.get("action").and_then(Value::as_str).unwrap_or("snapshot");
        let rows = value
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        self.store.apply_book(&key, action, &rows);
        if let Ok(mut seen) = self.bootstrap_seen.lock() {
            seen.insert(key);
        }
    }

    fn bootstrap_complete(&self, expected: &[BookKey]) -> bool {
        self.bootstrap_seen
            .lock()
            .map(|seen| expected.iter().all(|key| seen.contains(key)))
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────
    // Private WS
    // ─────────────────────────────────────────────────

    pub async fn run_private_ws(self: Arc<Self>) {
        loop {
            match self.private_session().await {
                Ok(()) => self.signal_ws_disconnect("private", None),
                Err(err) => self.signal_ws_disconnect("private", Some(&err.to_string())),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn private_session(&self) -> Result<()> {
        let creds = self
            .creds
            .as_ref()
            .context("private ws requires credentials")?;

        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            connect_async(&self.config.exchange.ws_private),
        )
        .await
        .context("private ws connect timeout")?;
        let (ws, response) = connect.context("private ws connect")?;
        info!(status = ?response.status(), "private WS connected");
        let (mut write, mut read) = ws.split();

        let ts = now_ms() / 1000;
        let login = json!({
            "op": "login",
            "args": [{
                "apiKey": creds.api_key,
                "passphrase": secrecy::ExposeSecret::expose_secret(&creds.api_passphrase),
                "timestamp": ts.to_string(),
                "sign": auth::sign(&creds.api_secret, &auth::ws_login_prehash(ts)),
            }],
        });
        write
            .send(Message::Text(login.to_string()))
            .await
            .context("private ws login")?;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .context("private ws ping")?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "pong" {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        match value.get("event").and_then(Value::as_str) {
                            Some("login") => {
                                let code = value.get("code").map(|c| c.to_string()).unwrap_or_default();
                                if code.trim_matches('"') != "0" {
                                    anyhow::bail!("private ws login rejected: {value}");
                                }
                                write
                                    .send(Message::Text(self.private_subscribe().to_string()))
                                    .await
                                    .context("private ws subscribe")?;
                                self.log.log(json!({
                                    "event": "ws_private_connected",
                                    "intent": "SYSTEM",
                                    "source": "ws_private",
                                    "mode": "INIT",
                                    "reason": "connected",
                                    "leg": "private",
                                }));
                            }
                            Some("error") => anyhow::bail!("private ws error: {value}"),
                            Some(_) => debug!(?value, "private WS control message"),
                            None => self.route_private(&value),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
    }

    fn private_subscribe(&self) -> Value {
        let spot = &self.config.symbols.spot;
        let perp = &self.config.symbols.perp;
        json!({
            "op": "subscribe",
            "args": [
                { "instType": spot.inst_type, "channel": "fill", "instId": spot.symbol },
                { "instType": perp.inst_type, "channel": "fill", "instId": "default" },
                { "instType": perp.inst_type, "channel": "positions", "instId": "default" },
            ],
        })
    }

    fn route_private(&self, value: &Value) {
        let Some(arg) = value.get("arg") else {
            return;
        };
        let channel = arg.get("channel").and_then(Value::as_str).unwrap_or_default();
        let inst_type = arg.get("instType").and_then(Value::as_str).unwrap_or_default();
        let rows = value
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        match channel {
            "fill" => {
                // Fill rows omit instType; carry it over from the arg so the
                // OMS can classify the leg.
                let rows = rows
                    .into_iter()
                    .map(|mut row| {
                        if row.get("instType").is_none() {
                            if let Some(map) = row.as_object_mut() {
                                map.insert("instType".to_string(), json!(inst_type));
                            }
                        }
                        row
                    })
                    .collect();
                self.store.push_fills(rows);
            }
            "positions" => self.store.set_positions(rows),
            _ => {}
        }
    }

    // ─────────────────────────────────────────────────
    // Disconnect signalling
    // ─────────────────────────────────────────────────

    fn signal_ws_disconnect(&self, scope: &str, error: Option<&str>) {
        if scope == "public" {
            self.set_book_ready(false);
            if let Some(reason) = self.controlled_reconnect_reason() {
                self.log.log(json!({
                    "event": "ws_disconnect_controlled",
                    "intent": "SYSTEM",
                    "source": "ws",
                    "mode": "RUN",
                    "reason": reason,
                    "leg": "books",
                    "scope": scope,
                    "error": error,
                }));
                return;
            }
        }
        warn!(scope, ?error, "uncontrolled WS disconnect");
        let _ = self.disconnect_tx.send(true);
        self.log.log(json!({
            "event": "ws_disconnect",
            "intent": "SYSTEM",
            "source": "ws",
            "mode": "RUN",
            "reason": "ws_disconnect",
            "leg": "ws",
            "scope": scope,
            "error": error,
        }));
    }

    fn enter_controlled_reconnect(&self, reason: &str) {
        let grace = self.config.risk.controlled_reconnect_grace_sec;
        if let Ok(mut state) = self.state.lock() {
            if grace <= 0.0 {
                state.controlled_until_ms = 0;
                state.controlled_reason = None;
            } else {
                state.controlled_until_ms = now_ms() + (grace * 1000.0) as i64;
                state.controlled_reason = Some(reason.to_string());
            }
        }
    }

    fn clear_controlled_reconnect(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.controlled_until_ms = 0;
            state.controlled_reason = None;
        }
    }

    /// The active controlled-reconnect reason, or `None` when outside the
    /// grace window.
    fn controlled_reconnect_reason(&self) -> Option<String> {
        self.state.lock().ok().and_then(|state| {
            if state.controlled_until_ms > 0 && now_ms() <= state.controlled_until_ms {
                state.controlled_reason.clone()
            } else {
                None
            }
        })
    }

    fn set_public_channel(&self, channel: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.public_channel = channel.to_string();
        }
    }

    pub(crate) fn set_book_ready(&self, ready: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.book_ready = ready;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_constraints_for_tests(&self, registry: ConstraintsRegistry) {
        if let Ok(mut guard) = self.constraints.write() {
            *guard = registry;
        }
    }
}

fn auth_headers(
    request: reqwest::RequestBuilder,
    creds: &Credentials,
    ts: i64,
    sign: &str,
) -> reqwest::RequestBuilder {
    request
        .header("ACCESS-KEY", &creds.api_key)
        .header("ACCESS-SIGN", sign)
        .header("ACCESS-TIMESTAMP", ts.to_string())
        .header(
            "ACCESS-PASSPHRASE",
            secrecy::ExposeSecret::expose_secret(&creds.api_passphrase),
        )
        .header("locale", "en-US")
}

// ─────────────────────────────────────────────────────────
// Constraint row parsing
// ─────────────────────────────────────────────────────────

fn find_row(payload: &Value, key: &str, value: &str) -> Option<Value> {
    payload
        .get("data")
        .and_then(Value::as_array)?
        .iter()
        .find(|row| row.get(key).and_then(Value::as_str) == Some(value))
        .cloned()
}

fn scale_to_step(scale: Option<i64>) -> f64 {
    scale.map(|s| 10f64.powi(-(s as i32))).unwrap_or(0.0)
}

pub(crate) fn parse_spot_constraints(row: &Value) -> InstrumentConstraints {
    let mut min_qty =
        first_f64(row, &["minTradeAmount", "minTradeNum", "minTradeQty"]).unwrap_or(0.0);
    let min_notional =
        first_f64(row, &["minTradeUSDT", "minTradeQuoteAmount", "minNotional"]).unwrap_or(0.0);
    let qty_step = scale_to_step(first_i64(
        row,
        &["quantityScale", "basePrecision", "quantityPrecision"],
    ));
    let tick_size = scale_to_step(first_i64(row, &["priceScale", "pricePrecision"]));
    // Spot metadata sometimes reports minTradeAmount as "0"; the step is the
    // real floor then.
    if min_qty <= 0.0 && qty_step > 0.0 {
        min_qty = qty_step;
    }
    InstrumentConstraints {
        tick_size,
        qty_step,
        min_qty,
        min_notional,
    }
}

pub(crate) fn parse_perp_constraints(row: &Value) -> InstrumentConstraints {
    let min_qty = first_f64(row, &["minTradeNum", "minTradeAmount", "minTradeVol"]).unwrap_or(0.0);
    let min_notional = first_f64(row, &["minTradeUSDT", "minNotional"]).unwrap_or(0.0);
    let mut qty_step = first_f64(row, &["sizeMultiplier", "qtyStep"]).unwrap_or(0.0);
    if qty_step <= 0.0 {
        qty_step = scale_to_step(first_i64(row, &["volumePlace", "volPrecision"]));
    }
    let tick_size = scale_to_step(first_i64(row, &["pricePlace", "pricePrecision"]));
    InstrumentConstraints {
        tick_size,
        qty_step,
        min_qty,
        min_notional,
    }
}
