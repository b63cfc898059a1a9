//! Bybit venue adapter
//!
//! REST v5 adapter: signed requests, response translation into the core
//! vocabulary, and error classification per the shared taxonomy. Executions
//! are pulled by a poller and pushed into the fill channel; per-order
//! sequence numbers are assigned from the venue's execution ordering.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{
    BrokerAdapter, HmacSigner, OrderAck, PlaceOrderRequest, StatusReport, Credentials,
};
use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::types::{
    Balance, ClientToken, Fill, OrderStatus, OrderType, Position, Price, Quantity, Side, Symbol,
};

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";
const CATEGORY: &str = "linear";

/// Bybit REST adapter.
pub struct BybitBroker {
    rest_url: &'static str,
    signer: HmacSigner,
    client: reqwest::Client,
    fill_tx: flume::Sender<Fill>,
    fill_rx: flume::Receiver<Fill>,
    /// orderLinkId (= client token) -> engine order id, for execution
    /// attribution.
    // TODO: persist this map so executions can be attributed after a restart
    order_ids: RwLock<HashMap<String, Uuid>>,
    /// venue order id -> symbol; Bybit cancels need both
    order_symbols: RwLock<HashMap<String, Symbol>>,
    seen_executions: RwLock<HashSet<String>>,
    exec_seq: RwLock<HashMap<Uuid, u64>>,
}

impl BybitBroker {
    pub fn new(settings: &BrokerSettings, credentials: Credentials) -> Self {
        let (fill_tx, fill_rx) = flume::unbounded();
        Self {
            rest_url: if settings.testnet {
                TESTNET_URL
            } else {
                MAINNET_URL
            },
            signer: HmacSigner::new(credentials.api_key, credentials.api_secret),
            client: reqwest::Client::new(),
            fill_tx,
            fill_rx,
            order_ids: RwLock::new(HashMap::new()),
            order_symbols: RwLock::new(HashMap::new()),
            seen_executions: RwLock::new(HashSet::new()),
            exec_seq: RwLock::new(HashMap::new()),
        }
    }

    /// "BTC/USDT" -> "BTCUSDT"
    fn venue_symbol(symbol: &Symbol) -> String {
        symbol.as_str().replace('/', "")
    }

    fn auth_headers(&self, timestamp: i64, payload: &str) -> Vec<(&'static str, String)> {
        // v5 signature: HMAC(timestamp + api_key + recv_window + payload)
        let message = format!(
            "{}{}{}{}",
            timestamp,
            self.signer.key_id(),
            RECV_WINDOW,
            payload
        );
        vec![
            ("X-BAPI-API-KEY", self.signer.key_id().to_string()),
            ("X-BAPI-TIMESTAMP", timestamp.to_string()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string()),
            ("X-BAPI-SIGN", self.signer.sign(&message)),
        ]
    }

    /// Signed GET. Failures are transient: reads mutate nothing.
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, BrokerError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let timestamp = Utc::now().timestamp_millis();
        let url = format!("{}{}?{}", self.rest_url, path, query_string);

        let mut request = self.client.get(&url);
        for (name, value) in self.auth_headers(timestamp, &query_string) {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(BrokerError::transient)?;
        let body: serde_json::Value = response.json().await.map_err(BrokerError::transient)?;
        Self::check_envelope(body, false)
    }

    /// Signed POST. Send errors after the connection is up are ambiguous:
    /// the venue may have processed the request.
    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, BrokerError> {
        let payload = body.to_string();
        let timestamp = Utc::now().timestamp_millis();
        let url = format!("{}{}", self.rest_url, path);

        let mut request = self.client.post(&url);
        for (name, value) in self.auth_headers(timestamp, &payload) {
            request = request.header(name, value);
        }
        let response = request
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    BrokerError::transient(e)
                } else {
                    BrokerError::ambiguous(e)
                }
            })?;
        let body: serde_json::Value = response.json().await.map_err(BrokerError::ambiguous)?;
        Self::check_envelope(body, true)
    }

    /// Unwrap the `{retCode, retMsg, result}` envelope into `result`.
    fn check_envelope(
        body: serde_json::Value,
        mutating: bool,
    ) -> Result<serde_json::Value, BrokerError> {
        let code = body["retCode"].as_i64().unwrap_or(-1);
        if code == 0 {
            return Ok(body["result"].clone());
        }
        let message = body["retMsg"].as_str().unwrap_or("unknown error").to_string();
        Err(match code {
            // Invalid key / signature / permissions
            10003 | 10004 | 10005 => BrokerError::Auth(message),
            // Timestamp drift and rate limiting: definitely not executed
            10002 | 10006 | 10018 => BrokerError::Transient(message),
            _ if mutating => BrokerError::Rejected(message),
            _ => BrokerError::Transient(message),
        })
    }

    fn parse_status(status: &str) -> OrderStatus {
        match status {
            "New" | "Untriggered" => OrderStatus::Submitted,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "Deactivated" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            other => {
                warn!(status = other, "unmapped venue order status");
                OrderStatus::Submitted
            }
        }
    }

    fn decimal_field(value: &serde_json::Value, key: &str) -> Decimal {
        value[key]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO)
    }

    /// Pull recent executions and emit any not yet seen, in venue order.
    /// Call periodically from `spawn_execution_poller`.
    pub async fn poll_executions(&self) -> Result<usize, BrokerError> {
        let result = self
            .get(
                "/v5/execution/list",
                &[("category", CATEGORY.to_string()), ("limit", "50".to_string())],
            )
            .await?;
        let Some(list) = result["list"].as_array() else {
            return Ok(0);
        };

        // The venue returns newest-first; apply oldest-first
        let mut emitted = 0;
        for exec in list.iter().rev() {
            let Some(exec_id) = exec["execId"].as_str() else {
                continue;
            };
            if self.seen_executions.read().contains(exec_id) {
                continue;
            }
            let Some(order_id) = exec["orderLinkId"]
                .as_str()
                .and_then(|link| self.order_ids.read().get(link).copied())
            else {
                debug!(exec_id, "execution for unknown order link; skipped");
                continue;
            };

            let seq = {
                let mut seqs = self.exec_seq.write();
                let next = seqs.entry(order_id).or_insert(1);
                let seq = *next;
                *next += 1;
                seq
            };
            let side = match exec["side"].as_str() {
                Some("Sell") => Side::Sell,
                _ => Side::Buy,
            };
            let fill = Fill {
                fill_id: exec_id.to_string(),
                order_id,
                symbol: Symbol::new(exec["symbol"].as_str().unwrap_or_default()),
                side,
                quantity: Quantity::new(Self::decimal_field(exec, "execQty")),
                price: Price::new(Self::decimal_field(exec, "execPrice")),
                seq,
                timestamp: Utc::now(),
            };
            self.seen_executions.write().insert(exec_id.to_string());
            if self.fill_tx.send(fill).is_ok() {
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    pub fn spawn_execution_poller(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(error) = broker.poll_executions().await {
                    warn!(%error, "execution poll failed");
                }
            }
        })
    }
}

#[async_trait]
impl BrokerAdapter for BybitBroker {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        // Any signed read verifies credentials
        self.get(
            "/v5/account/wallet-balance",
            &[("accountType", "UNIFIED".to_string())],
        )
        .await?;
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, BrokerError> {
        let result = self
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
            )
            .await?;
        let account = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .ok_or_else(|| BrokerError::transient("empty wallet-balance response"))?;
        let total = Self::decimal_field(&account, "totalWalletBalance");
        let free = Self::decimal_field(&account, "totalAvailableBalance");
        Ok(Balance {
            asset: "USDT".to_string(),
            free,
            locked: total - free,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let result = self
            .get(
                "/v5/position/list",
                &[
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", "USDT".to_string()),
                ],
            )
            .await?;
        let Some(list) = result["list"].as_array() else {
            return Ok(vec![]);
        };
        Ok(list
            .iter()
            .filter(|p| Self::decimal_field(p, "size") > Decimal::ZERO)
            .map(|p| {
                let entry = Self::decimal_field(p, "avgPrice");
                let mark = Self::decimal_field(p, "markPrice");
                let mut position = Position {
                    symbol: Symbol::new(p["symbol"].as_str().unwrap_or_default()),
                    side: match p["side"].as_str() {
                        Some("Sell") => Side::Sell,
                        _ => Side::Buy,
                    },
                    quantity: Quantity::new(Self::decimal_field(p, "size")),
                    entry_price: Price::new(entry),
                    mark_price: Price::new(mark),
                    unrealized_pnl: Self::decimal_field(p, "unrealisedPnl"),
                    stop_loss: None,
                    take_profit: None,
                    venue: "bybit".to_string(),
                    opened_at: Utc::now(),
                };
                position.refresh_mark(Price::new(mark));
                position
            })
            .collect())
    }

    async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        let link_id = request.client_token.to_string();
        // Record the attribution before the wire call: an ambiguous
        // outcome can still produce executions we must route.
        self.order_ids
            .write()
            .insert(link_id.clone(), request.order_id);

        let mut body = serde_json::json!({
            "category": CATEGORY,
            "symbol": Self::venue_symbol(&request.symbol),
            "side": match request.side { Side::Buy => "Buy", Side::Sell => "Sell" },
            "orderType": match request.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": request.quantity.as_decimal().to_string(),
            "orderLinkId": link_id,
            "timeInForce": "GTC",
        });
        if let Some(price) = request.price {
            body["price"] = serde_json::Value::String(price.as_decimal().to_string());
        }

        let result = self.post("/v5/order/create", &body).await?;
        let venue_order_id = result["orderId"]
            .as_str()
            .ok_or_else(|| BrokerError::ambiguous("create response missing orderId"))?
            .to_string();
        self.order_symbols
            .write()
            .insert(venue_order_id.clone(), request.symbol.clone());

        Ok(OrderAck {
            venue_order_id,
            status: OrderStatus::Submitted,
        })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), BrokerError> {
        let symbol = self
            .order_symbols
            .read()
            .get(venue_order_id)
            .cloned()
            .ok_or_else(|| {
                BrokerError::Rejected(format!("unknown venue order {}", venue_order_id))
            })?;
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": Self::venue_symbol(&symbol),
            "orderId": venue_order_id,
        });
        self.post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn order_status(&self, token: &ClientToken) -> Result<StatusReport, BrokerError> {
        let result = self
            .get(
                "/v5/order/realtime",
                &[
                    ("category", CATEGORY.to_string()),
                    ("orderLinkId", token.to_string()),
                ],
            )
            .await?;
        let order = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .ok_or_else(|| BrokerError::Rejected(format!("no order for token {}", token)))?;

        let avg = Self::decimal_field(&order, "avgPrice");
        Ok(StatusReport {
            venue_order_id: order["orderId"].as_str().map(String::from),
            status: Self::parse_status(order["orderStatus"].as_str().unwrap_or_default()),
            filled_quantity: Quantity::new(Self::decimal_field(&order, "cumExecQty")),
            avg_fill_price: (avg > Decimal::ZERO).then(|| Price::new(avg)),
        })
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<Price, BrokerError> {
        let result = self
            .get(
                "/v5/market/tickers",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", Self::venue_symbol(symbol)),
                ],
            )
            .await?;
        let ticker = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .ok_or_else(|| BrokerError::transient(format!("no ticker for {}", symbol)))?;
        let last = Self::decimal_field(&ticker, "lastPrice");
        if last <= Decimal::ZERO {
            return Err(BrokerError::transient(format!("zero price for {}", symbol)));
        }
        Ok(Price::new(last))
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), BrokerError> {
        let body = serde_json::json!({
            "category": CATEGORY,
            "symbol": Self::venue_symbol(symbol),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        // "leverage not modified" is success for our purposes
        match self.post("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(BrokerError::Rejected(message)) if message.contains("not modified") => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn fills(&self) -> flume::Receiver<Fill> {
        self.fill_rx.clone()
    }
}
