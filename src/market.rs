//! # market — Market Snapshot Provider
//!
//! ดึง feature vector ต่อ symbol มาให้ Advisory Engine
//!
//! ## Data Sources (เลือกได้)
//! 1. Market bridge HTTP: ถ้ามี `MARKET_URL` ใน .env
//! 2. Static / Mock: สำหรับ dev, paper trading และ test

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::TradeError;
use crate::models::MarketSnapshot;

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// ล้มได้แบบ transient → `SnapshotUnavailable`
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, TradeError>;
}

// ─── Bridge Provider ──────────────────────────────────────────────────────────

/// Response format จาก bridge `/api/market/snapshot`
#[derive(Debug, Deserialize)]
struct BridgeMarketResponse {
    bid:        f64,
    ask:        f64,
    change_1h:  Option<f64>,
    change_24h: Option<f64>,
    high_24h:   Option<f64>,
    low_24h:    Option<f64>,
    volume:     Option<f64>,
    rsi_14:     Option<f64>,
    ma_5:       Option<f64>,
    ma_20:      Option<f64>,
    ma_50:      Option<f64>,
    atr_14:     Option<f64>,
}

pub struct BridgeSnapshotProvider {
    client:   reqwest::Client,
    base_url: String,
    timeout:  Duration,
}

impl BridgeSnapshotProvider {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl SnapshotProvider for BridgeSnapshotProvider {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, TradeError> {
        let unavailable = |reason: String| TradeError::SnapshotUnavailable {
            symbol: symbol.to_string(),
            reason,
        };

        let url = format!("{}/api/market/snapshot", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| unavailable(format!("market bridge unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(unavailable(format!("market bridge returned {}", resp.status())));
        }

        let data: BridgeMarketResponse = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("failed to parse market response: {e}")))?;

        if !(data.bid > 0.0 && data.ask > 0.0) {
            return Err(unavailable(format!("non-positive quote {}/{}", data.bid, data.ask)));
        }

        let mid = (data.bid + data.ask) / 2.0;
        debug!(symbol, price = mid, "📈 Snapshot fetched");

        Ok(MarketSnapshot {
            symbol:         symbol.to_string(),
            price:          mid,
            bid:            data.bid,
            ask:            data.ask,
            change_1h_pct:  data.change_1h.unwrap_or(0.0),
            change_24h_pct: data.change_24h.unwrap_or(0.0),
            high_24h:       data.high_24h.unwrap_or(mid * 1.01),
            low_24h:        data.low_24h.unwrap_or(mid * 0.99),
            volume_24h:     data.volume.unwrap_or(0.0),
            rsi_14:         data.rsi_14,
            ma_5:           data.ma_5,
            ma_20:          data.ma_20,
            ma_50:          data.ma_50,
            atr_14:         data.atr_14,
            taken_at:       Utc::now(),
        })
    }
}

// ─── Static Provider ──────────────────────────────────────────────────────────

/// Snapshot ที่ตั้งค่าเองได้: symbol ที่ไม่มีใน table คือ unavailable
#[derive(Default)]
pub struct StaticSnapshotProvider {
    snapshots: RwLock<HashMap<String, MarketSnapshot>>,
}

impl StaticSnapshotProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock data สำหรับ development (ไม่ต้องมี market bridge)
    pub fn with_mock_data(symbols: &[String]) -> Self {
        let snapshots = symbols
            .iter()
            .map(|symbol| (symbol.clone(), mock_snapshot(symbol)))
            .collect();
        Self { snapshots: RwLock::new(snapshots) }
    }

    pub async fn set(&self, snapshot: MarketSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.symbol.clone(), snapshot);
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        let mut snapshots = self.snapshots.write().await;
        let entry = snapshots
            .entry(symbol.to_string())
            .or_insert_with(|| MarketSnapshot::at_price(symbol, price));
        entry.price = price;
        entry.bid   = price;
        entry.ask   = price;
    }

    pub async fn remove(&self, symbol: &str) {
        self.snapshots.write().await.remove(symbol);
    }
}

#[async_trait]
impl SnapshotProvider for StaticSnapshotProvider {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, TradeError> {
        let snapshots = self.snapshots.read().await;
        let mut snapshot = snapshots
            .get(symbol)
            .cloned()
            .ok_or_else(|| TradeError::SnapshotUnavailable {
                symbol: symbol.to_string(),
                reason: "no snapshot configured".to_string(),
            })?;
        snapshot.taken_at = Utc::now();
        Ok(snapshot)
    }
}

fn mock_snapshot(symbol: &str) -> MarketSnapshot {
    let price = match crate::config::base_asset(symbol) {
        "BTC" => 67_000.0,
        "ETH" => 3_400.0,
        "SOL" => 150.0,
        "BNB" => 580.0,
        "XRP" => 0.55,
        _     => 100.0,
    };
    MarketSnapshot {
        symbol:         symbol.to_string(),
        price,
        bid:            price * 0.99997,
        ask:            price * 1.00003,
        change_1h_pct:  0.15,
        change_24h_pct: 1.32,
        high_24h:       price * 1.022,
        low_24h:        price * 0.982,
        volume_24h:     24_500.0,
        rsi_14:         Some(52.4),
        ma_5:           Some(price * 0.998),
        ma_20:          Some(price * 0.988),
        ma_50:          Some(price * 0.967),
        atr_14:         Some(price * 0.012),
        taken_at:       Utc::now(),
    }
}
