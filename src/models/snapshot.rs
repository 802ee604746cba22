//! # models::snapshot
//!
//! Feature vector ต่อ symbol จาก Market Snapshot Provider
//! (การคำนวณ indicator อยู่นอกระบบ: ที่นี่แค่รับค่ามาใช้)

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol:         String,
    pub price:          f64,
    pub bid:            f64,
    pub ask:            f64,
    /// % เปลี่ยนแปลงใน 1 ชั่วโมง
    pub change_1h_pct:  f64,
    /// % เปลี่ยนแปลงใน 24 ชั่วโมง
    pub change_24h_pct: f64,
    pub high_24h:       f64,
    pub low_24h:        f64,
    pub volume_24h:     f64,
    pub rsi_14:         Option<f64>,
    pub ma_5:           Option<f64>,
    pub ma_20:          Option<f64>,
    pub ma_50:          Option<f64>,
    pub atr_14:         Option<f64>,
    pub taken_at:       DateTime<Utc>,
}

impl MarketSnapshot {
    /// Snapshot ขั้นต่ำที่มีแค่ราคา (ใช้ใน mock provider และ test)
    pub fn at_price(symbol: &str, price: f64) -> Self {
        Self {
            symbol:         symbol.to_string(),
            price,
            bid:            price,
            ask:            price,
            change_1h_pct:  0.0,
            change_24h_pct: 0.0,
            high_24h:       price,
            low_24h:        price,
            volume_24h:     0.0,
            rsi_14:         None,
            ma_5:           None,
            ma_20:          None,
            ma_50:          None,
            atr_14:         None,
            taken_at:       Utc::now(),
        }
    }

    /// จัด market regime จากการเรียงตัวของ moving averages
    pub fn regime(&self) -> MarketRegime {
        let (Some(ma_20), Some(ma_50)) = (self.ma_20, self.ma_50) else {
            return MarketRegime::Unknown;
        };
        let fast = self.ma_5.unwrap_or(self.price);

        if self.price > fast && fast >= ma_20 && ma_20 > ma_50 {
            MarketRegime::TrendingUp
        } else if self.price < fast && fast <= ma_20 && ma_20 < ma_50 {
            MarketRegime::TrendingDown
        } else if self.ma_5.is_none() && self.price > ma_20 && ma_20 > ma_50 {
            MarketRegime::TrendingUp
        } else if self.ma_5.is_none() && self.price < ma_20 && ma_20 < ma_50 {
            MarketRegime::TrendingDown
        } else {
            MarketRegime::Ranging
        }
    }
}

// ─── Market Regime ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketRegime::TrendingUp   => "trending_up",
            MarketRegime::TrendingDown => "trending_down",
            MarketRegime::Ranging      => "ranging",
            MarketRegime::Unknown      => "unknown",
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
