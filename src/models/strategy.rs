//! # models::strategy
//!
//! Strategy label เป็น closed enum: แต่ละตัว map ไปยัง
//! [`StrategyProfile`] `{ take_profit_pct, stop_loss_pct }` ที่ชัดเจน
//!
//! | Label           | TP %  | SL %  |
//! |-----------------|-------|-------|
//! | `balanced`      | 5.0   | 2.0   |
//! | `aggressive`    | 7.0   | 2.5   |
//! | `stable_profit` | 3.0   | 1.5   |
//! | `unknown`       | —     | —     |
//!
//! `unknown` ใช้กับ Position ที่ synthesize จาก exchange (ไม่รู้ที่มา)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyLabel {
    Balanced,
    Aggressive,
    StableProfit,
    Unknown,
}

/// Take-profit / stop-loss เป็น % ของราคา (ไม่คูณ leverage)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyProfile {
    pub take_profit_pct: f64,
    pub stop_loss_pct:   f64,
}

impl StrategyLabel {
    pub const TRADEABLE: [StrategyLabel; 3] = [
        StrategyLabel::Balanced,
        StrategyLabel::Aggressive,
        StrategyLabel::StableProfit,
    ];

    pub fn profile(self) -> Option<StrategyProfile> {
        match self {
            StrategyLabel::Balanced     => Some(StrategyProfile { take_profit_pct: 5.0, stop_loss_pct: 2.0 }),
            StrategyLabel::Aggressive   => Some(StrategyProfile { take_profit_pct: 7.0, stop_loss_pct: 2.5 }),
            StrategyLabel::StableProfit => Some(StrategyProfile { take_profit_pct: 3.0, stop_loss_pct: 1.5 }),
            StrategyLabel::Unknown      => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyLabel::Balanced     => "balanced",
            StrategyLabel::Aggressive   => "aggressive",
            StrategyLabel::StableProfit => "stable_profit",
            StrategyLabel::Unknown      => "unknown",
        }
    }
}

impl fmt::Display for StrategyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "balanced"      => Ok(StrategyLabel::Balanced),
            "aggressive"    => Ok(StrategyLabel::Aggressive),
            "stable_profit" => Ok(StrategyLabel::StableProfit),
            "unknown"       => Ok(StrategyLabel::Unknown),
            other => Err(format!(
                "unknown strategy '{other}' (use balanced, aggressive or stable_profit)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let p = StrategyLabel::Balanced.profile().unwrap();
        assert_eq!(p.take_profit_pct, 5.0);
        assert_eq!(p.stop_loss_pct, 2.0);
        assert_eq!(StrategyLabel::Aggressive.profile().unwrap().stop_loss_pct, 2.5);
        assert_eq!(StrategyLabel::StableProfit.profile().unwrap().take_profit_pct, 3.0);
        assert!(StrategyLabel::Unknown.profile().is_none());
    }

    #[test]
    fn test_parse_accepts_dash_and_case() {
        assert_eq!("Stable-Profit".parse::<StrategyLabel>(), Ok(StrategyLabel::StableProfit));
        assert_eq!(" aggressive ".parse::<StrategyLabel>(), Ok(StrategyLabel::Aggressive));
        assert!("yolo".parse::<StrategyLabel>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&StrategyLabel::StableProfit).unwrap();
        assert_eq!(json, "\"stable_profit\"");
    }
}
