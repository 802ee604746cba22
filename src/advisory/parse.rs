//! # advisory::parse — Strict validator ของคำตอบ model
//!
//! คำตอบจาก model ไม่น่าเชื่อถือเสมอ: ทุก field ถูกตรวจช่วงค่า และอะไรที่
//! ไม่ผ่านจะกลายเป็น `Action::Invalid` (ซึ่ง downstream ถือเป็น hold)
//!
//! รองรับรูปแบบเก่าด้วย:
//! - `primary_action` wrapper → ใช้ object ข้างใน
//! - `signal`: `BUY` / `SELL` / `CLOSE` / `CLOSE_ALL` / `HOLD` แทน `action`
//! - `symbol: "ALL"` ใช้ได้กับทุก symbol
//! - `amount` แทน `size`
//! - `confidence` เป็นตัวเลข 0–1 หรือ `HIGH` / `MEDIUM` / `LOW`

use serde::Deserialize;
use serde_json::Value;

use crate::advisory::AdviceLimits;
use crate::config::base_asset;
use crate::error::TradeError;
use crate::models::{Action, CloseReason, PositionSide, Recommendation};

const MAX_RATIONALE_CHARS: usize = 200;
/// ยอมให้ size ต่ำกว่าขั้นต่ำได้แค่ floating-point noise
const SIZE_EPSILON: f64 = 1e-9;

#[derive(Debug, Deserialize)]
struct RawAdvice {
    #[serde(default, alias = "signal")]
    action:          Option<String>,
    #[serde(default)]
    symbol:          Option<String>,
    #[serde(default, alias = "amount")]
    size:            Option<f64>,
    #[serde(default)]
    leverage:        Option<f64>,
    #[serde(default)]
    confidence:      Option<Value>,
    #[serde(default)]
    stop_loss_pct:   Option<f64>,
    #[serde(default)]
    take_profit_pct: Option<f64>,
    #[serde(default, alias = "reason")]
    rationale:       Option<String>,
}

/// Parse + validate: ไม่มีวัน error: คำตอบที่ใช้ไม่ได้คืนเป็น `Invalid`
pub fn parse_advice(raw: &str, symbol: &str, limits: &AdviceLimits) -> Recommendation {
    match validate(raw, symbol, limits) {
        Ok(rec)  => rec,
        Err(err) => Recommendation::invalid(symbol, err.to_string()),
    }
}

fn validate(raw: &str, symbol: &str, limits: &AdviceLimits) -> Result<Recommendation, TradeError> {
    let json = extract_json(raw).ok_or_else(|| malformed("no JSON object in reply"))?;

    let mut value: Value = serde_json::from_str(json)
        .map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let wrapped = value
        .get_mut("primary_action")
        .filter(|v| v.is_object())
        .map(Value::take);
    if let Some(inner) = wrapped {
        value = inner;
    }
    let advice: RawAdvice = serde_json::from_value(value)
        .map_err(|e| malformed(format!("unexpected shape: {e}")))?;

    if let Some(other) = advice.symbol.as_deref() {
        if !same_symbol(other, symbol) {
            return Err(malformed(format!("advice is for {other}, expected {symbol}")));
        }
    }

    let action_word = advice
        .action
        .as_deref()
        .ok_or_else(|| malformed("missing action"))?
        .trim()
        .to_ascii_uppercase()
        .replace(['-', ' '], "_");

    let confidence = match &advice.confidence {
        Some(v) => Some(parse_confidence(v)?),
        None    => None,
    };

    let stop_loss_pct   = positive_pct("stop_loss_pct", advice.stop_loss_pct)?;
    let take_profit_pct = positive_pct("take_profit_pct", advice.take_profit_pct)?;

    let action = match action_word.as_str() {
        "OPEN_LONG" | "BUY" | "LONG" => open_action(PositionSide::Long, &advice, limits, stop_loss_pct, take_profit_pct)?,
        "OPEN_SHORT" | "SELL" | "SHORT" => open_action(PositionSide::Short, &advice, limits, stop_loss_pct, take_profit_pct)?,
        "CLOSE" | "EXIT" | "CLOSE_POSITION" | "CLOSE_ALL" => Action::Close { reason: CloseReason::Advisory },
        "HOLD" | "NO_TRADE" | "WAIT" => Action::Hold,
        "ADJUST_STOP" | "ADJUST" => {
            if stop_loss_pct.is_none() && take_profit_pct.is_none() {
                return Err(malformed("adjust_stop needs stop_loss_pct or take_profit_pct"));
            }
            Action::Adjust { stop_loss_pct, take_profit_pct }
        }
        other => return Err(malformed(format!("unknown action '{other}'"))),
    };

    let confidence = match (&action, confidence) {
        (Action::Open { .. }, None) => return Err(malformed("open requires a confidence")),
        (_, Some(c))                => c,
        (_, None)                   => 0.0,
    };

    let rationale = advice.rationale.unwrap_or_default();
    Ok(Recommendation::new(
        symbol,
        action,
        confidence,
        rationale.trim().chars().take(MAX_RATIONALE_CHARS).collect::<String>(),
    ))
}

fn open_action(
    side: PositionSide,
    advice: &RawAdvice,
    limits: &AdviceLimits,
    stop_loss_pct: Option<f64>,
    take_profit_pct: Option<f64>,
) -> Result<Action, TradeError> {
    let size = advice.size.unwrap_or(limits.default_size);
    if !size.is_finite() || size <= 0.0 {
        return Err(malformed(format!("size must be positive, got {size}")));
    }
    if size + SIZE_EPSILON < limits.min_size {
        return Err(malformed(format!("size {size} below minimum {}", limits.min_size)));
    }

    let leverage = match advice.leverage {
        None => limits.default_leverage,
        Some(l) if l.is_finite() && l.fract() == 0.0 && l >= 1.0 && l <= limits.max_leverage as f64 => l as u32,
        Some(l) => {
            return Err(malformed(format!(
                "leverage must be an integer in 1..={}, got {l}",
                limits.max_leverage
            )))
        }
    };

    Ok(Action::Open { side, size, leverage, stop_loss_pct, take_profit_pct })
}

fn parse_confidence(value: &Value) -> Result<f64, TradeError> {
    let confidence = match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "HIGH"   => 0.8,
            "MEDIUM" => 0.6,
            "LOW"    => 0.3,
            other    => other.parse().unwrap_or(f64::NAN),
        },
        other => return Err(malformed(format!("confidence must be a number, got {other}"))),
    };
    if !(0.0..=1.0).contains(&confidence) {
        return Err(malformed(format!("confidence {confidence} outside 0..=1")));
    }
    Ok(confidence)
}

fn positive_pct(field: &str, value: Option<f64>) -> Result<Option<f64>, TradeError> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(malformed(format!("{field} must be positive, got {v}"))),
        other => Ok(other),
    }
}

/// `"BTC"` / `"btc-usdt"` / `"ALL"` ถือว่าตรงกับ `"BTC/USDT"`
fn same_symbol(claimed: &str, symbol: &str) -> bool {
    if claimed.trim().eq_ignore_ascii_case("ALL") {
        return true;
    }
    let norm = |s: &str| s.to_ascii_uppercase().replace(['/', '-', ':', '_'], "");
    norm(claimed) == norm(symbol) || claimed.eq_ignore_ascii_case(base_asset(symbol))
}

/// ตัด markdown fence / ข้อความรอบๆ ออก เหลือ `{ ... }` ตัวนอกสุด
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end   = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn malformed(reason: impl Into<String>) -> TradeError {
    TradeError::MalformedAdvice(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyLabel;

    const BTC: &str = "BTC/USDT";

    fn limits() -> AdviceLimits {
        AdviceLimits {
            strategy:         StrategyLabel::Balanced,
            default_size:     0.01,
            min_size:         0.01,
            default_leverage: 10,
            max_leverage:     20,
        }
    }

    fn parse(raw: &str) -> Recommendation {
        parse_advice(raw, BTC, &limits())
    }

    fn invalid_reason(rec: &Recommendation) -> String {
        match &rec.action {
            Action::Invalid { reason } => reason.clone(),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_open_long_with_fences() {
        let rec = parse(
            "```json\n{\"action\":\"open_long\",\"size\":0.02,\"leverage\":5,\"confidence\":0.8,\
             \"stop_loss_pct\":2.0,\"rationale\":\"breakout above MA20\"}\n```",
        );
        assert_eq!(
            rec.action,
            Action::Open {
                side:            PositionSide::Long,
                size:            0.02,
                leverage:        5,
                stop_loss_pct:   Some(2.0),
                take_profit_pct: None,
            }
        );
        assert_eq!(rec.confidence, 0.8);
        assert_eq!(rec.rationale, "breakout above MA20");
    }

    #[test]
    fn test_missing_size_and_leverage_use_defaults() {
        let rec = parse(r#"{"action":"open_short","confidence":0.7}"#);
        assert!(matches!(
            rec.action,
            Action::Open { side: PositionSide::Short, size, leverage: 10, .. } if size == 0.01
        ));
    }

    #[test]
    fn test_primary_action_wrapper_and_legacy_signal() {
        let rec = parse(r#"{"primary_action":{"signal":"SELL","amount":0.05,"confidence":"HIGH"}}"#);
        assert!(matches!(rec.action, Action::Open { side: PositionSide::Short, .. }));
        assert_eq!(rec.confidence, 0.8);

        let rec = parse(r#"{"signal":"CLOSE","confidence":"low"}"#);
        assert_eq!(rec.action, Action::Close { reason: CloseReason::Advisory });
        assert_eq!(rec.confidence, 0.3);
    }

    #[test]
    fn test_close_all_applies_to_any_symbol() {
        let rec = parse(r#"{"primary_action":{"symbol":"ALL","signal":"CLOSE_ALL","confidence":"HIGH"}}"#);
        assert_eq!(rec.action, Action::Close { reason: CloseReason::Advisory });
        assert_eq!(rec.confidence, 0.8);
        assert_eq!(rec.symbol, BTC);

        let rec = parse_advice(r#"{"symbol":"all","action":"hold"}"#, "ETH/USDT", &limits());
        assert_eq!(rec.action, Action::Hold);
    }

    #[test]
    fn test_prose_reply_is_invalid() {
        let rec = parse("I would go long here.");
        assert!(rec.is_hold());
        assert!(invalid_reason(&rec).contains("no JSON"));
    }

    #[test]
    fn test_size_below_minimum_is_invalid() {
        let rec = parse(r#"{"action":"open_long","size":0.001,"confidence":0.9}"#);
        assert!(invalid_reason(&rec).contains("below minimum"));
    }

    #[test]
    fn test_leverage_bounds() {
        let rec = parse(r#"{"action":"open_long","leverage":50,"confidence":0.9}"#);
        assert!(invalid_reason(&rec).contains("leverage"));
        let rec = parse(r#"{"action":"open_long","leverage":2.5,"confidence":0.9}"#);
        assert!(invalid_reason(&rec).contains("leverage"));
        let rec = parse(r#"{"action":"open_long","leverage":20,"confidence":0.9}"#);
        assert!(matches!(rec.action, Action::Open { leverage: 20, .. }));
    }

    #[test]
    fn test_confidence_validation() {
        let rec = parse(r#"{"action":"open_long","confidence":1.5}"#);
        assert!(invalid_reason(&rec).contains("outside"));
        let rec = parse(r#"{"action":"open_long"}"#);
        assert!(invalid_reason(&rec).contains("confidence"));
        // hold ไม่ต้องมี confidence
        let rec = parse(r#"{"action":"hold"}"#);
        assert_eq!(rec.action, Action::Hold);
    }

    #[test]
    fn test_adjust_requires_a_threshold() {
        let rec = parse(r#"{"action":"adjust_stop","confidence":0.5}"#);
        assert!(rec.is_hold());
        let rec = parse(r#"{"action":"adjust_stop","stop_loss_pct":1.0}"#);
        assert_eq!(rec.action, Action::Adjust { stop_loss_pct: Some(1.0), take_profit_pct: None });
        let rec = parse(r#"{"action":"adjust_stop","stop_loss_pct":-1.0}"#);
        assert!(invalid_reason(&rec).contains("stop_loss_pct"));
    }

    #[test]
    fn test_symbol_mismatch_and_unknown_action() {
        let rec = parse(r#"{"symbol":"ETH/USDT","action":"hold"}"#);
        assert!(invalid_reason(&rec).contains("ETH/USDT"));
        let rec = parse(r#"{"symbol":"btc","action":"hold"}"#);
        assert_eq!(rec.action, Action::Hold);
        let rec = parse(r#"{"action":"moon"}"#);
        assert!(invalid_reason(&rec).contains("unknown action"));
    }

    #[test]
    fn test_rationale_is_truncated() {
        let long = "a".repeat(500);
        let rec = parse(&format!(r#"{{"action":"hold","rationale":"{long}"}}"#));
        assert_eq!(rec.rationale.chars().count(), MAX_RATIONALE_CHARS);
    }
}
