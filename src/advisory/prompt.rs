//! # advisory::prompt — สร้าง Decision Request
//!
//! Prompt ประกอบด้วย 3 ส่วน: ข้อมูลตลาด, position ปัจจุบัน และ "ความจำ"
//! (insight hints ที่ถูกจำกัดขนาด): model ต้องตอบ JSON ตาม schema เท่านั้น

use crate::advisory::{AdviceLimits, DecisionRequest};
use crate::models::{Insight, MarketSnapshot, Position};

/// ความยาวสูงสุดของ lesson ที่ยกมาใส่ prompt
const MAX_LESSON_CHARS: usize = 240;

pub const SYSTEM_PROMPT: &str = "You are a disciplined crypto futures trader. \
You learn from your own trade history and never repeat a losing setup without a clear reason. \
You answer with a single JSON object and nothing else.";

pub fn build_request(
    symbol: &str,
    snapshot: &MarketSnapshot,
    insight: &Insight,
    position: &Position,
    limits: &AdviceLimits,
) -> DecisionRequest {
    DecisionRequest {
        symbol: symbol.to_string(),
        system: SYSTEM_PROMPT.to_string(),
        prompt: build_prompt(symbol, snapshot, insight, position, limits),
    }
}

pub fn build_prompt(
    symbol: &str,
    snapshot: &MarketSnapshot,
    insight: &Insight,
    position: &Position,
    limits: &AdviceLimits,
) -> String {
    let rsi_line = snapshot.rsi_14
        .map(|v| format!("- RSI(14): {v:.1}"))
        .unwrap_or_else(|| "- RSI(14): N/A".to_string());

    let ma_line = match (snapshot.ma_20, snapshot.ma_50) {
        (Some(m20), Some(m50)) if m20 != 0.0 => format!(
            "- MA20: {m20:.2} | MA50: {m50:.2} | Price vs MA20: {:+.2}%",
            ((snapshot.price - m20) / m20) * 100.0
        ),
        _ => "- MA: N/A".to_string(),
    };

    let atr_line = snapshot.atr_14
        .map(|v| format!("- ATR(14): {v:.4}"))
        .unwrap_or_else(|| "- ATR(14): N/A".to_string());

    let position_block = position_block(position, snapshot.price);
    let memory_block   = memory_block(insight);

    let strategy = limits.strategy;
    let (tp, sl) = strategy
        .profile()
        .map(|p| (p.take_profit_pct, p.stop_loss_pct))
        .unwrap_or((0.0, 0.0));

    format!(r#"You are analyzing {symbol} for the "{strategy}" strategy.

## Current Market Data
- Symbol: {symbol}
- Current Price: {price:.4}
- Bid/Ask: {bid:.4} / {ask:.4}
- 1H Change: {ch1h:+.2}%
- 24H Change: {ch24h:+.2}%
- 24H High: {high:.4} | 24H Low: {low:.4}
- 24H Volume: {volume:.2}
{rsi_line}
{ma_line}
{atr_line}
- Regime: {regime}

## Current Position
{position_block}

## Memory (your own past trades on {symbol})
{memory_block}

## Your Task
Decide one action for {symbol}. Default profile: take profit {tp}%, stop loss {sl}%.

**CRITICAL**: Respond with ONLY a valid JSON object. No explanations, no markdown, no code fences.

## Required JSON Format
```
{{
  "action": "open_long" | "open_short" | "close" | "hold" | "adjust_stop",
  "size": {size},
  "leverage": {leverage},
  "confidence": <float 0.0-1.0>,
  "stop_loss_pct": <float, optional>,
  "take_profit_pct": <float, optional>,
  "rationale": "<brief explanation max 200 chars>"
}}
```

## Rules
1. size must be at least {min_size}
2. leverage must be an integer between 1 and {max_leverage}
3. "close" and "adjust_stop" only make sense with an open position
4. If conditions are unclear or memory warns against the setup → use "hold"

Respond with JSON only:"#,
        price        = snapshot.price,
        bid          = snapshot.bid,
        ask          = snapshot.ask,
        ch1h         = snapshot.change_1h_pct,
        ch24h        = snapshot.change_24h_pct,
        high         = snapshot.high_24h,
        low          = snapshot.low_24h,
        volume       = snapshot.volume_24h,
        regime       = snapshot.regime(),
        size         = limits.default_size,
        leverage     = limits.default_leverage,
        min_size     = limits.min_size,
        max_leverage = limits.max_leverage,
    )
}

fn position_block(position: &Position, price: f64) -> String {
    if !position.is_open() {
        return "- Flat (no open position)".to_string();
    }
    let thresholds = match (position.stop_loss_pct, position.take_profit_pct) {
        (Some(sl), Some(tp)) => format!("SL {sl}% / TP {tp}%"),
        (Some(sl), None)     => format!("SL {sl}%"),
        (None, Some(tp))     => format!("TP {tp}%"),
        (None, None)         => "no thresholds".to_string(),
    };
    format!(
        "- {side} {size} @ {entry:.4} x{lev} ({strategy}, {thresholds})\n- Unrealized: {pnl:+.2}%",
        side     = position.side,
        size     = position.size,
        entry    = position.entry_price,
        lev      = position.leverage,
        strategy = position.strategy,
        pnl      = position.pnl_pct(price),
    )
}

/// Hints ที่ถูกจำกัด: ไม่ dump record ทั้งหมดลง prompt
fn memory_block(insight: &Insight) -> String {
    if insight.count == 0 {
        return "- No recorded trades yet".to_string();
    }

    let mut lines = vec![format!(
        "- {count} closed trades, win rate {rate:.0}%, average P&L {avg:+.2}%",
        count = insight.count,
        rate  = insight.win_rate * 100.0,
        avg   = insight.avg_pnl_pct,
    )];
    if let Some(lesson) = &insight.last_failure_lesson {
        lines.push(format!("- Most recent failure: {}", truncate(lesson, MAX_LESSON_CHARS)));
    }
    if let Some(caution) = &insight.caution {
        lines.push(format!("- Caution: {caution}"));
    }
    if let Some(best) = insight.best_strategy {
        lines.push(format!("- Best performing strategy: {best}"));
    }
    if let Some(hour) = insight.best_hour_utc {
        lines.push(format!("- Best hour so far: {hour:02}:00 UTC"));
    }
    lines.join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CloseReason, MarketRegime, MemoryRecord, Outcome, PositionSide, StrategyLabel};
    use chrono::Utc;
    use uuid::Uuid;

    fn limits() -> AdviceLimits {
        AdviceLimits {
            strategy:         StrategyLabel::Balanced,
            default_size:     0.01,
            min_size:         0.01,
            default_leverage: 10,
            max_leverage:     20,
        }
    }

    fn failure(lesson: &str) -> MemoryRecord {
        MemoryRecord {
            record_id:   Uuid::new_v4(),
            symbol:      "BTC/USDT".into(),
            strategy:    StrategyLabel::Balanced,
            side:        PositionSide::Long,
            outcome:     Outcome::Failure,
            pnl_pct:     -2.5,
            entry_price: 50_000.0,
            exit_price:  48_750.0,
            regime:      MarketRegime::Ranging,
            reason:      CloseReason::StopLoss,
            lesson:      lesson.to_string(),
            opened_at:   None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_embeds_market_and_flat_position() {
        let snapshot = MarketSnapshot { rsi_14: Some(42.0), ..MarketSnapshot::at_price("BTC/USDT", 50_000.0) };
        let prompt = build_prompt(
            "BTC/USDT",
            &snapshot,
            &Insight::empty("BTC/USDT", None),
            &Position::flat("BTC/USDT"),
            &limits(),
        );
        assert!(prompt.contains("Current Price: 50000.0000"));
        assert!(prompt.contains("RSI(14): 42.0"));
        assert!(prompt.contains("Flat (no open position)"));
        assert!(prompt.contains("No recorded trades yet"));
        assert!(prompt.contains("take profit 5%"));
    }

    #[test]
    fn test_memory_hints_are_bounded() {
        let long_lesson = "x".repeat(1_000);
        let insight = Insight::from_records("BTC/USDT", None, vec![failure(&long_lesson), failure("older")]);
        let block = memory_block(&insight);
        assert!(block.contains("2 closed trades, win rate 0%"));
        assert!(block.contains("Caution: 2 of 2 losing trades"));
        assert!(!block.contains(&long_lesson));
        assert!(block.contains(&"x".repeat(MAX_LESSON_CHARS)));
    }

    #[test]
    fn test_open_position_shows_unrealized() {
        let position = Position {
            side:          PositionSide::Long,
            entry_price:   100.0,
            size:          1.0,
            leverage:      5,
            stop_loss_pct: Some(2.0),
            ..Position::flat("SOL/USDT")
        };
        let block = position_block(&position, 101.0);
        assert!(block.contains("long 1 @ 100.0000 x5"));
        assert!(block.contains("(unknown, SL 2%)"));
        assert!(block.contains("Unrealized: +1.00%"));
    }
}
