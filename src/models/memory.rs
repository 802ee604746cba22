//! # models::memory
//!
//! [`MemoryRecord`]: ผลลัพธ์ของ Position ที่ปิดแล้ว (append-only ไม่มีวันแก้)
//! และ [`Insight`]: สรุปที่ fold มาจาก records ของ symbol / strategy
//!
//! Insight คือสิ่งที่ Advisory Engine ใช้ "จำ" ว่าอะไรเคยได้ผล อะไรเคยเจ็บ

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ClosedPosition, CloseReason, MarketRegime, PositionSide, StrategyLabel};

/// จำนวน record ขั้นต่ำก่อนจะเชื่อ stat ของกลุ่มย่อย (strategy / ชั่วโมง)
const MIN_GROUP_SAMPLES: usize = 2;
/// จำนวน lesson ล่าสุดที่เก็บไว้ใน Insight
const RECENT_LESSONS: usize = 3;

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
}

impl Outcome {
    /// `|pnl| <= neutral_band` = neutral, ไม่งั้นตามเครื่องหมาย
    pub fn classify(pnl_pct: f64, neutral_band_pct: f64) -> Self {
        if pnl_pct > neutral_band_pct {
            Outcome::Success
        } else if pnl_pct < -neutral_band_pct {
            Outcome::Failure
        } else {
            Outcome::Neutral
        }
    }
}

// ─── Memory Record ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub record_id:   Uuid,
    pub symbol:      String,
    pub strategy:    StrategyLabel,
    pub side:        PositionSide,
    pub outcome:     Outcome,
    /// Realized P&L % ของราคา (ไม่คูณ leverage)
    pub pnl_pct:     f64,
    pub entry_price: f64,
    pub exit_price:  f64,
    pub regime:      MarketRegime,
    pub reason:      CloseReason,
    pub lesson:      String,
    pub opened_at:   Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn from_close(closed: &ClosedPosition, regime: MarketRegime, neutral_band_pct: f64) -> Self {
        let pos     = &closed.position;
        let outcome = Outcome::classify(closed.pnl_pct, neutral_band_pct);
        let lesson  = match outcome {
            Outcome::Success => format!(
                "{} {} worked: {} at {:+.2}% in a {} market",
                pos.strategy, pos.side, closed.reason, closed.pnl_pct, regime
            ),
            Outcome::Failure => format!(
                "{} {} lost {:.2}% ({}) in a {} market; be wary of this setup",
                pos.strategy, pos.side, closed.pnl_pct.abs(), closed.reason, regime
            ),
            Outcome::Neutral => format!(
                "{} {} closed flat ({}) at {:+.2}% in a {} market",
                pos.strategy, pos.side, closed.reason, closed.pnl_pct, regime
            ),
        };

        Self {
            record_id:   Uuid::new_v4(),
            symbol:      pos.symbol.clone(),
            strategy:    pos.strategy,
            side:        pos.side,
            outcome,
            pnl_pct:     closed.pnl_pct,
            entry_price: pos.entry_price,
            exit_price:  closed.exit_price,
            regime,
            reason:      closed.reason,
            lesson,
            opened_at:   pos.opened_at,
            recorded_at: closed.closed_at,
        }
    }
}

// ─── Query ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQuery {
    pub symbol:   String,
    pub strategy: Option<StrategyLabel>,
    pub limit:    Option<usize>,
    pub since:    Option<DateTime<Utc>>,
}

impl MemoryQuery {
    pub fn symbol(symbol: &str) -> Self {
        Self { symbol: symbol.to_string(), strategy: None, limit: None, since: None }
    }

    pub fn strategy(mut self, strategy: Option<StrategyLabel>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        record.symbol == self.symbol
            && self.strategy.map_or(true, |s| record.strategy == s)
            && self.since.map_or(true, |t| record.recorded_at >= t)
    }
}

// ─── Insight ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyStats {
    pub strategy:    StrategyLabel,
    pub count:       usize,
    pub wins:        usize,
    pub win_rate:    f64,
    pub avg_pnl_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insight {
    pub symbol:              String,
    pub strategy:            Option<StrategyLabel>,
    pub count:               usize,
    pub wins:                usize,
    pub losses:              usize,
    /// wins / count (0.0 เมื่อไม่มี record)
    pub win_rate:            f64,
    pub avg_pnl_pct:         f64,
    pub avg_win_pct:         Option<f64>,
    pub avg_loss_pct:        Option<f64>,
    /// Regime ที่เจอบ่อยที่สุดในกลุ่ม failure
    pub failure_regime:      Option<MarketRegime>,
    pub caution:             Option<String>,
    pub last_failure_lesson: Option<String>,
    pub recent_lessons:      Vec<String>,
    pub by_strategy:         Vec<StrategyStats>,
    pub best_strategy:       Option<StrategyLabel>,
    /// ชั่วโมง UTC ที่ average P&L ดีที่สุด
    pub best_hour_utc:       Option<u32>,
}

impl Insight {
    pub fn empty(symbol: &str, strategy: Option<StrategyLabel>) -> Self {
        Self {
            symbol: symbol.to_string(),
            strategy,
            count: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            avg_pnl_pct: 0.0,
            avg_win_pct: None,
            avg_loss_pct: None,
            failure_regime: None,
            caution: None,
            last_failure_lesson: None,
            recent_lessons: Vec::new(),
            by_strategy: Vec::new(),
            best_strategy: None,
            best_hour_utc: None,
        }
    }

    /// Fold records (เรียงใหม่สุดก่อน) เป็น Insight
    pub fn from_records<I>(symbol: &str, strategy: Option<StrategyLabel>, records: I) -> Self
    where
        I: IntoIterator<Item = MemoryRecord>,
    {
        let mut insight = Insight::empty(symbol, strategy);

        let mut pnl_sum  = 0.0;
        let mut win_sum  = 0.0;
        let mut loss_sum = 0.0;
        let mut failure_regimes: HashMap<MarketRegime, (usize, usize)> = HashMap::new();
        let mut per_strategy: BTreeMap<&'static str, (StrategyLabel, usize, usize, f64)> = BTreeMap::new();
        let mut per_hour: BTreeMap<u32, (usize, f64)> = BTreeMap::new();

        for record in records {
            let order = insight.count;
            insight.count += 1;
            pnl_sum += record.pnl_pct;

            match record.outcome {
                Outcome::Success => {
                    insight.wins += 1;
                    win_sum += record.pnl_pct;
                }
                Outcome::Failure => {
                    insight.losses += 1;
                    loss_sum += record.pnl_pct;
                    if insight.last_failure_lesson.is_none() {
                        insight.last_failure_lesson = Some(record.lesson.clone());
                    }
                    if record.regime != MarketRegime::Unknown {
                        // (count, first-seen order): tie ให้ตัวที่ใหม่กว่า
                        let entry = failure_regimes.entry(record.regime).or_insert((0, order));
                        entry.0 += 1;
                    }
                }
                Outcome::Neutral => {}
            }

            let stats = per_strategy
                .entry(record.strategy.as_str())
                .or_insert((record.strategy, 0, 0, 0.0));
            stats.1 += 1;
            if record.outcome == Outcome::Success {
                stats.2 += 1;
            }
            stats.3 += record.pnl_pct;

            let hour = per_hour.entry(record.recorded_at.hour()).or_insert((0, 0.0));
            hour.0 += 1;
            hour.1 += record.pnl_pct;

            if insight.recent_lessons.len() < RECENT_LESSONS {
                insight.recent_lessons.push(record.lesson);
            }
        }

        if insight.count == 0 {
            return insight;
        }

        insight.win_rate    = insight.wins as f64 / insight.count as f64;
        insight.avg_pnl_pct = pnl_sum / insight.count as f64;
        if insight.wins > 0 {
            insight.avg_win_pct = Some(win_sum / insight.wins as f64);
        }
        if insight.losses > 0 {
            insight.avg_loss_pct = Some(loss_sum / insight.losses as f64);
        }

        insight.failure_regime = failure_regimes
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
            .map(|(regime, _)| *regime);
        if let Some(regime) = insight.failure_regime {
            let hits = failure_regimes.get(&regime).map_or(0, |v| v.0);
            insight.caution = Some(format!(
                "{hits} of {} losing trades on {symbol} happened in {regime} markets",
                insight.losses
            ));
        }

        insight.by_strategy = per_strategy
            .into_values()
            .map(|(strategy, count, wins, pnl)| StrategyStats {
                strategy,
                count,
                wins,
                win_rate:    wins as f64 / count as f64,
                avg_pnl_pct: pnl / count as f64,
            })
            .collect();

        insight.best_strategy = insight
            .by_strategy
            .iter()
            .filter(|s| s.count >= MIN_GROUP_SAMPLES && s.strategy != StrategyLabel::Unknown)
            .max_by(|a, b| {
                a.win_rate
                    .total_cmp(&b.win_rate)
                    .then(a.avg_pnl_pct.total_cmp(&b.avg_pnl_pct))
            })
            .map(|s| s.strategy);

        insight.best_hour_utc = per_hour
            .iter()
            .filter(|(_, (count, _))| *count >= MIN_GROUP_SAMPLES)
            .max_by(|a, b| {
                let avg_a = a.1 .1 / a.1 .0 as f64;
                let avg_b = b.1 .1 / b.1 .0 as f64;
                avg_a.total_cmp(&avg_b)
            })
            .map(|(hour, _)| *hour);

        insight
    }
}
