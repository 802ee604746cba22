//! # risk — Risk Gate
//!
//! ด่านสุดท้ายก่อนเปิด Position ใหม่: ใช้กับ **open** เท่านั้น
//! (close / stop-loss ต้องผ่านได้เสมอ ไม่งั้นจะติด Position ที่ควรปิด)
//!
//! ## ลำดับการเช็ค
//! 1. **Kill Switch**      : manual, auto-kill หรือ Memory Store ล่ม
//! 2. **Min Confidence**   : Recommendation ที่มั่นใจไม่พอไม่ถูกเปิด
//! 3. **Cooldown**         : พักหลัง execution fail
//! 4. **Max Opens/Day**    : นับรวมทุก symbol, reset ตอนเที่ยงคืน UTC
//! 5. **Auto-Kill**        : fail ติดต่อกัน N ครั้ง

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{env_f64, env_u32, env_u64};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskConfig {
    /// เปิดได้กี่ครั้งต่อวัน (0 = ไม่จำกัด)
    pub max_opens_per_day:        u32,
    /// Fail ติดต่อกันกี่ครั้งถึง Auto-Kill (0 = ปิด)
    pub max_consecutive_failures: u32,
    pub cooldown_secs:            u64,
    pub min_confidence:           f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_opens_per_day:        0,
            max_consecutive_failures: 3,
            cooldown_secs:            300,
            min_confidence:           0.6,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_opens_per_day:        env_u32("RISK_MAX_OPENS_PER_DAY", d.max_opens_per_day),
            max_consecutive_failures: env_u32("RISK_MAX_CONSECUTIVE_FAILS", d.max_consecutive_failures),
            cooldown_secs:            env_u64("RISK_COOLDOWN_SECS", d.cooldown_secs),
            min_confidence:           env_f64("RISK_MIN_CONFIDENCE", d.min_confidence).clamp(0.0, 1.0),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(i64::try_from(self.cooldown_secs).unwrap_or(i64::MAX / 1000))
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct KillState {
    pub reason:    String,
    pub killed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Ledger {
    kill:                 Option<KillState>,
    day:                  NaiveDate,
    opens_by_symbol:      HashMap<String, u32>,
    consecutive_failures: u32,
    last_failure_at:      Option<DateTime<Utc>>,
    last_open_at:         Option<DateTime<Utc>>,
}

impl Ledger {
    fn opens_today(&self) -> u32 {
        self.opens_by_symbol.values().sum()
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.day {
            self.day = today;
            self.opens_by_symbol.clear();
            info!(%today, "📅 Risk: daily open counters reset");
        }
    }

    fn cooldown_ends_at(&self, config: &RiskConfig) -> Option<DateTime<Utc>> {
        self.last_failure_at.map(|t| t + config.cooldown())
    }
}

/// `GET /api/risk/status`
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub is_killed:            bool,
    pub kill:                 Option<KillState>,
    pub opens_today:          u32,
    pub opens_by_symbol:      HashMap<String, u32>,
    pub consecutive_failures: u32,
    pub last_open_at:         Option<DateTime<Utc>>,
    pub cooldown_ends_at:     Option<DateTime<Utc>>,
    pub config:               RiskConfig,
}

#[derive(Debug, PartialEq)]
pub enum RiskDecision {
    Approved,
    Blocked(String),
}

// ─── Risk Manager ─────────────────────────────────────────────────────────────

pub struct RiskManager {
    config: RiskConfig,
    ledger: RwLock<Ledger>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            ledger: RwLock::new(Ledger {
                kill:                 None,
                day:                  Utc::now().date_naive(),
                opens_by_symbol:      HashMap::new(),
                consecutive_failures: 0,
                last_failure_at:      None,
                last_open_at:         None,
            }),
        }
    }

    /// เรียกก่อนส่ง open intent ทุกครั้ง ถ้า Approved จะนับเป็นหนึ่ง open ของวันนี้
    pub async fn pre_trade_check(&self, symbol: &str, confidence: f64) -> RiskDecision {
        let now = Utc::now();
        let mut ledger = self.ledger.write().await;
        ledger.roll_day(now);

        if let Some(reason) = self.blocking_reason(&mut ledger, confidence, now) {
            return RiskDecision::Blocked(reason);
        }

        *ledger.opens_by_symbol.entry(symbol.to_string()).or_default() += 1;
        ledger.last_open_at = Some(now);
        info!(
            symbol,
            confidence,
            opens_today = ledger.opens_today(),
            max         = self.config.max_opens_per_day,
            "✅ Risk approved open"
        );
        RiskDecision::Approved
    }

    fn blocking_reason(&self, ledger: &mut Ledger, confidence: f64, now: DateTime<Utc>) -> Option<String> {
        if let Some(kill) = &ledger.kill {
            return Some(format!("Kill switch active: {}", kill.reason));
        }

        if confidence < self.config.min_confidence {
            return Some(format!(
                "Confidence {confidence:.2} below minimum {:.2}",
                self.config.min_confidence
            ));
        }

        if let Some(ends) = ledger.cooldown_ends_at(&self.config).filter(|ends| now < *ends) {
            return Some(format!(
                "Cooldown: {}s remaining after last failure",
                (ends - now).num_seconds()
            ));
        }

        let limit = self.config.max_opens_per_day;
        if limit > 0 && ledger.opens_today() >= limit {
            return Some(format!("Daily open limit reached: {}/{limit}", ledger.opens_today()));
        }

        let max_fails = self.config.max_consecutive_failures;
        if max_fails > 0 && ledger.consecutive_failures >= max_fails {
            let reason = format!("Auto-kill: {} consecutive execution failures", ledger.consecutive_failures);
            warn!(reason = %reason, "⛔ Risk auto-kill activated");
            ledger.kill = Some(KillState { reason: reason.clone(), killed_at: now });
            return Some(reason);
        }

        None
    }

    // ─── Execution Results ────────────────────────────────────────────────────

    /// order fill แล้ว
    pub async fn record_success(&self) {
        let mut ledger = self.ledger.write().await;
        if ledger.consecutive_failures > 0 {
            info!(was = ledger.consecutive_failures, "Risk: failure streak cleared");
        }
        ledger.consecutive_failures = 0;
    }

    /// order ถูก reject / cancel / จบโดยไม่ fill
    pub async fn record_failure(&self) {
        let mut ledger = self.ledger.write().await;
        ledger.consecutive_failures += 1;
        ledger.last_failure_at = Some(Utc::now());
        warn!(
            consecutive = ledger.consecutive_failures,
            max         = self.config.max_consecutive_failures,
            "⚠️ Risk: execution failure recorded"
        );
    }

    // ─── Kill Switch ──────────────────────────────────────────────────────────

    /// kill ซ้ำขณะ kill อยู่แล้วเก็บเหตุผลเดิมไว้
    pub async fn kill(&self, reason: &str) {
        let mut ledger = self.ledger.write().await;
        if ledger.kill.is_none() {
            ledger.kill = Some(KillState { reason: reason.to_string(), killed_at: Utc::now() });
            warn!(reason, "⛔ KILL SWITCH ACTIVATED");
        }
    }

    /// เปิดรับ open อีกครั้ง: ล้าง failure streak และ cooldown ด้วย
    pub async fn rearm(&self) {
        let mut ledger = self.ledger.write().await;
        let was = ledger.kill.take();
        ledger.consecutive_failures = 0;
        ledger.last_failure_at = None;
        info!(was = ?was.map(|k| k.reason), "✅ KILL SWITCH DEACTIVATED, opens enabled");
    }

    /// ถือ write lock ของ ledger ไว้: ทุก call ที่แตะ risk จะรอจน guard ถูก drop
    #[cfg(test)]
    pub(crate) async fn freeze(&self) -> tokio::sync::RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().await
    }

    pub async fn is_killed(&self) -> bool {
        self.ledger.read().await.kill.is_some()
    }

    pub async fn status(&self) -> RiskStatus {
        let now = Utc::now();
        let ledger = self.ledger.read().await;
        RiskStatus {
            is_killed:            ledger.kill.is_some(),
            kill:                 ledger.kill.clone(),
            opens_today:          ledger.opens_today(),
            opens_by_symbol:      ledger.opens_by_symbol.clone(),
            consecutive_failures: ledger.consecutive_failures,
            last_open_at:         ledger.last_open_at,
            cooldown_ends_at:     ledger.cooldown_ends_at(&self.config).filter(|ends| now < *ends),
            config:               self.config.clone(),
        }
    }
}
