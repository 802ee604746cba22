//! # advisory — Advisory Engine
//!
//! รวม Market Snapshot + Insight จาก Memory เป็น decision request หนึ่งก้อน
//! → เรียก decision model → validate คำตอบเป็น [`Recommendation`]
//!
//! ## Failure Policy
//! - model error / timeout → retry ตาม `RetryPolicy` (มี backoff) แล้วคืน
//!   `AdvisoryUnavailable` ให้ Coordinator แปลงเป็น hold
//! - คำตอบไม่ผ่าน validation → `Action::Invalid` (ไม่ retry)

pub mod llm;
pub mod parse;
pub mod prompt;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{Config, RetryPolicy};
use crate::error::TradeError;
use crate::models::{Action, Insight, MarketSnapshot, Position, Recommendation, StrategyLabel};

pub use llm::LlmClient;

// ─── Decision Model Seam ──────────────────────────────────────────────────────

/// Request ที่ส่งให้ decision model: system instruction + user prompt
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub symbol: String,
    pub system: String,
    pub prompt: String,
}

/// Collaborator ภายนอก: หนึ่ง request → หนึ่ง raw text response (ยังไม่ trust)
#[async_trait]
pub trait DecisionModel: Send + Sync {
    fn name(&self) -> String;

    async fn decide(&self, request: &DecisionRequest) -> anyhow::Result<String>;
}

// ─── Limits ───────────────────────────────────────────────────────────────────

/// ขอบเขตที่ใช้ validate คำแนะนำของ symbol หนึ่งตัว
#[derive(Debug, Clone, PartialEq)]
pub struct AdviceLimits {
    pub strategy:         StrategyLabel,
    pub default_size:     f64,
    pub min_size:         f64,
    pub default_leverage: u32,
    pub max_leverage:     u32,
}

impl AdviceLimits {
    pub fn for_symbol(config: &Config, symbol: &str) -> Self {
        Self {
            strategy:         config.strategy,
            default_size:     config.trade_size(symbol),
            min_size:         config.min_size(symbol),
            default_leverage: config.leverage,
            max_leverage:     config.max_leverage,
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct AdvisoryEngine {
    model: Arc<dyn DecisionModel>,
    retry: RetryPolicy,
}

impl AdvisoryEngine {
    pub fn new(model: Arc<dyn DecisionModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    pub fn model_name(&self) -> String {
        self.model.name()
    }

    /// หนึ่ง model call ต่อ attempt: Ok เสมอเมื่อ model ตอบ (แม้คำตอบจะ invalid)
    pub async fn recommend(
        &self,
        symbol: &str,
        snapshot: &MarketSnapshot,
        insight: &Insight,
        position: &Position,
        limits: &AdviceLimits,
    ) -> Result<Recommendation, TradeError> {
        let request = prompt::build_request(symbol, snapshot, insight, position, limits);
        let raw = self.call_model(&request).await?;
        debug!(symbol, raw = %raw, "🤖 Decision model replied");

        let rec = parse::parse_advice(&raw, symbol, limits);
        if let Action::Invalid { reason } = &rec.action {
            warn!(symbol, kind = "malformed_advice", reason = %reason, "🧩 Advice rejected, treating as hold");
        }
        Ok(rec)
    }

    async fn call_model(&self, request: &DecisionRequest) -> Result<String, TradeError> {
        let symbol = request.symbol.as_str();
        let mut last_error = String::new();

        for attempt in 1..=self.retry.attempts {
            match tokio::time::timeout(self.retry.timeout, self.model.decide(request)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e))   => last_error = format!("{e:#}"),
                Err(_)       => last_error = format!("timed out after {:?}", self.retry.timeout),
            }

            warn!(
                symbol,
                attempt,
                max   = self.retry.attempts,
                error = %last_error,
                "⚠️ Decision model call failed"
            );
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }

        Err(TradeError::AdvisoryUnavailable {
            symbol:   symbol.to_string(),
            attempts: self.retry.attempts,
            reason:   last_error,
        })
    }
}

// ─── Test Doubles ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// คำตอบที่ scripted model จะคืนตามลำดับ
    pub enum Reply {
        Text(String),
        Fail(String),
        Stall(Duration),
    }

    /// Decision model ที่คืนคำตอบตาม script: หมด script แล้วตอบ hold
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Reply>>,
        calls:   AtomicU32,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: AtomicU32::new(0) }
        }

        pub fn always(text: &str) -> Self {
            Self::new(vec![Reply::Text(text.to_string()); 64])
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub async fn push(&self, reply: Reply) {
            self.replies.lock().await.push_back(reply);
        }
    }

    impl Clone for Reply {
        fn clone(&self) -> Self {
            match self {
                Reply::Text(t)  => Reply::Text(t.clone()),
                Reply::Fail(e)  => Reply::Fail(e.clone()),
                Reply::Stall(d) => Reply::Stall(*d),
            }
        }
    }

    #[async_trait]
    impl DecisionModel for ScriptedModel {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        async fn decide(&self, _request: &DecisionRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().await.pop_front();
            match next {
                Some(Reply::Text(text)) => Ok(text),
                Some(Reply::Fail(err))  => anyhow::bail!(err),
                Some(Reply::Stall(d))   => {
                    tokio::time::sleep(d).await;
                    Ok(r#"{"action":"hold","confidence":0.5,"rationale":"late"}"#.to_string())
                }
                None => Ok(r#"{"action":"hold","confidence":0.5,"rationale":"script exhausted"}"#.to_string()),
            }
        }
    }
}
