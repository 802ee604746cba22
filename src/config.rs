//! # config — อ่าน Config จาก Environment Variables
//!
//! `.env` ถูกโหลดด้วย `dotenvy` ใน `main` ก่อนเรียก [`Config::from_env`]
//! ค่าทุกตัวมี default ที่รันได้ทันทีในโหมด paper (`EXCHANGE_URL=mock`)
//!
//! Config ย่อยของแต่ละ component (`RiskConfig`, `GateConfig`) มี `from_env`
//! ของตัวเองในโมดูลนั้นๆ

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::coordinator::gates::GateConfig;
use crate::models::StrategyLabel;
use crate::risk::RiskConfig;

/// ขนาด order ตั้งต้นและขั้นต่ำต่อ coin (หน่วยสัญญา)
const DEFAULT_SIZES: [(&str, f64); 5] = [
    ("BTC", 0.01),
    ("ETH", 0.1),
    ("XRP", 0.1),
    ("SOL", 0.1),
    ("BNB", 1.0),
];

// ─── Env Helpers ──────────────────────────────────────────────────────────────

pub(crate) fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
pub(crate) fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

// ─── Retry Policy ─────────────────────────────────────────────────────────────

/// จำนวนครั้ง + exponential backoff + timeout ต่อการเรียกหนึ่งครั้ง
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// จำนวนครั้งทั้งหมด (รวมครั้งแรก) ต้อง >= 1
    pub attempts:     u32,
    pub base_backoff: Duration,
    pub max_backoff:  Duration,
    pub timeout:      Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_backoff: Duration, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_backoff,
            max_backoff: base_backoff * 16,
            timeout,
        }
    }

    /// Delay ก่อน retry หลัง attempt ที่ `attempt` (เริ่ม 1) ล้มเหลว
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    fn from_env(prefix: &str, attempts: u32, backoff_ms: u64, timeout_secs: u64) -> Self {
        Self::new(
            env_u32(&format!("{prefix}_ATTEMPTS"), attempts),
            Duration::from_millis(env_u64(&format!("{prefix}_BACKOFF_MS"), backoff_ms)),
            Duration::from_secs(env_u64(&format!("{prefix}_TIMEOUT_SECS"), timeout_secs)),
        )
    }
}

// ─── AI Provider ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    Claude,   // Anthropic Messages API
    OpenAi,   // OpenAI Chat Completions
    DeepSeek, // OpenAI-compatible (api.deepseek.com)
}

impl AiProvider {
    pub fn default_model(self) -> &'static str {
        match self {
            AiProvider::Claude   => "claude-3-5-sonnet-20241022",
            AiProvider::OpenAi   => "gpt-4o",
            AiProvider::DeepSeek => "deepseek-chat",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            AiProvider::Claude   => "https://api.anthropic.com",
            AiProvider::OpenAi   => "https://api.openai.com",
            AiProvider::DeepSeek => "https://api.deepseek.com",
        }
    }
}

impl std::fmt::Display for AiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiProvider::Claude   => write!(f, "Claude"),
            AiProvider::OpenAi   => write!(f, "OpenAI"),
            AiProvider::DeepSeek => write!(f, "DeepSeek"),
        }
    }
}

impl std::str::FromStr for AiProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude"   => Ok(AiProvider::Claude),
            "openai"   => Ok(AiProvider::OpenAi),
            "deepseek" => Ok(AiProvider::DeepSeek),
            other => bail!("Unknown AI_PROVIDER: '{other}'. Use 'claude', 'openai' or 'deepseek'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub provider:   AiProvider,
    pub api_key:    String,
    pub model:      String,
    pub base_url:   String,
    pub max_tokens: u32,
}

impl AiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let provider: AiProvider = std::env::var("AI_PROVIDER")
            .unwrap_or_else(|_| "claude".to_string())
            .parse()?;

        let api_key = std::env::var("AI_API_KEY")
            .context("AI_API_KEY environment variable is required")?;

        Ok(Self {
            provider,
            api_key,
            model:      std::env::var("AI_MODEL").unwrap_or_else(|_| provider.default_model().to_string()),
            base_url:   std::env::var("AI_BASE_URL").unwrap_or_else(|_| provider.default_base_url().to_string()),
            max_tokens: env_u32("AI_MAX_TOKENS", 1024),
        })
    }
}

// ─── Exchange Endpoint ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Live endpoint: `mock` = paper exchange ในโปรเซส
    pub url:         String,
    pub testnet_url: String,
    pub api_key:     Option<String>,
}

impl ExchangeConfig {
    /// `TEST_MODE` เลือก testnet endpoint เสมอ
    pub fn endpoint(&self, test_mode: bool) -> &str {
        if test_mode { &self.testnet_url } else { &self.url }
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub symbols:              Vec<String>,
    pub trade_sizes:          HashMap<String, f64>,
    pub min_sizes:            HashMap<String, f64>,
    pub default_trade_size:   f64,
    pub leverage:             u32,
    pub max_leverage:         u32,
    pub strategy:             StrategyLabel,
    pub test_mode:            bool,
    pub cycle_interval:       Duration,
    /// Deadline ต่อ symbol pipeline ภายในหนึ่ง cycle
    pub cycle_deadline:       Duration,
    pub exchange:             ExchangeConfig,
    pub market_url:           Option<String>,
    pub memory_path:          PathBuf,
    pub database_url:         Option<String>,
    pub bind_addr:            String,
    pub advisory_retry:       RetryPolicy,
    pub exchange_retry:       RetryPolicy,
    pub store_retry:          RetryPolicy,
    pub snapshot_timeout:     Duration,
    /// จำนวนครั้งที่ poll order status ระหว่าง Settling
    pub settle_polls:         u32,
    pub settle_poll_interval: Duration,
    /// Order ที่ยัง working นานกว่านี้ถูก cancel ในรอบถัดไป
    pub stale_order_after:    Duration,
    /// > 0 = open ด้วย limit order ห่างจาก mark เท่านี้ % (0 = market)
    pub entry_limit_offset_pct: f64,
    /// |pnl| <= band ถือว่า neutral
    pub neutral_band_pct:     f64,
    /// Conflict ติดกันกี่รอบถึง alert ระดับ process
    pub conflict_alert_after: u32,
    pub gates:                GateConfig,
    pub risk:                 RiskConfig,
}

impl Default for Config {
    fn default() -> Self {
        let sizes: HashMap<String, f64> = DEFAULT_SIZES
            .iter()
            .map(|(coin, size)| (coin.to_string(), *size))
            .collect();

        Self {
            symbols:              vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            trade_sizes:          sizes.clone(),
            min_sizes:            sizes,
            default_trade_size:   0.01,
            leverage:             10,
            max_leverage:         20,
            strategy:             StrategyLabel::Balanced,
            test_mode:            false,
            cycle_interval:       Duration::from_secs(120),
            cycle_deadline:       Duration::from_secs(108),
            exchange: ExchangeConfig {
                url:         "mock".to_string(),
                testnet_url: "mock".to_string(),
                api_key:     None,
            },
            market_url:           None,
            memory_path:          PathBuf::from("data/memory.jsonl"),
            database_url:         None,
            bind_addr:            "0.0.0.0:3000".to_string(),
            advisory_retry:       RetryPolicy::new(2, Duration::from_millis(500), Duration::from_secs(30)),
            exchange_retry:       RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(5)),
            store_retry:          RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(5)),
            snapshot_timeout:     Duration::from_secs(10),
            settle_polls:         10,
            settle_poll_interval: Duration::from_millis(500),
            stale_order_after:    Duration::from_secs(300),
            entry_limit_offset_pct: 0.0,
            neutral_band_pct:     0.1,
            conflict_alert_after: 3,
            gates:                GateConfig::default(),
            risk:                 RiskConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let symbols = match std::env::var("SYMBOLS") {
            Ok(raw) => parse_symbols(&raw)?,
            Err(_)  => defaults.symbols,
        };

        let mut trade_sizes = defaults.trade_sizes;
        if let Ok(raw) = std::env::var("TRADE_SIZES") {
            trade_sizes.extend(parse_size_map(&raw).context("TRADE_SIZES")?);
        }
        let mut min_sizes = defaults.min_sizes;
        if let Ok(raw) = std::env::var("MIN_SIZES") {
            min_sizes.extend(parse_size_map(&raw).context("MIN_SIZES")?);
        }

        let strategy: StrategyLabel = std::env::var("STRATEGY")
            .unwrap_or_else(|_| "balanced".to_string())
            .parse()
            .map_err(anyhow::Error::msg)?;
        if strategy == StrategyLabel::Unknown {
            bail!("STRATEGY must be balanced, aggressive or stable_profit");
        }

        let leverage     = env_u32("LEVERAGE", defaults.leverage);
        let max_leverage = env_u32("MAX_LEVERAGE", defaults.max_leverage);
        if leverage == 0 || leverage > max_leverage {
            bail!("LEVERAGE must be between 1 and MAX_LEVERAGE ({max_leverage}), got {leverage}");
        }

        let interval_secs = env_u64("CYCLE_INTERVAL_SECS", defaults.cycle_interval.as_secs());
        if interval_secs == 0 {
            bail!("CYCLE_INTERVAL_SECS must be greater than zero");
        }
        let deadline_secs = env_u64("CYCLE_DEADLINE_SECS", (interval_secs * 9 / 10).max(1));

        Ok(Self {
            symbols,
            trade_sizes,
            min_sizes,
            default_trade_size:   env_f64("DEFAULT_TRADE_SIZE", defaults.default_trade_size),
            leverage,
            max_leverage,
            strategy,
            test_mode:            env_bool("TEST_MODE", false),
            cycle_interval:       Duration::from_secs(interval_secs),
            cycle_deadline:       Duration::from_secs(deadline_secs),
            exchange: ExchangeConfig {
                url:         std::env::var("EXCHANGE_URL").unwrap_or(defaults.exchange.url),
                testnet_url: std::env::var("EXCHANGE_TESTNET_URL").unwrap_or(defaults.exchange.testnet_url),
                api_key:     std::env::var("EXCHANGE_API_KEY").ok().filter(|k| !k.is_empty()),
            },
            market_url:           std::env::var("MARKET_URL").ok().filter(|u| !u.is_empty()),
            memory_path:          std::env::var("MEMORY_PATH").map(PathBuf::from).unwrap_or(defaults.memory_path),
            database_url:         std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            bind_addr:            std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            advisory_retry:       RetryPolicy::from_env("ADVISORY", 2, 500, 30),
            exchange_retry:       RetryPolicy::from_env("EXCHANGE", 3, 250, 5),
            store_retry:          RetryPolicy::from_env("STORE", 3, 100, 5),
            snapshot_timeout:     Duration::from_secs(env_u64("SNAPSHOT_TIMEOUT_SECS", 10)),
            settle_polls:         env_u32("SETTLE_POLLS", defaults.settle_polls).max(1),
            settle_poll_interval: Duration::from_millis(env_u64("SETTLE_POLL_INTERVAL_MS", 500)),
            stale_order_after:    Duration::from_secs(env_u64("STALE_ORDER_SECS", 300)),
            entry_limit_offset_pct: env_f64("ENTRY_LIMIT_OFFSET_PCT", defaults.entry_limit_offset_pct).max(0.0),
            neutral_band_pct:     env_f64("NEUTRAL_BAND_PCT", defaults.neutral_band_pct).abs(),
            conflict_alert_after: env_u32("CONFLICT_ALERT_AFTER", defaults.conflict_alert_after).max(1),
            gates:                GateConfig::from_env(),
            risk:                 RiskConfig::from_env(),
        })
    }

    /// ขนาด order ของ symbol (lookup ตามชื่อเต็มก่อน แล้วค่อย base asset)
    pub fn trade_size(&self, symbol: &str) -> f64 {
        lookup_size(&self.trade_sizes, symbol).unwrap_or(self.default_trade_size)
    }

    /// ขนาดขั้นต่ำที่ exchange รับ (0.0 = ไม่จำกัด)
    pub fn min_size(&self, symbol: &str) -> f64 {
        lookup_size(&self.min_sizes, symbol).unwrap_or(0.0)
    }

    pub fn exchange_endpoint(&self) -> &str {
        self.exchange.endpoint(self.test_mode)
    }
}

// ─── Parsing ──────────────────────────────────────────────────────────────────

/// `"BTC/USDT:USDT"` → `"BTC"`
pub fn base_asset(symbol: &str) -> &str {
    symbol
        .split(|c| c == '/' || c == '-' || c == ':')
        .next()
        .unwrap_or(symbol)
}

fn lookup_size(map: &HashMap<String, f64>, symbol: &str) -> Option<f64> {
    map.get(symbol)
        .or_else(|| map.get(base_asset(symbol)))
        .copied()
}

fn parse_symbols(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut symbols: Vec<String> = Vec::new();
    for symbol in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    }
    if symbols.is_empty() {
        bail!("SYMBOLS must list at least one symbol");
    }
    Ok(symbols)
}

/// `"BTC=0.01,ETH=0.1"` → map
fn parse_size_map(raw: &str) -> anyhow::Result<HashMap<String, f64>> {
    let mut sizes = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=SIZE, got '{pair}'"))?;
        let size: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("invalid size for {key}: '{value}'"))?;
        if !size.is_finite() || size <= 0.0 {
            bail!("size for {key} must be positive, got {size}");
        }
        sizes.insert(key.trim().to_string(), size);
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(30), Duration::from_millis(1600));
    }

    #[test]
    fn test_attempts_never_zero() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_secs(1));
        assert_eq!(policy.attempts, 1);
    }

    #[test]
    fn test_size_lookup_by_base_asset() {
        let config = Config::default();
        assert_eq!(config.trade_size("BTC/USDT:USDT"), 0.01);
        assert_eq!(config.trade_size("BNB/USDT"), 1.0);
        assert_eq!(config.min_size("ETH-USDT"), 0.1);
        assert_eq!(config.trade_size("DOGE/USDT"), config.default_trade_size);
        assert_eq!(config.min_size("DOGE/USDT"), 0.0);
    }

    #[test]
    fn test_parse_size_map() {
        let map = parse_size_map("BTC=0.02, ETH = 0.5").unwrap();
        assert_eq!(map.get("BTC"), Some(&0.02));
        assert_eq!(map.get("ETH"), Some(&0.5));
        assert!(parse_size_map("BTC").is_err());
        assert!(parse_size_map("BTC=-1").is_err());
    }

    #[test]
    fn test_parse_symbols_dedupes() {
        let symbols = parse_symbols("BTC/USDT, ETH/USDT,BTC/USDT,").unwrap();
        assert_eq!(symbols, vec!["BTC/USDT", "ETH/USDT"]);
        assert!(parse_symbols(" , ").is_err());
    }

    #[test]
    fn test_test_mode_selects_testnet() {
        let exchange = ExchangeConfig {
            url:         "https://live.example".into(),
            testnet_url: "https://testnet.example".into(),
            api_key:     None,
        };
        assert_eq!(exchange.endpoint(true), "https://testnet.example");
        assert_eq!(exchange.endpoint(false), "https://live.example");
    }
}
