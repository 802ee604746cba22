//! # Hindsight — Decision · Execution · Memory trading loop
//!
//! ```text
//!              every CYCLE_INTERVAL_SECS
//!  ┌─────────────────────────────────────────────────────────────┐
//!  │ Coordinator  (ทุก symbol พร้อมกัน, แต่ละ symbol ทีละ stage)    │
//!  │                                                             │
//!  │  snapshot ─▶ reconcile ─▶ SL/TP guard ─▶ advisory ─▶ order  │
//!  │     │            │                          │          │    │
//!  └─────┼────────────┼──────────────────────────┼──────────┼────┘
//!        ▼            ▼                          ▼          ▼
//!   Market bridge   Exchange ◀──────────── Decision model   Memory Store
//!                   (paper / http)         (Claude/OpenAI)  (journal / postgres)
//!                                                               │
//!  ┌──────────────┐   GET /api/* · /ws/monitor                  │
//!  │  Dashboard   │ ◀───────────────────────────────────────────┘
//!  └──────────────┘   POST /api/risk/* · /api/control/drain
//! ```
//!
//! ## Environment Variables
//!
//! | Variable              | Default              | Description                          |
//! |-----------------------|----------------------|--------------------------------------|
//! | `SYMBOLS`             | `BTC/USDT,ETH/USDT`  | Symbols ที่เทรด                        |
//! | `CYCLE_INTERVAL_SECS` | `120`                | รอบของ cycle                          |
//! | `EXCHANGE_URL`        | `mock`               | `mock` = paper exchange ในโปรเซส        |
//! | `MARKET_URL`          | —                    | ไม่ตั้ง = mock snapshot                 |
//! | `AI_PROVIDER`         | `claude`             | `claude` / `openai` / `deepseek`     |
//! | `AI_API_KEY`          | —                    | **required**                         |
//! | `MEMORY_PATH`         | `data/memory.jsonl`  | Journal file                         |
//! | `DATABASE_URL`        | —                    | Postgres (feature `postgres`)        |
//! | `BIND_ADDR`           | `0.0.0.0:3000`       | Monitor / control API                |
//! | `API_KEY`             | —                    | X-API-Key guard (ว่าง = dev mode)     |
//! | `RUST_LOG`            | `hindsight=debug`    | Tracing filter                       |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod advisory;
mod auth;
mod config;
mod coordinator;
mod error;
mod events;
mod exchange;
mod market;
mod memory;
mod models;
mod reconciler;
mod risk;
mod routes;
mod state;

use advisory::{AdvisoryEngine, LlmClient};
use config::{AiConfig, Config};
use coordinator::{Collaborators, Coordinator};
use events::EventBus;
use exchange::{Exchange, HttpExchange, PaperExchange};
use market::{BridgeSnapshotProvider, SnapshotProvider, StaticSnapshotProvider};
use memory::{JournalStore, MemoryStore};
use reconciler::PositionReconciler;
use risk::RiskManager;
use state::AppState;

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env ─────────────────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Structured logging ────────────────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("hindsight=debug".parse()?)
            .add_directive("tower_http=info".parse()?)
            .add_directive("reqwest=warn".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║          HINDSIGHT — Trading Loop             ║
  ║     Advisory · Execution · Memory             ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Configuration ─────────────────────────────────────────────────────
    let config = Arc::new(Config::from_env()?);
    let ai = AiConfig::from_env()?;

    info!(
        symbols   = ?config.symbols,
        strategy  = %config.strategy,
        interval  = config.cycle_interval.as_secs(),
        test_mode = config.test_mode,
        exchange  = config.exchange_endpoint(),
        provider  = %ai.provider,
        model     = %ai.model,
        "⚙️ Config loaded"
    );

    // ── 4. Collaborators ─────────────────────────────────────────────────────
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    let snapshots = build_snapshots(&config, &http);
    let exchange  = build_exchange(&config, &http, &snapshots).await;
    let memory    = build_memory(&config).await?;
    let model     = Arc::new(LlmClient::new(http.clone(), ai));
    let advisory  = Arc::new(AdvisoryEngine::new(model, config.advisory_retry));

    let reconciler = Arc::new(PositionReconciler::new());
    let risk       = Arc::new(RiskManager::new(config.risk.clone()));
    let events     = EventBus::new();

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        Collaborators {
            exchange,
            snapshots,
            advisory,
            memory,
            reconciler: Arc::clone(&reconciler),
            risk:       Arc::clone(&risk),
            events:     events.clone(),
        },
    ));

    // ── 5. Startup recovery → trading loop ───────────────────────────────────
    coordinator.recover().await;
    let trading = tokio::spawn(Arc::clone(&coordinator).run());

    // ── 6. Monitor / control API ─────────────────────────────────────────────
    let state = AppState::new(
        Arc::clone(&coordinator),
        reconciler,
        risk,
        events,
        std::env::var("API_KEY").ok(),
    );
    if state.api_key.is_none() {
        warn!("🔓 API_KEY not set, monitor/control API is open (dev mode)");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid BIND_ADDR '{}'", config.bind_addr))?;
    info!(?addr, "🚀 Hindsight API listening");

    // ── 7. Serve until Ctrl-C or POST /api/control/drain ─────────────────────
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = Arc::clone(&coordinator);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => shutdown.request_drain(),
                _ = shutdown.wait_drained() => {}
            }
            shutdown.wait_drained().await;
        })
        .await?;

    trading.await.context("Trading loop panicked")?;
    info!("👋 Hindsight stopped");
    Ok(())
}

// ─── Wiring ───────────────────────────────────────────────────────────────────

fn build_snapshots(config: &Config, http: &reqwest::Client) -> Arc<dyn SnapshotProvider> {
    match &config.market_url {
        Some(url) => {
            info!(url = %url, "📈 Market snapshots from bridge");
            Arc::new(BridgeSnapshotProvider::new(http.clone(), url, config.snapshot_timeout))
        }
        None => {
            warn!("🎭 MARKET_URL not set, using static mock snapshots");
            Arc::new(StaticSnapshotProvider::with_mock_data(&config.symbols))
        }
    }
}

async fn build_exchange(
    config: &Config,
    http: &reqwest::Client,
    snapshots: &Arc<dyn SnapshotProvider>,
) -> Arc<dyn Exchange> {
    let endpoint = config.exchange_endpoint();
    if endpoint != "mock" {
        info!(endpoint, test_mode = config.test_mode, "🏦 Exchange bridge");
        return Arc::new(HttpExchange::new(http.clone(), endpoint, config.exchange.api_key.clone()));
    }

    // paper exchange เริ่มที่ราคาเดียวกับ snapshot
    let paper = PaperExchange::new();
    for symbol in &config.symbols {
        match snapshots.snapshot(symbol).await {
            Ok(snapshot) => paper.set_mark(symbol, snapshot.price).await,
            Err(e) => warn!(symbol = %symbol, error = %e, "⚠️ No starting mark for paper exchange"),
        }
    }
    warn!("🎭 EXCHANGE_URL=mock, orders go to the in-process paper exchange");
    Arc::new(paper)
}

async fn build_memory(config: &Config) -> anyhow::Result<Arc<dyn MemoryStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let store = memory::postgres::PostgresStore::connect(url)
            .await
            .context("Failed to connect Postgres memory store")?;
        info!("🐘 Memory store: postgres");
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        warn!("DATABASE_URL set but built without the `postgres` feature, using the journal");
    }

    let store = JournalStore::open(&config.memory_path)
        .await
        .with_context(|| format!("Failed to open memory journal {}", config.memory_path.display()))?;
    info!(path = %config.memory_path.display(), records = store.len().await, "📓 Memory store: journal");
    Ok(Arc::new(store))
}
