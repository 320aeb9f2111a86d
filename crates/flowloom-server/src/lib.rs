use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use flowloom_core::{
    AppConfig, EventBus, MessageIntake, RunEngine, SimilarityMatcher, Store, Summarizer,
    Validator, VersionManager,
};
use flowloom_providers::LlmPort;

mod http;
mod idempotency;

pub use http::app_router;
pub use idempotency::{IdempotencyCache, Lookup};

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub config: Arc<AppConfig>,
    pub engine: RunEngine,
    pub intake: Arc<MessageIntake>,
    pub summarizer: Arc<Summarizer>,
    pub matcher: SimilarityMatcher,
    pub versions: VersionManager,
    pub idempotency: IdempotencyCache,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<Store>,
        bus: EventBus,
        llm: Arc<dyn LlmPort>,
    ) -> Self {
        let matcher = SimilarityMatcher::new(config.similarity_threshold);
        let validator = Validator::new(&config.schema_channel);
        let versions = VersionManager::new(&config.schema_channel);
        let engine = RunEngine::new(
            store.clone(),
            bus.clone(),
            llm.clone(),
            matcher.clone(),
            validator,
            versions.clone(),
        );
        let intake = Arc::new(MessageIntake::new(
            store.clone(),
            bus.clone(),
            config.messages_rate_per_minute,
            config.message_text_max_len,
        ));
        let summarizer = Arc::new(Summarizer::new(store.clone(), llm));
        let idempotency =
            IdempotencyCache::new(config.idempotency_cache_max, config.idempotency_ttl);
        Self {
            store,
            bus,
            config: Arc::new(config),
            engine,
            intake,
            summarizer,
            matcher,
            versions,
            idempotency,
        }
    }
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "flowloom api listening");
    axum::serve(listener, router).await?;
    Ok(())
}
