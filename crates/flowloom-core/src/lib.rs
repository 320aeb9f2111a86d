pub mod canonical;
pub mod config;
pub mod errors;
pub mod event_bus;
pub mod intake;
pub mod run_engine;
pub mod similarity;
pub mod store;
pub mod summarizer;
pub mod threads;
pub mod validator;
pub mod versioning;

pub use canonical::{content_hash, to_canonical_json};
pub use config::AppConfig;
pub use errors::{CoreError, CoreResult};
pub use event_bus::{EventBus, Replay};
pub use intake::{MessageIntake, RateLimiter};
pub use run_engine::{CancellationRegistry, RunEngine, RunRequest};
pub use similarity::SimilarityMatcher;
pub use store::{Store, Tables};
pub use summarizer::Summarizer;
pub use threads::create_thread_with_snapshot;
pub use validator::Validator;
pub use versioning::VersionManager;
