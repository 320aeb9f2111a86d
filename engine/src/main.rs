use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use flowloom_core::{AppConfig, EventBus, Store};
use flowloom_observability::{LogOptions, ProcessKind};
use flowloom_providers::{build_llm, LlmSettings};
use flowloom_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "flowloom-engine")]
#[command(about = "Flowloom pipeline authoring service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, env = "FLOWLOOM_STATE_DIR", default_value = ".flowloom")]
        state_dir: String,
    },
    /// Seed an initial schema definition and point the configured channel at it.
    Seed {
        #[arg(long, env = "FLOWLOOM_STATE_DIR", default_value = ".flowloom")]
        state_dir: String,
        /// Path to a schema JSON file; a built-in pipeline schema is used when absent.
        #[arg(long)]
        schema_path: Option<String>,
    },
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["name", "stages"],
        "properties": {
            "name": {"type": "string"},
            "stages": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "type", "params"],
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string", "enum": ["source", "map", "reduce", "sink"]},
                        "params": {"type": "object"}
                    }
                }
            }
        }
    })
}

fn llm_settings(config: &AppConfig) -> LlmSettings {
    LlmSettings {
        provider: config.llm_provider.clone(),
        timeout: config.llm_timeout,
        retries: config.llm_retries,
        backoff_base: config.llm_backoff_base,
        api_key: config.openai_api_key.clone(),
        model: config.openai_model.clone(),
        base_url: config.openai_base_url.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_root = PathBuf::from(state_dir);
            let config = AppConfig::from_env();
            let log = LogOptions::new(ProcessKind::Api, state_root.join("logs"))
                .retention_days(config.log_retention_days)
                .init()?;
            info!(
                dir = %log.dir.display(),
                files_swept = log.swept_files,
                "logging initialized"
            );

            let store = Store::open(state_root.join("state"))
                .await
                .context("opening store")?;
            let bus = EventBus::new(config.sse_buffer_maxlen, config.sse_buffer_ttl);
            let llm = build_llm(&llm_settings(&config));
            let state = AppState::new(config, store, bus, llm);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("parsing listen address")?;
            serve(state, addr).await
        }
        Command::Seed {
            state_dir,
            schema_path,
        } => {
            let config = AppConfig::from_env();
            let store = Store::open(PathBuf::from(state_dir).join("state"))
                .await
                .context("opening store")?;
            let schema = match schema_path {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading schema file {path}"))?;
                    serde_json::from_str(&raw).context("parsing schema file")?
                }
                None => default_schema(),
            };
            let channel = config.schema_channel.clone();
            store
                .transact(move |t| {
                    let def = flowloom_types::SchemaDefinition::new(
                        "pipeline-core",
                        "1.0.0",
                        schema,
                    );
                    let def_id = def.id.clone();
                    t.insert_schema_def(def)?;
                    t.upsert_channel(flowloom_types::SchemaChannel::new(channel, def_id))
                })
                .await
                .map_err(|err| anyhow::anyhow!(err))?;
            println!("Seed OK");
            Ok(())
        }
    }
}
