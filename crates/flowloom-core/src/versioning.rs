use chrono::Utc;
use serde_json::Value;

use flowloom_types::{generate_id, Pipeline, PipelineStatus, PublishResponse};

use crate::canonical::content_hash;
use crate::errors::{CoreError, CoreResult};
use crate::store::{Store, Tables};

/// Derives pipeline versions, deduplicates drafts by content hash, and
/// enforces publish exclusivity per flow.
#[derive(Debug, Clone)]
pub struct VersionManager {
    channel: String,
}

fn parse_semver(v: &str) -> Option<(u64, u64, u64)> {
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn bump_patch(v: &str) -> String {
    match parse_semver(v) {
        Some((a, b, c)) => format!("{a}.{b}.{}", c + 1),
        None => "1.0.1".to_string(),
    }
}

fn bump_major(v: &str) -> String {
    match parse_semver(v) {
        Some((a, _, _)) => format!("{}.0.0", a + 1),
        None => "2.0.0".to_string(),
    }
}

impl VersionManager {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    /// Creates a new draft for the flow. When `dedupe` is set (the default
    /// behavior for agent runs) and the flow already holds a pipeline with
    /// the same content hash, that existing row is returned unchanged.
    pub fn create_version(
        &self,
        t: &mut Tables,
        flow_id: &str,
        content: &Value,
        dedupe: bool,
    ) -> CoreResult<Pipeline> {
        t.flow(flow_id)?;
        let channel = t.channel_by_name(&self.channel).ok_or_else(|| {
            CoreError::SchemaChannelMissing(format!(
                "No schema channel named '{}' is configured",
                self.channel
            ))
        })?;
        let schema_def = t.schema_def(&channel.active_schema_def_id)?;
        let schema_def_id = schema_def.id.clone();
        let schema_version = schema_def.version.clone();

        let hash = content_hash(content);
        if dedupe {
            if let Some(existing) = t.pipeline_by_hash(flow_id, &hash) {
                return Ok(existing.clone());
            }
        }

        let version = match t.latest_pipeline_for_flow(flow_id) {
            None => "1.0.0".to_string(),
            Some(last) => {
                if last.schema_def_id.as_deref() != Some(schema_def_id.as_str()) {
                    bump_major(&last.version)
                } else {
                    bump_patch(&last.version)
                }
            }
        };

        let now = Utc::now();
        let pipeline = Pipeline {
            id: generate_id(),
            flow_id: flow_id.to_string(),
            version,
            schema_version,
            schema_def_id: Some(schema_def_id),
            status: PipelineStatus::Draft,
            is_published: false,
            content: content.clone(),
            content_hash: Some(hash),
            created_at: now,
            updated_at: now,
        };
        t.insert_pipeline(pipeline.clone())?;
        Ok(pipeline)
    }

    /// Publishes a pipeline, demoting any previously published sibling. After
    /// the transaction commits, the published set is re-read; if it is not
    /// exactly the target (a concurrent publish won), the caller gets a
    /// publish conflict.
    pub async fn publish(&self, store: &Store, pipeline_id: &str) -> CoreResult<PublishResponse> {
        let pipeline_id = pipeline_id.to_string();
        let target = pipeline_id.clone();
        let (flow_id, version) = store
            .transact(move |t| {
                let pipeline = t.pipeline(&target)?.clone();
                let now = Utc::now();
                let sibling_ids: Vec<String> = t
                    .pipelines
                    .values()
                    .filter(|p| p.flow_id == pipeline.flow_id && p.id != target && p.is_published)
                    .map(|p| p.id.clone())
                    .collect();
                for id in sibling_ids {
                    if let Some(row) = t.pipelines.get_mut(&id) {
                        row.is_published = false;
                        row.status = PipelineStatus::Draft;
                        row.updated_at = now;
                    }
                }
                let row = t
                    .pipelines
                    .get_mut(&target)
                    .ok_or_else(|| CoreError::not_found(format!("Pipeline {target} not found")))?;
                row.is_published = true;
                row.status = PipelineStatus::Published;
                row.updated_at = now;
                Ok((row.flow_id.clone(), row.version.clone()))
            })
            .await?;

        let published_ids: Vec<String> = store
            .read(|t| {
                t.pipelines
                    .values()
                    .filter(|p| p.flow_id == flow_id && p.is_published)
                    .map(|p| p.id.clone())
                    .collect()
            })
            .await;
        if published_ids.as_slice() != [pipeline_id.clone()] {
            return Err(CoreError::PublishConflict(format!(
                "Pipeline {pipeline_id} lost the published slot for flow {flow_id}"
            )));
        }

        Ok(PublishResponse {
            ok: true,
            flow_id,
            version,
            is_published: true,
        })
    }
}
