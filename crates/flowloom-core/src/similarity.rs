use std::collections::HashSet;

use serde_json::Value;

use flowloom_types::Suggestion;

use crate::canonical::{content_hash, to_canonical_json};
use crate::store::Tables;

/// Longest request text considered for fuzzy matching.
const QUERY_TEXT_MAX: usize = 4000;

/// Finds an existing pipeline that matches an incoming request, first by
/// exact canonical hash, then by trigram similarity over the canonical text
/// projection. Both strategies fall back to "no candidate".
#[derive(Debug, Clone)]
pub struct SimilarityMatcher {
    threshold: f64,
}

impl SimilarityMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn find_candidate(
        &self,
        t: &Tables,
        flow_id: &str,
        user_message: &Value,
    ) -> Option<Suggestion> {
        if let Some(candidate) = embedded_pipeline(user_message) {
            let hash = content_hash(candidate);
            if let Some(p) = t.pipeline_by_hash(flow_id, &hash) {
                return Some(Suggestion {
                    pipeline_id: p.id.clone(),
                    version: p.version.clone(),
                    score: 1.0,
                });
            }
        }

        let mut query_text = serde_json::to_string(user_message).ok()?;
        if query_text.is_empty() {
            return None;
        }
        if query_text.len() > QUERY_TEXT_MAX {
            let mut end = QUERY_TEXT_MAX;
            while !query_text.is_char_boundary(end) {
                end -= 1;
            }
            query_text.truncate(end);
        }
        let query_grams = trigrams(&query_text);
        if query_grams.is_empty() {
            return None;
        }

        let mut best: Option<(&str, &str, f64)> = None;
        for p in t.pipelines.values().filter(|p| p.flow_id == flow_id) {
            let candidate_text = to_canonical_json(&p.content);
            let score = jaccard(&query_grams, &trigrams(&candidate_text));
            if best.map_or(true, |(_, _, s)| score > s) {
                best = Some((&p.id, &p.version, score));
            }
        }
        let (id, version, score) = best?;
        if score < self.threshold {
            return None;
        }
        Some(Suggestion {
            pipeline_id: id.to_string(),
            version: version.to_string(),
            score: (score * 10_000.0).round() / 10_000.0,
        })
    }
}

/// A request may carry a complete candidate pipeline under a recognized key.
fn embedded_pipeline(user_message: &Value) -> Option<&Value> {
    for key in ["content", "pipeline"] {
        if let Some(value) = user_message.get(key) {
            if value.is_object() || value.is_array() {
                return Some(value);
            }
        }
    }
    None
}

/// Word-wise trigram set in the pg_trgm manner: lowercase, words padded with
/// two leading and one trailing space.
fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let mut grams = HashSet::new();
    let lowered = text.to_lowercase();
    for word in lowered.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let padded: Vec<char> = std::iter::repeat(' ')
            .take(2)
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();
        for window in padded.windows(3) {
            grams.insert([window[0], window[1], window[2]]);
        }
    }
    grams
}

fn jaccard(a: &HashSet<[char; 3]>, b: &HashSet<[char; 3]>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versioning::VersionManager;
    use flowloom_types::{Flow, SchemaChannel, SchemaDefinition};
    use serde_json::json;

    fn seeded_tables_with_pipeline(content: Value) -> (Tables, String, String) {
        let mut t = Tables::default();
        let flow = Flow::new("demo", "Demo");
        let flow_id = flow.id.clone();
        t.flows.insert(flow_id.clone(), flow);
        let def = SchemaDefinition::new("pipeline", "1.0.0", json!({"type": "object"}));
        let def_id = def.id.clone();
        t.schema_defs.insert(def_id.clone(), def);
        let channel = SchemaChannel::new("stable", def_id);
        t.schema_channels.insert(channel.id.clone(), channel);
        let vm = VersionManager::new("stable");
        let p = vm.create_version(&mut t, &flow_id, &content, true).unwrap();
        (t, flow_id, p.id)
    }

    #[test]
    fn exact_hash_match_scores_one() {
        let content = json!({"name": "p", "stages": [{"name": "load", "type": "source"}]});
        let (t, flow_id, pipeline_id) = seeded_tables_with_pipeline(content.clone());
        let matcher = SimilarityMatcher::new(0.75);
        let hit = matcher
            .find_candidate(&t, &flow_id, &json!({"content": content}))
            .unwrap();
        assert_eq!(hit.pipeline_id, pipeline_id);
        assert_eq!(hit.score, 1.0);
    }

    #[test]
    fn key_order_does_not_defeat_the_exact_match() {
        let content = json!({"name": "p", "stages": []});
        let (t, flow_id, pipeline_id) = seeded_tables_with_pipeline(content);
        let reordered = json!({"stages": [], "name": "p"});
        let matcher = SimilarityMatcher::new(0.75);
        let hit = matcher
            .find_candidate(&t, &flow_id, &json!({"pipeline": reordered}))
            .unwrap();
        assert_eq!(hit.pipeline_id, pipeline_id);
    }

    #[test]
    fn unrelated_text_yields_no_candidate() {
        let content = json!({"name": "p", "stages": [{"name": "load", "type": "source"}]});
        let (t, flow_id, _) = seeded_tables_with_pipeline(content);
        let matcher = SimilarityMatcher::new(0.75);
        let miss = matcher.find_candidate(
            &t,
            &flow_id,
            &json!({"text": "completely different topic entirely"}),
        );
        assert!(miss.is_none());
    }

    #[test]
    fn near_identical_text_passes_the_threshold() {
        let content = json!({"name": "orders-pipeline", "stages": [{"name": "load", "type": "source"}]});
        let (t, flow_id, pipeline_id) = seeded_tables_with_pipeline(content.clone());
        let matcher = SimilarityMatcher::new(0.5);
        // Same document embedded as free text rather than under a known key.
        let hit = matcher
            .find_candidate(&t, &flow_id, &json!({"text": content}))
            .unwrap();
        assert_eq!(hit.pipeline_id, pipeline_id);
        assert!(hit.score >= 0.5);
    }
}
