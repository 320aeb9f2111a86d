use std::collections::HashMap;

use jsonschema::error::ValidationErrorKind;
use serde_json::Value;

use flowloom_types::{Issue, IssueSeverity, SchemaDefinition};

use crate::errors::{CoreError, CoreResult};
use crate::store::Tables;

/// Validates pipeline documents against the active schema definition plus
/// domain rules, classifying findings by severity.
#[derive(Debug, Clone)]
pub struct Validator {
    channel: String,
}

fn severity_for(code: &str) -> IssueSeverity {
    match code {
        "required" | "type" | "enum" | "duplicate_id" => IssueSeverity::Error,
        _ => IssueSeverity::Warning,
    }
}

impl Validator {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    /// Resolves the schema definition the configured channel points at.
    pub fn active_schema<'t>(&self, t: &'t Tables) -> CoreResult<&'t SchemaDefinition> {
        let channel = t.channel_by_name(&self.channel).ok_or_else(|| {
            CoreError::SchemaChannelMissing(format!(
                "No schema channel named '{}' is configured",
                self.channel
            ))
        })?;
        t.schema_def(&channel.active_schema_def_id)
    }

    pub fn validate(&self, t: &Tables, pipeline: &Value) -> CoreResult<Vec<Issue>> {
        let schema_def = self.active_schema(t)?;
        let compiled = jsonschema::validator_for(&schema_def.json)
            .map_err(|err| CoreError::internal(format!("schema compile failed: {err}")))?;

        let mut issues = Vec::new();
        for error in compiled.iter_errors(pipeline) {
            let base_path = error.instance_path().to_string();
            let (code, path) = match &error.kind() {
                ValidationErrorKind::Required { property } => {
                    // The missing property is named in the path, not just the
                    // object that lacks it.
                    let name = property.as_str().unwrap_or_default();
                    ("required", format!("{base_path}/{name}"))
                }
                ValidationErrorKind::Type { .. } => ("type", normalize_path(base_path)),
                ValidationErrorKind::Enum { .. } => ("enum", normalize_path(base_path)),
                _ => ("schema", normalize_path(base_path)),
            };
            issues.push(Issue {
                path,
                code: code.to_string(),
                severity: severity_for(code),
                message: error.to_string(),
            });
        }

        issues.extend(duplicate_stage_names(pipeline));
        Ok(issues)
    }
}

fn normalize_path(path: String) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path
    }
}

/// Domain rule: stage names within `stages[]` must be unique.
fn duplicate_stage_names(pipeline: &Value) -> Vec<Issue> {
    let mut issues = Vec::new();
    let Some(stages) = pipeline.get("stages").and_then(Value::as_array) else {
        return issues;
    };
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for stage in stages {
        if let Some(name) = stage.get("name").and_then(Value::as_str) {
            *seen.entry(name).or_default() += 1;
        }
    }
    let mut duplicates: Vec<&str> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect();
    duplicates.sort_unstable();
    for name in duplicates {
        issues.push(Issue {
            path: "/stages".to_string(),
            code: "duplicate_id".to_string(),
            severity: IssueSeverity::Error,
            message: format!("Duplicate stage name: {name}"),
        });
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_types::{SchemaChannel, SchemaDefinition};
    use serde_json::json;

    fn pipeline_schema() -> Value {
        json!({
            "type": "object",
            "required": ["name", "stages"],
            "properties": {
                "name": {"type": "string"},
                "stages": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "type"],
                        "properties": {
                            "name": {"type": "string"},
                            "type": {"type": "string", "enum": ["source", "map", "sink"]}
                        }
                    }
                }
            }
        })
    }

    fn tables_with_schema() -> Tables {
        let mut t = Tables::default();
        let def = SchemaDefinition::new("pipeline", "1.0.0", pipeline_schema());
        let def_id = def.id.clone();
        t.schema_defs.insert(def_id.clone(), def);
        let channel = SchemaChannel::new("stable", def_id);
        t.schema_channels.insert(channel.id.clone(), channel);
        t
    }

    #[test]
    fn missing_required_fields_name_the_property_in_the_path() {
        let t = tables_with_schema();
        let v = Validator::new("stable");
        let issues = v
            .validate(&t, &json!({"stages": [{"type": "source"}]}))
            .unwrap();
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"/name"));
        assert!(paths.contains(&"/stages/0/name"));
        assert!(issues
            .iter()
            .all(|i| i.code != "required" || i.severity == IssueSeverity::Error));
    }

    #[test]
    fn enum_violations_are_errors() {
        let t = tables_with_schema();
        let v = Validator::new("stable");
        let issues = v
            .validate(
                &t,
                &json!({"name": "p", "stages": [{"name": "a", "type": "teleport"}]}),
            )
            .unwrap();
        let enum_issue = issues.iter().find(|i| i.code == "enum").unwrap();
        assert_eq!(enum_issue.severity, IssueSeverity::Error);
        assert_eq!(enum_issue.path, "/stages/0/type");
    }

    #[test]
    fn duplicate_stage_names_flagged_at_stages() {
        let t = tables_with_schema();
        let v = Validator::new("stable");
        let issues = v
            .validate(
                &t,
                &json!({"name": "p", "stages": [
                    {"name": "load", "type": "source"},
                    {"name": "load", "type": "sink"}
                ]}),
            )
            .unwrap();
        let dup = issues.iter().find(|i| i.code == "duplicate_id").unwrap();
        assert_eq!(dup.path, "/stages");
        assert!(dup.message.contains("load"));
    }

    #[test]
    fn valid_pipeline_yields_no_issues() {
        let t = tables_with_schema();
        let v = Validator::new("stable");
        let issues = v
            .validate(
                &t,
                &json!({"name": "p", "stages": [{"name": "load", "type": "source"}]}),
            )
            .unwrap();
        assert!(issues.is_empty());
    }

    #[test]
    fn missing_channel_is_a_service_error() {
        let t = Tables::default();
        let v = Validator::new("stable");
        let err = v.validate(&t, &json!({})).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_CHANNEL_MISSING");
    }
}
