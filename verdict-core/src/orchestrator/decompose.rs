//! Phase 0: split a broad query into sub-research tasks.

use super::{Orchestrator, prompts};
use crate::error::{Result, TaskError};
use crate::inference::extract_json;
use crate::tasks::{NewTask, TaskCategory, TaskMetadata, TaskPriority};
use serde_json::{Map, Value};
use tracing::{info, warn};

const REQUIRED_FIELDS: [&str; 6] = ["id", "title", "query", "category", "priority", "rationale"];

/// Tasks accepted from a decomposition response.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub tasks: Vec<NewTask>,
    pub rationale: Option<String>,
}

fn string_field(task: &Map<String, Value>, key: &str) -> Option<String> {
    task.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_task(index: usize, value: &Value) -> Option<NewTask> {
    let Some(task) = value.as_object() else {
        warn!(index, "Decomposed task is not an object; skipping");
        return None;
    };
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|key| string_field(task, key).is_none())
        .collect();
    if !missing.is_empty() {
        warn!(index, missing = ?missing, "Decomposed task is missing fields; skipping");
        return None;
    }

    let field = |key: &str| string_field(task, key).unwrap_or_default();
    let extra: Map<String, Value> = task
        .iter()
        .filter(|(k, _)| !REQUIRED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Some(NewTask {
        id: Some(field("id")),
        query: field("query"),
        metadata: TaskMetadata {
            title: field("title"),
            category: TaskCategory::normalize(&field("category")),
            priority: TaskPriority::normalize(&field("priority")),
            rationale: field("rationale"),
            extra,
        },
    })
}

/// Validate a decomposition response. Fails only when no task is usable.
pub fn parse_decomposition(value: &Value) -> std::result::Result<Decomposition, TaskError> {
    let (items, rationale) = match value {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(map) => (
            map.get("tasks")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            string_field(map, "rationale"),
        ),
        _ => (&[][..], None),
    };
    let tasks: Vec<NewTask> = items
        .iter()
        .enumerate()
        .filter_map(|(i, v)| parse_task(i, v))
        .collect();
    if tasks.is_empty() {
        return Err(TaskError::DecompositionEmpty);
    }
    Ok(Decomposition { tasks, rationale })
}

impl Orchestrator {
    /// Ask the model to split `query` into narrower tasks.
    pub async fn decompose(&self, query: &str) -> Result<Decomposition> {
        let inference = &self.config.inference;
        let response = self
            .call_with_attempts(
                "decompose",
                &prompts::decomposition(query),
                inference.call_timeout(),
                inference.planning_attempts,
            )
            .await?;
        let decomposition = parse_decomposition(&extract_json(&response.content))?;
        info!(query, tasks = decomposition.tasks.len(), "Query decomposed");
        Ok(decomposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{config, orchestrator};
    use crate::inference::ScriptedGateway;
    use crate::search::ScriptedSearchBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn task(id: &str) -> Value {
        json!({
            "id": id,
            "title": "Elemente constitutive",
            "query": "elementele furtului calificat",
            "category": "case_law",
            "priority": "urgent",
            "rationale": "baseline",
            "depends_on": []
        })
    }

    #[test]
    fn test_invalid_tasks_are_dropped_and_enums_normalized() {
        let mut incomplete = task("t2");
        incomplete.as_object_mut().unwrap().remove("query");
        let mut odd = task("t3");
        odd["category"] = json!("astrology");
        odd["priority"] = json!("someday");

        let parsed = parse_decomposition(&json!({
            "rationale": "split by theme",
            "tasks": [task("t1"), incomplete, odd, "not a task"]
        }))
        .unwrap();

        assert_eq!(parsed.rationale.as_deref(), Some("split by theme"));
        let ids: Vec<_> = parsed.tasks.iter().map(|t| t.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["t1", "t3"]);
        assert_eq!(parsed.tasks[0].metadata.category, TaskCategory::Jurisprudence);
        assert_eq!(parsed.tasks[0].metadata.priority, TaskPriority::High);
        assert_eq!(parsed.tasks[1].metadata.category, TaskCategory::General);
        assert_eq!(parsed.tasks[1].metadata.priority, TaskPriority::Medium);
        assert!(parsed.tasks[0].metadata.extra.contains_key("depends_on"));
    }

    #[test]
    fn test_zero_valid_tasks_fails() {
        let err = parse_decomposition(&json!({"tasks": [{"id": "x"}]})).unwrap_err();
        assert!(matches!(err, TaskError::DecompositionEmpty));
        assert!(parse_decomposition(&json!("prose")).is_err());
    }

    #[tokio::test]
    async fn test_decompose_accepts_bare_array() {
        let body = json!([task("a"), task("b")]).to_string();
        let gateway = Arc::new(ScriptedGateway::new().with_response(format!("```json\n{body}\n```")));
        let orch = orchestrator(config(50), gateway, ScriptedSearchBackend::new());
        let decomposition = orch.decompose("furt calificat").await.unwrap();
        assert_eq!(decomposition.tasks.len(), 2);
        assert_eq!(decomposition.rationale, None);
    }
}
