//! Phase 3: reduce a plan's chunk results, and the execute entry point.

use super::report::case_id_of;
use super::{Orchestrator, PlanOutcome, prompts};
use crate::error::{PersistenceError, Result};
use crate::inference::extract_json;
use crate::notify::{Notification, notify_quietly};
use crate::plan::PlanStatus;
use crate::search::CaseId;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Union of the referenced ids of every chunk, in chunk order, without duplicates.
pub fn union_bibliography<'a>(chunks: impl IntoIterator<Item = &'a [CaseId]>) -> Vec<CaseId> {
    let mut seen = HashSet::new();
    chunks
        .into_iter()
        .flatten()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Case ids the model cites in its own synthesis, wherever it put them.
fn cited_ids(synthesis: &Value) -> Vec<CaseId> {
    let mut ids = Vec::new();
    for key in ["bibliography", "cited_case_ids", "case_ids"] {
        let entries = match synthesis.get(key) {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Object(map)) => map
                .get("jurisprudence")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            _ => continue,
        };
        for entry in entries {
            let id = match entry {
                Value::Object(map) => map.get("case_id").or_else(|| map.get("id")).and_then(case_id_of),
                other => case_id_of(other),
            };
            ids.extend(id);
        }
    }
    ids
}

/// Replace the synthesis bibliography with `bibliography`.
///
/// Returns how many distinct ids the model cited that are not in it.
pub fn enforce_bibliography(synthesis: &mut Value, bibliography: &[CaseId]) -> usize {
    let known: HashSet<CaseId> = bibliography.iter().copied().collect();
    let unknown: HashSet<CaseId> = cited_ids(synthesis)
        .into_iter()
        .filter(|id| !known.contains(id))
        .collect();

    if !synthesis.is_object() {
        let original = std::mem::take(synthesis);
        let mut map = Map::new();
        map.insert("findings".to_string(), original);
        *synthesis = Value::Object(map);
    }
    if let Value::Object(map) = synthesis {
        map.insert(
            "bibliography".to_string(),
            json!({
                "jurisprudence": bibliography,
                "total_cases_cited": bibliography.len(),
            }),
        );
    }
    unknown.len()
}

impl Orchestrator {
    /// Phase 3: synthesize whatever chunk results exist.
    ///
    /// Missing chunks are reported, not waited for. The bibliography comes
    /// from the chunks, never from the synthesis text.
    pub async fn synthesize_plan(&self, plan_id: &Uuid) -> Result<PlanOutcome> {
        let plan = self.plans.load(plan_id)?;
        let results = self.plans.chunk_results(plan_id)?;
        if results.is_empty() {
            return Err(PersistenceError::NotFound {
                kind: "chunk results".to_string(),
                id: plan_id.to_string(),
            }
            .into());
        }

        let present: HashSet<usize> = results.iter().map(|r| r.chunk_index).collect();
        let missing_chunks: Vec<usize> = (0..plan.total_chunks)
            .filter(|i| !present.contains(i))
            .collect();
        if !missing_chunks.is_empty() {
            warn!(plan_id = %plan_id, missing = ?missing_chunks, "Synthesizing with missing chunks");
        }

        let extractions = Value::Array(
            results
                .iter()
                .map(|r| {
                    json!({
                        "chunk_index": r.chunk_index,
                        "case_ids": r.referenced_case_ids,
                        "extraction": r.extraction,
                    })
                })
                .collect(),
        );
        let prompt = prompts::synthesis(&plan.user_query, &extractions, &missing_chunks);
        let inference = &self.config.inference;
        let response = self
            .call_with_attempts(
                "synthesis",
                &prompt,
                inference.synthesis_timeout(),
                inference.planning_attempts,
            )
            .await?;

        let bibliography =
            union_bibliography(results.iter().map(|r| r.referenced_case_ids.as_slice()));
        let mut synthesis = extract_json(&response.content);
        let filtered_citations = enforce_bibliography(&mut synthesis, &bibliography);
        if filtered_citations > 0 {
            warn!(
                plan_id = %plan_id,
                filtered = filtered_citations,
                "Synthesis cited cases no chunk referenced"
            );
        }
        self.plans.save_synthesis(plan_id, &synthesis)?;

        info!(
            plan_id = %plan_id,
            cases_cited = bibliography.len(),
            chunks = results.len(),
            "Plan synthesized"
        );
        Ok(PlanOutcome {
            plan_id: *plan_id,
            query: plan.user_query,
            synthesis,
            bibliography,
            chunks_completed: results.len(),
            total_chunks: plan.total_chunks,
            missing_chunks,
            filtered_citations,
        })
    }

    /// Phases 2 and 3 with plan status tracking and notifications.
    ///
    /// `notification_email` overrides the address stored on the plan.
    pub async fn execute(
        &self,
        plan_id: &Uuid,
        notification_email: Option<String>,
    ) -> Result<PlanOutcome> {
        let plan = self.plans.set_status(plan_id, PlanStatus::Executing, None)?;
        let email = notification_email.or(plan.notification_email);

        let outcome = match self.execute_plan(plan_id).await {
            Ok(_) => self.synthesize_plan(plan_id).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                self.plans.set_status(plan_id, PlanStatus::Completed, None)?;
                if let Some(to) = email.as_deref() {
                    let body = format!(
                        "{} of {} chunks analyzed, {} cases cited.",
                        outcome.chunks_completed,
                        outcome.total_chunks,
                        outcome.bibliography.len()
                    );
                    notify_quietly(
                        self.notifier.as_ref(),
                        Notification::completed(to, &plan.user_query, body),
                    )
                    .await;
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(plan_id = %plan_id, error = %e, "Plan execution failed");
                if let Err(status_err) =
                    self.plans
                        .set_status(plan_id, PlanStatus::Failed, Some(e.to_string()))
                {
                    warn!(plan_id = %plan_id, error = %status_err, "Could not record plan failure");
                }
                if let Some(to) = email.as_deref() {
                    notify_quietly(
                        self.notifier.as_ref(),
                        Notification::failed(to, &plan.user_query, &e.to_string()),
                    )
                    .await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::inference::ScriptedGateway;
    use crate::notify::{NotificationKind, Notifier};
    use crate::orchestrator::testing::{config, orchestrator};
    use crate::search::ScriptedSearchBackend;
    use crate::strategy::{StrategyDescriptor, StrategyType};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, n: &Notification) -> std::result::Result<(), NotifyError> {
            self.0.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    #[test]
    fn test_union_bibliography_dedups_in_order() {
        let a = [3, 1];
        let b = [1, 4];
        assert_eq!(union_bibliography([&a[..], &b[..]]), vec![3, 1, 4]);
    }

    #[test]
    fn test_enforce_bibliography_counts_unknown() {
        let mut synthesis = json!({
            "summary": "see case 999",
            "bibliography": [1, {"case_id": 999}, "1000"]
        });
        let filtered = enforce_bibliography(&mut synthesis, &[1, 2]);
        assert_eq!(filtered, 2);
        assert_eq!(synthesis["bibliography"]["jurisprudence"], json!([1, 2]));
        assert_eq!(synthesis["bibliography"]["total_cases_cited"], json!(2));

        let mut list = json!(["a", "b"]);
        enforce_bibliography(&mut list, &[]);
        assert_eq!(list["findings"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_execute_completes_and_notifies() {
        let gateway = Arc::new(ScriptedGateway::new().with_responder(|label, _| {
            Ok(match label {
                "chunk" => r#"{"referenced_case_ids": [2]}"#.to_string(),
                _ => r#"{"summary": "cases 2 and 77", "cited_case_ids": [2, 77]}"#.to_string(),
            })
        }));
        let recorder = Arc::new(Recording::default());
        let orch = orchestrator(config(50), gateway, ScriptedSearchBackend::new())
            .with_notifier(recorder.clone());
        let plan = orch
            .plans()
            .create(
                "furt",
                StrategyDescriptor::new(StrategyType::ProSearch),
                3,
                &[1, 2, 3],
                50,
                Some("avocat@example.ro".into()),
            )
            .unwrap();

        let outcome = orch.execute(&plan.plan_id, None).await.unwrap();
        assert_eq!(outcome.bibliography, vec![2]);
        assert_eq!(outcome.filtered_citations, 1);
        assert_eq!(orch.plans().load(&plan.plan_id).unwrap().status, PlanStatus::Completed);
        let stored = orch.plans().load_synthesis(&plan.plan_id).unwrap().unwrap();
        assert_eq!(stored["bibliography"]["jurisprudence"], json!([2]));

        let sent = recorder.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Completed);
        assert_eq!(sent[0].to, "avocat@example.ro");
    }

    #[tokio::test]
    async fn test_execute_without_results_fails_plan() {
        let gateway = Arc::new(ScriptedGateway::new());
        let recorder = Arc::new(Recording::default());
        let orch = orchestrator(config(50), gateway, ScriptedSearchBackend::new())
            .with_notifier(recorder.clone());
        let plan = orch
            .plans()
            .create("furt", StrategyDescriptor::new(StrategyType::ProSearch), 1, &[1], 50, None)
            .unwrap();

        let err = orch
            .execute(&plan.plan_id, Some("avocat@example.ro".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chunk results"));
        let stored = orch.plans().load(&plan.plan_id).unwrap();
        assert_eq!(stored.status, PlanStatus::Failed);
        assert!(stored.error.is_some());
        assert_eq!(recorder.0.lock().unwrap()[0].kind, NotificationKind::Failed);
    }
}
