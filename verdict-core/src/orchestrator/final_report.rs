//! Phase 4: one report across every completed task.

use super::report::Report;
use super::{Orchestrator, prompts};
use crate::error::{InferenceError, Result};
use crate::inference::json_repair::try_extract_json;
use crate::search::CaseId;
use crate::tasks::{DurableTaskQueue, Task, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// The outcome of final report synthesis. `success` is always true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub success: bool,
    pub report: Report,
    /// Attempts made before a report was accepted or the fallback was built.
    pub attempts: u32,
    pub fallback_used: bool,
}

/// Case ids produced by completed tasks, first occurrence first.
pub fn known_case_ids(tasks: &[Task]) -> Vec<CaseId> {
    let mut seen = HashSet::new();
    tasks
        .iter()
        .filter(|t| t.state == TaskState::Completed)
        .filter_map(|t| t.result.as_ref())
        .flat_map(|r| r.bibliography.iter().copied())
        .filter(|id| seen.insert(*id))
        .collect()
}

impl Orchestrator {
    /// Phase 4: synthesize the final report, falling back to a deterministic one.
    ///
    /// Attempts after the first are preceded by the configured cooldown and
    /// carry a correction note. The bibliography is restricted to case ids
    /// the completed tasks actually produced.
    pub async fn synthesize_final_report(&self, query: &str, tasks: &[Task]) -> FinalReport {
        let completed: Vec<Task> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed && t.result.is_some())
            .cloned()
            .collect();
        let known_ids = known_case_ids(&completed);
        let known: HashSet<CaseId> = known_ids.iter().copied().collect();
        let synthesis = &self.config.synthesis;
        let attempts = synthesis.max_retries.max(1);
        let mut last_response: Option<String> = None;

        for attempt in 1..=attempts {
            let delay = synthesis.cooldown.delay_before(attempt);
            if !delay.is_zero() {
                info!(attempt, delay_secs = delay.as_secs(), "Cooling down before retry");
                tokio::time::sleep(delay).await;
            }

            let prompt = prompts::final_report(query, &completed, attempt > 1);
            let response = match self
                .gateway
                .call(&prompt, self.config.inference.synthesis_timeout(), "final_report")
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, "Final report call failed");
                    continue;
                }
            };
            let parsed = try_extract_json(&response.content)
                .and_then(|value| Report::from_wire(value, completed.len()));
            last_response = Some(response.content);

            match parsed {
                Ok(mut report) => {
                    report.retain_known_citations(&known);
                    info!(
                        attempt,
                        cases_cited = report.bibliography.total_cases_cited,
                        words = report.metadata.word_count_estimate,
                        "Final report accepted"
                    );
                    return FinalReport {
                        success: true,
                        report,
                        attempts: attempt,
                        fallback_used: false,
                    };
                }
                Err(e @ InferenceError::SchemaValidation { .. }) => {
                    warn!(attempt, error = %e, "Final report is missing sections");
                }
                Err(e) => warn!(attempt, error = %e, "Final report is not structured"),
            }
        }

        warn!(attempts, "Building fallback report from raw text");
        FinalReport {
            success: true,
            report: Report::fallback(query, last_response.as_deref(), &known_ids, completed.len()),
            attempts,
            fallback_used: true,
        }
    }

    /// Validate the task queue, then run phase 4 over it.
    pub async fn generate_report(&self, tasks: &DurableTaskQueue) -> Result<FinalReport> {
        tasks.validate_for_report_generation()?;
        let document = tasks.load_document()?;
        let query = document.queue_metadata.original_query.unwrap_or_default();
        Ok(self.synthesize_final_report(&query, &document.tasks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownPolicy;
    use crate::inference::ScriptedGateway;
    use crate::orchestrator::PlanOutcome;
    use crate::orchestrator::testing::{config, orchestrator};
    use crate::search::ScriptedSearchBackend;
    use crate::tasks::TaskMetadata;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn completed_task(id: &str, ids: Vec<CaseId>) -> Task {
        let mut task = Task::new(id, "furt", TaskMetadata::default());
        task.state = TaskState::Completed;
        task.result = Some(PlanOutcome {
            plan_id: Uuid::new_v4(),
            query: "furt".into(),
            synthesis: json!({"summary": "s"}),
            total_chunks: 1,
            chunks_completed: 1,
            missing_chunks: vec![],
            filtered_citations: 0,
            bibliography: ids,
        });
        task
    }

    fn valid_report() -> String {
        json!({
            "dissertation": {
                "title": "Furtul calificat",
                "introduction": "Intro.",
                "chapters": [{"title": "I", "content": "Analiza."}],
                "conclusions": "Concluzii.",
                "bibliography": {"jurisprudence": [{"case_id": 1}, {"case_id": 555}]}
            },
            "visual_tasks": []
        })
        .to_string()
    }

    #[test]
    fn test_known_ids_only_from_completed() {
        let mut failed = completed_task("b", vec![9]);
        failed.state = TaskState::Failed;
        let tasks = vec![completed_task("a", vec![1, 2]), failed, completed_task("c", vec![2, 3])];
        assert_eq!(known_case_ids(&tasks), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_second_attempt_carries_correction() {
        let gateway = Arc::new(
            ScriptedGateway::new()
                .with_response("Here is a lovely essay instead of JSON.")
                .with_response(valid_report()),
        );
        let orch = orchestrator(config(50), gateway.clone(), ScriptedSearchBackend::new());
        let result = orch
            .synthesize_final_report("furt calificat", &[completed_task("a", vec![1, 2])])
            .await;

        assert!(!result.fallback_used);
        assert_eq!(result.attempts, 2);
        let cited: Vec<CaseId> = result.report.bibliography.jurisprudence.iter().map(|c| c.case_id).collect();
        assert_eq!(cited, vec![1]);
        let calls = gateway.calls();
        assert!(!calls[0].prompt.contains("CORRECTION"));
        assert!(calls[1].prompt.contains("CORRECTION"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prose_falls_back_after_cooldowns() {
        let gateway = Arc::new(ScriptedGateway::new().with_default("Doar proză, fără JSON."));
        let mut cfg = config(50);
        cfg.synthesis.cooldown = CooldownPolicy::Fixed { secs: 30 };
        let orch = orchestrator(cfg, gateway.clone(), ScriptedSearchBackend::new());

        let started = tokio::time::Instant::now();
        let tasks = [completed_task("a", vec![4, 5]), completed_task("b", vec![5, 6])];
        let result = orch.synthesize_final_report("furt calificat", &tasks).await;

        assert!(result.success);
        assert!(result.fallback_used);
        assert!(result.report.is_fallback());
        assert_eq!(result.report.bibliography.total_cases_cited, 3);
        assert_eq!(result.report.chapters[0].content, "Doar proză, fără JSON.");
        assert_eq!(gateway.call_count("final_report"), 3);
        assert!(started.elapsed() >= std::time::Duration::from_secs(60));
    }
}
