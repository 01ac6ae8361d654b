//! Wires the engine's components from configuration.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use verdict_core::{
    DurableTaskQueue, EngineConfig, FileStore, HttpGateway, InferenceGateway, LogNotifier,
    Notifier, Orchestrator, ScriptedGateway, SerializationQueue, SmtpNotifier,
    SqliteSearchBackend,
};

/// A running engine: the orchestrator, the task queue and the queue worker.
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub tasks: Arc<DurableTaskQueue>,
    worker: JoinHandle<()>,
}

impl Runtime {
    pub fn build(config: EngineConfig, workspace: &Path, dry_run: bool) -> anyhow::Result<Self> {
        let data_dir = config.storage.resolve_data_dir(workspace);
        std::fs::create_dir_all(&data_dir)?;
        debug!(data_dir = %data_dir.display(), "Using data directory");
        let store = Arc::new(FileStore::new(&data_dir));

        let database = database_path(&config, workspace);
        let backend = Arc::new(
            SqliteSearchBackend::open(&database)
                .map_err(|e| anyhow::anyhow!("Cannot open case store {}: {}", database.display(), e))?,
        );

        let gateway: Arc<dyn InferenceGateway> = if dry_run {
            Arc::new(dry_run_gateway())
        } else {
            Arc::new(
                HttpGateway::new(&config.inference)
                    .map_err(|e| anyhow::anyhow!("Inference gateway error: {}", e))?,
            )
        };

        let notifier: Arc<dyn Notifier> = match &config.notifications {
            Some(settings) => match SmtpNotifier::from_config(settings) {
                Ok(smtp) => Arc::new(smtp),
                Err(e) => {
                    warn!(error = %e, "SMTP notifications unavailable; logging instead");
                    Arc::new(LogNotifier)
                }
            },
            None => Arc::new(LogNotifier),
        };

        let queue = SerializationQueue::new(config.queue.clone());
        let worker = queue.spawn_worker();
        let tasks = Arc::new(DurableTaskQueue::new(
            store.clone(),
            config.storage.max_backups,
        ));
        let orchestrator =
            Orchestrator::new(config, gateway, backend, store, queue).with_notifier(notifier);

        Ok(Self {
            orchestrator,
            tasks,
            worker,
        })
    }

    /// Stop the queue worker and wait for it to exit.
    pub async fn shutdown(self) {
        self.orchestrator.queue().shutdown();
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Queue worker did not exit cleanly");
        }
    }
}

/// The case database path, relative paths resolved against the workspace.
pub fn database_path(config: &EngineConfig, workspace: &Path) -> PathBuf {
    let path = &config.search.database_path;
    if path.is_absolute() {
        path.clone()
    } else {
        workspace.join(path)
    }
}

/// The research question embedded in one of the engine's prompts.
fn question_in(prompt: &str) -> &str {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Research question: "))
        .unwrap_or("")
        .trim()
}

/// Canned answers for every inference phase, so the pipeline can run offline.
pub fn dry_run_gateway() -> ScriptedGateway {
    ScriptedGateway::new().with_responder(|label, prompt| {
        let question = question_in(prompt);
        let body = match label {
            "decompose" => json!({
                "rationale": "Dry run: one task per angle of the question.",
                "tasks": [
                    {
                        "id": "jurisprudence",
                        "title": "Court practice",
                        "query": question,
                        "category": "jurisprudence",
                        "priority": "high",
                        "rationale": "How courts decide the question"
                    },
                    {
                        "id": "procedure",
                        "title": "Procedural aspects",
                        "query": question,
                        "category": "procedure",
                        "priority": "low",
                        "rationale": "Procedural issues raised by the same cases"
                    }
                ]
            }),
            "strategy" => json!({
                "strategy_type": "sql_standard",
                "rationale": "Dry run: keyword filtering on the question text",
                "selected_columns": ["title", "court", "decision_date", "summary"]
            }),
            "preview" => json!({"relevant": true, "note": "dry run"}),
            "chunk" => json!({"findings": [], "themes": ["dry run"]}),
            "synthesis" => json!({
                "summary": format!("Dry-run analysis of: {question}"),
                "key_findings": [],
                "trends": [],
                "open_issues": []
            }),
            "final_report" => json!({
                "title": format!("Dry run: {question}"),
                "table_of_contents": ["Findings"],
                "introduction": "Generated without an inference service.",
                "chapters": [{"title": "Findings", "content": "No analysis was performed."}],
                "conclusions": "None.",
                "bibliography": {"jurisprudence": []}
            }),
            _ => json!({}),
        };
        Ok(body.to_string())
    })
}
