//! Phase 1: turn a query into a persisted, chunked plan.

use super::{Orchestrator, prompts};
use crate::error::{DiscoveryError, InferenceError, Result};
use crate::inference::json_repair::try_extract_json;
use crate::plan::Plan;
use crate::search::{CASE_COLUMNS, CaseId};
use crate::strategy::{
    Discovery, MultiStrategyMode, StrategyDescriptor, StrategyType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What plan creation reports back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningOutcome {
    pub plan_id: Uuid,
    pub total_cases: usize,
    pub total_chunks: usize,
    pub strategy_type: StrategyType,
    pub strategies_used: Vec<StrategyType>,
    pub strategy_breakdown: BTreeMap<String, usize>,
    /// `(total_chunks + 1) * 60`; a heuristic, not a measurement.
    pub eta_seconds: u64,
    /// Whether the preview call over the first few cases succeeded.
    pub preview_verified: bool,
}

/// Estimated execution time: one minute per chunk plus one for synthesis.
pub fn eta_seconds(total_chunks: usize) -> u64 {
    (total_chunks as u64 + 1) * 60
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum Terms {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct WireStrategy {
    #[serde(alias = "strategy", alias = "type")]
    strategy_type: String,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    selected_columns: Vec<String>,
    #[serde(default)]
    where_clause: Option<String>,
    #[serde(default)]
    search_terms: Terms,
    #[serde(default)]
    semantic_query: Option<String>,
    #[serde(default)]
    primary_strategy: Option<String>,
    #[serde(default)]
    filter_clause: Option<String>,
    #[serde(default)]
    count_query: Option<String>,
    #[serde(default)]
    id_list_query: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Read a strategy proposal. Unknown columns are dropped; an unknown type is an error.
pub fn parse_strategy(value: Value) -> std::result::Result<StrategyDescriptor, InferenceError> {
    let wire: WireStrategy =
        serde_json::from_value(value).map_err(|e| InferenceError::ResponseParse {
            message: format!("strategy: {e}"),
        })?;
    let strategy_type =
        StrategyType::parse(&wire.strategy_type).ok_or_else(|| InferenceError::ResponseParse {
            message: format!("unknown strategy type '{}'", wire.strategy_type),
        })?;

    let mut descriptor = StrategyDescriptor::new(strategy_type);
    descriptor.rationale = wire.rationale.unwrap_or_default();
    descriptor.selected_columns = wire
        .selected_columns
        .into_iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| CASE_COLUMNS.contains(&c.as_str()))
        .collect();
    descriptor.where_clause = non_blank(wire.where_clause);
    descriptor.search_terms = match wire.search_terms {
        Terms::None => Vec::new(),
        Terms::One(term) => vec![term],
        Terms::Many(terms) => terms,
    };
    descriptor.semantic_query = non_blank(wire.semantic_query);
    descriptor.primary_strategy = wire.primary_strategy.as_deref().and_then(StrategyType::parse);
    descriptor.filter_clause = non_blank(wire.filter_clause);
    descriptor.count_query = non_blank(wire.count_query);
    descriptor.id_list_query = non_blank(wire.id_list_query);
    Ok(descriptor)
}

impl Orchestrator {
    /// Ask the model for a strategy, retrying bad or failed answers.
    async fn propose_strategy(&self, query: &str) -> Result<StrategyDescriptor> {
        let inference = &self.config.inference;
        let attempts = inference.planning_attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=attempts {
            let prompt = prompts::strategy(query, attempt, last_error.as_deref());
            let proposal = match self
                .gateway
                .call(&prompt, inference.call_timeout(), "strategy")
                .await
            {
                Ok(response) => try_extract_json(&response.content).and_then(parse_strategy),
                Err(e) => Err(e),
            };
            match proposal {
                Ok(descriptor) => {
                    info!(query, attempt, strategy = %descriptor.strategy_type, "Strategy proposed");
                    return Ok(descriptor);
                }
                Err(e) => {
                    warn!(query, attempt, error = %e, "Strategy proposal rejected");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(InferenceError::AttemptsExhausted {
            phase: "planning".to_string(),
            attempts,
            last_error: last_error.unwrap_or_default(),
        }
        .into())
    }

    /// Run discovery for a proposed strategy, expanding and falling back as needed.
    ///
    /// Returns the descriptor the plan is built from and the ranked ids.
    pub async fn resolve_candidates(
        &self,
        query: &str,
        proposed: StrategyDescriptor,
    ) -> Result<(StrategyDescriptor, Vec<CaseId>)> {
        let engine = &self.engine;
        let columns = proposed.selected_columns.clone();

        let mut descriptor = if proposed.strategy_type == StrategyType::Exhaustive {
            let outcome = engine
                .execute_multi_strategy(query, &proposed, &[], MultiStrategyMode::Exhaustive)
                .await;
            let mut resolved = outcome.into_descriptor(proposed.rationale);
            resolved.selected_columns = columns.clone();
            resolved
        } else {
            engine.builder().enrich(query, proposed)
        };

        let discovery = match engine.discover(query, &descriptor).await {
            Ok(found) => found,
            Err(e @ DiscoveryError::NoRunnableStrategy { .. }) => return Err(e.into()),
            Err(e) => {
                warn!(query, strategy = %descriptor.strategy_type, error = %e, "Primary strategy failed");
                Discovery {
                    count: 0,
                    ids: Vec::new(),
                }
            }
        };
        let threshold = self.config.discovery.min_results_threshold;
        let mut ids = discovery.ids;
        if descriptor.strategies_used.is_empty() {
            descriptor.strategies_used = vec![descriptor.strategy_type];
            descriptor
                .strategy_breakdown
                .insert(descriptor.strategy_type.to_string(), ids.len());
        }

        if !descriptor.is_precomputed() && discovery.count < threshold {
            info!(
                query,
                count = discovery.count,
                threshold,
                "Primary strategy under threshold, expanding"
            );
            let outcome = engine
                .execute_multi_strategy(query, &descriptor, &ids, MultiStrategyMode::AutoExpand)
                .await;
            outcome.apply_to(&mut descriptor);
            ids = outcome.ids;
        }

        if ids.is_empty() {
            match engine.fallback(query).await {
                Ok(Some((mut fallback, found))) if !found.ids.is_empty() => {
                    fallback.selected_columns = columns;
                    fallback.strategies_used = vec![StrategyType::Fallback];
                    fallback
                        .strategy_breakdown
                        .insert(StrategyType::Fallback.to_string(), found.ids.len());
                    descriptor = fallback;
                    ids = found.ids;
                }
                Ok(_) => {}
                Err(e) => warn!(query, error = %e, "Fallback discovery failed"),
            }
        }

        if ids.is_empty() {
            return Err(DiscoveryError::ZeroResultsExhausted {
                query: query.to_string(),
            }
            .into());
        }
        Ok((descriptor, ids))
    }

    /// Phase 1: propose a strategy, discover candidates and persist a plan.
    pub async fn create_plan(
        &self,
        query: &str,
        notification_email: Option<String>,
    ) -> Result<PlanningOutcome> {
        let proposed = self.propose_strategy(query).await?;
        let (descriptor, ids) = self.resolve_candidates(query, proposed).await?;
        let plan = self.plans.create(
            query,
            descriptor,
            ids.len(),
            &ids,
            self.config.discovery.chunk_size,
            notification_email,
        )?;
        let preview_verified = self.verify_preview(&plan).await;

        Ok(PlanningOutcome {
            plan_id: plan.plan_id,
            total_cases: plan.total_cases,
            total_chunks: plan.total_chunks,
            strategy_type: plan.strategy.strategy_type,
            strategies_used: plan.strategies_used.clone(),
            strategy_breakdown: plan.strategy_breakdown.clone(),
            eta_seconds: eta_seconds(plan.total_chunks),
            preview_verified,
        })
    }

    /// Show the model the first few planned cases. Failures never fail planning.
    async fn verify_preview(&self, plan: &Plan) -> bool {
        let preview: Vec<CaseId> = plan
            .flattened_ids()
            .into_iter()
            .take(self.config.discovery.preview_size)
            .collect();
        if preview.is_empty() {
            return false;
        }
        let rows = match self
            .engine
            .backend()
            .rows_for_ids(&preview, &plan.strategy.selected_columns)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(plan_id = %plan.plan_id, error = %e, "Preview rows unavailable");
                return false;
            }
        };
        let lines: Vec<String> = rows
            .iter()
            .filter_map(|row| serde_json::to_string(row).ok())
            .collect();
        let prompt = prompts::preview(&plan.user_query, &lines.join("\n"));
        match self
            .gateway
            .call(&prompt, self.config.inference.call_timeout(), "preview")
            .await
        {
            Ok(_) => {
                debug!(plan_id = %plan.plan_id, cases = preview.len(), "Preview verified");
                true
            }
            Err(e) => {
                warn!(plan_id = %plan.plan_id, error = %e, "Preview verification failed");
                false
            }
        }
    }
}
