//! Strategy execution against the search backend.

use super::query::QueryBuilder;
use super::rank::{StrategyHits, merge_and_rank};
use super::{StrategyDescriptor, StrategyType};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::search::{CaseId, SearchBackend};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of running one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub count: usize,
    pub ids: Vec<CaseId>,
}

/// How secondary strategies are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiStrategyMode {
    /// Secondaries from the primary type's priority table.
    AutoExpand,
    /// Every discovery strategy.
    Exhaustive,
}

/// Merged, ranked output of a multi-strategy run.
#[derive(Debug, Clone)]
pub struct MultiStrategyOutcome {
    pub ids: Vec<CaseId>,
    pub source_map: HashMap<CaseId, BTreeSet<StrategyType>>,
    pub strategies_used: Vec<StrategyType>,
    /// Ids contributed per strategy, keyed by strategy name.
    pub strategy_breakdown: BTreeMap<String, usize>,
}

impl MultiStrategyOutcome {
    /// Fold the outcome into the descriptor the plan will be created from.
    pub fn apply_to(&self, descriptor: &mut StrategyDescriptor) {
        descriptor.strategies_used = self.strategies_used.clone();
        descriptor.strategy_breakdown = self.strategy_breakdown.clone();
    }

    /// A precomputed descriptor carrying this outcome (exhaustive mode).
    pub fn into_descriptor(self, rationale: impl Into<String>) -> StrategyDescriptor {
        let mut descriptor = StrategyDescriptor::new(StrategyType::Exhaustive);
        descriptor.precomputed_count = Some(self.ids.len());
        descriptor.precomputed_ids = Some(self.ids);
        descriptor.strategies_used = self.strategies_used;
        descriptor.strategy_breakdown = self.strategy_breakdown;
        descriptor.rationale = rationale.into();
        descriptor
    }
}

/// Runs discovery strategies and merges their results.
pub struct StrategyEngine {
    backend: Arc<dyn SearchBackend>,
    builder: QueryBuilder,
}

impl StrategyEngine {
    pub fn new(backend: Arc<dyn SearchBackend>, config: &DiscoveryConfig) -> Self {
        Self {
            backend,
            builder: QueryBuilder::new(config),
        }
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    /// Run one strategy. Precomputed results are returned as-is.
    pub async fn discover(
        &self,
        query: &str,
        strategy: &StrategyDescriptor,
    ) -> Result<Discovery, DiscoveryError> {
        if let Some(ids) = &strategy.precomputed_ids {
            return Ok(Discovery {
                count: strategy.precomputed_count.unwrap_or(ids.len()),
                ids: ids.clone(),
            });
        }
        let (Some(count_query), Some(id_list_query)) =
            (&strategy.count_query, &strategy.id_list_query)
        else {
            return Err(DiscoveryError::NoRunnableStrategy {
                strategy: strategy.strategy_type.to_string(),
            });
        };
        if count_query.trim().is_empty() || id_list_query.trim().is_empty() {
            return Err(DiscoveryError::NoRunnableStrategy {
                strategy: strategy.strategy_type.to_string(),
            });
        }

        let (count, ids) = self.backend.run(count_query, id_list_query).await?;
        debug!(
            strategy = %strategy.strategy_type,
            query,
            count,
            ids = ids.len(),
            "Discovery finished"
        );
        Ok(Discovery { count, ids })
    }

    /// Run secondary strategies concurrently and merge them with the primary's ids.
    ///
    /// In exhaustive mode the primary's ids are ignored and every discovery
    /// strategy runs. A failing strategy is logged and contributes nothing.
    pub async fn execute_multi_strategy(
        &self,
        query: &str,
        primary: &StrategyDescriptor,
        primary_ids: &[CaseId],
        mode: MultiStrategyMode,
    ) -> MultiStrategyOutcome {
        let mut results: Vec<StrategyHits> = Vec::new();
        let secondaries: Vec<StrategyType> = match mode {
            MultiStrategyMode::AutoExpand => {
                results.push(StrategyHits::new(primary.strategy_type, primary_ids.to_vec()));
                // A combined primary already ran its underlying method.
                let underlying = primary.effective_type();
                primary
                    .strategy_type
                    .expansion_order()
                    .iter()
                    .copied()
                    .filter(|&t| t != underlying)
                    .collect()
            }
            MultiStrategyMode::Exhaustive => StrategyType::DISCOVERY.to_vec(),
        };

        info!(
            query,
            primary = %primary.strategy_type,
            ?mode,
            secondaries = ?secondaries,
            "Running multi-strategy discovery"
        );

        let branches = secondaries.iter().map(|&strategy_type| {
            let descriptor = self.builder.for_type(query, strategy_type);
            async move { (strategy_type, self.discover(query, &descriptor).await) }
        });

        for (strategy_type, outcome) in join_all(branches).await {
            match outcome {
                Ok(discovery) => results.push(StrategyHits::new(strategy_type, discovery.ids)),
                Err(e) => warn!(strategy = %strategy_type, error = %e, "Secondary strategy failed"),
            }
        }

        let mut strategies_used = Vec::new();
        let mut strategy_breakdown = BTreeMap::new();
        for hits in &results {
            if !strategies_used.contains(&hits.strategy) {
                strategies_used.push(hits.strategy);
            }
            *strategy_breakdown
                .entry(hits.strategy.to_string())
                .or_insert(0) += hits.ids.len();
        }

        let (ids, merged) = merge_and_rank(&results);
        info!(
            query,
            merged = ids.len(),
            breakdown = ?strategy_breakdown,
            "Multi-strategy discovery merged"
        );
        MultiStrategyOutcome {
            ids,
            source_map: merged.source_map,
            strategies_used,
            strategy_breakdown,
        }
    }

    /// Last-resort keyword discovery from the query's own words.
    ///
    /// Returns `None` when the query has no usable words.
    pub async fn fallback(
        &self,
        query: &str,
    ) -> Result<Option<(StrategyDescriptor, Discovery)>, DiscoveryError> {
        let Some(descriptor) = self.builder.fallback(query) else {
            return Ok(None);
        };
        let discovery = self.discover(query, &descriptor).await?;
        info!(query, found = discovery.ids.len(), "Fallback discovery finished");
        Ok(Some((descriptor, discovery)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ScriptedSearchBackend;
    use pretty_assertions::assert_eq;

    fn engine(backend: ScriptedSearchBackend) -> StrategyEngine {
        StrategyEngine::new(Arc::new(backend), &DiscoveryConfig::default())
    }

    #[tokio::test]
    async fn test_discover_precomputed_skips_backend() {
        let backend = Arc::new(ScriptedSearchBackend::new());
        let engine = StrategyEngine::new(backend.clone(), &DiscoveryConfig::default());
        let mut d = StrategyDescriptor::new(StrategyType::Exhaustive);
        d.precomputed_ids = Some(vec![3, 1]);
        let found = engine.discover("q", &d).await.unwrap();
        assert_eq!(found, Discovery { count: 2, ids: vec![3, 1] });
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_discover_unrunnable_fails() {
        let engine = engine(ScriptedSearchBackend::new());
        let d = StrategyDescriptor::new(StrategyType::SqlStandard);
        let err = engine.discover("q", &d).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NoRunnableStrategy { .. }));
    }

    #[tokio::test]
    async fn test_auto_expand_merges_furt_calificat() {
        let engine = engine(
            ScriptedSearchBackend::new()
                .with_rule("MATCH", vec![2, 3, 4, 5, 6, 7, 8, 9, 10])
                .with_rule("trigram_similarity", vec![]),
        );
        let primary = engine.builder().for_type("furt calificat", StrategyType::SqlStandard);
        let outcome = engine
            .execute_multi_strategy("furt calificat", &primary, &[1, 2, 3], MultiStrategyMode::AutoExpand)
            .await;
        assert_eq!(outcome.ids.len(), 10);
        let pos = |id| outcome.ids.iter().position(|x| *x == id).unwrap();
        for later in [1, 4, 5, 6, 7, 8, 9, 10] {
            assert!(pos(2) < pos(later));
            assert!(pos(3) < pos(later));
        }
        assert_eq!(outcome.strategy_breakdown.get("pro_search"), Some(&9));
        assert_eq!(outcome.strategy_breakdown.get("sql_standard"), Some(&3));
    }

    #[tokio::test]
    async fn test_failing_branch_is_isolated() {
        let engine = engine(
            ScriptedSearchBackend::new()
                .with_failure("MATCH")
                .with_rule("trigram_similarity", vec![42]),
        );
        let primary = engine.builder().for_type("furt calificat", StrategyType::SqlStandard);
        let outcome = engine
            .execute_multi_strategy("furt calificat", &primary, &[1], MultiStrategyMode::AutoExpand)
            .await;
        assert_eq!(outcome.ids, vec![1, 42]);
        assert!(!outcome.strategies_used.contains(&StrategyType::ProSearch));
    }

    #[tokio::test]
    async fn test_exhaustive_runs_every_strategy() {
        let backend = Arc::new(
            ScriptedSearchBackend::new()
                .with_rule("MATCH", vec![5])
                .with_rule("trigram_similarity", vec![6])
                .with_rule("LIKE", vec![5, 7]),
        );
        let engine = StrategyEngine::new(backend.clone(), &DiscoveryConfig::default());
        let primary = StrategyDescriptor::new(StrategyType::Exhaustive);
        let outcome = engine
            .execute_multi_strategy("furt calificat", &primary, &[], MultiStrategyMode::Exhaustive)
            .await;
        assert_eq!(backend.calls().len(), 3);
        assert_eq!(outcome.ids, vec![5, 7, 6]);
        let descriptor = outcome.into_descriptor("all");
        assert!(descriptor.is_precomputed());
        assert_eq!(descriptor.precomputed_count, Some(3));
    }

    #[tokio::test]
    async fn test_combined_primary_skips_its_underlying_method() {
        let backend = Arc::new(
            ScriptedSearchBackend::new()
                .with_rule("MATCH", vec![1, 2])
                .with_rule("trigram_similarity", vec![])
                .with_rule("LIKE", vec![3]),
        );
        let engine = StrategyEngine::new(backend.clone(), &DiscoveryConfig::default());
        let mut primary = StrategyDescriptor::new(StrategyType::Combined);
        primary.filter_clause = Some("court LIKE '%Cluj%'".into());
        let primary = engine.builder().enrich("furt calificat", primary);

        let outcome = engine
            .execute_multi_strategy("furt calificat", &primary, &[1, 2], MultiStrategyMode::AutoExpand)
            .await;
        assert_eq!(backend.calls().len(), 2);
        assert!(backend.calls().iter().all(|sql| !sql.contains("MATCH")));
        assert!(!outcome.strategies_used.contains(&StrategyType::ProSearch));
        assert_eq!(outcome.ids, vec![1, 2, 3]);
        assert!(outcome.source_map[&1].len() == 1);
    }

    #[tokio::test]
    async fn test_fallback_without_words() {
        let engine = engine(ScriptedSearchBackend::new());
        assert!(engine.fallback("a b c").await.unwrap().is_none());
    }
}
