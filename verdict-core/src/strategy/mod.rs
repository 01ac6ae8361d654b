//! Candidate discovery: strategy descriptors, query rendering, merging and ranking.
//!
//! A research query is turned into one or more discovery strategies. Each
//! strategy renders to a pair of read-only queries executed by the
//! [`SearchBackend`](crate::search::SearchBackend). When the primary strategy
//! under-returns, secondary strategies are fanned out concurrently and their
//! results are merged and ranked into a single ordered candidate list.

pub mod engine;
pub mod query;
pub mod rank;

pub use engine::{Discovery, MultiStrategyMode, MultiStrategyOutcome, StrategyEngine};
pub use query::QueryBuilder;
pub use rank::{MergedCandidates, RankTier, StrategyHits, merge, merge_and_rank, rank};

use crate::search::CaseId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named discovery method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// Baseline keyword matching.
    SqlStandard,
    /// Phrase search over the full-text index.
    ProSearch,
    /// Embedding-similarity search.
    VectorSearch,
    /// A primary strategy narrowed by an extra filter clause.
    Combined,
    /// Every discovery strategy, regardless of the primary's sufficiency.
    Exhaustive,
    /// Last-resort keyword filter derived from the query's own words.
    Fallback,
}

impl StrategyType {
    /// The strategies run by exhaustive mode, in execution order.
    pub const DISCOVERY: [StrategyType; 3] = [
        StrategyType::SqlStandard,
        StrategyType::ProSearch,
        StrategyType::VectorSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::SqlStandard => "sql_standard",
            StrategyType::ProSearch => "pro_search",
            StrategyType::VectorSearch => "vector_search",
            StrategyType::Combined => "combined",
            StrategyType::Exhaustive => "exhaustive",
            StrategyType::Fallback => "fallback",
        }
    }

    /// Parse a strategy name as the model writes it. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "sql_standard" | "sql" | "keyword" => Some(StrategyType::SqlStandard),
            "pro_search" | "pro" | "fulltext" => Some(StrategyType::ProSearch),
            "vector_search" | "vector" | "semantic" => Some(StrategyType::VectorSearch),
            "combined" => Some(StrategyType::Combined),
            "exhaustive" => Some(StrategyType::Exhaustive),
            "fallback" => Some(StrategyType::Fallback),
            _ => None,
        }
    }

    /// Secondary strategies tried, in order, when this type under-returns.
    pub fn expansion_order(&self) -> &'static [StrategyType] {
        match self {
            StrategyType::SqlStandard => &[StrategyType::ProSearch, StrategyType::VectorSearch],
            StrategyType::ProSearch => &[StrategyType::SqlStandard, StrategyType::VectorSearch],
            StrategyType::VectorSearch => &[StrategyType::ProSearch, StrategyType::SqlStandard],
            StrategyType::Combined => &[
                StrategyType::ProSearch,
                StrategyType::SqlStandard,
                StrategyType::VectorSearch,
            ],
            StrategyType::Exhaustive | StrategyType::Fallback => &[],
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovery strategy as proposed by the model and enriched into runnable queries.
///
/// Immutable once a plan has been created from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub strategy_type: StrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_list_query: Option<String>,
    /// Results resolved ahead of time (exhaustive mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precomputed_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precomputed_ids: Option<Vec<CaseId>>,
    /// Columns sent to the model for each case during chunk execution.
    #[serde(default)]
    pub selected_columns: Vec<String>,
    #[serde(default)]
    pub rationale: String,
    /// Raw `WHERE` condition proposed for the baseline keyword strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    /// Phrases for the full-text strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_terms: Vec<String>,
    /// Free text for the similarity strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_query: Option<String>,
    /// For `combined`: the underlying strategy the filter narrows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_strategy: Option<StrategyType>,
    /// For `combined`: the extra filter condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_clause: Option<String>,
    #[serde(default)]
    pub strategies_used: Vec<StrategyType>,
    #[serde(default)]
    pub strategy_breakdown: BTreeMap<String, usize>,
}

impl StrategyDescriptor {
    /// An empty descriptor of the given type.
    pub fn new(strategy_type: StrategyType) -> Self {
        Self {
            strategy_type,
            count_query: None,
            id_list_query: None,
            precomputed_count: None,
            precomputed_ids: None,
            selected_columns: Vec::new(),
            rationale: String::new(),
            where_clause: None,
            search_terms: Vec::new(),
            semantic_query: None,
            primary_strategy: None,
            filter_clause: None,
            strategies_used: Vec::new(),
            strategy_breakdown: BTreeMap::new(),
        }
    }

    /// The discovery method actually run: `combined` narrows its primary,
    /// which defaults to the phrase search.
    pub fn effective_type(&self) -> StrategyType {
        match self.strategy_type {
            StrategyType::Combined => match self.primary_strategy {
                Some(
                    p @ (StrategyType::SqlStandard
                    | StrategyType::ProSearch
                    | StrategyType::VectorSearch),
                ) => p,
                _ => StrategyType::ProSearch,
            },
            other => other,
        }
    }

    /// Whether the descriptor carries precomputed results.
    pub fn is_precomputed(&self) -> bool {
        self.precomputed_ids.is_some()
    }

    /// Whether the descriptor can be handed to a search backend.
    pub fn is_runnable(&self) -> bool {
        self.is_precomputed()
            || matches!(
                (&self.count_query, &self.id_list_query),
                (Some(c), Some(i)) if !c.trim().is_empty() && !i.trim().is_empty()
            )
    }
}
