//! Merging per-strategy results and ranking the union.
//!
//! Ranking is tiered: ids confirmed by several strategies first, then ids
//! only the phrase search found, then keyword-only, then similarity-only.
//! Within a tier, ids keep the order in which they were first seen, walking
//! the primary strategy's results before the secondaries'. Chunk contents
//! depend on this order.

use super::StrategyType;
use crate::search::CaseId;
use std::collections::{BTreeSet, HashMap};

/// The ids one strategy produced, in its own ranked order.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyHits {
    pub strategy: StrategyType,
    pub ids: Vec<CaseId>,
}

impl StrategyHits {
    pub fn new(strategy: StrategyType, ids: Vec<CaseId>) -> Self {
        Self { strategy, ids }
    }
}

/// Rank tier, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RankTier {
    Multi,
    Pro,
    Keyword,
    Semantic,
}

impl RankTier {
    fn for_sources(sources: &BTreeSet<StrategyType>) -> Self {
        if sources.len() >= 2 {
            return RankTier::Multi;
        }
        match sources.iter().next() {
            Some(StrategyType::ProSearch | StrategyType::Combined) => RankTier::Pro,
            Some(StrategyType::VectorSearch) => RankTier::Semantic,
            _ => RankTier::Keyword,
        }
    }
}

/// The union of several strategies' results.
#[derive(Debug, Clone, Default)]
pub struct MergedCandidates {
    /// Distinct ids in first-seen order.
    pub order: Vec<CaseId>,
    /// For each id, the strategies that found it.
    pub source_map: HashMap<CaseId, BTreeSet<StrategyType>>,
}

impl MergedCandidates {
    pub fn tier_of(&self, id: CaseId) -> Option<RankTier> {
        self.source_map.get(&id).map(RankTier::for_sources)
    }
}

/// Union the results, recording which strategies found each id.
pub fn merge(results: &[StrategyHits]) -> MergedCandidates {
    let mut merged = MergedCandidates::default();
    for hits in results {
        for &id in &hits.ids {
            let sources = merged.source_map.entry(id).or_insert_with(|| {
                merged.order.push(id);
                BTreeSet::new()
            });
            sources.insert(hits.strategy);
        }
    }
    merged
}

/// Order merged ids by tier, then by first-seen position.
pub fn rank(merged: &MergedCandidates) -> Vec<CaseId> {
    let mut keyed: Vec<(RankTier, usize, CaseId)> = merged
        .order
        .iter()
        .enumerate()
        .map(|(pos, &id)| {
            let tier = merged.tier_of(id).unwrap_or(RankTier::Keyword);
            (tier, pos, id)
        })
        .collect();
    keyed.sort_by_key(|&(tier, pos, _)| (tier, pos));
    keyed.into_iter().map(|(_, _, id)| id).collect()
}

/// `merge` followed by `rank`.
pub fn merge_and_rank(results: &[StrategyHits]) -> (Vec<CaseId>, MergedCandidates) {
    let merged = merge(results);
    (rank(&merged), merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_furt_calificat_expansion_ranking() {
        let (ranked, merged) = merge_and_rank(&[
            StrategyHits::new(StrategyType::SqlStandard, vec![1, 2, 3]),
            StrategyHits::new(StrategyType::ProSearch, vec![2, 3, 4, 5, 6, 7, 8, 9, 10]),
        ]);
        assert_eq!(ranked.len(), 10);
        assert_eq!(ranked, vec![2, 3, 4, 5, 6, 7, 8, 9, 10, 1]);
        assert_eq!(merged.tier_of(2), Some(RankTier::Multi));
        assert_eq!(merged.tier_of(1), Some(RankTier::Keyword));
        assert_eq!(merged.tier_of(4), Some(RankTier::Pro));
    }

    #[test]
    fn test_semantic_only_ranks_last() {
        let ranked = rank(&merge(&[
            StrategyHits::new(StrategyType::VectorSearch, vec![7, 8]),
            StrategyHits::new(StrategyType::SqlStandard, vec![9]),
            StrategyHits::new(StrategyType::ProSearch, vec![10, 8]),
        ]));
        assert_eq!(ranked, vec![8, 10, 9, 7]);
    }

    #[test]
    fn test_duplicates_within_one_strategy_are_not_multi() {
        let merged = merge(&[StrategyHits::new(StrategyType::SqlStandard, vec![1, 1, 2])]);
        assert_eq!(merged.order, vec![1, 2]);
        assert_eq!(merged.tier_of(1), Some(RankTier::Keyword));
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_and_rank(&[]).0.is_empty());
    }
}
