//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use verdict_core::config::{CooldownPolicy, EngineConfig, QueueConfig};
use verdict_core::inference::ScriptedGateway;
use verdict_core::orchestrator::execute::referenced_ids;
use verdict_core::orchestrator::report::Report;
use verdict_core::orchestrator::synthesize::enforce_bibliography;
use verdict_core::persistence::InMemoryStore;
use verdict_core::plan::{ExecutionPlanStore, chunk_ids};
use verdict_core::queue::SerializationQueue;
use verdict_core::search::{CaseId, ScriptedSearchBackend};
use verdict_core::strategy::{RankTier, StrategyDescriptor, StrategyHits, StrategyType, merge_and_rank};
use verdict_core::Orchestrator;

fn distinct_ids(max: CaseId, len: usize) -> impl Strategy<Value = Vec<CaseId>> {
    prop::collection::btree_set(1..max, 0..len)
        .prop_map(|set| set.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

// --- Chunking properties ---

proptest! {
    #[test]
    fn chunks_cover_ids_in_order(
        ids in distinct_ids(10_000, 300),
        chunk_size in 1usize..80,
    ) {
        let chunks = chunk_ids(&ids, chunk_size);
        prop_assert_eq!(chunks.len(), ids.len().div_ceil(chunk_size));
        let flat: Vec<CaseId> = chunks.iter().flatten().copied().collect();
        prop_assert_eq!(&flat, &ids);
        for chunk in chunks.iter().take(chunks.len().saturating_sub(1)) {
            prop_assert_eq!(chunk.len(), chunk_size);
        }
    }

    #[test]
    fn created_plan_keeps_chunk_invariant(
        ids in distinct_ids(5_000, 200),
        chunk_size in 1usize..60,
        limit in 1usize..250,
    ) {
        prop_assume!(!ids.is_empty());
        let store = ExecutionPlanStore::new(Arc::new(InMemoryStore::new()));
        let descriptor = StrategyDescriptor::new(StrategyType::SqlStandard);
        let plan = store.create("furt", descriptor, ids.len(), &ids, chunk_size, None).unwrap();
        prop_assert_eq!(plan.total_chunks, ids.len().div_ceil(chunk_size));
        prop_assert_eq!(plan.flattened_ids(), ids.clone());

        let limited = store.update_case_limit(&plan.plan_id, limit).unwrap();
        let kept = limit.min(ids.len());
        prop_assert_eq!(limited.flattened_ids(), ids[..kept].to_vec());
        prop_assert_eq!(limited.total_chunks, kept.div_ceil(chunk_size));
        if kept < ids.len() {
            prop_assert_eq!(limited.original_total_cases, Some(ids.len()));
        }
    }
}

// --- Merge and rank properties ---

proptest! {
    #[test]
    fn multi_strategy_ids_rank_first(
        sql in distinct_ids(60, 30),
        pro in distinct_ids(60, 30),
        vector in distinct_ids(60, 30),
    ) {
        let results = vec![
            StrategyHits::new(StrategyType::SqlStandard, sql.clone()),
            StrategyHits::new(StrategyType::ProSearch, pro.clone()),
            StrategyHits::new(StrategyType::VectorSearch, vector.clone()),
        ];
        let (ranked, merged) = merge_and_rank(&results);

        let union: BTreeSet<CaseId> = sql.iter().chain(&pro).chain(&vector).copied().collect();
        prop_assert_eq!(ranked.iter().copied().collect::<BTreeSet<_>>(), union.clone());
        prop_assert_eq!(ranked.len(), union.len());

        let tiers: Vec<RankTier> = ranked.iter().map(|id| merged.tier_of(*id).unwrap()).collect();
        prop_assert!(tiers.windows(2).all(|w| w[0] <= w[1]));

        let last_multi = tiers.iter().rposition(|t| *t == RankTier::Multi);
        let first_single = tiers.iter().position(|t| *t != RankTier::Multi);
        if let (Some(m), Some(s)) = (last_multi, first_single) {
            prop_assert!(m < s);
        }
    }
}

// --- Citation filtering properties ---

proptest! {
    #[test]
    fn chunk_references_are_subset_of_sent(
        sent in distinct_ids(200, 50),
        claimed in prop::collection::vec(1i64..400, 0..40),
    ) {
        let extraction = serde_json::json!({ "referenced_case_ids": claimed });
        let referenced = referenced_ids(&extraction, &sent);
        let sent_set: HashSet<CaseId> = sent.iter().copied().collect();
        prop_assert!(referenced.iter().all(|id| sent_set.contains(id)));
    }

    #[test]
    fn synthesis_bibliography_ignores_model_citations(
        referenced in distinct_ids(1_000, 40),
        bogus in prop::collection::vec(1_000i64..2_000, 1..10),
    ) {
        let mut synthesis = serde_json::json!({
            "summary": "analysis",
            "bibliography": bogus,
        });
        let filtered = enforce_bibliography(&mut synthesis, &referenced);
        let distinct_bogus: HashSet<CaseId> = bogus.iter().copied().collect();
        prop_assert_eq!(filtered, distinct_bogus.len());
        prop_assert_eq!(
            &synthesis["bibliography"]["jurisprudence"],
            &serde_json::json!(referenced)
        );
    }

    #[test]
    fn report_bibliography_is_subset_of_known(
        known in distinct_ids(500, 30),
        cited in prop::collection::vec(1i64..1_000, 0..40),
    ) {
        let wire = serde_json::json!({
            "title": "T",
            "introduction": "I",
            "chapters": [{"title": "C", "content": "x"}],
            "conclusions": "K",
            "bibliography": {"jurisprudence": cited},
        });
        let mut report = Report::from_wire(wire, 1).unwrap();
        let known_set: HashSet<CaseId> = known.iter().copied().collect();
        report.retain_known_citations(&known_set);
        prop_assert!(report.bibliography.jurisprudence.iter().all(|c| known_set.contains(&c.case_id)));
        prop_assert_eq!(report.bibliography.total_cases_cited, report.bibliography.jurisprudence.len());
    }
}

// --- End-to-end hallucination guard ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn bogus_synthesis_id_never_reaches_bibliography(
        ids in distinct_ids(900, 12),
        bogus in 1_000i64..5_000,
    ) {
        prop_assume!(!ids.is_empty());
        let gateway = Arc::new(ScriptedGateway::new().with_responder(move |label, _prompt| {
            Ok(match label {
                "chunk" => serde_json::json!({"findings": []}).to_string(),
                _ => serde_json::json!({
                    "summary": format!("See also decision {bogus}."),
                    "bibliography": [bogus],
                })
                .to_string(),
            })
        }));
        let mut config = EngineConfig::default();
        config.synthesis.cooldown = CooldownPolicy::None;
        let orch = Orchestrator::new(
            config,
            gateway,
            Arc::new(ScriptedSearchBackend::new()),
            Arc::new(InMemoryStore::new()),
            SerializationQueue::new(QueueConfig::default()),
        );
        let plan = orch
            .plans()
            .create("furt", StrategyDescriptor::new(StrategyType::ProSearch), ids.len(), &ids, 5, None)
            .unwrap();

        let outcome = tokio_test::block_on(orch.execute(&plan.plan_id, None)).unwrap();
        prop_assert!(!outcome.bibliography.contains(&bogus));
        prop_assert_eq!(outcome.bibliography.len(), ids.len());
        prop_assert_eq!(outcome.filtered_citations, 1);
    }
}
