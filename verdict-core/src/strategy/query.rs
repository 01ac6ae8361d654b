//! Rendering discovery strategies into runnable read-only SQL.

use super::{StrategyDescriptor, StrategyType};
use crate::config::DiscoveryConfig;
use regex::Regex;
use std::sync::LazyLock;

static WHERE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));
static ORDER_BY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("valid regex"));
static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\b").expect("valid regex"));

const SIMILARITY_TEXT: &str = "title || ' ' || COALESCE(summary, '')";

/// Lowercased distinct words longer than three characters, in query order.
pub fn significant_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for word in query
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 3)
    {
        if !tokens.contains(&word) {
            tokens.push(word);
        }
    }
    tokens
}

/// Free text bound for an SQL literal. Statement separators are blanked so
/// the backend's single-statement guard never rejects a user's wording.
fn statement_safe(s: &str) -> String {
    s.replace(';', " ")
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn keyword_condition(token: &str) -> String {
    format!("(title LIKE '%{token}%' OR summary LIKE '%{token}%' OR content LIKE '%{token}%')")
}

/// Splice `filter` into a query: after `WHERE` when present, otherwise as a
/// new `WHERE` before `ORDER BY` / `LIMIT`, otherwise appended.
pub fn insert_filter(sql: &str, filter: &str) -> String {
    let filter = filter.trim();
    if filter.is_empty() {
        return sql.to_string();
    }
    if let Some(m) = WHERE_RE.find(sql) {
        return format!("{} ({filter}) AND{}", &sql[..m.end()], &sql[m.end()..]);
    }
    let tail = ORDER_BY_RE.find(sql).or_else(|| LIMIT_RE.find(sql));
    match tail {
        Some(m) => format!(
            "{} WHERE ({filter}) {}",
            sql[..m.start()].trim_end(),
            &sql[m.start()..]
        ),
        None => format!("{} WHERE ({filter})", sql.trim_end()),
    }
}

/// Renders strategy descriptors into `count_query`/`id_list_query` pairs.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    max_candidates: usize,
    fallback_cap: usize,
    similarity_threshold: f64,
}

impl QueryBuilder {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            max_candidates: config.max_candidates,
            fallback_cap: config.fallback_cap,
            similarity_threshold: config.similarity_threshold,
        }
    }

    fn keyword_pair(&self, conditions: &str) -> (String, String) {
        (
            format!("SELECT COUNT(*) FROM cases WHERE {conditions}"),
            format!(
                "SELECT id FROM cases WHERE {conditions} ORDER BY decision_date DESC, id LIMIT {}",
                self.max_candidates
            ),
        )
    }

    /// Baseline keyword strategy: every significant token must match.
    pub fn sql_standard(&self, query: &str) -> Option<(String, String)> {
        let tokens = significant_tokens(query);
        if tokens.is_empty() {
            return None;
        }
        let conditions = tokens
            .iter()
            .map(|t| keyword_condition(t))
            .collect::<Vec<_>>()
            .join(" AND ");
        Some(self.keyword_pair(&conditions))
    }

    /// Phrase search over the FTS5 index; phrases are OR-ed.
    pub fn pro_search(&self, terms: &[String]) -> Option<(String, String)> {
        let phrases: Vec<String> = terms
            .iter()
            .map(|t| statement_safe(&t.replace('"', " ")).trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|t| format!("\"{t}\""))
            .collect();
        if phrases.is_empty() {
            return None;
        }
        let matcher = quote_literal(&phrases.join(" OR "));
        let from = "FROM cases JOIN cases_fts ON cases_fts.rowid = cases.id";
        Some((
            format!("SELECT COUNT(*) {from} WHERE cases_fts MATCH {matcher}"),
            format!(
                "SELECT cases.id {from} WHERE cases_fts MATCH {matcher} ORDER BY cases_fts.rank LIMIT {}",
                self.max_candidates
            ),
        ))
    }

    /// Similarity search using the `trigram_similarity` SQL function.
    pub fn vector_search(&self, text: &str) -> Option<(String, String)> {
        let text = statement_safe(text);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let score = format!("trigram_similarity({SIMILARITY_TEXT}, {})", quote_literal(text));
        let threshold = self.similarity_threshold;
        Some((
            format!("SELECT COUNT(*) FROM cases WHERE {score} >= {threshold}"),
            format!(
                "SELECT id FROM cases WHERE {score} >= {threshold} ORDER BY {score} DESC, id LIMIT {}",
                self.max_candidates
            ),
        ))
    }

    /// Last resort: any of the first three significant tokens, hard-capped.
    pub fn fallback(&self, query: &str) -> Option<StrategyDescriptor> {
        let tokens: Vec<String> = significant_tokens(query).into_iter().take(3).collect();
        if tokens.is_empty() {
            return None;
        }
        let conditions = tokens
            .iter()
            .map(|t| keyword_condition(t))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut descriptor = StrategyDescriptor::new(StrategyType::Fallback);
        descriptor.count_query = Some(format!(
            "SELECT MIN(COUNT(*), {}) FROM cases WHERE {conditions}",
            self.fallback_cap
        ));
        descriptor.id_list_query = Some(format!(
            "SELECT id FROM cases WHERE {conditions} ORDER BY decision_date DESC, id LIMIT {}",
            self.fallback_cap
        ));
        descriptor.rationale = format!("Keyword fallback on: {}", tokens.join(", "));
        Some(descriptor)
    }

    /// A plain descriptor of `strategy_type` built from the query text alone.
    pub fn for_type(&self, query: &str, strategy_type: StrategyType) -> StrategyDescriptor {
        self.enrich(query, StrategyDescriptor::new(strategy_type))
    }

    /// Fill in runnable queries for a descriptor, following type-specific rules.
    ///
    /// Descriptors that already carry both queries or precomputed results are
    /// returned unchanged. A descriptor that cannot be made runnable is
    /// returned as-is and rejected later by discovery.
    pub fn enrich(&self, query: &str, mut descriptor: StrategyDescriptor) -> StrategyDescriptor {
        if descriptor.is_runnable() {
            return descriptor;
        }
        let pair = match descriptor.strategy_type {
            StrategyType::Combined => self.combined(query, &descriptor),
            StrategyType::Exhaustive => None,
            StrategyType::Fallback => self
                .fallback(query)
                .and_then(|f| f.count_query.zip(f.id_list_query)),
            other => self.pair_for(query, other, &descriptor),
        };
        if let Some((count_query, id_list_query)) = pair {
            descriptor.count_query = Some(count_query);
            descriptor.id_list_query = Some(id_list_query);
        }
        descriptor
    }

    fn pair_for(
        &self,
        query: &str,
        strategy_type: StrategyType,
        descriptor: &StrategyDescriptor,
    ) -> Option<(String, String)> {
        match strategy_type {
            StrategyType::SqlStandard => match descriptor.where_clause.as_deref().map(str::trim) {
                Some(clause) if !clause.is_empty() => Some(self.keyword_pair(clause)),
                _ => self.sql_standard(query),
            },
            StrategyType::ProSearch => {
                if descriptor.search_terms.is_empty() {
                    self.pro_search(&[query.to_string()])
                } else {
                    self.pro_search(&descriptor.search_terms)
                }
            }
            StrategyType::VectorSearch => {
                self.vector_search(descriptor.semantic_query.as_deref().unwrap_or(query))
            }
            _ => None,
        }
    }

    fn combined(&self, query: &str, descriptor: &StrategyDescriptor) -> Option<(String, String)> {
        let primary = descriptor.effective_type();
        let (count_query, id_list_query) = self.pair_for(query, primary, descriptor)?;
        // A keyword primary already renders `where_clause` itself.
        let where_filter = match primary {
            StrategyType::SqlStandard => None,
            _ => descriptor.where_clause.as_deref(),
        };
        match descriptor.filter_clause.as_deref().or(where_filter) {
            Some(filter) => Some((
                insert_filter(&count_query, filter),
                insert_filter(&id_list_query, filter),
            )),
            None => Some((count_query, id_list_query)),
        }
    }
}
