//! Prompt templates for every inference call the pipeline makes.

use crate::search::CASE_COLUMNS;
use crate::tasks::Task;
use serde_json::Value;

const JSON_ONLY: &str = "Respond with a single JSON value and nothing else. No markdown, no commentary.";

/// Phase 0: split a broad question into narrower research tasks.
pub fn decomposition(query: &str) -> String {
    format!(
        "You are a legal research planner.\n\
         Split the research question below into 2 to 6 focused sub-research tasks.\n\n\
         Research question: {query}\n\n\
         Return an object of the form:\n\
         {{\"rationale\": \"why this split\", \"tasks\": [{{\"id\": \"short_snake_case_id\", \
         \"title\": \"...\", \"query\": \"self-contained research question\", \
         \"category\": \"jurisprudence|legislation|doctrine|procedure|general\", \
         \"priority\": \"high|medium|low\", \"rationale\": \"...\"}}]}}\n\n\
         {JSON_ONLY}"
    )
}

/// Phase 1: ask for a discovery strategy.
pub fn strategy(query: &str, attempt: u32, last_error: Option<&str>) -> String {
    let mut prompt = format!(
        "You are choosing how to search a database of court decisions.\n\n\
         Research question: {query}\n\n\
         Available columns: {columns}\n\
         Strategy types:\n\
         - sql_standard: keyword filtering; give a SQL `where_clause` over the columns\n\
         - pro_search: full-text phrase search; give `search_terms` (exact phrases)\n\
         - vector_search: similarity search; give a `semantic_query` paraphrase\n\
         - combined: a `primary_strategy` narrowed by a `filter_clause`\n\
         - exhaustive: run every strategy and merge\n\n\
         Return an object with keys: strategy_type, rationale, selected_columns, \
         and the fields your strategy type needs.\n\n\
         {JSON_ONLY}",
        columns = CASE_COLUMNS.join(", "),
    );
    if attempt > 1
        && let Some(error) = last_error
    {
        prompt.push_str(&format!(
            "\n\nAttempt {attempt}. The previous answer was rejected: {error}"
        ));
    }
    prompt
}

/// Non-blocking sanity check over the first few planned cases.
pub fn preview(query: &str, rows: &str) -> String {
    format!(
        "Research question: {query}\n\n\
         The first candidate decisions found are listed below, one JSON object per line.\n\
         Say briefly whether they look relevant.\n\n{rows}\n\n\
         Return {{\"relevant\": true|false, \"note\": \"...\"}}. {JSON_ONLY}"
    )
}

/// Phase 2: analyze one chunk of case rows.
pub fn chunk(query: &str, chunk_index: usize, total_chunks: usize, rows: &str) -> String {
    format!(
        "Research question: {query}\n\n\
         Batch {n} of {total_chunks}. Each line below is one court decision as JSON.\n\n\
         {rows}\n\n\
         Extract what these decisions say about the research question. Return an object:\n\
         {{\"findings\": [{{\"case_id\": <id>, \"holding\": \"...\", \"relevance\": \"...\"}}], \
         \"themes\": [\"...\"], \"referenced_case_ids\": [<ids you actually used>]}}\n\n\
         Only cite ids that appear in this batch. {JSON_ONLY}",
        n = chunk_index + 1,
    )
}

/// Phase 3: reduce all chunk extractions into one analysis.
pub fn synthesis(query: &str, extractions: &Value, missing_chunks: &[usize]) -> String {
    let gap = if missing_chunks.is_empty() {
        String::new()
    } else {
        format!(
            "\nNote: {} batch(es) could not be analyzed and are absent.\n",
            missing_chunks.len()
        )
    };
    format!(
        "Research question: {query}\n\n\
         Below are structured extractions from batches of court decisions.\n{gap}\n\
         {extractions}\n\n\
         Write a consolidated analysis. Return an object with keys \
         \"summary\", \"key_findings\" (array), \"trends\" (array) and \"open_issues\" (array). \
         {JSON_ONLY}"
    )
}

/// Phase 4: write the final report across every completed task.
pub fn final_report(query: &str, tasks: &[Task], correction: bool) -> String {
    let mut sections = String::new();
    for task in tasks {
        let Some(result) = &task.result else {
            continue;
        };
        sections.push_str(&format!(
            "## {title}\nQuestion: {q}\nCases: {ids:?}\nAnalysis: {analysis}\n\n",
            title = if task.user_metadata.title.is_empty() {
                task.id.as_str()
            } else {
                task.user_metadata.title.as_str()
            },
            q = task.query,
            ids = result.bibliography,
            analysis = result.synthesis,
        ));
    }
    let mut prompt = format!(
        "You are writing a legal research dissertation.\n\n\
         Research question: {query}\n\n\
         Completed research tasks:\n\n{sections}\
         Return an object with keys: title, table_of_contents (array of strings), \
         introduction, chapters (array of {{title, content, sections: [{{title, content}}]}}), \
         conclusions, bibliography ({{\"jurisprudence\": [{{\"case_id\": <id>, \"citation\": \"...\"}}]}}).\n\
         Cite only case ids listed above. {JSON_ONLY}"
    );
    if correction {
        prompt.push_str(
            "\n\nCORRECTION: the previous attempt returned prose, not JSON. \
             Return only the JSON object described above.",
        );
    }
    prompt
}
