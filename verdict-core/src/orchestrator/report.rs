//! The canonical final report and its wire shapes.
//!
//! The model answers either with a flat report object or with a
//! `{dissertation, visual_tasks}` wrapper. Both are parsed here into
//! [`Report`]; nothing past this module sees the wire shapes.

use crate::error::InferenceError;
use crate::search::CaseId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// `metadata.import_mode` of the deterministic fallback report.
pub const RAW_TEXT_FALLBACK: &str = "raw_text_fallback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub title: String,
    pub table_of_contents: Vec<String>,
    pub introduction: String,
    pub chapters: Vec<Chapter>,
    pub conclusions: String,
    pub bibliography: Bibliography,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bibliography {
    pub jurisprudence: Vec<CitedCase>,
    pub total_cases_cited: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitedCase {
    pub case_id: CaseId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub word_count_estimate: usize,
    pub tasks_synthesized: usize,
    pub generation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireBody {
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    table_of_contents: Option<Vec<Value>>,
    #[serde(default)]
    introduction: Option<Value>,
    #[serde(default)]
    chapters: Option<Vec<Value>>,
    #[serde(default, alias = "conclusion")]
    conclusions: Option<Value>,
    #[serde(default)]
    bibliography: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireReport {
    Wrapped {
        dissertation: WireBody,
        #[serde(default)]
        visual_tasks: Vec<Value>,
    },
    Flat(WireBody),
}

/// Render a loosely typed text field: strings as-is, arrays joined by blank lines.
fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| text_of(Some(v)))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        Some(Value::Object(map)) => text_of(map.get("content").or_else(|| map.get("text"))),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn toc_entry(value: &Value) -> Option<String> {
    let text = match value {
        Value::Object(map) => text_of(map.get("title")),
        other => text_of(Some(other)),
    };
    (!text.is_empty()).then_some(text)
}

fn parse_chapter(value: &Value) -> Option<Chapter> {
    let Value::Object(map) = value else {
        let content = text_of(Some(value));
        return (!content.is_empty()).then(|| Chapter {
            title: String::new(),
            content,
            sections: Vec::new(),
        });
    };
    let sections = map
        .get("sections")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|s| Section {
                    title: text_of(s.get("title")),
                    content: text_of(s.get("content").or_else(|| s.get("text"))),
                })
                .collect()
        })
        .unwrap_or_default();
    Some(Chapter {
        title: text_of(map.get("title")),
        content: text_of(map.get("content").or_else(|| map.get("text"))),
        sections,
    })
}

/// Parse a case id written as a number or a numeric string.
pub fn case_id_of(value: &Value) -> Option<CaseId> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
        _ => None,
    }
}

fn cited_case(value: &Value) -> Option<CitedCase> {
    match value {
        Value::Object(map) => {
            let id = ["case_id", "id", "caseId"]
                .iter()
                .find_map(|k| map.get(*k).and_then(case_id_of))?;
            let citation = ["citation", "title", "reference"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(str::to_string);
            Some(CitedCase { case_id: id, citation })
        }
        other => case_id_of(other).map(|case_id| CitedCase {
            case_id,
            citation: None,
        }),
    }
}

fn parse_bibliography(value: Option<&Value>) -> Vec<CitedCase> {
    let entries = match value {
        Some(Value::Object(map)) => map.get("jurisprudence").and_then(Value::as_array),
        Some(Value::Array(items)) => Some(items),
        _ => None,
    };
    entries
        .map(|items| items.iter().filter_map(cited_case).collect())
        .unwrap_or_default()
}

/// Count whitespace-separated words across the report's structured text.
pub fn word_count(report: &Report) -> usize {
    let words = |s: &str| s.split_whitespace().count();
    words(&report.title)
        + report.table_of_contents.iter().map(|t| words(t)).sum::<usize>()
        + words(&report.introduction)
        + report
            .chapters
            .iter()
            .map(|c| {
                words(&c.title)
                    + words(&c.content)
                    + c.sections
                        .iter()
                        .map(|s| words(&s.title) + words(&s.content))
                        .sum::<usize>()
            })
            .sum::<usize>()
        + words(&report.conclusions)
}

impl Report {
    /// Normalize either wire shape and check the required sections are present.
    pub fn from_wire(value: Value, tasks_synthesized: usize) -> Result<Self, InferenceError> {
        let wire: WireReport =
            serde_json::from_value(value).map_err(|e| InferenceError::ResponseParse {
                message: format!("unrecognized report shape: {e}"),
            })?;
        let body = match wire {
            WireReport::Wrapped {
                dissertation,
                visual_tasks,
            } => {
                debug!(visual_tasks = visual_tasks.len(), "Dropping visual tasks from wrapped report");
                dissertation
            }
            WireReport::Flat(body) => body,
        };

        let chapters: Vec<Chapter> = body
            .chapters
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(parse_chapter)
            .collect();
        let mut table_of_contents: Vec<String> = body
            .table_of_contents
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(toc_entry)
            .collect();
        if table_of_contents.is_empty() {
            table_of_contents = chapters
                .iter()
                .map(|c| c.title.clone())
                .filter(|t| !t.is_empty())
                .collect();
        }

        let jurisprudence = parse_bibliography(body.bibliography.as_ref());
        let mut report = Report {
            title: text_of(body.title.as_ref()),
            table_of_contents,
            introduction: text_of(body.introduction.as_ref()),
            chapters,
            conclusions: text_of(body.conclusions.as_ref()),
            bibliography: Bibliography {
                total_cases_cited: jurisprudence.len(),
                jurisprudence,
            },
            metadata: ReportMetadata {
                word_count_estimate: 0,
                tasks_synthesized,
                generation_timestamp: Utc::now(),
                import_mode: None,
            },
        };
        report.validate()?;
        report.metadata.word_count_estimate = word_count(&report);
        Ok(report)
    }

    /// Fail with the list of missing required sections, if any.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let mut missing = Vec::new();
        if self.title.trim().is_empty() {
            missing.push("title".to_string());
        }
        if self.introduction.trim().is_empty() {
            missing.push("introduction".to_string());
        }
        if self.chapters.is_empty() || self.chapters.iter().all(|c| c.content.trim().is_empty() && c.sections.is_empty()) {
            missing.push("chapters".to_string());
        }
        if self.conclusions.trim().is_empty() {
            missing.push("conclusions".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(InferenceError::SchemaValidation { missing })
        }
    }

    /// Keep only citations of known case ids; duplicates collapse to the first.
    ///
    /// Returns how many citations were dropped.
    pub fn retain_known_citations(&mut self, known: &HashSet<CaseId>) -> usize {
        let before = self.bibliography.jurisprudence.len();
        let mut seen = HashSet::new();
        self.bibliography
            .jurisprudence
            .retain(|c| known.contains(&c.case_id) && seen.insert(c.case_id));
        self.bibliography.total_cases_cited = self.bibliography.jurisprudence.len();
        let dropped = before - self.bibliography.jurisprudence.len();
        if dropped > 0 {
            warn!(dropped, "Removed citations of cases no task produced");
        }
        dropped
    }

    /// A structurally valid report built without the model's structure.
    pub fn fallback(
        query: &str,
        raw_response: Option<&str>,
        known_ids: &[CaseId],
        tasks_synthesized: usize,
    ) -> Self {
        let content = raw_response
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("No analysis text was produced.")
            .to_string();
        let chapter_title = "Consolidated analysis".to_string();
        let mut report = Report {
            title: format!("Research report: {}", query.trim()),
            table_of_contents: vec![chapter_title.clone()],
            introduction: format!(
                "This report answers the research question \"{}\". The analysis below is reproduced as returned.",
                query.trim()
            ),
            chapters: vec![Chapter {
                title: chapter_title,
                content,
                sections: Vec::new(),
            }],
            conclusions: format!(
                "{} cases from {} completed research tasks informed this analysis.",
                known_ids.len(),
                tasks_synthesized
            ),
            bibliography: Bibliography {
                jurisprudence: known_ids
                    .iter()
                    .map(|&case_id| CitedCase {
                        case_id,
                        citation: None,
                    })
                    .collect(),
                total_cases_cited: known_ids.len(),
            },
            metadata: ReportMetadata {
                word_count_estimate: 0,
                tasks_synthesized,
                generation_timestamp: Utc::now(),
                import_mode: Some(RAW_TEXT_FALLBACK.to_string()),
            },
        };
        report.metadata.word_count_estimate = word_count(&report);
        report
    }

    pub fn is_fallback(&self) -> bool {
        self.metadata.import_mode.as_deref() == Some(RAW_TEXT_FALLBACK)
    }
}
