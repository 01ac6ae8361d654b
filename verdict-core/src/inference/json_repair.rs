//! Recovering JSON from model output.
//!
//! Models wrap JSON in markdown fences, prepend chatty banners, or trail off
//! with commentary. Extraction tries, in order: the cleaned text as-is, the
//! span between the first `{` and the last `}`, and the span between the
//! first `[` and the last `]`. When nothing parses the raw text is returned
//! inside a tagged `parsed_as_text` object.

use crate::error::InferenceError;
use serde_json::{Value, json};

/// Tag set on the object returned when no JSON could be recovered.
pub const PARSED_AS_TEXT: &str = "parsed_as_text";

fn is_banner(line: &str) -> bool {
    let t = line.trim();
    t.starts_with("```")
        || t.starts_with('#')
        || (!t.is_empty() && t.chars().all(|c| matches!(c, '=' | '-' | '*' | '_')))
}

/// Drop markdown fences and banner lines.
pub fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !is_banner(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Parse JSON out of model output, failing if every heuristic fails.
pub fn try_extract_json(text: &str) -> Result<Value, InferenceError> {
    let cleaned = strip_fences(text);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned)
        && (value.is_object() || value.is_array())
    {
        return Ok(value);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(candidate) = span(&cleaned, open, close)
            && let Ok(value) = serde_json::from_str::<Value>(candidate)
        {
            return Ok(value);
        }
    }
    Err(InferenceError::ResponseParse {
        message: format!(
            "no JSON object found in {} characters of output",
            text.chars().count()
        ),
    })
}

/// Parse JSON out of model output, never failing.
///
/// Unparseable output comes back as `{"parsed_as_text": true, "text": <raw>}`.
pub fn extract_json(text: &str) -> Value {
    try_extract_json(text).unwrap_or_else(|_| {
        json!({
            PARSED_AS_TEXT: true,
            "text": text.trim(),
        })
    })
}

/// Whether a value is the tagged text fallback.
pub fn is_parsed_as_text(value: &Value) -> bool {
    value.get(PARSED_AS_TEXT).and_then(Value::as_bool) == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_json() {
        assert_eq!(extract_json("{\"a\": 1}"), json!({"a": 1}));
    }

    #[test]
    fn test_fenced_json_with_banner() {
        let text = "# Result\n```json\n{\"chapters\": []}\n```\n";
        assert_eq!(extract_json(text), json!({"chapters": []}));
    }

    #[test]
    fn test_embedded_object_with_commentary() {
        let text = "Sure! Here is the analysis: {\"x\": {\"y\": 2}} Hope that helps.";
        assert_eq!(extract_json(text), json!({"x": {"y": 2}}));
    }

    #[test]
    fn test_top_level_array() {
        let text = "Tasks:\n[{\"id\": \"t1\"}]";
        assert_eq!(extract_json(text), json!([{"id": "t1"}]));
    }

    #[test]
    fn test_prose_is_tagged() {
        let value = extract_json("The court held that the theft was aggravated.");
        assert!(is_parsed_as_text(&value));
        assert_eq!(
            value["text"],
            json!("The court held that the theft was aggravated.")
        );
        assert!(try_extract_json("no json here").is_err());
    }

    #[test]
    fn test_bare_scalar_is_not_accepted() {
        assert!(is_parsed_as_text(&extract_json("42")));
    }
}
