use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub const SUBSTEPS_SYSTEM_PROMPT: &str = r#"You are an expert startup mentor.
Context: {context}
Task: Break down the node "{node_title}" into 3-5 actionable sub-tasks.
Return ONLY a JSON object of the form {"tasks": ["..."]} (no markdown, no code block).
Each task must be specific and doable in a day or two.
Example: {"tasks": ["Identify target audience", "Create survey form", "Distribute to 10 people"]}"#;

pub fn substeps_system_prompt(node_title: &str, context: &str) -> String {
    SUBSTEPS_SYSTEM_PROMPT
        .replace("{context}", context)
        .replace("{node_title}", node_title)
}

pub fn substeps_user_prompt(node_title: &str) -> String {
    format!("Break down: {node_title}")
}

fn code_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").unwrap())
}

fn numbering_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[0-9]+[.)]|[-*])\s*").unwrap())
}

/// Trims a task title and strips list numbering or bullets; `None` when nothing is left.
pub fn clean_title(raw: &str) -> Option<String> {
    let title = numbering_re().replace(raw.trim(), "").trim().to_string();
    (!title.is_empty()).then_some(title)
}

fn strings_in(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => clean_title(s).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(strings_in).collect(),
        _ => Vec::new(),
    }
}

/// Extracts task titles from an LLM reply.
///
/// Accepts a bare JSON array, an object with a `tasks` array, or any object
/// whose values flatten to strings; markdown code fences are tolerated.
pub fn parse_substeps(content: &str) -> Result<Vec<String>, String> {
    let body = code_fence_re()
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(content);

    let parsed: Value = serde_json::from_str(body.trim())
        .map_err(|e| format!("Failed to parse AI response as JSON: {e}"))?;

    let tasks = match &parsed {
        Value::Array(_) => strings_in(&parsed),
        Value::Object(map) => match map.get("tasks") {
            Some(tasks @ Value::Array(_)) => strings_in(tasks),
            _ => map.values().flat_map(strings_in).collect(),
        },
        other => return Err(format!("Unexpected AI response shape: {other}")),
    };
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_array() {
        let tasks = parse_substeps(r#"["Identify audience", "  Create survey  "]"#).unwrap();
        assert_eq!(tasks, vec!["Identify audience", "Create survey"]);
    }

    #[test]
    fn parses_tasks_object() {
        let tasks = parse_substeps(r#"{"tasks": ["1. Draft pitch", "2) Send to 3 mentors"]}"#)
            .unwrap();
        assert_eq!(tasks, vec!["Draft pitch", "Send to 3 mentors"]);
    }

    #[test]
    fn flattens_unexpected_objects() {
        let tasks =
            parse_substeps(r#"{"steps": ["Pick a niche", 3, ""], "extra": "Set a deadline"}"#)
                .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.contains(&"Pick a niche".to_string()));
        assert!(tasks.contains(&"Set a deadline".to_string()));
    }

    #[test]
    fn tolerates_code_fences() {
        let reply = "```json\n{\"tasks\": [\"- Write FAQ\"]}\n```";
        assert_eq!(parse_substeps(reply).unwrap(), vec!["Write FAQ"]);
    }

    #[test]
    fn rejects_prose() {
        assert!(parse_substeps("Sure! Here are some tasks").is_err());
        assert!(parse_substeps("42").is_err());
    }

    #[test]
    fn prompt_mentions_node_and_context() {
        let prompt = substeps_system_prompt("Build MVP", "B2B invoicing tool");
        assert!(prompt.contains("\"Build MVP\""));
        assert!(prompt.contains("Context: B2B invoicing tool"));
    }
}
