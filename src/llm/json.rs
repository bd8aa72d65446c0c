//! Locating JSON inside free-form model output.

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// First `max_chars` characters of `text`, for logging and error excerpts.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_object() {
        assert_eq!(extract_json_object(r#"  {"a": 1} "#), r#"{"a": 1}"#);
    }

    #[test]
    fn markdown_json_block() {
        let raw = "Here you go:\n```json\n{\"changes\": []}\n```\nthanks";
        assert_eq!(extract_json_object(raw), r#"{"changes": []}"#);
    }

    #[test]
    fn bare_fence() {
        let raw = "```\n{\"type\": \"other\"}\n```";
        assert_eq!(extract_json_object(raw), r#"{"type": "other"}"#);
    }

    #[test]
    fn embedded_in_prose() {
        let raw = "Sure! {\"changes\": [{\"x\": 1}]} Let me know.";
        assert_eq!(extract_json_object(raw), r#"{"changes": [{"x": 1}]}"#);
    }

    #[test]
    fn no_object_returns_trimmed_input() {
        assert_eq!(extract_json_object("  nothing here "), "nothing here");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("añb", 2), "añ");
    }
}
