//! Lenient JSON extraction from model output.
//!
//! Models asked for JSON often wrap it in a code fence or add a sentence around
//! it. These helpers find the payload before handing it to `serde_json`.

use serde::de::DeserializeOwned;

/// Find the JSON object or array inside `text`.
///
/// Code fences are stripped, then the outermost `{...}` or `[...]` span is
/// returned, whichever opens first.
pub fn extract_json(text: &str) -> Option<&str> {
    let text = strip_fence(text.trim());

    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Extract and deserialize JSON from model output.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T, serde_json::Error> {
    let payload = extract_json(text).unwrap_or(text);
    serde_json::from_str(payload)
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line.
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pick {
        ids: Vec<u32>,
    }

    #[test]
    fn test_extract_plain_object() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn test_extract_fenced() {
        let text = "```json\n{\"ids\": [1, 2]}\n```";
        let pick: Pick = parse_json(text).unwrap();
        assert_eq!(pick, Pick { ids: vec![1, 2] });
    }

    #[test]
    fn test_extract_with_prose() {
        let text = "Here you go: {\"ids\": [3]} Hope that helps.";
        let pick: Pick = parse_json(text).unwrap();
        assert_eq!(pick.ids, vec![3]);
    }

    #[test]
    fn test_extract_array() {
        assert_eq!(extract_json("Sure! [\"a\", \"b\"]"), Some("[\"a\", \"b\"]"));
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json("nothing here"), None);
        assert!(parse_json::<Pick>("nothing here").is_err());
    }
}
