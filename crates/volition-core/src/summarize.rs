//! Tool-result compaction for working context
//!
//! Full results always go to storage; what the model sees on the next
//! round is a size-capped variant. Known result families get structural
//! shrinkage (a fixed whitelist of fields per item); everything else is
//! serialized and truncated.

use serde_json::Value;
use volition_llm::util::truncate_safe;

/// Field whitelists per result family, matched by tool-name prefix.
const FAMILY_WHITELISTS: &[(&str, &[&str])] = &[
    ("web_search", &["title", "url", "snippet"]),
    ("search_", &["title", "url", "snippet"]),
    ("memory_", &["category", "content", "score"]),
    ("email_", &["from", "subject", "date", "snippet"]),
    ("calendar_", &["title", "start", "end", "location"]),
];

/// Max items kept from a list-shaped result.
const MAX_ITEMS: usize = 10;

fn whitelist_for(tool_name: &str) -> Option<&'static [&'static str]> {
    FAMILY_WHITELISTS
        .iter()
        .find(|(prefix, _)| tool_name.starts_with(prefix))
        .map(|(_, fields)| *fields)
}

fn shrink_item(item: &Value, fields: &[&str]) -> Value {
    let Some(map) = item.as_object() else {
        return item.clone();
    };
    let kept: serde_json::Map<String, Value> = map
        .iter()
        .filter(|(k, _)| fields.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(kept)
}

/// Find the list payload in a result: either the result itself or its
/// first array-valued field (`results`, `items`, etc.).
fn list_payload(result: &Value) -> Option<&Vec<Value>> {
    if let Some(items) = result.as_array() {
        return Some(items);
    }
    let map = result.as_object()?;
    for key in ["results", "items", "messages", "events"] {
        if let Some(items) = map.get(key).and_then(Value::as_array) {
            return Some(items);
        }
    }
    None
}

/// Compact a tool result for the next model call.
///
/// Errors and simulated results pass through untouched so the model sees
/// them verbatim.
#[must_use]
pub fn compact_tool_result(tool_name: &str, full: &Value, char_budget: usize) -> String {
    if full.get("error").is_some() || full.get("simulated").is_some() {
        return full.to_string();
    }

    let shrunk = match (whitelist_for(tool_name), list_payload(full)) {
        (Some(fields), Some(items)) => {
            let total = items.len();
            let kept: Vec<Value> = items
                .iter()
                .take(MAX_ITEMS)
                .map(|item| shrink_item(item, fields))
                .collect();
            if total > MAX_ITEMS {
                serde_json::json!({ "results": kept, "omitted": total - MAX_ITEMS })
            } else {
                serde_json::json!({ "results": kept })
            }
        }
        _ => full.clone(),
    };

    let rendered = shrunk.to_string();
    if rendered.len() > char_budget {
        format!("{}...(truncated)", truncate_safe(&rendered, char_budget))
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_results_keep_only_whitelisted_fields() {
        let full = serde_json::json!({
            "results": [
                {"title": "a", "url": "http://a", "snippet": "s", "raw_html": "<html>...</html>"},
            ],
            "latency_ms": 120,
        });
        let compact = compact_tool_result("web_search", &full, 10_000);
        let parsed: Value = serde_json::from_str(&compact).unwrap();
        let item = &parsed["results"][0];
        assert_eq!(item["title"], "a");
        assert!(item.get("raw_html").is_none());
        assert!(parsed.get("latency_ms").is_none());
    }

    #[test]
    fn long_lists_are_cut_with_a_count() {
        let items: Vec<Value> = (0..25)
            .map(|i| serde_json::json!({"title": format!("t{i}"), "url": "u", "snippet": "s"}))
            .collect();
        let full = serde_json::json!({ "results": items });
        let compact = compact_tool_result("search_contacts", &full, 100_000);
        let parsed: Value = serde_json::from_str(&compact).unwrap();
        assert_eq!(parsed["results"].as_array().unwrap().len(), 10);
        assert_eq!(parsed["omitted"], 15);
    }

    #[test]
    fn unknown_families_are_truncated_not_shrunk() {
        let full = serde_json::json!({ "blob": "x".repeat(500) });
        let compact = compact_tool_result("custom_tool", &full, 100);
        assert!(compact.len() <= 100 + "...(truncated)".len());
        assert!(compact.ends_with("...(truncated)"));
    }

    #[test]
    fn errors_pass_through_verbatim() {
        let full = serde_json::json!({ "error": "upstream timeout" });
        let compact = compact_tool_result("web_search", &full, 10_000);
        assert_eq!(compact, full.to_string());
    }

    #[test]
    fn small_results_are_left_alone() {
        let full = serde_json::json!({ "ok": true });
        let compact = compact_tool_result("custom_tool", &full, 10_000);
        assert_eq!(compact, full.to_string());
    }
}
