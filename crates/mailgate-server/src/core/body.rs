//! Body-attribute extraction and quoted-content truncation.
//!
//! Operates on the "effective body" the message parser already picked
//! (HTML over plain text). Attribute extraction optionally looks inside
//! an HTML document's `<body>` text; truncation has a dedicated
//! text-mode and DOM-aware HTML-mode path.

use std::collections::HashMap;

use anyhow::Result;
use regex::Regex;
use scraper::{Html, Selector};

use crate::config::{AttributeType, CommentDelimiter};

/// Extracts every permitted attribute present in `body`.
///
/// When `is_html`, attributes are matched against the textual content of
/// `<body>` rather than the raw markup, so tags never leak into values.
pub fn extract_attributes(
    body: &str,
    is_html: bool,
    permitted: &HashMap<String, AttributeType>,
) -> HashMap<String, String> {
    let haystack = if is_html { html_body_text(body) } else { body.to_string() };

    let mut found = HashMap::with_capacity(permitted.len());
    for (key, attr_type) in permitted {
        if let Some(value) = extract_one(&haystack, key, *attr_type) {
            found.insert(key.clone(), value);
        }
    }
    found
}

fn extract_one(haystack: &str, key: &str, attr_type: AttributeType) -> Option<String> {
    let pattern = match attr_type {
        AttributeType::Date => format!(
            r"(?i)\b{}\b\s*[-;:]?\s*(\d{{2}})[-/](\d{{2}})[-/](\d{{4}})(?:\s+(\d{{2}}):(\d{{2}}))?",
            regex::escape(key)
        ),
        AttributeType::Id => format!(r"(?i)\b{}\b\s*[-;:]?\s*([A-Za-z]{{3}}\d{{12}})", regex::escape(key)),
        AttributeType::String => format!(r"(?i)\b{}\b\s*[-;:]?\s*(\S+)", regex::escape(key)),
    };

    let regex = Regex::new(&pattern).ok()?;
    let captures = regex.captures(haystack)?;

    match attr_type {
        AttributeType::Date => {
            let day = &captures[1];
            let month = &captures[2];
            let year = &captures[3];
            let time = match (captures.get(4), captures.get(5)) {
                (Some(h), Some(m)) => format!("{}:{}:00", h.as_str(), m.as_str()),
                _ => "23:59:59".to_string(),
            };
            Some(format!("{year}-{month}-{day}T{time}"))
        }
        AttributeType::Id => Some(captures[1].to_uppercase()),
        AttributeType::String => Some(captures[1].to_string()),
    }
}

fn html_body_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").expect("static selector");
    document
        .select(&body_selector)
        .next()
        .map(|body| body.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// Truncates `body` at the first matching delimiter, in configured order.
/// No-op when `delimiters` is empty.
pub fn truncate_body(body: &str, is_html: bool, delimiters: &[CommentDelimiter]) -> Result<String> {
    if delimiters.is_empty() {
        return Ok(normalize_newlines(body, is_html));
    }

    if is_html {
        truncate_html(body, delimiters)
    } else {
        Ok(truncate_text(body, delimiters))
    }
}

fn truncate_text(body: &str, delimiters: &[CommentDelimiter]) -> String {
    let mut result = body;

    for delimiter in delimiters {
        let Ok(regex) = delimiter.compile() else { continue };
        if let Some(found) = regex.find(result) {
            result = &result[..found.start()];
        }
    }

    normalize_newlines(result, false)
}

fn normalize_newlines(body: &str, is_html: bool) -> String {
    if is_html {
        return body.to_string();
    }
    let crlf = Regex::new(r"\r?\n").expect("static regex");
    crlf.replace_all(body, "<br>").into_owned()
}

fn truncate_html(body: &str, delimiters: &[CommentDelimiter]) -> Result<String> {
    let mut document = Html::parse_document(body);

    for delimiter in delimiters {
        let Ok(regex) = delimiter.compile() else { continue };

        let body_selector = Selector::parse("body").expect("static selector");
        let Some(body_ref) = document.select(&body_selector).next() else { continue };
        let body_id = body_ref.id();

        let body_text = body_ref.text().collect::<Vec<_>>().join(" ");
        if !regex.is_match(&body_text) {
            continue;
        }

        let Some(match_id) = find_deepest_matching_element(&document, body_id, &regex) else { continue };
        truncate_at(&mut document, match_id, body_id);
    }

    Ok(document.html())
}

fn find_deepest_matching_element(
    document: &Html,
    root: ego_tree::NodeId,
    regex: &Regex,
) -> Option<ego_tree::NodeId> {
    let node = document.tree.get(root)?;

    for child in node.children() {
        if child.value().is_element()
            && let Some(found) = find_deepest_matching_element(document, child.id(), regex)
        {
            return Some(found);
        }
    }

    let own_text: String = node
        .descendants()
        .filter_map(|n| n.value().as_text())
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join(" ");

    if node.value().is_element() && regex.is_match(&own_text) {
        Some(root)
    } else {
        None
    }
}

/// Removes `match_id` and every right sibling at every ancestor level up
/// to (and including the contents of) `body_id`.
fn truncate_at(document: &mut Html, match_id: ego_tree::NodeId, body_id: ego_tree::NodeId) {
    let mut current = match_id;

    loop {
        remove_right_siblings(document, current);

        if current == body_id {
            if let Some(mut node) = document.tree.get_mut(current) {
                while node.has_children() {
                    let child_id = node.first_child().expect("has_children checked").id();
                    detach(document, child_id);
                }
            }
            break;
        }

        detach(document, current);

        let Some(parent_id) = document.tree.get(current).and_then(|n| n.parent()).map(|n| n.id()) else {
            break;
        };
        current = parent_id;
    }
}

fn remove_right_siblings(document: &mut Html, node_id: ego_tree::NodeId) {
    loop {
        let Some(next_id) = document.tree.get(node_id).and_then(|n| n.next_sibling()).map(|n| n.id()) else {
            break;
        };
        detach(document, next_id);
    }
}

fn detach(document: &mut Html, node_id: ego_tree::NodeId) {
    if let Some(mut node) = document.tree.get_mut(node_id) {
        node.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeType;

    #[test]
    fn extracts_date_attribute_with_time() {
        let mut permitted = HashMap::new();
        permitted.insert("due".to_string(), AttributeType::Date);
        let found = extract_attributes("please resolve due: 05-06-2024 14:30 thanks", false, &permitted);
        assert_eq!(found.get("due").unwrap(), "2024-06-05T14:30:00");
    }

    #[test]
    fn extracts_date_attribute_without_time() {
        let mut permitted = HashMap::new();
        permitted.insert("due".to_string(), AttributeType::Date);
        let found = extract_attributes("due: 05-06-2024", false, &permitted);
        assert_eq!(found.get("due").unwrap(), "2024-06-05T23:59:59");
    }

    #[test]
    fn extracts_id_attribute() {
        let mut permitted = HashMap::new();
        permitted.insert("ref".to_string(), AttributeType::Id);
        let found = extract_attributes("ref: abc123456789012 more text", false, &permitted);
        assert_eq!(found.get("ref").unwrap(), "ABC123456789012");
    }

    #[test]
    fn text_mode_truncates_at_first_delimiter() {
        let delimiters = vec![CommentDelimiter::Literal("-- original message --".to_string())];
        let body = "reply text\n-- original message --\nquoted stuff";
        let truncated = truncate_body(body, false, &delimiters).unwrap();
        assert_eq!(truncated, "reply text<br>");
    }

    #[test]
    fn text_mode_later_delimiter_truncates_the_already_cut_prefix() {
        let delimiters = vec![
            CommentDelimiter::Literal("-- original message --".to_string()),
            CommentDelimiter::Literal("reply".to_string()),
        ];
        let body = "reply text\n-- original message --\nquoted stuff";
        let truncated = truncate_body(body, false, &delimiters).unwrap();
        assert_eq!(truncated, "");
    }

    #[test]
    fn text_mode_with_no_delimiters_only_normalizes_newlines() {
        let truncated = truncate_body("line one\r\nline two", false, &[]).unwrap();
        assert_eq!(truncated, "line one<br>line two");
    }

    #[test]
    fn html_mode_truncates_quoted_block() {
        let delimiters = vec![CommentDelimiter::Literal("Original Message".to_string())];
        let html = "<html><body><p>reply text</p><div>On Tue, Original Message wrote:</div><p>quoted</p></body></html>";
        let truncated = truncate_body(html, true, &delimiters).unwrap();
        assert!(truncated.contains("reply text"));
        assert!(!truncated.contains("quoted"));
    }
}
