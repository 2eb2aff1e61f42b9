//! Error types for the attack engine

use thiserror::Error;

/// Errors surfaced by the attack engine
#[derive(Error, Debug)]
pub enum Error {
    /// A request-sending primitive was called outside a `start()` scope
    #[error("attack context has no session; call start() first")]
    NoSession,

    /// `start()` was called on a context that already holds a session
    #[error("attack context already has a session")]
    SessionActive,

    /// `start_oob_server()` was called twice on the same context
    #[error("OOB server has already been started")]
    OobAlreadyStarted,

    /// An OOB operation was requested without `--oob host:port`
    #[error("no OOB listener details configured")]
    OobNotConfigured,

    /// The `--oob` value did not parse as `host:port`
    #[error("invalid OOB listen address: {0}")]
    OobAddress(String),

    /// A builder payload was asked to render a raw string expression
    #[error("payload combinator for '{0}' cannot render a raw string expression")]
    PayloadRender(String),

    /// Detection finished with no surviving injection
    #[error("no injections detected")]
    NoInjections,

    /// Every probe answered true, including the expected-false ones
    #[error("oracle answered true for every probe; the page likely reports errors as truthy")]
    DegenerateOracle,

    /// A request failed on both the initial attempt and the retry
    #[error("request failed after retry")]
    Transport(#[source] reqwest::Error),

    /// The tamper hook rejected or corrupted the outgoing request args
    #[error("tamper hook failed: {0}")]
    Tamper(String),

    /// A configured header line did not parse
    #[error("invalid header: {0}")]
    Header(String),

    /// The configured HTTP method is not a valid token
    #[error("invalid HTTP method: {0}")]
    Method(String),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for attack engine operations
pub type Result<T> = std::result::Result<T, Error>;
