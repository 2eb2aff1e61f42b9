//! xtractor: XPath injection attack engine
//!
//! Automates exploitation of XPath injection in web applications whose
//! server-side queries interpolate user input. Given an endpoint, a target
//! parameter and an oracle that tells "the injected predicate was true"
//! apart from "false", the engine finds a working injection shape, probes
//! the evaluator's feature set, and recovers the backing XML document.
//!
//! # Architecture
//!
//! - `context`: the attack context threaded through every stage
//! - `request` / `oracle`: semaphore-bounded request pipeline and the
//!   boolean oracle contract (response match, timing, out-of-band)
//! - `injections`: the injection-shape catalog and its detectors
//! - `features`: XPath dialect and extension probing with false-test guards
//! - `oob`: the transient callback/collection HTTP server
//! - `algorithms`: blind extraction (binary search, codepoint/substring/
//!   linear character recovery, OOB bulk transfer)
//! - `inband`: response-diff extraction for reflective applications
//!
//! The command-line surface lives in the `xtractor-cli` crate.

pub mod algorithms;
pub mod context;
pub mod display;
pub mod error;
pub mod features;
pub mod inband;
pub mod injections;
pub mod oob;
pub mod oracle;
pub mod request;
pub mod xpath;

pub use algorithms::{Extractor, OobChannel, ASCII_SEARCH_SPACE};
pub use context::{
    make_delay_payload, make_match_function, AttackContext, Counters, Encoding, MatchFn,
    RequestArgs, Tamper,
};
pub use display::XmlNode;
pub use error::{Error, Result};
pub use features::{detect_features, features, Feature};
pub use inband::inband_extract;
pub use injections::{detect_injections, detect_injections_timed, Injection, Payload, INJECTORS};
pub use oob::OobServer;
pub use oracle::{HttpOracle, Oracle};
pub use request::{check, get_response_body, get_response_with_match, timed_request};
pub use xpath::{func, Expression};
