//! Detection and oracle tests against a mock victim.
//!
//! The victim simulates `/lib/book[id=?]` (numeric context): only payloads
//! that keep the integer-injection grammar intact and evaluate true return
//! the "Kings" page; everything else gets "No results".

use std::time::Duration;
use wiremock::matchers::{method, query_param, query_param_contains};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xtractor::{
    check, detect_features, detect_injections, detect_injections_timed, make_delay_payload,
    make_match_function, AttackContext, Encoding,
};

fn context_for(server: &MockServer, concurrency: usize) -> AttackContext {
    AttackContext::new(
        server.uri(),
        "GET",
        "title",
        vec![("title".to_string(), "Bible".to_string())],
        make_match_function(None, Some(("Kings".to_string(), false))),
        concurrency,
        Encoding::Url,
    )
}

async fn mount_true_payload(server: &MockServer, value: &str) {
    Mock::given(method("GET"))
        .and(query_param("title", value))
        .respond_with(ResponseTemplate::new(200).set_body_string("Kings"))
        .with_priority(1)
        .mount(server)
        .await;
}

async fn mount_fallback(server: &MockServer) {
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("No results"))
        .with_priority(10)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_integer_injection_is_detected_alone() {
    let server = MockServer::start().await;
    mount_true_payload(&server, "Bible and 1=1").await;
    mount_fallback(&server).await;

    let context = context_for(&server, 10);
    let started = context.start(None).expect("session");
    let detected = detect_injections(&started).await.expect("detection");

    let names: Vec<&str> = detected.iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["integer"]);
}

#[tokio::test]
async fn test_oracle_idempotence() {
    let server = MockServer::start().await;
    mount_true_payload(&server, "Bible and 1=1").await;
    mount_fallback(&server).await;

    let context = context_for(&server, 2);
    let started = context.start(None).expect("session");

    let first = check(&started, "Bible and 1=1").await.expect("check");
    let second = check(&started, "Bible and 1=1").await.expect("check");
    assert_eq!(first, second);
    assert!(first);

    let first = check(&started, "Bible and 1=2").await.expect("check");
    let second = check(&started, "Bible and 1=2").await.expect("check");
    assert_eq!(first, second);
    assert!(!first);
}

#[tokio::test]
async fn test_degenerate_oracle_is_rejected() {
    // A page that answers "Kings" to everything (an error page echoing the
    // marker) must not produce a detection.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Kings"))
        .mount(&server)
        .await;

    let context = context_for(&server, 10);
    let started = context.start(None).expect("session");
    let error = detect_injections(&started)
        .await
        .expect_err("degenerate oracle must fail detection");
    assert!(error.to_string().contains("every probe"));
}

#[tokio::test]
async fn test_feature_false_guard_demotes_xpath2() {
    // The victim supports the positive XPath 2.0 probes but also answers
    // true to lower-case('A') = 'z': an evaluator error is being reported
    // as truth, so the feature must be demoted.
    let server = MockServer::start().await;
    mount_true_payload(&server, "Bible and 1=1").await;
    for fragment in [
        "lower-case('A') = 'a'",
        "lower-case('A') = 'z'",
        "ends-with('thetest', 'test')",
        "encode-for-uri('test') = 'test'",
    ] {
        Mock::given(method("GET"))
            .and(query_param_contains("title", fragment))
            .respond_with(ResponseTemplate::new(200).set_body_string("Kings"))
            .with_priority(1)
            .mount(&server)
            .await;
    }
    mount_fallback(&server).await;

    let context = context_for(&server, 10);
    let started = context.start(None).expect("session");
    let detected = detect_injections(&started).await.expect("detection");
    assert_eq!(detected[0].name, "integer");

    let probed = detect_features(&started, &detected[0])
        .await
        .expect("feature probing");
    let xpath2 = probed
        .iter()
        .find(|(feature, _)| feature.name == "xpath-2")
        .expect("xpath-2 probed");
    assert!(!xpath2.1, "error-as-true evaluator must not enable xpath-2");
}

#[tokio::test]
async fn test_normalize_space_feature_enabled_when_honest() {
    let server = MockServer::start().await;
    mount_true_payload(&server, "Bible and 1=1").await;
    Mock::given(method("GET"))
        .and(query_param_contains("title", "normalize-space('  a  b ') = 'a b'"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Kings"))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_fallback(&server).await;

    let context = context_for(&server, 10);
    let started = context.start(None).expect("session");
    let detected = detect_injections(&started).await.expect("detection");
    let probed = detect_features(&started, &detected[0])
        .await
        .expect("feature probing");

    let normalize = probed
        .iter()
        .find(|(feature, _)| feature.name == "normalize-space")
        .expect("normalize-space probed");
    assert!(normalize.1);

    // The guarded search features never passed their positive probes.
    for name in ["codepoint-search", "substring-search", "saxon"] {
        let entry = probed
            .iter()
            .find(|(feature, _)| feature.name == name)
            .expect("feature probed");
        assert!(!entry.1, "{} must stay disabled", name);
    }
}

#[tokio::test]
async fn test_timed_detection_calibrates_threshold() {
    // Only the exact integer-shaped delay payload is slow; every other
    // probe returns immediately. The detector must accept the integer
    // shape alone and calibrate the threshold to the midpoint.
    let server = MockServer::start().await;
    let delay = make_delay_payload(1);

    Mock::given(method("GET"))
        .and(query_param(
            "title",
            format!("Bible and true() and {}", delay).as_str(),
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("whatever")
                .set_delay(Duration::from_millis(1500)),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("whatever"))
        .with_priority(10)
        .mount(&server)
        .await;

    let context = context_for(&server, 10).with_time_based(delay);
    assert_eq!(context.concurrency, 1);

    let started = context.start(None).expect("session");
    let (detected, threshold) = detect_injections_timed(&started)
        .await
        .expect("timed detection");

    let names: Vec<&str> = detected.iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["integer"]);
    // Midpoint of ~1.5s true and ~0s false.
    assert!(threshold > 0.5 && threshold < 1.5, "threshold {}", threshold);
}
