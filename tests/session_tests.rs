//! HTTP capability tests against a local mock server.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stampede::config::RunnerConfig;
use stampede::context::{Capabilities, Context, IdData};
use stampede::errors::JourneyError;
use stampede::messages::MemorySink;
use stampede::session::SessionPool;

fn http_context(sink: Arc<MemorySink>) -> Context {
    Context::new(
        sink,
        RunnerConfig::new(),
        IdData {
            test: "http-test".to_string(),
            runner_id: 1,
            journey: "j".to_string(),
            context_id: 1,
            scenario_id: 1,
            data_id: None,
        },
        Arc::new(AtomicBool::new(false)),
        Capabilities {
            http: Some(SessionPool::new(10, Duration::from_secs(5))),
        },
        false,
    )
}

#[tokio::test]
async fn get_emits_curl_style_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let ctx = http_context(sink.clone());
    let session = ctx.http().unwrap().acquire().await.unwrap();

    let response = session
        .get(&ctx, &format!("{}/ok", server.uri()))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hello");
    response.expect_status(200).unwrap();

    let messages = sink.drain();
    assert_eq!(messages.len(), 1);
    let metrics = &messages[0];
    assert_eq!(metrics.kind, "http_curl_metrics");
    assert_eq!(metrics.fields["response_code"], 200);
    assert_eq!(metrics.fields["method"], "GET");
    assert!(metrics.fields["effective_url"]
        .as_str()
        .unwrap()
        .ends_with("/ok"));
    assert!(metrics.fields["start_time"].as_f64().unwrap() > 0.0);
    let first_byte = metrics.fields["first_byte_time"].as_f64().unwrap();
    let total = metrics.fields["total_time"].as_f64().unwrap();
    assert!(first_byte >= 0.0);
    assert!(total >= first_byte);
    assert_eq!(metrics.test, "http-test");
}

#[tokio::test]
async fn unexpected_status_becomes_a_domain_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fail"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let ctx = http_context(sink.clone());
    let session = ctx.http().unwrap().acquire().await.unwrap();

    let response = session
        .get(&ctx, &format!("{}/fail", server.uri()))
        .await
        .unwrap();
    match response.expect_status(200) {
        Err(JourneyError::Error { fields, .. }) => {
            assert_eq!(fields["status_code"], 500);
            assert_eq!(fields["body"], "boom");
        }
        other => panic!("expected domain error, got {:?}", other),
    }

    // The metrics frame is emitted regardless of status.
    assert_eq!(sink.count_kind("http_curl_metrics"), 1);
}

#[tokio::test]
async fn transaction_reports_http_domain_error_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fail"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let ctx = http_context(sink.clone());
    let url = format!("{}/fail", server.uri());

    let result: Result<(), JourneyError> = ctx
        .transaction("checkout", async {
            let session = ctx.http()?.acquire().await?;
            let response = session.get(&ctx, &url).await?;
            response.expect_status(200)?;
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(JourneyError::Handled)));

    let kinds: Vec<String> = sink.drain().into_iter().map(|m| m.kind).collect();
    assert_eq!(kinds, vec!["start", "http_curl_metrics", "error", "end"]);
}
