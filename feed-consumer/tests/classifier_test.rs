mod common;

use common::init_tracing;
use feed_consumer::{Classifier, ClassifierConfig, ClassifierEndpoint, ClassifyError, HttpClassifier, NeedItem};
use serde_json::json;
use std::time::{Duration, Instant};
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn classifier_for(base: &str, max_retries: u32) -> HttpClassifier {
    let endpoint = |route: &str, key: &str| ClassifierEndpoint {
        url: Url::parse(&format!("{base}/{route}")).unwrap(),
        api_key: key.to_string(),
    };
    let mut config = ClassifierConfig::new(endpoint("intent", "intent-key"), endpoint("needs", "needs-key"));
    config.max_retries = max_retries;
    config.retry_delay_ms = 1;
    HttpClassifier::new(config).unwrap()
}

#[tokio::test]
async fn intent_request_carries_bearer_and_plain_input() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .and(header("authorization", "Bearer intent-key"))
        .and(body_json(json!({"inputs": "ekmek lazim"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[
            {"label": "Lojistik", "score": 0.82},
            {"label": "Barinma", "score": 0.30},
            {"label": "Saglik", "score": 0.45}
        ]])))
        .expect(1)
        .mount(&server)
        .await;

    let labels = classifier_for(&server.uri(), 0).classify_intent("ekmek lazim").await;
    assert_eq!(labels, Ok("lojistik,saglik".to_string()));
}

#[tokio::test]
async fn needs_request_wraps_input_in_list() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/needs"))
        .and(header("authorization", "Bearer needs-key"))
        .and(body_json(json!({"inputs": ["ekmek lazim"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": [{"processed": {"detailed_intent_tags": ["Yemek", "Su"]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let needs = classifier_for(&server.uri(), 0).extract_needs("ekmek lazim").await;
    assert_eq!(
        needs,
        Ok(vec![
            NeedItem { label: "yemek".into(), status: true },
            NeedItem { label: "su".into(), status: true },
        ])
    );
}

#[tokio::test]
async fn confident_irrelevant_verdict_is_reported() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[{"label": "Alakasiz", "score": 0.95}]])))
        .mount(&server)
        .await;

    let result = classifier_for(&server.uri(), 0).classify_intent("maç sonucu").await;
    assert_eq!(result, Err(ClassifyError::Irrelevant { score: 0.95 }));
}

#[tokio::test]
async fn server_errors_are_retried_then_reported() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let result = classifier_for(&server.uri(), 2).classify_intent("ekmek").await;
    assert!(matches!(result, Err(ClassifyError::Transient(_))));
}

#[tokio::test]
async fn recovers_after_rate_limit() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[{"label": "Enkaz", "score": 0.9}]])))
        .expect(1)
        .mount(&server)
        .await;

    let result = classifier_for(&server.uri(), 2).classify_intent("enkaz altinda").await;
    assert_eq!(result, Ok("enkaz".to_string()));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/needs"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let result = classifier_for(&server.uri(), 3).extract_needs("ekmek").await;
    assert!(matches!(result, Err(ClassifyError::Transient(_))));
}

#[tokio::test]
async fn undecodable_body_is_transient() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let result = classifier_for(&server.uri(), 2).classify_intent("ekmek").await;
    assert!(matches!(result, Err(ClassifyError::Transient(_))));
}

#[tokio::test]
async fn empty_responses_are_not_errors() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/needs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": []})))
        .mount(&server)
        .await;

    let classifier = classifier_for(&server.uri(), 0);
    assert_eq!(classifier.classify_intent("ekmek").await, Ok(String::new()));
    assert_eq!(classifier.extract_needs("ekmek").await, Ok(Vec::new()));
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    init_tracing();
    let server = MockServer::start().await;
    let base = server.uri();
    drop(server);

    let result = classifier_for(&base, 1).classify_intent("ekmek").await;
    assert!(matches!(result, Err(ClassifyError::Transient(_))));
}

#[tokio::test]
async fn retries_stay_within_call_deadline() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intent"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([[{"label": "Lojistik", "score": 0.9}]]))
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;

    let endpoint = |route: &str| ClassifierEndpoint {
        url: Url::parse(&format!("{}/{route}", server.uri())).unwrap(),
        api_key: "key".to_string(),
    };
    let mut config = ClassifierConfig::new(endpoint("intent"), endpoint("needs"));
    config.timeout_seconds = 1;
    config.retry_delay_ms = 1;
    let classifier = HttpClassifier::new(config).unwrap();

    let started = Instant::now();
    let result = classifier.classify_intent("ekmek").await;

    assert!(matches!(result, Err(ClassifyError::Transient(_))));
    assert!(started.elapsed() < Duration::from_millis(1800), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn malformed_request_is_not_retried() {
    init_tracing();
    let endpoint = |route: &str| ClassifierEndpoint {
        url: Url::parse(&format!("ftp://127.0.0.1/{route}")).unwrap(),
        api_key: "key".to_string(),
    };
    let mut config = ClassifierConfig::new(endpoint("intent"), endpoint("needs"));
    config.max_retries = 3;
    config.retry_delay_ms = 2_000;
    let classifier = HttpClassifier::new(config).unwrap();

    let started = Instant::now();
    let result = classifier.extract_needs("ekmek").await;

    assert!(matches!(result, Err(ClassifyError::Transient(_))));
    assert!(started.elapsed() < Duration::from_millis(800), "took {:?}", started.elapsed());
}
