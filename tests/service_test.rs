// HTTP reasoning client against a stub service

use axum::{Json, Router, http::StatusCode, routing::get, routing::post};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

mod common;
use common::{signup_page, test_config};

use formpilot::extractor::detect_questions;
use formpilot::resolver::{
    AnswerResolver, AnswerSource, CircuitBreaker, HttpReasoningService, ReasoningService,
    SemanticCache, ServiceError, ServiceRequest,
};
use formpilot::types::{AnswerValue, Provenance};

/// Serve `app` on an ephemeral port and return its base URL
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Answers every question from its type; remembers the request bodies
fn answering_app(seen: Arc<Mutex<Vec<Value>>>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/answer-questions",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(body.clone());
                    let questions: Vec<ServiceRequest> =
                        serde_json::from_value(body["questions"].clone()).unwrap();
                    let answers: Vec<Value> = questions
                        .iter()
                        .map(|q| {
                            json!({
                                "question_id": q.id,
                                "value": common::stub_value(q),
                                "confidence": 0.8,
                                "reasoning": "stub"
                            })
                        })
                        .collect();
                    Json(json!({ "answers": answers }))
                }
            }),
        )
}

#[tokio::test]
async fn test_answers_round_trip_over_http() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = serve(answering_app(seen.clone())).await;
    let service = HttpReasoningService::new(&base, Some("a retired teacher".to_string())).unwrap();
    assert!(service.health().await);

    let questions = detect_questions(&signup_page());
    let requests: Vec<ServiceRequest> = questions.iter().map(ServiceRequest::from_question).collect();
    let replies = service.answer_batch(&requests).await.unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].value, json!("Ada Lovelace"));
    assert_eq!(replies[2].value, json!("Germany"));
    assert_eq!(replies[1].confidence, Some(0.8));

    let body = &seen.lock().await[0];
    assert_eq!(body["context"], json!("a retired teacher"));
    assert_eq!(body["questions"][1]["type"], json!("numeric"));
    assert_eq!(body["questions"][2]["options"][0]["value"], json!("fr"));
}

#[tokio::test]
async fn test_resolver_caches_http_answers() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = serve(answering_app(seen.clone())).await;
    let config = test_config();
    let resolver = AnswerResolver::new(
        Arc::new(HttpReasoningService::new(&base, None).unwrap()),
        Arc::new(SemanticCache::new()),
        Arc::new(CircuitBreaker::new(config.breaker.clone())),
        &config,
    );

    let questions = detect_questions(&signup_page());
    let first = resolver.resolve_all(&questions).await;
    let second = resolver.resolve_all(&questions).await;

    assert!(first.iter().all(|a| a.provenance == Provenance::Service));
    assert!(second.iter().all(|a| a.provenance == Provenance::Cache));
    assert_eq!(first[1].value, AnswerValue::Number(36.0));
    assert_eq!(first[2].value, AnswerValue::Choice("de".to_string()));
    assert_eq!(seen.lock().await.len(), 3);
    assert_eq!(resolver.stats().cache_hits, 3);
}

#[tokio::test]
async fn test_error_status_and_missing_answers() {
    let failing = Router::new().route(
        "/answer-questions",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base = serve(failing).await;
    let service = HttpReasoningService::new(&base, None).unwrap();
    let request = ServiceRequest::from_question(&detect_questions(&signup_page())[0]);

    let err = service.answer(&request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Status(500)));
    assert!(!service.health().await);

    let empty = Router::new().route(
        "/answer-questions",
        post(|| async { Json(json!({ "answers": [] })) }),
    );
    let base = serve(empty).await;
    let service = HttpReasoningService::new(&base, None).unwrap();
    let err = service.answer(&request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Malformed(_)));
}

#[tokio::test]
async fn test_unreachable_service_is_a_transport_error() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let service = HttpReasoningService::new(&format!("http://{}", addr), None).unwrap();
    let request = ServiceRequest::from_question(&detect_questions(&signup_page())[0]);
    let err = service.answer(&request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Transport(_)));
}
