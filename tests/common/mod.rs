// Common test utilities and fixtures

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use formpilot::config::FlowConfig;
use formpilot::memory::DomBuilder;
use formpilot::page::DomSnapshot;
use formpilot::resolver::{
    AnswerResolver, CircuitBreaker, ReasoningService, SemanticCache, ServiceError, ServiceReply,
    ServiceRequest,
};
use formpilot::types::SemanticType;

/// Name, age and country, plus a submit button
#[allow(dead_code)]
pub fn signup_page() -> DomSnapshot {
    let mut b = DomBuilder::new("https://example.com/signup");
    let form = b.element(None, "form", &[("id", "signup")], "");
    b.element(Some(form), "label", &[("for", "name")], "Full name");
    b.element(Some(form), "input", &[("id", "name"), ("name", "name")], "");
    b.element(Some(form), "label", &[("for", "age")], "Age");
    b.element(
        Some(form),
        "input",
        &[("id", "age"), ("name", "age"), ("type", "number"), ("min", "18"), ("max", "99")],
        "",
    );
    b.element(Some(form), "label", &[("for", "country")], "Country");
    let select = b.element(Some(form), "select", &[("id", "country"), ("name", "country")], "");
    b.option(select, "fr", "France")
        .option(select, "de", "Germany")
        .option(select, "gb", "United Kingdom");
    b.element(Some(form), "button", &[("type", "submit")], "Sign up");
    b.build()
}

/// Name, country and a terms checkbox: short text, single choice and boolean
#[allow(dead_code)]
pub fn terms_page() -> DomSnapshot {
    let mut b = DomBuilder::new("https://example.com/join");
    let form = b.element(None, "form", &[("id", "join")], "");
    b.element(Some(form), "label", &[("for", "name")], "Full name");
    b.element(Some(form), "input", &[("id", "name"), ("name", "name")], "");
    b.element(Some(form), "label", &[("for", "country")], "Country");
    let select = b.element(Some(form), "select", &[("id", "country"), ("name", "country")], "");
    b.option(select, "fr", "France")
        .option(select, "de", "Germany")
        .option(select, "gb", "United Kingdom");
    b.element(Some(form), "label", &[("for", "terms")], "I agree to the terms of service");
    b.element(
        Some(form),
        "input",
        &[("id", "terms"), ("name", "terms"), ("type", "checkbox")],
        "",
    );
    b.element(Some(form), "button", &[("type", "submit")], "Join");
    b.build()
}

/// A one-field page asking for an emailed code
#[allow(dead_code)]
pub fn verification_page() -> DomSnapshot {
    let mut b = DomBuilder::new("https://example.com/verify?token=abc");
    let form = b.element(None, "form", &[("id", "verify")], "");
    b.element(Some(form), "label", &[("for", "code")], "Verification code");
    b.element(
        Some(form),
        "input",
        &[("id", "code"), ("name", "code"), ("autocomplete", "one-time-code")],
        "",
    );
    b.element(Some(form), "button", &[("type", "submit")], "Verify");
    b.build()
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StubMode {
    /// Plausible answers for every question type
    Valid,
    /// Never replies
    Hang,
}

/// In-process reasoning service
#[allow(dead_code)]
pub struct StubService {
    mode: StubMode,
    calls: AtomicUsize,
}

impl StubService {
    #[allow(dead_code)]
    pub fn new(mode: StubMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningService for StubService {
    async fn answer(&self, request: &ServiceRequest) -> Result<ServiceReply, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.mode == StubMode::Hang {
            std::future::pending::<()>().await;
        }
        Ok(ServiceReply {
            value: stub_value(request),
            confidence: Some(0.9),
            reasoning: Some("stub".to_string()),
        })
    }
}

/// The answer the stub gives for a request
pub fn stub_value(request: &ServiceRequest) -> serde_json::Value {
    match request.question_type {
        SemanticType::Numeric => serde_json::json!("I am 36 years old"),
        SemanticType::SingleChoice | SemanticType::MultiChoice => request
            .options
            .get(1)
            .or_else(|| request.options.first())
            .map(|o| serde_json::json!(o.label))
            .unwrap_or(serde_json::Value::Null),
        SemanticType::Boolean => serde_json::json!("yes"),
        SemanticType::Date => serde_json::json!("1984-07-01"),
        _ => serde_json::json!("Ada Lovelace"),
    }
}

/// Timeouts short enough for paused-clock tests
pub fn test_config() -> FlowConfig {
    let mut config = FlowConfig::default();
    config.timeouts.service_call_ms = 1_000;
    config.timeouts.submit_wait_ms = 2_000;
    config.timeouts.tab_wait_ms = 20_000;
    config.retry_delay_ms = 100;
    config
}

#[allow(dead_code)]
pub fn resolver(service: Arc<dyn ReasoningService>, config: &FlowConfig) -> Arc<AnswerResolver> {
    Arc::new(AnswerResolver::new(
        service,
        Arc::new(SemanticCache::new()),
        Arc::new(CircuitBreaker::new(config.breaker.clone())),
        config,
    ))
}
