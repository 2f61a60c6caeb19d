//! Reasoning service boundary and its HTTP client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::types::{Choice, Question, SemanticType};

/// Default answer confidence when the service does not report one
pub const DEFAULT_SERVICE_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("reasoning service timed out after {0:?}")]
    Timeout(Duration),
    #[error("reasoning service unreachable: {0}")]
    Transport(String),
    #[error("reasoning service returned status {0}")]
    Status(u16),
    #[error("malformed reasoning service response: {0}")]
    Malformed(String),
    #[error("'{value}' is not a valid {semantic_type} answer")]
    Unparsable {
        value: String,
        semantic_type: SemanticType,
    },
}

/// One question as the service sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: SemanticType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Choice>,
    pub required: bool,
}

impl ServiceRequest {
    pub fn from_question(question: &Question) -> Self {
        Self {
            id: question.id.to_string(),
            text: question.text.split_whitespace().collect::<Vec<_>>().join(" "),
            question_type: question.semantic_type,
            options: question.choices.clone(),
            required: true,
        }
    }
}

/// The service's raw answer; the value is parsed against the question type later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReply {
    pub value: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// External reasoning service answering one question at a time
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn answer(&self, request: &ServiceRequest) -> Result<ServiceReply, ServiceError>;
}

#[derive(Debug, Serialize)]
struct AnswerQuestionsRequest<'a> {
    questions: &'a [ServiceRequest],
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AnswerQuestionsResponse {
    answers: Vec<WireAnswer>,
}

#[derive(Debug, Deserialize)]
struct WireAnswer {
    question_id: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Client for the `/answer-questions` HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpReasoningService {
    client: reqwest::Client,
    base_url: Url,
    context: Option<String>,
}

impl HttpReasoningService {
    pub fn new(base_url: &str, context: Option<String>) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            context,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::Transport(e.to_string()))
    }

    /// Answer several questions in one request, in request order
    pub async fn answer_batch(
        &self,
        requests: &[ServiceRequest],
    ) -> Result<Vec<ServiceReply>, ServiceError> {
        let url = self.endpoint("answer-questions")?;
        debug!("POST {} with {} question(s)", url, requests.len());

        let response = self
            .client
            .post(url)
            .json(&AnswerQuestionsRequest {
                questions: requests,
                context: self.context.as_deref(),
            })
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status(status.as_u16()));
        }
        let body: AnswerQuestionsResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;

        requests
            .iter()
            .map(|request| {
                let answer = body
                    .answers
                    .iter()
                    .find(|a| a.question_id == request.id)
                    .ok_or_else(|| {
                        ServiceError::Malformed(format!("no answer for question {}", request.id))
                    })?;
                if answer.value.is_null() {
                    return Err(ServiceError::Malformed(format!(
                        "empty answer for question {}",
                        request.id
                    )));
                }
                Ok(ServiceReply {
                    value: answer.value.clone(),
                    confidence: answer.confidence,
                    reasoning: answer.reasoning.clone(),
                })
            })
            .collect()
    }

    /// Whether `/health` answers with a success status
    pub async fn health(&self) -> bool {
        let Ok(url) = self.endpoint("health") else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn answer(&self, request: &ServiceRequest) -> Result<ServiceReply, ServiceError> {
        let mut replies = self.answer_batch(std::slice::from_ref(request)).await?;
        replies
            .pop()
            .ok_or_else(|| ServiceError::Malformed("empty answer list".to_string()))
    }
}
