//! Answer resolution: semantic cache, then the reasoning service behind a circuit
//! breaker, with deterministic fallbacks whenever the service cannot answer.

pub mod breaker;
pub mod cache;
pub mod fallback;
pub mod parse;
pub mod service;
pub mod shaping;

pub use breaker::{BreakerPermit, BreakerState, BreakerStats, CircuitBreaker};
pub use cache::{CachedAnswer, SemanticCache};
pub use fallback::{FALLBACK_CONFIDENCE, fallback_answer, fallback_value};
pub use parse::parse_value;
pub use service::{
    DEFAULT_SERVICE_CONFIDENCE, HttpReasoningService, ReasoningService, ServiceError,
    ServiceReply, ServiceRequest,
};
pub use shaping::humanize;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{FlowConfig, ShapingConfig};
use crate::types::{Answer, Provenance, Question};

/// Anything that can answer questions
#[async_trait]
pub trait AnswerSource: Send + Sync {
    async fn resolve(&self, question: &Question) -> Answer;

    /// Resolve concurrently; answers come back in question order
    async fn resolve_all(&self, questions: &[Question]) -> Vec<Answer> {
        futures::future::join_all(questions.iter().map(|q| self.resolve(q))).await
    }

    /// Counters, for sources that keep them
    fn resolver_stats(&self) -> Option<ResolverStats> {
        None
    }
}

/// Resolver counters, included in session reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub service_calls: u64,
    pub service_failures: u64,
    pub fallbacks: u64,
    pub breaker_trips: u64,
    pub breaker_rejections: u64,
    /// Estimated spend on answered service calls
    pub total_cost: f64,
    pub avg_cost_per_call: f64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    service_calls: AtomicU64,
    service_failures: AtomicU64,
    fallbacks: AtomicU64,
    /// Calls the service replied to, whether or not the reply parsed
    billed_calls: AtomicU64,
}

/// Resolves answers through cache, service and fallback.
///
/// The cache and breaker are shared objects so that tab sub-flows resolving in
/// parallel see the same state.
pub struct AnswerResolver {
    service: Arc<dyn ReasoningService>,
    cache: Arc<SemanticCache>,
    breaker: Arc<CircuitBreaker>,
    pool: Semaphore,
    call_timeout: Duration,
    shaping: ShapingConfig,
    cost_per_call: f64,
    counters: Counters,
}

impl AnswerResolver {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        cache: Arc<SemanticCache>,
        breaker: Arc<CircuitBreaker>,
        config: &FlowConfig,
    ) -> Self {
        Self {
            service,
            cache,
            breaker,
            pool: Semaphore::new(config.max_concurrent_calls.max(1)),
            call_timeout: config.timeouts.service_call(),
            shaping: config.shaping.clone(),
            cost_per_call: config.cost_per_call,
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn stats(&self) -> ResolverStats {
        let breaker = self.breaker.stats();
        let service_calls = self.counters.service_calls.load(Ordering::Relaxed);
        let total_cost =
            self.counters.billed_calls.load(Ordering::Relaxed) as f64 * self.cost_per_call;
        ResolverStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            service_calls,
            service_failures: self.counters.service_failures.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            breaker_trips: breaker.trips,
            breaker_rejections: breaker.rejections,
            total_cost,
            avg_cost_per_call: total_cost / service_calls.max(1) as f64,
        }
    }

    fn from_cache(&self, question: &Question, key: &str) -> Option<Answer> {
        let hit = self.cache.get(key)?;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!("Cache hit for question {}", question.id);
        Some(Answer {
            question_id: question.id.clone(),
            value: hit.value,
            provenance: Provenance::Cache,
            confidence: hit.confidence,
            reasoning: hit.reasoning,
        })
    }

    fn fallback(&self, question: &Question, cause: &str) -> Answer {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        humanize(fallback_answer(question, cause), question, &self.shaping)
    }

    async fn call_service(&self, question: &Question) -> Result<(Answer, CachedAnswer), ServiceError> {
        let request = ServiceRequest::from_question(question);
        let reply = tokio::time::timeout(self.call_timeout, self.service.answer(&request))
            .await
            .map_err(|_| ServiceError::Timeout(self.call_timeout))??;
        self.counters.billed_calls.fetch_add(1, Ordering::Relaxed);

        let value = parse_value(question, &reply.value)?;
        let confidence = reply
            .confidence
            .unwrap_or(DEFAULT_SERVICE_CONFIDENCE)
            .clamp(0.0, 1.0);
        let answer = Answer {
            question_id: question.id.clone(),
            value,
            provenance: Provenance::Service,
            confidence,
            reasoning: reply.reasoning,
        };
        // The cache stores the shaped answer so repeated questions read the same
        let answer = humanize(answer, question, &self.shaping);
        let cached = CachedAnswer {
            value: answer.value.clone(),
            confidence: answer.confidence,
            reasoning: answer.reasoning.clone(),
            stored_at: Utc::now(),
        };
        Ok((answer, cached))
    }
}

#[async_trait]
impl AnswerSource for AnswerResolver {
    async fn resolve(&self, question: &Question) -> Answer {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let key = question.cache_key();
        if let Some(answer) = self.from_cache(question, &key) {
            return answer;
        }

        // Short-circuited requests do not queue behind in-flight calls
        if self.breaker.rejects() {
            debug!("Breaker open, falling back for question {}", question.id);
            return self.fallback(question, "circuit breaker open");
        }

        let Ok(_slot) = self.pool.acquire().await else {
            return self.fallback(question, "resolver pool closed");
        };
        // Another resolution may have answered the same question while this one queued
        if let Some(answer) = self.from_cache(question, &key) {
            return answer;
        }

        let Some(permit) = self.breaker.try_acquire() else {
            debug!("Breaker open, falling back for question {}", question.id);
            return self.fallback(question, "circuit breaker open");
        };

        self.counters.service_calls.fetch_add(1, Ordering::Relaxed);
        match self.call_service(question).await {
            Ok((answer, cached)) => {
                permit.succeed();
                self.cache.insert(key, cached);
                answer
            }
            Err(e) => {
                permit.fail();
                self.counters.service_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Resolution failed for question {}: {}", question.id, e);
                self.fallback(question, &e.to_string())
            }
        }
    }

    fn resolver_stats(&self) -> Option<ResolverStats> {
        Some(self.stats())
    }
}
