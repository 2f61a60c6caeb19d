//! The session state machine.
//!
//! `INIT → DETECT → RESOLVE → FILL → VALIDATE → SUBMIT → COMPLETE`, with `RECOVER`
//! reachable from any failing phase and `FAILED` as the other terminal. The
//! orchestrator only reads [`SessionState`] and decides; the extractor, resolver,
//! filler and tab coordinator perform the side effects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FlowConfig;
use crate::extractor::PageModelExtractor;
use crate::filler::{PrecisionFiller, ResolutionMode};
use crate::page::{PageDriver, TabId, WaitCondition};
use crate::record::{AttemptRecord, NullRecordSink, PhaseRecord, ProvenanceCounts, RecordSink};
use crate::resolver::{AnswerSource, ResolverStats};
use crate::tabs::{SubFlowRunner, TabClass, TabCoordinator, TabOutcome, classify_url};
use crate::types::{Answer, FillOutcome, FillStatus, FillSummary, Question, QuestionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    Detect,
    Resolve,
    Fill,
    Validate,
    Submit,
    Recover,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }
}

/// Why a phase sent the session to RECOVER
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NoQuestionsDetected,
    LowFillRate,
    SubmitUnconfirmed,
    CoordinationTimeout,
    SessionTimeout,
    PageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Re-enter the failed phase after a short delay
    Retry,
    /// Reload the page and detect from scratch
    Reload,
    /// Drop the questions that failed and validate again
    Skip,
    /// Fill again with healing applied to every ambiguous selector
    ChangeApproach,
}

/// Which phases a session runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowPlan {
    /// The primary flow
    #[default]
    Full,
    /// A verification tab: detect the code field, fill it and submit
    Verification,
}

/// Everything the orchestrator decides on
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Uuid,
    pub plan: FlowPlan,
    pub phase: Phase,
    pub url: String,
    /// Executions per phase
    pub attempts: BTreeMap<Phase, u32>,
    /// Recoveries per failure reason
    pub recoveries: BTreeMap<FailureReason, u32>,
    pub recover_cycles: u32,
    /// Extractor pass; bumped on every DETECT
    pub pass: u64,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
    pub outcomes: Vec<FillOutcome>,
    /// Questions dropped by the skip strategy; excluded from detection and fill ratio
    pub skipped: BTreeSet<QuestionId>,
    pub mode: ResolutionMode,
    pub last_failure: Option<FailureReason>,
    /// Phase that failed, where a retry resumes
    pub resume: Option<Phase>,
    pub submit_confirmed: bool,
    pub history: Vec<PhaseRecord>,
    pub active_tabs: BTreeSet<TabId>,
    pub tab_outcomes: BTreeMap<TabId, TabOutcome>,
}

impl SessionState {
    pub fn new(plan: FlowPlan) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            plan,
            phase: Phase::Init,
            url: String::new(),
            attempts: BTreeMap::new(),
            recoveries: BTreeMap::new(),
            recover_cycles: 0,
            pass: 0,
            questions: Vec::new(),
            answers: Vec::new(),
            outcomes: Vec::new(),
            skipped: BTreeSet::new(),
            mode: ResolutionMode::default(),
            last_failure: None,
            resume: None,
            submit_confirmed: false,
            history: Vec::new(),
            active_tabs: BTreeSet::new(),
            tab_outcomes: BTreeMap::new(),
        }
    }

    pub fn attempts_of(&self, phase: Phase) -> u32 {
        self.attempts.get(&phase).copied().unwrap_or(0)
    }

    pub fn recoveries_of(&self, reason: FailureReason) -> u32 {
        self.recoveries.get(&reason).copied().unwrap_or(0)
    }

    /// Outcomes of the current pass for questions still in play
    pub fn current_outcomes(&self) -> impl Iterator<Item = &FillOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.pass == self.pass && !self.skipped.contains(&o.question_id))
    }

    pub fn fill_summary(&self) -> FillSummary {
        FillSummary::from_outcomes(self.current_outcomes())
    }

    /// Questions still needing a fill: not skipped, and not every field filled
    pub fn fill_targets(&self) -> Vec<Question> {
        self.questions
            .iter()
            .filter(|q| !self.skipped.contains(&q.id))
            .filter(|q| {
                let mut outcomes = self.current_outcomes().filter(|o| o.question_id == q.id).peekable();
                outcomes.peek().is_none() || outcomes.any(|o| o.status != FillStatus::Filled)
            })
            .cloned()
            .collect()
    }

    /// Replace the outcomes of refilled questions
    fn merge_outcomes(&mut self, refilled: &[Question], outcomes: Vec<FillOutcome>) {
        let ids: BTreeSet<&QuestionId> = refilled.iter().map(|q| &q.id).collect();
        let pass = self.pass;
        self.outcomes
            .retain(|o| o.pass != pass || !ids.contains(&o.question_id));
        self.outcomes.extend(outcomes);
    }

    /// Mark every question with a failed field as skipped
    fn skip_failing(&mut self) -> usize {
        let failing: Vec<QuestionId> = self
            .current_outcomes()
            .filter(|o| matches!(o.status, FillStatus::Failed(_)))
            .map(|o| o.question_id.clone())
            .collect();
        let before = self.skipped.len();
        self.skipped.extend(failing);
        self.skipped.len() - before
    }

    /// Forget everything learned from the page before a reload. A confirmed
    /// submission is never forgotten.
    fn reset_page(&mut self) {
        self.questions.clear();
        self.outcomes.clear();
    }
}

/// `Some(LowFillRate)` when the filled/(filled+failed) ratio is under `threshold`
pub fn evaluate_fill(summary: &FillSummary, threshold: f64) -> Option<FailureReason> {
    (summary.fill_ratio() < threshold).then_some(FailureReason::LowFillRate)
}

/// Pick a recovery for `reason`, or `None` when the session should fail
pub fn choose_strategy(
    state: &SessionState,
    reason: FailureReason,
    config: &FlowConfig,
) -> Option<RecoveryStrategy> {
    if state.recover_cycles >= config.max_recover_cycles {
        return None;
    }
    let seen = state.recoveries_of(reason);
    let strategy = match reason {
        FailureReason::SessionTimeout => return None,
        FailureReason::NoQuestionsDetected if seen == 0 => RecoveryStrategy::Retry,
        FailureReason::NoQuestionsDetected => RecoveryStrategy::Reload,
        FailureReason::LowFillRate => match seen {
            0 => RecoveryStrategy::ChangeApproach,
            1 => RecoveryStrategy::Skip,
            _ => RecoveryStrategy::Reload,
        },
        FailureReason::SubmitUnconfirmed | FailureReason::CoordinationTimeout => {
            RecoveryStrategy::Retry
        }
        FailureReason::PageError => RecoveryStrategy::Reload,
    };
    // After a confirmed submission the form is gone; only the tab wait may run again
    if state.submit_confirmed {
        return Some(RecoveryStrategy::Retry);
    }

    // A phase that keeps failing gets a fresh page instead
    let resume = state.resume.unwrap_or(Phase::Detect);
    if strategy == RecoveryStrategy::Retry && state.attempts_of(resume) >= config.max_phase_attempts {
        return Some(RecoveryStrategy::Reload);
    }
    Some(strategy)
}

/// Final account of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub url: String,
    pub plan: FlowPlan,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub fill: FillSummary,
    pub outcomes: Vec<FillOutcome>,
    pub answers: Vec<Answer>,
    pub provenance: ProvenanceCounts,
    pub recover_cycles: u32,
    pub history: Vec<PhaseRecord>,
    pub tabs: BTreeMap<TabId, TabOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverStats>,
    pub duration_ms: u64,
}

impl SessionReport {
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }
}

type Step = std::result::Result<Phase, FailureReason>;

pub struct FlowOrchestrator {
    page: Arc<dyn PageDriver>,
    answers: Arc<dyn AnswerSource>,
    extractor: PageModelExtractor,
    filler: PrecisionFiller,
    config: FlowConfig,
    tabs: Option<Arc<TabCoordinator>>,
    records: Arc<dyn RecordSink>,
    state: SessionState,
    /// First history entry of the current attempt
    attempt_start: usize,
}

impl FlowOrchestrator {
    pub fn new(page: Arc<dyn PageDriver>, answers: Arc<dyn AnswerSource>, config: FlowConfig) -> Self {
        let filler = PrecisionFiller::new(page.clone(), &config);
        Self {
            page,
            answers,
            extractor: PageModelExtractor::new(),
            filler,
            config,
            tabs: None,
            records: Arc::new(NullRecordSink),
            state: SessionState::new(FlowPlan::Full),
            attempt_start: 0,
        }
    }

    pub fn with_plan(mut self, plan: FlowPlan) -> Self {
        self.state.plan = plan;
        self
    }

    /// Coordinate the tabs the session opens
    pub fn with_tabs(mut self, tabs: Arc<TabCoordinator>) -> Self {
        self.tabs = Some(tabs);
        self
    }

    pub fn with_record_sink(mut self, records: Arc<dyn RecordSink>) -> Self {
        self.records = records;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drive the session to a terminal phase
    pub async fn run(&mut self) -> SessionReport {
        let started = Instant::now();
        let deadline = started + self.config.timeouts.session();
        info!(
            "Session {} started ({:?} plan)",
            self.state.session_id, self.state.plan
        );

        while !self.state.phase.is_terminal() {
            let phase = self.state.phase;
            let next = if phase == Phase::Recover {
                self.recover().await
            } else {
                *self.state.attempts.entry(phase).or_default() += 1;
                let step = match tokio::time::timeout_at(deadline, self.step(phase)).await {
                    Ok(Ok(step)) => step,
                    Ok(Err(e)) => {
                        warn!("Phase {:?} failed: {:#}", phase, e);
                        Err(FailureReason::PageError)
                    }
                    Err(_) => {
                        warn!("Session deadline passed during {:?}", phase);
                        Err(FailureReason::SessionTimeout)
                    }
                };
                self.record_phase(phase, step.err());
                match step {
                    Ok(next) => next,
                    Err(reason) => {
                        self.state.last_failure = Some(reason);
                        self.state.resume = Some(phase);
                        Phase::Recover
                    }
                }
            };
            debug!("{:?} -> {:?}", phase, next);
            self.state.phase = next;
        }

        self.finish(started).await
    }

    async fn step(&mut self, phase: Phase) -> Result<Step> {
        match phase {
            Phase::Init => self.init().await,
            Phase::Detect => self.detect().await,
            Phase::Resolve => self.resolve().await,
            Phase::Fill => self.fill().await,
            Phase::Validate => self.validate().await,
            Phase::Submit => self.submit().await,
            Phase::Recover | Phase::Complete | Phase::Failed => Ok(Ok(phase)),
        }
    }

    async fn init(&mut self) -> Result<Step> {
        let ready = self
            .page
            .wait_for(&WaitCondition::Ready, self.config.timeouts.page_ready())
            .await?;
        self.state.url = self.page.url().await?;
        if !ready {
            warn!("Page {} not ready", self.state.url);
            return Ok(Err(FailureReason::PageError));
        }
        if let Some(tabs) = &self.tabs {
            self.state.active_tabs = tabs.active_tabs();
        }
        Ok(Ok(Phase::Detect))
    }

    async fn detect(&mut self) -> Result<Step> {
        let detected = self.extractor.detect(self.page.as_ref()).await?;
        self.state.pass += 1;
        self.state.questions = detected
            .into_iter()
            .filter(|q| !self.state.skipped.contains(&q.id))
            .collect();
        info!(
            "Pass {}: {} question(s) detected",
            self.state.pass,
            self.state.questions.len()
        );

        if self.state.questions.is_empty() {
            return Ok(Err(FailureReason::NoQuestionsDetected));
        }
        Ok(Ok(match self.state.plan {
            FlowPlan::Full => Phase::Resolve,
            FlowPlan::Verification => Phase::Fill,
        }))
    }

    async fn resolve(&mut self) -> Result<Step> {
        self.resolve_pending().await;
        Ok(Ok(Phase::Fill))
    }

    /// Resolve every question that has no answer yet
    async fn resolve_pending(&mut self) {
        let answered: BTreeSet<&QuestionId> =
            self.state.answers.iter().map(|a| &a.question_id).collect();
        let pending: Vec<Question> = self
            .state
            .questions
            .iter()
            .filter(|q| !answered.contains(&q.id))
            .cloned()
            .collect();

        if !pending.is_empty() {
            let resolved = self.answers.resolve_all(&pending).await;
            debug!("Resolved {} answer(s)", resolved.len());
            self.state.answers.extend(resolved);
        }
    }

    async fn fill(&mut self) -> Result<Step> {
        if self.state.plan == FlowPlan::Verification {
            // Answers are resolved inline for the short verification flow
            self.resolve_pending().await;
        }

        let targets = self.state.fill_targets();
        let outcomes = self
            .filler
            .fill(&targets, &self.state.answers, self.state.pass, self.state.mode)
            .await;
        self.state.merge_outcomes(&targets, outcomes);

        Ok(Ok(match self.state.plan {
            FlowPlan::Full => Phase::Validate,
            FlowPlan::Verification => Phase::Submit,
        }))
    }

    async fn validate(&mut self) -> Result<Step> {
        if let Some(reason) = self.wait_for_tabs().await? {
            return Ok(Err(reason));
        }

        let summary = self.state.fill_summary();
        let ratio = summary.fill_ratio();
        if let Some(reason) = evaluate_fill(&summary, self.config.low_fill_threshold) {
            warn!(
                "Fill ratio {:.2} below threshold {:.2}",
                ratio, self.config.low_fill_threshold
            );
            return Ok(Err(reason));
        }
        info!("Fill ratio {:.2}, submitting", ratio);
        Ok(Ok(Phase::Submit))
    }

    async fn submit(&mut self) -> Result<Step> {
        if !self.state.submit_confirmed {
            let questions: Vec<Question> = self
                .state
                .questions
                .iter()
                .filter(|q| !self.state.skipped.contains(&q.id))
                .cloned()
                .collect();
            if !self.filler.submit(&questions).await? {
                return Ok(Err(FailureReason::SubmitUnconfirmed));
            }
            self.state.submit_confirmed = true;
        }

        if let Some(reason) = self.wait_for_tabs().await? {
            return Ok(Err(reason));
        }
        Ok(Ok(Phase::Complete))
    }

    /// Block on every tab the primary flow has to wait for
    async fn wait_for_tabs(&mut self) -> Result<Option<FailureReason>> {
        let Some(tabs) = self.tabs.clone() else {
            return Ok(None);
        };
        tabs.sweep().await.context("Failed to enumerate tabs")?;

        let mut failure = None;
        for context in tabs.blocking() {
            info!("Waiting for {:?} tab {}", context.class, context.tab);
            let outcome = tabs
                .await_tab(&context, self.config.timeouts.tab_wait())
                .await;
            let timed_out = outcome == TabOutcome::TimedOut;
            self.state.tab_outcomes.insert(context.tab.clone(), outcome);
            if timed_out {
                failure = Some(FailureReason::CoordinationTimeout);
                break;
            }
        }
        self.state.active_tabs = tabs.active_tabs();
        Ok(failure)
    }

    async fn recover(&mut self) -> Phase {
        let reason = self.state.last_failure.unwrap_or(FailureReason::PageError);
        let Some(strategy) = choose_strategy(&self.state, reason, &self.config) else {
            error!(
                "Giving up after {} recovery cycle(s): {:?}",
                self.state.recover_cycles, reason
            );
            return Phase::Failed;
        };

        self.emit_record(Some(reason), Some(strategy), None);
        self.state.recover_cycles += 1;
        *self.state.recoveries.entry(reason).or_default() += 1;
        info!(
            "Recovering from {:?} with {:?} (cycle {}/{})",
            reason, strategy, self.state.recover_cycles, self.config.max_recover_cycles
        );

        let resume = self.state.resume.unwrap_or(Phase::Detect);
        match strategy {
            RecoveryStrategy::Retry => {
                tokio::time::sleep(self.config.retry_delay()).await;
                resume
            }
            RecoveryStrategy::Reload => {
                if let Err(e) = self.reload().await {
                    warn!("Reload failed: {:#}", e);
                }
                Phase::Detect
            }
            RecoveryStrategy::Skip => {
                let dropped = self.state.skip_failing();
                info!("Skipping {} failing question(s)", dropped);
                Phase::Validate
            }
            RecoveryStrategy::ChangeApproach => {
                self.state.mode = ResolutionMode::HealerFirst;
                Phase::Fill
            }
        }
    }

    async fn reload(&mut self) -> Result<()> {
        self.page.reload().await.context("Failed to reload page")?;
        self.page
            .wait_for(&WaitCondition::Ready, self.config.timeouts.page_ready())
            .await?;
        self.state.reset_page();
        Ok(())
    }

    fn record_phase(&mut self, phase: Phase, failure: Option<FailureReason>) {
        self.state.history.push(PhaseRecord {
            phase,
            attempt: self.state.attempts_of(phase),
            failure,
            at: Utc::now(),
        });
    }

    fn emit_record(
        &mut self,
        failure: Option<FailureReason>,
        strategy: Option<RecoveryStrategy>,
        terminal: Option<Phase>,
    ) {
        let record = AttemptRecord {
            session_id: self.state.session_id,
            attempt: self.state.recover_cycles + 1,
            url: self.state.url.clone(),
            phases: self.state.history[self.attempt_start..].to_vec(),
            fill: self.state.fill_summary(),
            provenance: ProvenanceCounts::from_answers(&self.state.answers),
            failure,
            strategy,
            terminal,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.records.record(&record) {
            warn!("Failed to write attempt record: {:#}", e);
        }
        self.attempt_start = self.state.history.len();
    }

    async fn finish(&mut self, started: Instant) -> SessionReport {
        let phase = self.state.phase;
        let failure = (phase == Phase::Failed).then_some(self.state.last_failure).flatten();
        self.emit_record(failure, None, Some(phase));

        if let Ok(url) = self.page.url().await {
            self.state.url = url;
        }
        let duration = started.elapsed();
        match phase {
            Phase::Complete => info!("Session {} complete in {:?}", self.state.session_id, duration),
            _ => error!(
                "Session {} failed: {:?}",
                self.state.session_id, failure
            ),
        }

        SessionReport {
            session_id: self.state.session_id,
            url: self.state.url.clone(),
            plan: self.state.plan,
            phase,
            failure,
            fill: self.state.fill_summary(),
            outcomes: self.state.current_outcomes().cloned().collect(),
            answers: self.state.answers.clone(),
            provenance: ProvenanceCounts::from_answers(&self.state.answers),
            recover_cycles: self.state.recover_cycles,
            history: self.state.history.clone(),
            tabs: self.state.tab_outcomes.clone(),
            resolver: self.answers.resolver_stats(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Runs tab sub-flows: a verification-plan orchestrator for verification tabs, a
/// wait for the identity provider to hand back for OAuth tabs
pub struct SubFlowLauncher {
    answers: Arc<dyn AnswerSource>,
    config: FlowConfig,
    records: Arc<dyn RecordSink>,
}

impl SubFlowLauncher {
    pub fn new(answers: Arc<dyn AnswerSource>, config: FlowConfig, records: Arc<dyn RecordSink>) -> Self {
        Self {
            answers,
            config,
            records,
        }
    }

    async fn await_oauth(&self, page: &dyn PageDriver) -> TabOutcome {
        let wait = async {
            loop {
                match page.url().await {
                    Ok(url) if classify_url(&url) != Some(TabClass::Oauth) => {
                        return TabOutcome::Completed;
                    }
                    Ok(_) => tokio::time::sleep(Duration::from_millis(250)).await,
                    Err(_) => return TabOutcome::Closed,
                }
            }
        };
        tokio::time::timeout(self.config.timeouts.tab_wait(), wait)
            .await
            .unwrap_or(TabOutcome::TimedOut)
    }
}

#[async_trait]
impl SubFlowRunner for SubFlowLauncher {
    async fn run(&self, tab: TabId, class: TabClass, page: Arc<dyn PageDriver>) -> TabOutcome {
        match class {
            TabClass::Verification => {
                let mut config = self.config.clone();
                config.timeouts.session_ms = config.timeouts.tab_wait_ms;
                let mut flow = FlowOrchestrator::new(page, self.answers.clone(), config)
                    .with_plan(FlowPlan::Verification)
                    .with_record_sink(self.records.clone());
                let report = flow.run().await;
                debug!("Verification flow in tab {} ended in {:?}", tab, report.phase);
                match report.failure {
                    None if report.is_complete() => TabOutcome::Completed,
                    failure => TabOutcome::Failed(format!("verification flow failed: {:?}", failure)),
                }
            }
            TabClass::Oauth => self.await_oauth(page.as_ref()).await,
            TabClass::Primary | TabClass::Unclassified => TabOutcome::Ignored,
        }
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_test;
