use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::commands::utils;
use formpilot::config::FlowConfig;
use formpilot::errors::FormpilotError;
use formpilot::orchestrator::{FlowOrchestrator, SessionReport, SubFlowLauncher};
use formpilot::page::{BrowserSession, TabId};
use formpilot::record::{JsonlRecordSink, NullRecordSink, RecordSink};
use formpilot::resolver::{
    AnswerResolver, AnswerSource, CircuitBreaker, HttpReasoningService, SemanticCache,
};
use formpilot::tabs::{CodeAnswers, StaticCodeSource, TabCoordinator};
use formpilot::webdriver::WebDriverBrowser;

pub struct RunOptions {
    pub url: String,
    pub browser: String,
    pub webdriver_url: Option<String>,
    pub no_headless: bool,
    pub config: Option<PathBuf>,
    pub service_url: Option<String>,
    pub records: Option<PathBuf>,
    pub context: Option<String>,
    pub verification_code: Option<String>,
    pub humanize: bool,
}

pub async fn handle_run(options: RunOptions) -> Result<()> {
    let mut config = utils::load_config(
        options.config.as_deref(),
        options.service_url.clone(),
        options.context.clone(),
    )?;
    if options.humanize {
        config.shaping.enabled = true;
    }

    let (browser, primary) = utils::open_browser(
        &options.browser,
        options.webdriver_url.as_deref(),
        options.no_headless,
        &options.url,
    )
    .await?;

    let result = run_session(&browser, &primary, config, &options).await;
    if let Err(e) = browser.close().await {
        debug!("Failed to close browser: {}", e);
    }
    let report = result?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    match FormpilotError::from_report(&report) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn run_session(
    browser: &WebDriverBrowser,
    primary: &TabId,
    config: FlowConfig,
    options: &RunOptions,
) -> Result<SessionReport> {
    let session: Arc<dyn BrowserSession> = Arc::new(browser.clone());
    let page = session.page(primary).await?;

    let cache_path = utils::cache_path()?;
    let cache = Arc::new(SemanticCache::load(&cache_path)?);
    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let service = Arc::new(HttpReasoningService::new(
        &config.service_url,
        config.context.clone(),
    )?);
    if !service.health().await {
        warn!(
            "Reasoning service at {} is not healthy, answers will fall back",
            config.service_url
        );
    }
    let resolver: Arc<dyn AnswerSource> =
        Arc::new(AnswerResolver::new(service, cache.clone(), breaker, &config));

    let records: Arc<dyn RecordSink> = match &options.records {
        Some(path) => Arc::new(JsonlRecordSink::open(path)?),
        None => Arc::new(NullRecordSink),
    };

    // Verification tabs share the resolver, so cache and breaker state are shared too
    let verification_answers: Arc<dyn AnswerSource> = Arc::new(CodeAnswers::new(
        Arc::new(StaticCodeSource(options.verification_code.clone())),
        resolver.clone(),
    ));
    let launcher = Arc::new(SubFlowLauncher::new(
        verification_answers,
        config.clone(),
        records.clone(),
    ));
    let tabs = Arc::new(TabCoordinator::new(session, launcher, primary.clone()));

    info!("Starting session on {}", options.url);
    let mut flow = FlowOrchestrator::new(page, resolver, config)
        .with_tabs(tabs.clone())
        .with_record_sink(records);
    let report = flow.run().await;
    tabs.shutdown();

    if let Err(e) = cache.save(&cache_path) {
        warn!("Failed to save answer cache: {:#}", e);
    }
    Ok(report)
}
