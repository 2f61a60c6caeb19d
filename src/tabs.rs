//! Coordination of browser tabs spawned during a session.
//!
//! Every tab gets a [`TabContext`]. Verification and OAuth tabs run their own
//! sub-flow concurrently with the primary flow and publish exactly one
//! [`TabOutcome`] through a watch channel; the primary flow may block on that
//! signal with a timeout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::extractor::{associated_text, control_kind, is_usable_control};
use crate::page::{BrowserSession, DomSnapshot, PageDriver, TabId};
use crate::resolver::AnswerSource;
use crate::types::{Answer, AnswerValue, ElementKind, Provenance, Question, SemanticType, normalize_text};

/// Hosts that only serve sign-in and consent pages
const IDENTITY_PROVIDER_HOSTS: &[&str] = &[
    "accounts.google.com",
    "login.microsoftonline.com",
    "login.live.com",
    "appleid.apple.com",
    "github.com/login/oauth",
    "www.facebook.com/dialog/oauth",
    "api.twitter.com/oauth",
    "twitter.com/i/oauth2",
];

/// Words marking a one-time code field
const CODE_WORDS: &[&str] = &["code", "otp", "one-time", "verification", "pin", "passcode"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TabClass {
    Primary,
    Verification,
    Oauth,
    Unclassified,
}

impl TabClass {
    /// Whether the primary flow waits for this kind of tab
    pub fn blocks_primary(&self) -> bool {
        matches!(self, TabClass::Verification | TabClass::Oauth)
    }
}

/// How a tab's sub-flow ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum TabOutcome {
    Completed,
    Failed(String),
    /// Not a tab the session cares about
    Ignored,
    Closed,
    TimedOut,
}

/// One open tab and its completion signal
#[derive(Debug, Clone)]
pub struct TabContext {
    pub tab: TabId,
    pub class: TabClass,
    outcome: watch::Receiver<Option<TabOutcome>>,
}

impl TabContext {
    /// The outcome, once the sub-flow has reported
    pub fn outcome(&self) -> Option<TabOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

/// Runs the restricted flow of a classified tab
#[async_trait]
pub trait SubFlowRunner: Send + Sync {
    async fn run(&self, tab: TabId, class: TabClass, page: Arc<dyn PageDriver>) -> TabOutcome;
}

/// Supplies verification codes (e.g. read from an inbox by another component)
#[async_trait]
pub trait CodeSource: Send + Sync {
    async fn code(&self, question: &Question) -> Option<String>;
}

/// A fixed code, or none
#[derive(Debug, Clone, Default)]
pub struct StaticCodeSource(pub Option<String>);

#[async_trait]
impl CodeSource for StaticCodeSource {
    async fn code(&self, _question: &Question) -> Option<String> {
        self.0.clone()
    }
}

/// Whether a question asks for a one-time code
pub fn is_code_question(question: &Question) -> bool {
    let text = normalize_text(&question.text);
    matches!(
        question.semantic_type,
        SemanticType::ShortText | SemanticType::Numeric | SemanticType::Unknown
    ) && CODE_WORDS.iter().any(|w| text.contains(w))
}

/// Answers code questions from a [`CodeSource`], everything else from a delegate
pub struct CodeAnswers {
    source: Arc<dyn CodeSource>,
    delegate: Arc<dyn AnswerSource>,
}

impl CodeAnswers {
    pub fn new(source: Arc<dyn CodeSource>, delegate: Arc<dyn AnswerSource>) -> Self {
        Self { source, delegate }
    }
}

#[async_trait]
impl AnswerSource for CodeAnswers {
    async fn resolve(&self, question: &Question) -> Answer {
        if is_code_question(question)
            && let Some(code) = self.source.code(question).await
        {
            return Answer {
                question_id: question.id.clone(),
                value: AnswerValue::Text(code),
                provenance: Provenance::Collaborator,
                confidence: 1.0,
                reasoning: Some("supplied by verification code source".to_string()),
            };
        }
        self.delegate.resolve(question).await
    }

    fn resolver_stats(&self) -> Option<crate::resolver::ResolverStats> {
        self.delegate.resolver_stats()
    }
}

/// OAuth when the URL belongs to a known identity provider or carries an
/// authorization request
pub fn classify_url(url: &str) -> Option<TabClass> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let location = format!("{}{}", host, parsed.path().to_lowercase());
    if IDENTITY_PROVIDER_HOSTS.iter().any(|p| location.starts_with(p)) {
        return Some(TabClass::Oauth);
    }
    let authorizing = parsed
        .query_pairs()
        .any(|(k, _)| k == "client_id" || k == "redirect_uri");
    let oauth_path = ["oauth", "authorize"].iter().any(|p| location.contains(p));
    (authorizing && oauth_path).then_some(TabClass::Oauth)
}

/// Verification when the document asks for a one-time code, or for an email
/// address alongside verification wording
pub fn classify_dom(dom: &DomSnapshot) -> Option<TabClass> {
    let controls: Vec<usize> = (0..dom.len())
        .filter(|&i| control_kind(dom, i) == Some(ElementKind::Text) && is_usable_control(dom, i))
        .collect();

    let has_code_input = controls.iter().any(|&i| {
        let node = dom.node(i);
        if node.attr("autocomplete") == Some("one-time-code") {
            return true;
        }
        let described = [node.attr("name"), node.attr("id"), node.attr("placeholder")]
            .into_iter()
            .flatten()
            .map(str::to_lowercase)
            .chain(associated_text(dom, i).map(|t| t.to_lowercase()))
            .collect::<Vec<_>>();
        described
            .iter()
            .any(|d| CODE_WORDS.iter().any(|w| d.contains(w)))
    });
    if has_code_input {
        return Some(TabClass::Verification);
    }

    let has_email_input = controls
        .iter()
        .any(|&i| dom.node(i).input_type() == "email");
    let text = dom.visible_text();
    (has_email_input && (text.contains("verify") || text.contains("verification")))
        .then_some(TabClass::Verification)
}

/// Tracks every tab of a session and the sub-flows running in them
pub struct TabCoordinator {
    browser: Arc<dyn BrowserSession>,
    runner: Arc<dyn SubFlowRunner>,
    primary: TabId,
    contexts: DashMap<TabId, TabContext>,
    abandoned: DashSet<TabId>,
    /// Running sub-flows by tab
    tasks: DashMap<TabId, JoinHandle<()>>,
}

impl TabCoordinator {
    pub fn new(browser: Arc<dyn BrowserSession>, runner: Arc<dyn SubFlowRunner>, primary: TabId) -> Self {
        let (tx, rx) = watch::channel(None);
        drop(tx);
        let contexts = DashMap::new();
        contexts.insert(
            primary.clone(),
            TabContext {
                tab: primary.clone(),
                class: TabClass::Primary,
                outcome: rx,
            },
        );
        Self {
            browser,
            runner,
            primary,
            contexts,
            abandoned: DashSet::new(),
            tasks: DashMap::new(),
        }
    }

    pub fn primary(&self) -> &TabId {
        &self.primary
    }

    /// Classify a tab by URL first, then by its initial document
    pub async fn classify(&self, tab: &TabId) -> Result<TabClass> {
        if *tab == self.primary {
            return Ok(TabClass::Primary);
        }
        let page = self.browser.page(tab).await?;
        let url = page.url().await?;
        if let Some(class) = classify_url(&url) {
            return Ok(class);
        }
        let dom = page
            .snapshot()
            .await
            .with_context(|| format!("Failed to snapshot tab {}", tab))?;
        Ok(classify_dom(&dom).unwrap_or(TabClass::Unclassified))
    }

    /// Register a new tab and start its sub-flow
    pub async fn on_tab_opened(&self, tab: &TabId) -> Result<TabContext> {
        if let Some(existing) = self.contexts.get(tab) {
            return Ok(existing.clone());
        }

        let class = self.classify(tab).await?;
        let (tx, rx) = watch::channel(None);
        let context = TabContext {
            tab: tab.clone(),
            class,
            outcome: rx,
        };
        info!("Tab {} opened, classified as {:?}", tab, class);

        if class.blocks_primary() {
            let page = self.browser.page(tab).await?;
            let runner = self.runner.clone();
            let tab_id = tab.clone();
            let handle = tokio::spawn(async move {
                let outcome = runner.run(tab_id.clone(), class, page).await;
                info!("Tab {} sub-flow finished: {:?}", tab_id, outcome);
                // Single write; receivers may already be gone
                let _ = tx.send(Some(outcome));
            });
            self.tasks.insert(tab.clone(), handle);
        } else {
            let _ = tx.send(Some(TabOutcome::Ignored));
        }

        self.contexts.insert(tab.clone(), context.clone());
        Ok(context)
    }

    /// Track a tab as unclassified and already settled
    fn ignore(&self, tab: &TabId) -> TabContext {
        let (tx, rx) = watch::channel(Some(TabOutcome::Ignored));
        drop(tx);
        let context = TabContext {
            tab: tab.clone(),
            class: TabClass::Unclassified,
            outcome: rx,
        };
        self.contexts.insert(tab.clone(), context.clone());
        context
    }

    /// Pick up newly opened tabs and forget closed ones that no longer matter
    pub async fn sweep(&self) -> Result<Vec<TabContext>> {
        let open: BTreeSet<TabId> = self.browser.tabs().await?.into_iter().collect();

        let mut opened = Vec::new();
        for tab in &open {
            if self.contexts.contains_key(tab) {
                continue;
            }
            match self.on_tab_opened(tab).await {
                Ok(context) => opened.push(context),
                // Usually a popup that closed while being inspected
                Err(e) => {
                    warn!("Tab {} could not be inspected, ignoring it: {:#}", tab, e);
                    opened.push(self.ignore(tab));
                }
            }
        }

        self.contexts.retain(|tab, ctx| {
            let keep = open.contains(tab) || !(ctx.is_done() || self.abandoned.contains(tab));
            if !keep {
                debug!("Tab {} closed", tab);
            }
            keep
        });
        Ok(opened)
    }

    /// Contexts the primary flow still has to wait for
    pub fn blocking(&self) -> Vec<TabContext> {
        let mut blocking: Vec<TabContext> = self
            .contexts
            .iter()
            .filter(|e| {
                e.class.blocks_primary() && !e.is_done() && !self.abandoned.contains(e.key())
            })
            .map(|e| e.value().clone())
            .collect();
        blocking.sort_by(|a, b| a.tab.cmp(&b.tab));
        blocking
    }

    /// Wait for a tab's outcome. A timeout abandons the tab so it stops blocking.
    pub async fn await_tab(&self, context: &TabContext, timeout: Duration) -> TabOutcome {
        let mut rx = context.outcome.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map(|r| r.map(|outcome| outcome.clone()));

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) | Ok(Err(_)) => {
                TabOutcome::Failed("sub-flow ended without reporting".to_string())
            }
            Err(_) => {
                warn!("Tab {} did not finish within {:?}, abandoning it", context.tab, timeout);
                self.abandoned.insert(context.tab.clone());
                if let Some((_, handle)) = self.tasks.remove(&context.tab) {
                    handle.abort();
                }
                TabOutcome::TimedOut
            }
        }
    }

    pub fn active_tabs(&self) -> BTreeSet<TabId> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn context(&self, tab: &TabId) -> Option<TabContext> {
        self.contexts.get(tab).map(|c| c.clone())
    }

    /// Stop every running sub-flow
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }

    /// Sub-flows spawned and not yet finished
    pub fn running(&self) -> usize {
        self.tasks.iter().filter(|e| !e.value().is_finished()).count()
    }
}

impl Drop for TabCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tabs_test.rs"]
mod tabs_test;
