//! # formpilot
//!
//! Resilient web form automation.
//!
//! A session detects the questions a page asks, resolves an answer for each one
//! through a cached, circuit-broken reasoning service, fills the controls at a
//! human pace while verifying every value, heals selectors that stop resolving,
//! and coordinates the verification or sign-in tabs the form opens along the way.
//!
//! ## CLI Usage
//!
//! ```bash
//! # Fill and submit a form (geckodriver on :4444, reasoning service on :5000)
//! formpilot run "https://example.com/signup"
//!
//! # Use Chrome, a persona and an attempt log
//! formpilot run "https://example.com/signup" --browser chrome \
//!   --context "a nurse living in Leeds" --records attempts.jsonl
//!
//! # Supply the code a verification tab will ask for
//! formpilot run "https://example.com/signup" --verification-code 482913
//!
//! # Only print the detected questions
//! formpilot detect "https://example.com/signup" | jq '.[].text'
//!
//! # Show (or create) the configuration
//! formpilot config --init
//! ```
//!
//! Logs go to stderr (`RUST_LOG=formpilot=debug` for more); stdout carries the
//! session report or a JSON error `{ "error": true, "message", "exit_code" }`.
//!
//! ## Library Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use formpilot::{
//!     AnswerResolver, CircuitBreaker, FlowConfig, FlowOrchestrator, HttpReasoningService,
//!     SemanticCache,
//! };
//! use formpilot::memory::{DomBuilder, MemoryPage};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut page = DomBuilder::new("https://example.com/signup");
//! let form = page.element(None, "form", &[], "");
//! page.element(Some(form), "label", &[("for", "email")], "Email");
//! page.element(Some(form), "input", &[("id", "email"), ("type", "email")], "");
//! page.element(Some(form), "button", &[("type", "submit")], "Sign up");
//!
//! let config = FlowConfig::default();
//! let service = Arc::new(HttpReasoningService::new(&config.service_url, None)?);
//! let resolver = Arc::new(AnswerResolver::new(
//!     service,
//!     Arc::new(SemanticCache::new()),
//!     Arc::new(CircuitBreaker::new(config.breaker.clone())),
//!     &config,
//! ));
//!
//! let mut flow = FlowOrchestrator::new(Arc::new(MemoryPage::new(page.build())), resolver, config);
//! let report = flow.run().await;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

/// Session policy
pub mod config;

/// Exit-code carrying top-level errors
pub mod errors;

/// Page model extraction
pub mod extractor;

/// Field filling and submission
pub mod filler;

/// Selector healing
pub mod healer;

/// In-memory browser backend
pub mod memory;

/// The session state machine
pub mod orchestrator;

/// Browser capability traits and document snapshots
pub mod page;

/// Attempt records
pub mod record;

/// Answer resolution
pub mod resolver;

/// CSS selector matching over snapshots
pub mod selector;

/// Tab coordination
pub mod tabs;

/// Questions, answers and fill outcomes
pub mod types;

/// WebDriver backend
pub mod webdriver;

pub use config::FlowConfig;
pub use errors::FormpilotError;
pub use extractor::PageModelExtractor;
pub use filler::PrecisionFiller;
pub use healer::SelectorHealer;
pub use orchestrator::{FlowOrchestrator, SessionReport, SubFlowLauncher};
pub use page::{BrowserSession, PageDriver, TabId};
pub use resolver::{
    AnswerResolver, AnswerSource, CircuitBreaker, HttpReasoningService, SemanticCache,
};
pub use tabs::TabCoordinator;
pub use types::{Answer, FillOutcome, Question};
pub use webdriver::{BrowserType, WebDriverBrowser};
