// Unit tests for tab classification and coordination

use super::*;
use crate::memory::{DomBuilder, MemoryBrowser, MemoryPage};
use crate::resolver::fallback_answer;
use crate::types::QuestionId;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};

struct StubRunner {
    /// `None` never finishes
    delay: Option<Duration>,
}

#[async_trait]
impl SubFlowRunner for StubRunner {
    async fn run(&self, _tab: TabId, _class: TabClass, _page: Arc<dyn PageDriver>) -> TabOutcome {
        match self.delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                TabOutcome::Completed
            }
            None => std::future::pending().await,
        }
    }
}

struct FallbackOnly;

#[async_trait]
impl AnswerSource for FallbackOnly {
    async fn resolve(&self, question: &Question) -> Answer {
        fallback_answer(question, "test")
    }
}

fn code_page() -> DomSnapshot {
    let mut b = DomBuilder::new("https://example.com/verify");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "label", &[("for", "otp")], "Enter the code we sent you");
    b.element(Some(form), "input", &[("id", "otp"), ("name", "otp")], "");
    b.element(Some(form), "button", &[("type", "submit")], "Verify");
    b.build()
}

fn plain_page(url: &str) -> DomSnapshot {
    let mut b = DomBuilder::new(url);
    let body = b.element(None, "body", &[], "");
    b.element(Some(body), "p", &[], "Our newsletter");
    b.build()
}

fn question(text: &str) -> Question {
    Question {
        id: QuestionId::derive(text, 0),
        text: text.to_string(),
        semantic_type: SemanticType::ShortText,
        fields: vec![],
        confidence: 0.95,
        choices: vec![],
        bounds: None,
    }
}

fn coordinator(browser: &Arc<MemoryBrowser>, delay: Option<Duration>) -> (TabCoordinator, TabId) {
    let primary = browser.add_page(Arc::new(MemoryPage::new(plain_page(
        "https://example.com/signup",
    ))));
    let coordinator = TabCoordinator::new(
        browser.clone(),
        Arc::new(StubRunner { delay }),
        primary.clone(),
    );
    (coordinator, primary)
}

#[test]
fn test_classify_url() {
    assert_eq!(
        classify_url("https://accounts.google.com/o/oauth2/v2/auth?client_id=1"),
        Some(TabClass::Oauth)
    );
    assert_eq!(
        classify_url("https://id.example.org/oauth/authorize?client_id=abc&redirect_uri=x"),
        Some(TabClass::Oauth)
    );
    assert_eq!(classify_url("https://example.com/authorize"), None);
    assert_eq!(classify_url("https://example.com/signup"), None);
    assert_eq!(classify_url("not a url"), None);
}

#[test]
fn test_classify_dom() {
    assert_eq!(classify_dom(&code_page()), Some(TabClass::Verification));
    assert_eq!(classify_dom(&plain_page("https://example.com")), None);

    let mut b = DomBuilder::new("https://example.com/confirm");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "p", &[], "Please verify your email address");
    b.element(Some(form), "input", &[("type", "email"), ("name", "email")], "");
    assert_eq!(classify_dom(&b.build()), Some(TabClass::Verification));
}

#[tokio::test(start_paused = true)]
async fn test_verification_tab_blocks_until_complete() {
    let browser = Arc::new(MemoryBrowser::new());
    let (coordinator, primary) = coordinator(&browser, Some(Duration::from_secs(2)));
    let popup = browser.add_page(Arc::new(MemoryPage::new(code_page())));

    let context = coordinator.on_tab_opened(&popup).await.unwrap();
    assert_eq!(context.class, TabClass::Verification);
    assert_eq!(coordinator.classify(&primary).await.unwrap(), TabClass::Primary);

    let blocking = coordinator.blocking();
    assert_eq!(blocking.len(), 1);
    assert_eq!(blocking[0].tab, popup);

    let outcome = coordinator.await_tab(&context, Duration::from_secs(10)).await;
    assert_eq!(outcome, TabOutcome::Completed);
    assert!(coordinator.blocking().is_empty());
    assert_eq!(context.outcome(), Some(TabOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_abandons_tab() {
    let browser = Arc::new(MemoryBrowser::new());
    let (coordinator, _primary) = coordinator(&browser, None);
    let popup = browser.add_page(Arc::new(MemoryPage::new(code_page())));

    let context = coordinator.on_tab_opened(&popup).await.unwrap();
    let outcome = coordinator.await_tab(&context, Duration::from_secs(5)).await;

    assert_eq!(outcome, TabOutcome::TimedOut);
    assert!(coordinator.blocking().is_empty());
}

/// Never finishes; flags when its future is dropped
struct DropFlagRunner {
    dropped: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubFlowRunner for DropFlagRunner {
    async fn run(&self, _tab: TabId, _class: TabClass, _page: Arc<dyn PageDriver>) -> TabOutcome {
        let _guard = SetOnDrop(self.dropped.clone());
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_stops_the_sub_flow() {
    let browser = Arc::new(MemoryBrowser::new());
    let primary = browser.add_page(Arc::new(MemoryPage::new(plain_page(
        "https://example.com/signup",
    ))));
    let dropped = Arc::new(AtomicBool::new(false));
    let coordinator = TabCoordinator::new(
        browser.clone(),
        Arc::new(DropFlagRunner {
            dropped: dropped.clone(),
        }),
        primary,
    );
    let popup = browser.add_page(Arc::new(MemoryPage::new(code_page())));

    let context = coordinator.on_tab_opened(&popup).await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(coordinator.running(), 1);

    let outcome = coordinator.await_tab(&context, Duration::from_secs(5)).await;
    assert_eq!(outcome, TabOutcome::TimedOut);
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(coordinator.running(), 0);
}

#[tokio::test]
async fn test_uninspectable_tab_does_not_fail_sweep() {
    struct GhostBrowser(Arc<MemoryBrowser>);

    #[async_trait]
    impl BrowserSession for GhostBrowser {
        async fn tabs(&self) -> Result<Vec<TabId>> {
            let mut tabs = self.0.tabs().await?;
            tabs.push(TabId("tab-gone".to_string()));
            Ok(tabs)
        }

        async fn open_tab(&self, url: &str) -> Result<TabId> {
            self.0.open_tab(url).await
        }

        async fn close_tab(&self, tab: &TabId) -> Result<()> {
            self.0.close_tab(tab).await
        }

        async fn page(&self, tab: &TabId) -> Result<Arc<dyn PageDriver>> {
            self.0.page(tab).await
        }
    }

    let memory = Arc::new(MemoryBrowser::new());
    let primary = memory.add_page(Arc::new(MemoryPage::new(plain_page(
        "https://example.com/signup",
    ))));
    let popup = memory.add_page(Arc::new(MemoryPage::new(code_page())));
    let coordinator = TabCoordinator::new(
        Arc::new(GhostBrowser(memory)),
        Arc::new(StubRunner {
            delay: Some(Duration::from_secs(60)),
        }),
        primary,
    );

    let opened = coordinator.sweep().await.unwrap();
    assert_eq!(opened.len(), 2);

    let gone = coordinator.context(&TabId("tab-gone".to_string())).unwrap();
    assert_eq!(gone.class, TabClass::Unclassified);
    assert_eq!(gone.outcome(), Some(TabOutcome::Ignored));
    let blocking: Vec<TabId> = coordinator.blocking().into_iter().map(|c| c.tab).collect();
    assert_eq!(blocking, vec![popup]);
}

#[tokio::test]
async fn test_unclassified_tab_is_ignored() {
    let browser = Arc::new(MemoryBrowser::new());
    let (coordinator, _primary) = coordinator(&browser, None);
    let ad = browser.add_page(Arc::new(MemoryPage::new(plain_page(
        "https://ads.example.net/",
    ))));

    let context = coordinator.on_tab_opened(&ad).await.unwrap();
    assert_eq!(context.class, TabClass::Unclassified);
    assert_eq!(context.outcome(), Some(TabOutcome::Ignored));
    assert!(coordinator.blocking().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_tracks_opened_and_closed_tabs() {
    let browser = Arc::new(MemoryBrowser::new());
    let (coordinator, primary) = coordinator(&browser, Some(Duration::from_millis(10)));
    assert!(coordinator.sweep().await.unwrap().is_empty());

    let popup = browser.add_page(Arc::new(MemoryPage::new(code_page())));
    let opened = coordinator.sweep().await.unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(
        coordinator.active_tabs(),
        BTreeSet::from([primary.clone(), popup.clone()])
    );

    // Sweeping again does not restart the sub-flow
    assert!(coordinator.sweep().await.unwrap().is_empty());

    let context = coordinator.context(&popup).unwrap();
    coordinator.await_tab(&context, Duration::from_secs(1)).await;
    browser.close_tab(&popup).await.unwrap();
    coordinator.sweep().await.unwrap();
    assert_eq!(coordinator.active_tabs(), BTreeSet::from([primary]));
}

#[tokio::test]
async fn test_code_answers_use_collaborator() {
    let answers = CodeAnswers::new(
        Arc::new(StaticCodeSource(Some("482913".to_string()))),
        Arc::new(FallbackOnly),
    );

    let code = answers.resolve(&question("Verification code")).await;
    assert_eq!(code.provenance, Provenance::Collaborator);
    assert_eq!(code.value, AnswerValue::Text("482913".to_string()));

    let other = answers.resolve(&question("Favourite film")).await;
    assert_eq!(other.provenance, Provenance::Fallback);

    let missing = CodeAnswers::new(Arc::new(StaticCodeSource(None)), Arc::new(FallbackOnly));
    let fallback = missing.resolve(&question("One-time code")).await;
    assert_eq!(fallback.provenance, Provenance::Fallback);
}
