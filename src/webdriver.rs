//! WebDriver backend for the page and browser capability traits.
//!
//! One WebDriver session serves every tab. Commands act on the focused window, so
//! each page switches focus under a shared lock before talking to the driver.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use fantoccini::wd::WindowHandle;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::page::{BrowserSession, DomSnapshot, ElementState, PageDriver, TabId};
use crate::types::Selector;

/// Serializes the document into a `DomSnapshot`
const SNAPSHOT_SCRIPT: &str = r#"
    const root = document.body || document.documentElement;
    const elements = [root, ...root.querySelectorAll('*')];
    const index = new Map();
    const nodes = [];
    for (const el of elements) {
        index.set(el, nodes.length);
        const style = window.getComputedStyle(el);
        const rect = el.getBoundingClientRect();
        const attrs = {};
        for (const a of el.attributes) { attrs[a.name] = a.value; }
        let text = '';
        for (const child of el.childNodes) {
            if (child.nodeType === Node.TEXT_NODE) { text += child.textContent; }
        }
        const tag = el.tagName.toLowerCase();
        nodes.push({
            tag: tag,
            parent: el === root ? null : (index.has(el.parentElement) ? index.get(el.parentElement) : null),
            attrs: attrs,
            text: text.replace(/\s+/g, ' ').trim(),
            rect: { x: rect.x, y: rect.y + window.scrollY, width: rect.width, height: rect.height },
            display_none: style.display === 'none',
            visibility_hidden: style.visibility === 'hidden' || style.visibility === 'collapse',
            value: ('value' in el && typeof el.value === 'string') ? el.value : '',
            checked: el.checked === true,
            options: tag === 'select'
                ? Array.from(el.options).map(o => ({ value: o.value, label: o.text.trim() }))
                : [],
            selected: tag === 'select' ? Array.from(el.selectedOptions).map(o => o.value) : []
        });
    }
    return { url: window.location.href, ready: document.readyState === 'complete', nodes: nodes };
"#;

/// Live state of every element matching `arguments[0]`. An element is visible
/// when it and every ancestor up to the body render with a non-zero area and are
/// neither `display: none` nor `visibility: hidden`, as `DomSnapshot::is_rendered`
/// judges a snapshot.
const QUERY_SCRIPT: &str = r#"
    const rendered = (el) => {
        for (let n = el; n && n !== document.documentElement; n = n.parentElement) {
            const style = window.getComputedStyle(n);
            const rect = n.getBoundingClientRect();
            if (style.display === 'none'
                || style.visibility === 'hidden'
                || style.visibility === 'collapse'
                || rect.width <= 0
                || rect.height <= 0) {
                return false;
            }
        }
        return true;
    };
    return Array.from(document.querySelectorAll(arguments[0])).map(el => ({
        visible: rendered(el),
        enabled: !el.disabled && !el.closest('fieldset[disabled]'),
        value: ('value' in el && typeof el.value === 'string') ? el.value : '',
        checked: el.checked === true,
        selected: el.tagName === 'SELECT' ? Array.from(el.selectedOptions).map(o => o.value) : []
    }));
"#;

/// Selects exactly the option values `arguments[1]` in the first match of
/// `arguments[0]`; returns an error message or null
const SELECT_SCRIPT: &str = r#"
    const el = document.querySelector(arguments[0]);
    const wanted = arguments[1];
    if (!el || el.tagName !== 'SELECT') { return 'not a select'; }
    const known = Array.from(el.options).map(o => o.value);
    const missing = wanted.find(v => !known.includes(v));
    if (missing !== undefined) { return "no option '" + missing + "'"; }
    if (!el.multiple && wanted.length > 1) { return 'takes a single option'; }
    el.focus();
    for (const o of el.options) { o.selected = wanted.includes(o.value); }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return null;
"#;

/// Supported browser types
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BrowserType {
    /// Mozilla Firefox
    Firefox,
    /// Google Chrome/Chromium
    Chrome,
}

impl std::str::FromStr for BrowserType {
    type Err = anyhow::Error;

    /// Parse browser type from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "firefox" => Ok(BrowserType::Firefox),
            "chrome" | "chromium" => Ok(BrowserType::Chrome),
            _ => anyhow::bail!("Unsupported browser: {}", s),
        }
    }
}

impl BrowserType {
    /// Default WebDriver URL for this browser type
    pub fn default_webdriver_url(&self) -> &'static str {
        match self {
            BrowserType::Firefox => "http://localhost:4444",
            BrowserType::Chrome => "http://localhost:9515",
        }
    }

    fn driver_name(&self) -> &'static str {
        match self {
            BrowserType::Firefox => "geckodriver",
            BrowserType::Chrome => "chromedriver",
        }
    }

    fn capabilities(&self, headless: bool) -> serde_json::Map<String, serde_json::Value> {
        let mut caps = serde_json::Map::new();
        match self {
            BrowserType::Firefox => {
                let mut args = Vec::new();
                if headless {
                    args.push("--headless".to_string());
                }
                caps.insert("moz:firefoxOptions".to_string(), json!({ "args": args }));
            }
            BrowserType::Chrome => {
                let mut args = vec!["--no-sandbox".to_string()];
                if headless {
                    args.push("--headless=new".to_string());
                    args.push("--disable-gpu".to_string());
                    args.push("--disable-dev-shm-usage".to_string());
                }
                caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
            }
        }
        caps
    }
}

struct Inner {
    client: Client,
    /// Window the driver currently points at
    focus: Mutex<Option<WindowHandle>>,
    windows: DashMap<TabId, WindowHandle>,
}

impl Inner {
    /// Point the driver at `tab` and hold focus until the guard drops
    async fn focus(&self, tab: &TabId) -> Result<MutexGuard<'_, Option<WindowHandle>>> {
        let handle = self
            .windows
            .get(tab)
            .map(|h| h.clone())
            .with_context(|| format!("Tab {} is not open", tab))?;
        let mut focus = self.focus.lock().await;
        if focus.as_ref() != Some(&handle) {
            self.client
                .switch_to_window(handle.clone())
                .await
                .with_context(|| format!("Failed to switch to tab {}", tab))?;
            *focus = Some(handle);
        }
        Ok(focus)
    }

    async fn refresh_windows(&self) -> Result<Vec<TabId>> {
        let handles = self.client.windows().await.context("Failed to list windows")?;
        let tabs: Vec<TabId> = handles
            .into_iter()
            .map(|h| {
                let tab = TabId(String::from(h.clone()));
                self.windows.insert(tab.clone(), h);
                tab
            })
            .collect();
        self.windows.retain(|tab, _| tabs.contains(tab));
        Ok(tabs)
    }
}

/// A WebDriver session
#[derive(Clone)]
pub struct WebDriverBrowser {
    inner: Arc<Inner>,
}

impl WebDriverBrowser {
    /// Connect to a running WebDriver server
    pub async fn connect(
        browser_type: BrowserType,
        webdriver_url: Option<&str>,
        headless: bool,
    ) -> Result<Self> {
        let url = webdriver_url.unwrap_or(browser_type.default_webdriver_url());
        info!("Connecting to {:?} WebDriver at {}", browser_type, url);

        if !Self::is_webdriver_running(url).await {
            anyhow::bail!(
                "Cannot connect to {} WebDriver at {}.\n\
                Please ensure {} is running:\n\
                  For Firefox: geckodriver --port 4444\n\
                  For Chrome: chromedriver --port 9515",
                browser_type.driver_name(),
                url,
                browser_type.driver_name()
            );
        }

        let client = ClientBuilder::rustls()
            .capabilities(browser_type.capabilities(headless))
            .connect(url)
            .await
            .context("Failed to connect to WebDriver")?;

        let browser = Self {
            inner: Arc::new(Inner {
                client,
                focus: Mutex::new(None),
                windows: DashMap::new(),
            }),
        };
        let current = browser
            .inner
            .client
            .window()
            .await
            .context("Failed to read the current window")?;
        browser.inner.refresh_windows().await?;
        *browser.inner.focus.lock().await = Some(current);
        Ok(browser)
    }

    async fn is_webdriver_running(url: &str) -> bool {
        let status_url = format!("{}/status", url);
        match reqwest::get(&status_url).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// The tab the session started in
    pub async fn primary_tab(&self) -> Result<TabId> {
        let focus = self.inner.focus.lock().await;
        let handle = focus.clone().context("No focused window")?;
        Ok(TabId(String::from(handle)))
    }

    /// Navigate a tab and wait (briefly) for the document to finish loading
    pub async fn goto(&self, tab: &TabId, url: &str) -> Result<()> {
        info!("Navigating to {}", url);
        let _focus = self.inner.focus(tab).await?;
        self.inner
            .client
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {}", url))?;

        for _ in 0..20 {
            match self
                .inner
                .client
                .execute("return document.readyState === 'complete';", vec![])
                .await
            {
                Ok(val) if val.as_bool().unwrap_or(false) => break,
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        self.inner.client.clone().close().await?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for WebDriverBrowser {
    async fn tabs(&self) -> Result<Vec<TabId>> {
        let _focus = self.inner.focus.lock().await;
        self.inner.refresh_windows().await
    }

    async fn open_tab(&self, url: &str) -> Result<TabId> {
        let created = {
            let _focus = self.inner.focus.lock().await;
            self.inner
                .client
                .new_window(true)
                .await
                .context("Failed to open a new tab")?
        };
        let tab = TabId(String::from(created.handle.clone()));
        self.inner.windows.insert(tab.clone(), created.handle);
        if !url.is_empty() {
            self.goto(&tab, url).await?;
        }
        Ok(tab)
    }

    async fn close_tab(&self, tab: &TabId) -> Result<()> {
        let mut focus = self.inner.focus(tab).await?;
        self.inner
            .client
            .close_window()
            .await
            .with_context(|| format!("Failed to close tab {}", tab))?;
        *focus = None;
        self.inner.windows.remove(tab);
        debug!("Closed tab {}", tab);
        Ok(())
    }

    async fn page(&self, tab: &TabId) -> Result<Arc<dyn PageDriver>> {
        if !self.inner.windows.contains_key(tab) {
            self.inner.refresh_windows().await?;
        }
        if !self.inner.windows.contains_key(tab) {
            anyhow::bail!("Tab {} is not open", tab);
        }
        Ok(Arc::new(WebDriverPage {
            inner: self.inner.clone(),
            tab: tab.clone(),
        }))
    }
}

/// One tab of a [`WebDriverBrowser`]
pub struct WebDriverPage {
    inner: Arc<Inner>,
    tab: TabId,
}

impl WebDriverPage {
    async fn first(&self, selector: &Selector) -> Result<fantoccini::elements::Element> {
        let css = selector.to_css();
        self.inner
            .client
            .find_all(Locator::Css(&css))
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("No elements found matching selector: {}", selector))
    }
}

#[async_trait]
impl PageDriver for WebDriverPage {
    async fn url(&self) -> Result<String> {
        let _focus = self.inner.focus(&self.tab).await?;
        Ok(self.inner.client.current_url().await?.to_string())
    }

    async fn snapshot(&self) -> Result<DomSnapshot> {
        let _focus = self.inner.focus(&self.tab).await?;
        let value = self
            .inner
            .client
            .execute(SNAPSHOT_SCRIPT, vec![])
            .await
            .context("Failed to capture document")?;
        serde_json::from_value(value).context("Malformed document snapshot")
    }

    async fn query(&self, selector: &Selector) -> Result<Vec<ElementState>> {
        let _focus = self.inner.focus(&self.tab).await?;
        let value = self
            .inner
            .client
            .execute(QUERY_SCRIPT, vec![json!(selector.to_css())])
            .await
            .with_context(|| format!("Failed to query {}", selector))?;
        serde_json::from_value(value).context("Malformed element state")
    }

    async fn clear(&self, selector: &Selector) -> Result<()> {
        let _focus = self.inner.focus(&self.tab).await?;
        self.first(selector).await?.clear().await?;
        Ok(())
    }

    async fn type_char(&self, selector: &Selector, ch: char) -> Result<()> {
        let _focus = self.inner.focus(&self.tab).await?;
        self.first(selector)
            .await?
            .send_keys(ch.encode_utf8(&mut [0; 4]))
            .await?;
        Ok(())
    }

    async fn select_options(&self, selector: &Selector, values: &[String]) -> Result<()> {
        let _focus = self.inner.focus(&self.tab).await?;
        if let [value] = values {
            let element = self.first(selector).await?;
            let multiple = element.attr("multiple").await?.is_some();
            if !multiple {
                element
                    .select_by_value(value)
                    .await
                    .with_context(|| format!("Select {} has no option '{}'", selector, value))?;
                return Ok(());
            }
        }
        let error = self
            .inner
            .client
            .execute(SELECT_SCRIPT, vec![json!(selector.to_css()), json!(values)])
            .await
            .with_context(|| format!("Failed to select options of {}", selector))?;
        if let Some(message) = error.as_str() {
            anyhow::bail!("Select {} {}", selector, message);
        }
        Ok(())
    }

    async fn click(&self, selector: &Selector) -> Result<()> {
        let _focus = self.inner.focus(&self.tab).await?;
        debug!("Clicking {}", selector);
        self.first(selector).await?.click().await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let _focus = self.inner.focus(&self.tab).await?;
        self.inner.client.refresh().await.context("Failed to reload page")?;
        Ok(())
    }
}
