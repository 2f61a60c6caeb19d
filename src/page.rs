//! Browser capability surface the automation core depends on.
//!
//! The core never touches a concrete automation library. It reads pages through
//! [`PageDriver`] (query, state checks, input, waits) and tabs through
//! [`BrowserSession`]. Structural analysis works on a [`DomSnapshot`], a plain-data
//! copy of the document taken in one round trip.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::selector;
use crate::types::{Choice, Selector};

/// Interval between polls of a wait condition
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identity of an open browser tab
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rendered bounds of an element
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// One element of a document snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    /// Lowercase tag name
    pub tag: String,
    /// Index of the parent node; parents always precede their children
    pub parent: Option<usize>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Text of the element's direct text children
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub display_none: bool,
    #[serde(default)]
    pub visibility_hidden: bool,
    /// Current value of form controls
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub checked: bool,
    /// Options of a `<select>`
    #[serde(default)]
    pub options: Vec<Choice>,
    /// Values of the selected options of a `<select>`, in option order
    #[serde(default)]
    pub selected: Vec<String>,
}

impl DomNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// Lowercased `type` attribute of an input (`text` when absent)
    pub fn input_type(&self) -> String {
        self.attr("type")
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "text".to_string())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }
}

/// Plain-data copy of a document, nodes in document (pre-)order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub url: String,
    /// `document.readyState === "complete"` at capture time
    #[serde(default = "default_ready")]
    pub ready: bool,
    pub nodes: Vec<DomNode>,
}

fn default_ready() -> bool {
    true
}

impl DomSnapshot {
    pub fn node(&self, idx: usize) -> &DomNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestors of a node, nearest first
    pub fn ancestors(&self, idx: usize) -> Ancestors<'_> {
        Ancestors {
            dom: self,
            next: self.nodes[idx].parent,
        }
    }

    pub fn is_descendant(&self, idx: usize, ancestor: usize) -> bool {
        self.ancestors(idx).any(|a| a == ancestor)
    }

    pub fn children(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .skip(idx + 1)
            .filter(move |(_, n)| n.parent == Some(idx))
            .map(|(i, _)| i)
    }

    /// Indices of all descendants of a node, in document order
    pub fn descendants(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        (idx + 1..self.nodes.len())
            .take_while(move |&j| self.is_descendant(j, idx))
    }

    /// Whether the element and all of its ancestors actually render
    pub fn is_rendered(&self, idx: usize) -> bool {
        std::iter::once(idx)
            .chain(self.ancestors(idx))
            .all(|i| {
                let n = &self.nodes[i];
                !n.display_none && !n.visibility_hidden && n.rect.has_area()
            })
    }

    /// Whether a control accepts input (no `disabled` on it or an enclosing fieldset)
    pub fn is_enabled(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        if node.has_attr("disabled") {
            return false;
        }
        !self
            .ancestors(idx)
            .any(|a| self.nodes[a].tag == "fieldset" && self.nodes[a].has_attr("disabled"))
    }

    /// Own text of a node and its descendants, excluding form-control internals
    pub fn text_content(&self, idx: usize) -> String {
        let mut parts = Vec::new();
        let own = self.nodes[idx].text.trim();
        if !own.is_empty() {
            parts.push(own.to_string());
        }
        for j in self.descendants(idx) {
            let n = &self.nodes[j];
            if matches!(n.tag.as_str(), "select" | "option" | "textarea" | "script" | "style") {
                continue;
            }
            if self
                .ancestors(j)
                .take_while(|&a| a != idx)
                .any(|a| matches!(self.nodes[a].tag.as_str(), "select" | "script" | "style"))
            {
                continue;
            }
            let t = n.text.trim();
            if !t.is_empty() {
                parts.push(t.to_string());
            }
        }
        parts.join(" ")
    }

    /// Visible text of the whole document, lowercased
    pub fn visible_text(&self) -> String {
        (0..self.nodes.len())
            .filter(|&i| !self.nodes[i].text.trim().is_empty() && self.is_rendered(i))
            .map(|i| self.nodes[i].text.trim().to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Nodes matching a selector, in document order
    pub fn query(&self, sel: &Selector) -> Vec<usize> {
        selector::query(self, sel)
    }

    /// Nearest `<form>` enclosing a node
    pub fn enclosing_form(&self, idx: usize) -> Option<usize> {
        self.ancestors(idx).find(|&a| self.nodes[a].tag == "form")
    }
}

pub struct Ancestors<'a> {
    dom: &'a DomSnapshot,
    next: Option<usize>,
}

impl Iterator for Ancestors<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.dom.nodes[current].parent;
        Some(current)
    }
}

/// Live state of an element matched by a selector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    /// Same rule as [`DomSnapshot::is_rendered`]
    pub visible: bool,
    pub enabled: bool,
    pub value: String,
    pub checked: bool,
    /// Selected option values; empty for anything but a `<select>`
    #[serde(default)]
    pub selected: Vec<String>,
}

/// A condition a page can be waited on
#[derive(Debug, Clone, PartialEq)]
pub enum WaitCondition {
    /// Document finished loading
    Ready,
    /// Current URL differs from the given one
    UrlChanged { from: String },
    /// Any of the given lowercase phrases is visible
    TextPresent(Vec<String>),
    /// No rendered element matches the selector
    Gone(Selector),
    Any(Vec<WaitCondition>),
}

impl WaitCondition {
    /// Evaluate against a snapshot and the current URL
    pub fn is_met(&self, dom: &DomSnapshot, url: &str) -> bool {
        match self {
            WaitCondition::Ready => dom.ready,
            WaitCondition::UrlChanged { from } => url != from,
            WaitCondition::TextPresent(phrases) => {
                let text = dom.visible_text();
                phrases.iter().any(|p| text.contains(p.as_str()))
            }
            WaitCondition::Gone(sel) => !dom.query(sel).into_iter().any(|i| dom.is_rendered(i)),
            WaitCondition::Any(conditions) => conditions.iter().any(|c| c.is_met(dom, url)),
        }
    }
}

/// Page-level capabilities required from an automation backend.
///
/// Actions address the first element matching a selector.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn url(&self) -> Result<String>;

    /// Capture the whole document
    async fn snapshot(&self) -> Result<DomSnapshot>;

    /// Live state of every element matching the selector
    async fn query(&self, selector: &Selector) -> Result<Vec<ElementState>>;

    async fn clear(&self, selector: &Selector) -> Result<()>;

    /// Send a single keystroke
    async fn type_char(&self, selector: &Selector, ch: char) -> Result<()>;

    /// Leave exactly these options selected, deselecting any others
    async fn select_options(&self, selector: &Selector, values: &[String]) -> Result<()>;

    async fn click(&self, selector: &Selector) -> Result<()>;

    async fn reload(&self) -> Result<()>;

    /// Wait until the condition holds; `Ok(false)` when the timeout elapses first
    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let dom = self.snapshot().await?;
            let url = self.url().await?;
            if condition.is_met(&dom, &url) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

/// Tab-level capabilities required from an automation backend
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Currently open tabs
    async fn tabs(&self) -> Result<Vec<TabId>>;

    async fn open_tab(&self, url: &str) -> Result<TabId>;

    async fn close_tab(&self, tab: &TabId) -> Result<()>;

    /// Driver bound to a specific tab
    async fn page(&self, tab: &TabId) -> Result<Arc<dyn PageDriver>>;
}
