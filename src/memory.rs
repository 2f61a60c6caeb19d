//! In-memory browser backend.
//!
//! Pages are [`DomSnapshot`]s mutated by the same actions a real browser performs:
//! typing appends to `value`, clicking toggles checkboxes and radios, and scripted
//! [`ClickEffect`]s stand in for form submission. Used for dry runs and tests.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::page::{BrowserSession, DomNode, DomSnapshot, ElementState, PageDriver, Rect, TabId};
use crate::types::{Choice, Selector};

/// Builds snapshots node by node. Nodes must be added in document order.
pub struct DomBuilder {
    snapshot: DomSnapshot,
    next_y: f64,
}

impl DomBuilder {
    pub fn new(url: &str) -> Self {
        Self {
            snapshot: DomSnapshot {
                url: url.to_string(),
                ready: true,
                nodes: Vec::new(),
            },
            next_y: 0.0,
        }
    }

    /// Append an element and return its index
    pub fn element(
        &mut self,
        parent: Option<usize>,
        tag: &str,
        attrs: &[(&str, &str)],
        text: &str,
    ) -> usize {
        if let (Some(p), Some(last)) = (parent, self.snapshot.nodes.len().checked_sub(1)) {
            assert!(
                p == last || self.snapshot.is_descendant(last, p),
                "node {} added out of document order",
                self.snapshot.nodes.len()
            );
        }

        let attrs: BTreeMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let tag = tag.to_lowercase();
        let is_hidden_input =
            tag == "input" && attrs.get("type").is_some_and(|t| t.eq_ignore_ascii_case("hidden"));
        let is_toggle = tag == "input"
            && attrs
                .get("type")
                .is_some_and(|t| t == "radio" || t == "checkbox");

        let rect = if is_hidden_input {
            Rect::default()
        } else {
            Rect {
                x: 10.0,
                y: self.next_y,
                width: 200.0,
                height: 24.0,
            }
        };
        self.next_y += 30.0;

        let value = if is_toggle {
            String::new()
        } else {
            attrs.get("value").cloned().unwrap_or_default()
        };
        let checked = is_toggle && attrs.contains_key("checked");

        self.snapshot.nodes.push(DomNode {
            tag,
            parent,
            attrs,
            text: text.to_string(),
            rect,
            value,
            checked,
            ..DomNode::default()
        });
        self.snapshot.nodes.len() - 1
    }

    /// Add an `<option>` to a select
    pub fn option(&mut self, select: usize, value: &str, label: &str) -> &mut Self {
        let node = &mut self.snapshot.nodes[select];
        if node.options.is_empty() && !node.has_attr("multiple") {
            node.value = value.to_string();
            node.selected = vec![value.to_string()];
        }
        node.options.push(Choice {
            value: value.to_string(),
            label: label.to_string(),
        });
        self
    }

    /// `display: none`
    pub fn hide(&mut self, idx: usize) -> &mut Self {
        self.snapshot.nodes[idx].display_none = true;
        self
    }

    /// `visibility: hidden`
    pub fn invisible(&mut self, idx: usize) -> &mut Self {
        self.snapshot.nodes[idx].visibility_hidden = true;
        self
    }

    /// Zero rendered area
    pub fn collapse(&mut self, idx: usize) -> &mut Self {
        self.snapshot.nodes[idx].rect = Rect::default();
        self
    }

    pub fn build(self) -> DomSnapshot {
        self.snapshot
    }
}

/// What clicking an element does besides toggling it
#[derive(Clone)]
pub enum ClickEffect {
    /// Load a new, empty document at the URL
    Navigate(String),
    /// Append a visible message to the document
    ShowText(String),
    /// Hide the enclosing form
    RemoveForm,
    /// Arbitrary document mutation
    Mutate(Arc<dyn Fn(&mut DomSnapshot) + Send + Sync>),
}

/// Misbehaviour injected for an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFault {
    /// Actions return an error
    Error,
    /// Actions succeed but leave the value untouched
    IgnoreInput,
    /// Actions never complete
    Hang,
}

/// An action performed on a page, reported to hooks
#[derive(Debug, Clone, PartialEq)]
pub struct PageAction {
    pub kind: &'static str,
    pub selector: Selector,
}

pub type ActionHook = Arc<dyn Fn(&PageAction) + Send + Sync>;

struct PageState {
    initial: DomSnapshot,
    dom: DomSnapshot,
    click_effects: Vec<(Selector, ClickEffect)>,
    faults: Vec<(Selector, PageFault)>,
    actions: Vec<PageAction>,
    reloads: usize,
}

/// A page held entirely in memory
pub struct MemoryPage {
    state: Mutex<PageState>,
    hook: Mutex<Option<ActionHook>>,
}

impl MemoryPage {
    pub fn new(dom: DomSnapshot) -> Self {
        Self {
            state: Mutex::new(PageState {
                initial: dom.clone(),
                dom,
                click_effects: Vec::new(),
                faults: Vec::new(),
                actions: Vec::new(),
                reloads: 0,
            }),
            hook: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_click(&self, css: &str, effect: ClickEffect) -> &Self {
        self.lock().click_effects.push((Selector::css(css), effect));
        self
    }

    pub fn fault(&self, css: &str, fault: PageFault) -> &Self {
        self.lock().faults.push((Selector::css(css), fault));
        self
    }

    /// Called after every successful action
    pub fn on_action(&self, hook: ActionHook) {
        *self.hook.lock().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    /// Mutate the live document (and what a reload restores when `persist` is set)
    pub fn mutate(&self, persist: bool, f: impl Fn(&mut DomSnapshot)) {
        let mut state = self.lock();
        f(&mut state.dom);
        if persist {
            f(&mut state.initial);
        }
    }

    pub fn dom(&self) -> DomSnapshot {
        self.lock().dom.clone()
    }

    pub fn actions(&self) -> Vec<PageAction> {
        self.lock().actions.clone()
    }

    pub fn reload_count(&self) -> usize {
        self.lock().reloads
    }

    /// Current value of the first element matching a CSS selector
    pub fn value_of(&self, css: &str) -> Option<String> {
        let state = self.lock();
        let idx = *state.dom.query(&Selector::css(css)).first()?;
        Some(state.dom.node(idx).value.clone())
    }

    /// Selected option values of the first matching select
    pub fn selected_of(&self, css: &str) -> Vec<String> {
        let state = self.lock();
        state
            .dom
            .query(&Selector::css(css))
            .first()
            .map(|&i| state.dom.node(i).selected.clone())
            .unwrap_or_default()
    }

    pub fn is_checked(&self, css: &str) -> bool {
        let state = self.lock();
        state
            .dom
            .query(&Selector::css(css))
            .first()
            .is_some_and(|&i| state.dom.node(i).checked)
    }

    fn fault_for(state: &PageState, idx: usize) -> Option<PageFault> {
        state
            .faults
            .iter()
            .find(|(sel, _)| state.dom.query(sel).contains(&idx))
            .map(|(_, f)| *f)
    }

    /// Apply an action to the first match, honouring injected faults
    async fn act(
        &self,
        kind: &'static str,
        selector: &Selector,
        apply: impl FnOnce(&mut PageState, usize) -> Result<()>,
    ) -> Result<()> {
        let hang = {
            let mut state = self.lock();
            let idx = *state
                .dom
                .query(selector)
                .first()
                .with_context(|| format!("No elements found matching selector: {}", selector))?;
            let hang = match Self::fault_for(&state, idx) {
                Some(PageFault::Error) => bail!("Element {} rejected {}", selector, kind),
                Some(PageFault::Hang) => true,
                Some(PageFault::IgnoreInput) => false,
                None => {
                    apply(&mut *state, idx)?;
                    false
                }
            };
            if !hang {
                state.actions.push(PageAction {
                    kind,
                    selector: selector.clone(),
                });
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let hook = self.hook.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(hook) = hook {
            hook(&PageAction {
                kind,
                selector: selector.clone(),
            });
        }
        Ok(())
    }
}

fn apply_click_effects(state: &mut PageState, idx: usize) {
    let effects: Vec<ClickEffect> = state
        .click_effects
        .iter()
        .filter(|(sel, _)| state.dom.query(sel).contains(&idx))
        .map(|(_, e)| e.clone())
        .collect();

    for effect in effects {
        match effect {
            ClickEffect::Navigate(url) => {
                debug!("Memory page navigating to {}", url);
                let mut builder = DomBuilder::new(&url);
                builder.element(None, "body", &[], "");
                state.dom = builder.build();
            }
            ClickEffect::ShowText(text) => {
                let y = state
                    .dom
                    .nodes
                    .iter()
                    .map(|n| n.rect.y + n.rect.height)
                    .fold(0.0, f64::max);
                state.dom.nodes.push(DomNode {
                    tag: "p".to_string(),
                    text,
                    rect: Rect {
                        x: 10.0,
                        y: y + 10.0,
                        width: 200.0,
                        height: 24.0,
                    },
                    ..DomNode::default()
                });
            }
            ClickEffect::RemoveForm => {
                if let Some(form) = state.dom.enclosing_form(idx) {
                    state.dom.nodes[form].display_none = true;
                }
            }
            ClickEffect::Mutate(f) => f(&mut state.dom),
        }
    }
}

#[async_trait]
impl PageDriver for MemoryPage {
    async fn url(&self) -> Result<String> {
        Ok(self.lock().dom.url.clone())
    }

    async fn snapshot(&self) -> Result<DomSnapshot> {
        Ok(self.dom())
    }

    async fn query(&self, selector: &Selector) -> Result<Vec<ElementState>> {
        let state = self.lock();
        let dom = &state.dom;
        Ok(dom
            .query(selector)
            .into_iter()
            .map(|i| ElementState {
                visible: dom.is_rendered(i),
                enabled: dom.is_enabled(i),
                value: dom.node(i).value.clone(),
                checked: dom.node(i).checked,
                selected: dom.node(i).selected.clone(),
            })
            .collect())
    }

    async fn clear(&self, selector: &Selector) -> Result<()> {
        self.act("clear", selector, |state, idx| {
            state.dom.nodes[idx].value.clear();
            Ok(())
        })
        .await
    }

    async fn type_char(&self, selector: &Selector, ch: char) -> Result<()> {
        self.act("type", selector, |state, idx| {
            let node = &mut state.dom.nodes[idx];
            let max_len = node
                .attr("maxlength")
                .and_then(|m| m.parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            if node.value.chars().count() < max_len {
                node.value.push(ch);
            }
            Ok(())
        })
        .await
    }

    async fn select_options(&self, selector: &Selector, values: &[String]) -> Result<()> {
        self.act("select", selector, |state, idx| {
            let node = &mut state.dom.nodes[idx];
            if node.tag != "select" {
                bail!("Element {} is not a select", selector);
            }
            if let Some(missing) = values
                .iter()
                .find(|v| !node.options.iter().any(|o| o.value == **v))
            {
                bail!("Select {} has no option '{}'", selector, missing);
            }
            if values.len() > 1 && !node.has_attr("multiple") {
                bail!("Select {} takes a single option", selector);
            }
            // Like `el.value`, the first selected option in option order
            node.selected = node
                .options
                .iter()
                .filter(|o| values.contains(&o.value))
                .map(|o| o.value.clone())
                .collect();
            node.value = node.selected.first().cloned().unwrap_or_default();
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &Selector) -> Result<()> {
        self.act("click", selector, |state, idx| {
            let input_type = state.dom.node(idx).input_type();
            if state.dom.node(idx).tag == "input" && input_type == "checkbox" {
                let node = &mut state.dom.nodes[idx];
                node.checked = !node.checked;
            } else if state.dom.node(idx).tag == "input" && input_type == "radio" {
                let name = state.dom.node(idx).attr("name").map(str::to_string);
                let form = state.dom.enclosing_form(idx);
                for i in 0..state.dom.len() {
                    let same_group = i != idx
                        && state.dom.node(i).input_type() == "radio"
                        && name.is_some()
                        && state.dom.node(i).attr("name") == name.as_deref()
                        && state.dom.enclosing_form(i) == form;
                    if same_group {
                        state.dom.nodes[i].checked = false;
                    }
                }
                state.dom.nodes[idx].checked = true;
            }
            apply_click_effects(state, idx);
            Ok(())
        })
        .await
    }

    async fn reload(&self) -> Result<()> {
        let mut state = self.lock();
        state.dom = state.initial.clone();
        state.reloads += 1;
        Ok(())
    }
}

/// A set of in-memory tabs
pub struct MemoryBrowser {
    tabs: Mutex<BTreeMap<TabId, Arc<MemoryPage>>>,
    next_id: AtomicUsize,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self {
            tabs: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Register an existing page as a new tab
    pub fn add_page(&self, page: Arc<MemoryPage>) -> TabId {
        let id = TabId(format!("tab-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.tabs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), page);
        id
    }

    pub fn memory_page(&self, tab: &TabId) -> Option<Arc<MemoryPage>> {
        self.tabs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(tab)
            .cloned()
    }
}

impl Default for MemoryBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserSession for MemoryBrowser {
    async fn tabs(&self) -> Result<Vec<TabId>> {
        Ok(self
            .tabs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn open_tab(&self, url: &str) -> Result<TabId> {
        let mut builder = DomBuilder::new(url);
        builder.element(None, "body", &[], "");
        Ok(self.add_page(Arc::new(MemoryPage::new(builder.build()))))
    }

    async fn close_tab(&self, tab: &TabId) -> Result<()> {
        self.tabs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(tab)
            .with_context(|| format!("Tab '{}' is not open", tab))?;
        Ok(())
    }

    async fn page(&self, tab: &TabId) -> Result<Arc<dyn PageDriver>> {
        let page = self
            .memory_page(tab)
            .with_context(|| format!("Tab '{}' is not open", tab))?;
        Ok(page)
    }
}
