//! Selector healing.
//!
//! When a field's selector stops resolving, the healer walks an ordered strategy
//! chain over a fresh snapshot and stops at the first strategy that yields exactly
//! one usable element of the field's kind:
//!
//! 1. [`HealStrategy::RelaxSelector`]: drop the most specific qualifier, repeatedly
//! 2. [`HealStrategy::LabelText`]: find the control now associated with the recorded label
//! 3. [`HealStrategy::KindPosition`]: same-kind control at the recorded position in the container

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::extractor::{associated_text, control_kind, field_selector, is_usable_control};
use crate::page::{DomSnapshot, PageDriver};
use crate::selector::ComplexSelector;
use crate::types::{InputField, normalize_text};

/// Relaxation steps tried before moving on to the next strategy
pub const DEFAULT_MAX_RELAX_STEPS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealStrategy {
    RelaxSelector,
    LabelText,
    KindPosition,
}

/// A field re-bound to an element of the current document
#[derive(Debug, Clone, PartialEq)]
pub struct Healed {
    pub field: InputField,
    pub strategy: HealStrategy,
    /// Node the field now points at
    pub node: usize,
}

#[derive(Debug, Clone)]
pub struct SelectorHealer {
    max_relax_steps: usize,
}

impl Default for SelectorHealer {
    fn default() -> Self {
        Self {
            max_relax_steps: DEFAULT_MAX_RELAX_STEPS,
        }
    }
}

impl SelectorHealer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_relax_steps(mut self, steps: usize) -> Self {
        self.max_relax_steps = steps;
        self
    }

    /// Snapshot the page and try to heal the field against it
    pub async fn heal_live(
        &self,
        field: &InputField,
        page: &dyn PageDriver,
    ) -> Result<Option<Healed>> {
        let dom = page
            .snapshot()
            .await
            .context("Failed to snapshot page for healing")?;
        Ok(self.heal(field, &dom))
    }

    /// Run the strategy chain; `None` means the field cannot be healed
    pub fn heal(&self, field: &InputField, dom: &DomSnapshot) -> Option<Healed> {
        let strategies: [(HealStrategy, fn(&Self, &InputField, &DomSnapshot) -> Option<usize>); 3] = [
            (HealStrategy::RelaxSelector, Self::by_relaxing),
            (HealStrategy::LabelText, Self::by_label),
            (HealStrategy::KindPosition, Self::by_position),
        ];

        for (strategy, find) in strategies {
            if let Some(node) = find(self, field, dom) {
                let mut healed = field.clone();
                healed.selector = field_selector(dom, node);
                healed.visible = dom.is_rendered(node);
                healed.enabled = dom.is_enabled(node);
                info!(
                    "Healed selector {} -> {} via {:?}",
                    field.selector, healed.selector, strategy
                );
                return Some(Healed {
                    field: healed,
                    strategy,
                    node,
                });
            }
            debug!("Heal strategy {:?} found no unique match for {}", strategy, field.selector);
        }
        info!("Selector {} is not healable", field.selector);
        None
    }

    fn by_relaxing(&self, field: &InputField, dom: &DomSnapshot) -> Option<usize> {
        let mut current = ComplexSelector::parse(&field.selector.to_css()).ok()?;
        if let Some((_, subject)) = current.parts.last_mut()
            && subject.tag.is_none()
        {
            subject.tag = Some(field.kind.tag().to_string());
        }

        for _ in 0..self.max_relax_steps {
            current = current.relax()?;
            // A bare tag says nothing about which control was meant
            if current.is_bare() {
                return None;
            }
            let matches: Vec<usize> = (0..dom.len())
                .filter(|&i| current.matches(dom, i) && acceptable(field, dom, i))
                .collect();
            debug!("Relaxed to '{}': {} candidate(s)", current, matches.len());
            if let [only] = matches.as_slice() {
                return Some(*only);
            }
        }
        None
    }

    fn by_label(&self, field: &InputField, dom: &DomSnapshot) -> Option<usize> {
        let wanted = normalize_text(field.label.as_deref()?);
        if wanted.is_empty() {
            return None;
        }
        unique((0..dom.len()).filter(|&i| {
            acceptable(field, dom, i)
                && associated_text(dom, i).is_some_and(|text| normalize_text(&text) == wanted)
        }))
    }

    fn by_position(&self, field: &InputField, dom: &DomSnapshot) -> Option<usize> {
        let container = unique(
            dom.query(field.container.as_ref()?)
                .into_iter()
                .filter(|&c| dom.is_rendered(c)),
        )?;
        let node = dom
            .descendants(container)
            .filter(|&i| control_kind(dom, i) == Some(field.kind) && is_usable_control(dom, i))
            .nth(field.position)?;
        acceptable(field, dom, node).then_some(node)
    }
}

/// A usable control of the field's kind (and option value, for toggles)
fn acceptable(field: &InputField, dom: &DomSnapshot, idx: usize) -> bool {
    if control_kind(dom, idx) != Some(field.kind) || !is_usable_control(dom, idx) {
        return false;
    }
    match &field.option_value {
        Some(value) => dom.node(idx).attr("value").unwrap_or("on") == value,
        None => true,
    }
}

fn unique(mut candidates: impl Iterator<Item = usize>) -> Option<usize> {
    let first = candidates.next()?;
    candidates.next().is_none().then_some(first)
}

#[cfg(test)]
#[path = "healer_test.rs"]
mod healer_test;
