//! Precision filling: human-paced input with per-field verification, and submission.

use anyhow::{Context, Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{FlowConfig, PacingConfig};
use crate::extractor::{element_path, field_selector};
use crate::healer::SelectorHealer;
use crate::page::{DomSnapshot, ElementState, PageDriver, WaitCondition};
use crate::types::{
    Answer, AnswerValue, ElementKind, FailReason, FillOutcome, FillStatus, FillSummary,
    InputField, Question, QuestionId, Selector, SkipReason,
};

/// Button text that reads as "send this form"
const AFFIRMATIVE_BUTTON_WORDS: &[&str] = &[
    "submit", "send", "continue", "next", "register", "sign up", "signup", "finish", "done",
    "confirm", "join", "create", "save", "vote", "apply", "get started", "verify",
];

/// Visible text that signals an accepted submission
pub const SUCCESS_PHRASES: &[&str] = &[
    "thank you",
    "thanks",
    "success",
    "submitted",
    "received",
    "confirmed",
    "complete",
    "welcome",
    "check your email",
    "verify your email",
];

/// How selectors are resolved during a fill pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMode {
    /// Use detected selectors; heal only when nothing matches
    #[default]
    Direct,
    /// Also heal selectors that match ambiguously or match an unusable element
    HealerFirst,
}

pub struct PrecisionFiller {
    page: Arc<dyn PageDriver>,
    healer: SelectorHealer,
    pacing: PacingConfig,
    field_timeout: Duration,
    submit_wait: Duration,
}

struct Located {
    selector: Selector,
    healed: Option<Selector>,
    state: ElementState,
}

enum Action {
    Type(String),
    Select(Vec<String>),
    Toggle(bool),
}

impl PrecisionFiller {
    pub fn new(page: Arc<dyn PageDriver>, config: &FlowConfig) -> Self {
        Self {
            page,
            healer: SelectorHealer::new(),
            pacing: config.pacing.clone(),
            field_timeout: config.timeouts.field(),
            submit_wait: config.timeouts.submit_wait(),
        }
    }

    /// Fill every field of every question, in question then field order
    pub async fn fill(
        &self,
        questions: &[Question],
        answers: &[Answer],
        pass: u64,
        mode: ResolutionMode,
    ) -> Vec<FillOutcome> {
        let by_question: HashMap<&QuestionId, &Answer> =
            answers.iter().map(|a| (&a.question_id, a)).collect();
        let mut outcomes = Vec::new();

        for question in questions {
            let Some(answer) = by_question.get(&question.id) else {
                for field in &question.fields {
                    outcomes.push(outcome(
                        field,
                        pass,
                        FillStatus::Failed(FailReason::Exception),
                        None,
                        Some("no answer resolved".to_string()),
                    ));
                }
                continue;
            };

            let radios_chosen = question
                .fields
                .iter()
                .filter(|f| f.kind == ElementKind::Radio)
                .any(|f| f.option_value.as_deref().is_some_and(|v| answer.value.selects(v)));

            for field in &question.fields {
                let action = match plan_action(field, &answer.value) {
                    Some(action) => action,
                    // An unchosen radio is left alone
                    None if radios_chosen => continue,
                    None => {
                        outcomes.push(outcome(
                            field,
                            pass,
                            FillStatus::Failed(FailReason::Exception),
                            None,
                            Some(format!(
                                "answer '{}' matches no option",
                                answer.value.as_input_text()
                            )),
                        ));
                        // Only report the unmatched set once
                        break;
                    }
                };
                outcomes.push(self.fill_field(field, action, pass, mode).await);
            }
        }

        let summary = FillSummary::from_outcomes(&outcomes);
        info!(
            "Fill pass {}: {} filled, {} skipped, {} failed",
            pass, summary.filled, summary.skipped, summary.failed
        );
        outcomes
    }

    async fn fill_field(
        &self,
        field: &InputField,
        action: Action,
        pass: u64,
        mode: ResolutionMode,
    ) -> FillOutcome {
        let located = match self.locate(field, mode).await {
            Ok(Some(located)) => located,
            Ok(None) => {
                return outcome(
                    field,
                    pass,
                    FillStatus::Skipped(SkipReason::NoSelectorMatch),
                    None,
                    None,
                );
            }
            Err(e) => {
                return outcome(
                    field,
                    pass,
                    FillStatus::Failed(FailReason::Exception),
                    None,
                    Some(e.to_string()),
                );
            }
        };

        let healed = located.healed.clone();
        if !located.state.visible {
            return outcome(field, pass, FillStatus::Skipped(SkipReason::NotVisible), healed, None);
        }
        if !located.state.enabled {
            return outcome(field, pass, FillStatus::Skipped(SkipReason::NotEnabled), healed, None);
        }

        // Keystroke pacing is budgeted on top of the field timeout
        let pacing_budget = match &action {
            Action::Type(text) => {
                Duration::from_millis(self.pacing.max_delay_ms) * text.chars().count() as u32
            }
            _ => Duration::ZERO,
        };
        let budget = self.field_timeout + pacing_budget;

        let result = tokio::time::timeout(budget, async {
            self.perform(&located, &action).await?;
            self.verify(&located.selector, &action).await
        })
        .await;

        let (status, detail) = match result {
            Ok(Ok(())) => (FillStatus::Filled, None),
            Ok(Err(e)) => {
                warn!("Field {} failed: {:#}", located.selector, e);
                (FillStatus::Failed(FailReason::Exception), Some(e.to_string()))
            }
            Err(_) => {
                warn!("Field {} timed out after {:?}", located.selector, budget);
                (
                    FillStatus::Failed(FailReason::Timeout),
                    Some(format!("timed out after {:?}", budget)),
                )
            }
        };
        outcome(field, pass, status, healed, detail)
    }

    /// Re-resolve a field on the live page, healing its selector when needed
    async fn locate(&self, field: &InputField, mode: ResolutionMode) -> Result<Option<Located>> {
        let states = self.page.query(&field.selector).await?;
        let usable = |s: &ElementState| s.visible && s.enabled;

        let needs_healing = match mode {
            ResolutionMode::Direct => states.is_empty(),
            ResolutionMode::HealerFirst => states.len() != 1 || !usable(&states[0]),
        };
        if !needs_healing {
            return Ok(states.into_iter().next().map(|state| Located {
                selector: field.selector.clone(),
                healed: None,
                state,
            }));
        }

        debug!("Selector {} needs healing ({} match(es))", field.selector, states.len());
        if let Some(healed) = self.healer.heal_live(field, self.page.as_ref()).await? {
            let healed_states = self.page.query(&healed.field.selector).await?;
            if let Some(state) = healed_states.into_iter().next() {
                return Ok(Some(Located {
                    selector: healed.field.selector.clone(),
                    healed: Some(healed.field.selector),
                    state,
                }));
            }
        }
        // Healer-first falls back to whatever the original selector matched
        Ok(states.into_iter().next().map(|state| Located {
            selector: field.selector.clone(),
            healed: None,
            state,
        }))
    }

    async fn perform(&self, located: &Located, action: &Action) -> Result<()> {
        let selector = &located.selector;
        match action {
            Action::Type(text) => {
                self.page.clear(selector).await?;
                for ch in text.chars() {
                    self.page.type_char(selector, ch).await?;
                    let delay = self.keystroke_delay();
                    tokio::time::sleep(delay).await;
                }
            }
            Action::Select(values) => self.page.select_options(selector, values).await?,
            Action::Toggle(desired) => {
                if located.state.checked != *desired {
                    self.page.click(selector).await?;
                }
            }
        }
        Ok(())
    }

    async fn verify(&self, selector: &Selector, action: &Action) -> Result<()> {
        let state = self
            .page
            .query(selector)
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("Element {} disappeared after input", selector))?;
        match action {
            Action::Type(text) if state.value != *text => {
                bail!("Value mismatch: expected '{}', found '{}'", text, state.value)
            }
            Action::Select(values) if !same_selection(values, &state.selected) => bail!(
                "Selection mismatch: expected '{}', found '{}'",
                values.join(","),
                state.selected.join(",")
            ),
            Action::Toggle(desired) if state.checked != *desired => {
                bail!("Toggle mismatch: expected checked={}", desired)
            }
            _ => Ok(()),
        }
    }

    fn keystroke_delay(&self) -> Duration {
        let (min, max) = (self.pacing.min_delay_ms, self.pacing.max_delay_ms);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Click the form's submit control and wait for a success signal
    pub async fn submit(&self, questions: &[Question]) -> Result<bool> {
        let dom = self.page.snapshot().await.context("Failed to snapshot page")?;
        let form = questions
            .iter()
            .flat_map(|q| &q.fields)
            .find_map(|f| dom.query(&f.selector).first().and_then(|&i| dom.enclosing_form(i)));

        let Some(button) = find_submit_control(&dom, form) else {
            warn!("No submit control found");
            return Ok(false);
        };
        let selector = field_selector(&dom, button);
        let before_url = self.page.url().await?;
        let before_text = dom.visible_text();

        let mut signals = vec![WaitCondition::UrlChanged { from: before_url }];
        let fresh_phrases: Vec<String> = SUCCESS_PHRASES
            .iter()
            .filter(|p| !before_text.contains(*p))
            .map(|p| p.to_string())
            .collect();
        if !fresh_phrases.is_empty() {
            signals.push(WaitCondition::TextPresent(fresh_phrases));
        }
        if let Some(form) = form {
            signals.push(WaitCondition::Gone(Selector::css(element_path(&dom, form))));
        }

        info!("Submitting via {}", selector);
        self.page.click(&selector).await?;
        let confirmed = self
            .page
            .wait_for(&WaitCondition::Any(signals), self.submit_wait)
            .await?;
        if confirmed {
            info!("Submission confirmed");
        } else {
            warn!("No success signal within {:?}", self.submit_wait);
        }
        Ok(confirmed)
    }
}

fn outcome(
    field: &InputField,
    pass: u64,
    status: FillStatus,
    healed: Option<Selector>,
    detail: Option<String>,
) -> FillOutcome {
    FillOutcome {
        question_id: field.question_id.clone(),
        selector: field.selector.clone(),
        status,
        healed,
        detail,
        pass,
    }
}

/// What to do with a field for an answer; `None` for radios the answer does not choose
fn plan_action(field: &InputField, value: &AnswerValue) -> Option<Action> {
    match field.kind {
        ElementKind::Text | ElementKind::Textarea => Some(Action::Type(value.as_input_text())),
        ElementKind::Select => Some(Action::Select(match value {
            AnswerValue::Choices(values) => values.clone(),
            AnswerValue::Choice(v) => vec![v.clone()],
            other => vec![other.as_input_text()],
        })),
        ElementKind::Checkbox => {
            let option = field.option_value.as_deref().unwrap_or("on");
            Some(Action::Toggle(value.selects(option)))
        }
        ElementKind::Radio => {
            let option = field.option_value.as_deref()?;
            value.selects(option).then_some(Action::Toggle(true))
        }
    }
}

/// Selections compare as sets; the browser reports them in option order
fn same_selection(wanted: &[String], selected: &[String]) -> bool {
    let wanted: BTreeSet<&String> = wanted.iter().collect();
    wanted == selected.iter().collect::<BTreeSet<_>>()
}

fn is_button(dom: &DomSnapshot, idx: usize) -> bool {
    let node = dom.node(idx);
    node.tag == "button"
        || (node.tag == "input"
            && matches!(node.input_type().as_str(), "submit" | "button" | "image"))
}

fn button_text(dom: &DomSnapshot, idx: usize) -> String {
    let node = dom.node(idx);
    let text = dom.text_content(idx);
    let text = if text.trim().is_empty() {
        node.attr("value").unwrap_or("").to_string()
    } else {
        text
    };
    text.to_lowercase()
}

/// Submit-typed control, then affirmative button, then the first enabled button
pub fn find_submit_control(dom: &DomSnapshot, form: Option<usize>) -> Option<usize> {
    let scope: Vec<usize> = match form {
        Some(f) => dom.descendants(f).collect(),
        None => (0..dom.len()).collect(),
    };
    let buttons: Vec<usize> = scope
        .into_iter()
        .filter(|&i| is_button(dom, i) && dom.is_rendered(i) && dom.is_enabled(i))
        .collect();

    let submit_typed = buttons.iter().copied().find(|&i| {
        let node = dom.node(i);
        matches!(node.attr("type"), Some(t) if t.eq_ignore_ascii_case("submit"))
            || (node.tag == "input" && node.input_type() == "image")
    });
    let affirmative = || {
        buttons.iter().copied().find(|&i| {
            let text = button_text(dom, i);
            AFFIRMATIVE_BUTTON_WORDS.iter().any(|w| text.contains(w))
        })
    };
    submit_typed
        .or_else(affirmative)
        .or_else(|| buttons.first().copied())
}

#[cfg(test)]
#[path = "filler_test.rs"]
mod filler_test;
