//! Page model extraction: turns a document into an ordered list of questions.
//!
//! A control only becomes part of a question when it is structurally tied to
//! visible text. Association strategies, strongest first:
//!
//! 1. `<label for>` pointing at the control
//! 2. `aria-labelledby` referencing visible elements
//! 3. `<legend>` of the fieldset enclosing a radio/checkbox set
//! 4. A `<label>` wrapping the control
//! 5. The nearest preceding text within a few ancestor levels (proximity)
//!
//! Detection is read-only and deterministic: the same document always produces the
//! same questions with the same ids.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::page::{DomSnapshot, PageDriver};
use crate::selector::nth_of_type;
use crate::types::{
    Choice, ElementKind, InputField, NumericBounds, Question, QuestionId, SemanticType, Selector,
    escape_attr,
};

/// How far up the tree proximity association searches
const MAX_PROXIMITY_DEPTH: usize = 3;

/// Input types that never carry an answer
const NON_ANSWER_INPUT_TYPES: &[&str] = &["hidden", "submit", "button", "reset", "image", "file"];

/// Tags whose text is never question text
const NON_TEXT_TAGS: &[&str] = &[
    "option", "script", "style", "button", "select", "textarea", "noscript",
];

/// How a control was tied to its question text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    LabelFor,
    LabelledBy,
    Legend,
    WrappingLabel,
    /// Nearest preceding text, found this many levels above the control
    Proximity(usize),
}

impl Association {
    pub fn confidence(&self) -> f64 {
        match self {
            Association::LabelFor => 0.95,
            Association::LabelledBy | Association::Legend => 0.9,
            Association::WrappingLabel => 0.85,
            Association::Proximity(depth) => (0.6 - 0.1 * *depth as f64).max(0.3),
        }
    }
}

/// Scans live pages for questions
#[derive(Debug, Default, Clone, Copy)]
pub struct PageModelExtractor;

impl PageModelExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot the page and detect its questions
    pub async fn detect(&self, page: &dyn PageDriver) -> Result<Vec<Question>> {
        let dom = page.snapshot().await.context("Failed to snapshot page")?;
        let questions = detect_questions(&dom);
        info!(
            "Detected {} question(s) with {} field(s) on {}",
            questions.len(),
            questions.iter().map(|q| q.fields.len()).sum::<usize>(),
            dom.url
        );
        Ok(questions)
    }
}

/// Kind of an answerable control, `None` for everything else
pub fn control_kind(dom: &DomSnapshot, idx: usize) -> Option<ElementKind> {
    let node = dom.node(idx);
    match node.tag.as_str() {
        "select" => Some(ElementKind::Select),
        "textarea" => Some(ElementKind::Textarea),
        "input" => {
            let input_type = node.input_type();
            match input_type.as_str() {
                t if NON_ANSWER_INPUT_TYPES.contains(&t) => None,
                "checkbox" => Some(ElementKind::Checkbox),
                "radio" => Some(ElementKind::Radio),
                _ => Some(ElementKind::Text),
            }
        }
        _ => None,
    }
}

/// An answerable control that renders and accepts input
pub fn is_usable_control(dom: &DomSnapshot, idx: usize) -> bool {
    control_kind(dom, idx).is_some() && dom.is_rendered(idx) && dom.is_enabled(idx)
}

struct Group {
    kind: ElementKind,
    members: Vec<usize>,
}

fn group_controls(dom: &DomSnapshot) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut by_name: HashMap<(Option<usize>, ElementKind, String), usize> = HashMap::new();

    for idx in 0..dom.len() {
        if !is_usable_control(dom, idx) {
            continue;
        }
        let Some(kind) = control_kind(dom, idx) else {
            continue;
        };
        let name = dom.node(idx).attr("name").filter(|n| !n.is_empty());
        match (kind, name) {
            (ElementKind::Radio | ElementKind::Checkbox, Some(name)) => {
                let key = (dom.enclosing_form(idx), kind, name.to_string());
                if let Some(&g) = by_name.get(&key) {
                    groups[g].members.push(idx);
                } else {
                    by_name.insert(key, groups.len());
                    groups.push(Group {
                        kind,
                        members: vec![idx],
                    });
                }
            }
            _ => groups.push(Group {
                kind,
                members: vec![idx],
            }),
        }
    }
    groups
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn visible_text_of(dom: &DomSnapshot, idx: usize) -> Option<String> {
    if !dom.is_rendered(idx) {
        return None;
    }
    let text = collapse_ws(&dom.text_content(idx));
    (!text.is_empty()).then_some(text)
}

/// Labels pointing at a control through `for`
fn labels_for(dom: &DomSnapshot, control: usize) -> Vec<usize> {
    let Some(id) = dom.node(control).attr("id").filter(|id| !id.is_empty()) else {
        return Vec::new();
    };
    (0..dom.len())
        .filter(|&i| dom.node(i).tag == "label" && dom.node(i).attr("for") == Some(id))
        .collect()
}

fn wrapping_label(dom: &DomSnapshot, control: usize) -> Option<usize> {
    dom.ancestors(control).find(|&a| dom.node(a).tag == "label")
}

fn labelled_by(dom: &DomSnapshot, idx: usize) -> Option<(String, usize)> {
    let ids = dom.node(idx).attr("aria-labelledby")?;
    let mut first = None;
    let texts: Vec<String> = ids
        .split_whitespace()
        .filter_map(|id| (0..dom.len()).find(|&i| dom.node(i).attr("id") == Some(id)))
        .filter_map(|i| {
            first.get_or_insert(i);
            visible_text_of(dom, i)
        })
        .collect();
    if texts.is_empty() {
        return None;
    }
    Some((texts.join(" "), first.unwrap_or(idx)))
}

/// Direct label of a control: `for`, `aria-labelledby` or wrapping label.
/// Returns the text, the node carrying it and the association.
pub fn direct_label(dom: &DomSnapshot, control: usize) -> Option<(String, usize, Association)> {
    for label in labels_for(dom, control) {
        if let Some(text) = visible_text_of(dom, label) {
            return Some((text, label, Association::LabelFor));
        }
    }
    if let Some((text, node)) = labelled_by(dom, control) {
        return Some((text, node, Association::LabelledBy));
    }
    let label = wrapping_label(dom, control)?;
    visible_text_of(dom, label).map(|text| (text, label, Association::WrappingLabel))
}

/// Label nodes (and their descendants) owned by the given controls
fn owned_label_nodes(dom: &DomSnapshot, controls: impl Iterator<Item = usize>) -> HashSet<usize> {
    let mut owned = HashSet::new();
    for control in controls {
        let labels = labels_for(dom, control)
            .into_iter()
            .chain(wrapping_label(dom, control));
        for label in labels {
            owned.insert(label);
            owned.extend(dom.descendants(label));
        }
    }
    owned
}

fn is_text_candidate(dom: &DomSnapshot, idx: usize) -> bool {
    let node = dom.node(idx);
    !node.text.trim().is_empty()
        && !NON_TEXT_TAGS.contains(&node.tag.as_str())
        && !dom
            .ancestors(idx)
            .any(|a| NON_TEXT_TAGS.contains(&dom.node(a).tag.as_str()))
        && dom.is_rendered(idx)
}

/// Nearest visible text preceding `control`, searched within growing ancestor scopes.
///
/// Text separated from the control by another control belongs to that control.
fn nearest_preceding_text(
    dom: &DomSnapshot,
    control: usize,
    members: &[usize],
    excluded: &HashSet<usize>,
) -> Option<(String, usize, Association)> {
    let mut scope_child = control;
    for depth in 0..=MAX_PROXIMITY_DEPTH {
        let scope = dom.node(scope_child).parent?;
        let mut best = dom
            .descendants(scope)
            .take_while(|&j| j < control)
            .filter(|&j| !excluded.contains(&j) && is_text_candidate(dom, j))
            .last();
        if best.is_none() && !excluded.contains(&scope) && is_text_candidate(dom, scope) {
            best = Some(scope);
        }

        if let Some(text_node) = best {
            let intervening = (text_node + 1..control)
                .any(|k| !members.contains(&k) && is_usable_control(dom, k));
            if intervening {
                return None;
            }
            let text = collapse_ws(dom.node(text_node).text.trim());
            return Some((text, text_node, Association::Proximity(depth)));
        }
        scope_child = scope;
    }
    None
}

/// Legend of the nearest fieldset enclosing every member
fn fieldset_legend(dom: &DomSnapshot, members: &[usize]) -> Option<(String, usize, Association)> {
    let fieldset = dom
        .ancestors(members[0])
        .find(|&a| dom.node(a).tag == "fieldset")?;
    if !members.iter().all(|&m| dom.is_descendant(m, fieldset)) {
        return None;
    }
    let legend = dom
        .children(fieldset)
        .find(|&c| dom.node(c).tag == "legend")?;
    visible_text_of(dom, legend).map(|text| (text, fieldset, Association::Legend))
}

/// Text a single control is associated with: its direct label, else nearby text
pub fn associated_text(dom: &DomSnapshot, control: usize) -> Option<String> {
    if let Some((text, _, _)) = direct_label(dom, control) {
        return Some(text);
    }
    let others = owned_label_nodes(
        dom,
        (0..dom.len()).filter(|&i| i != control && is_usable_control(dom, i)),
    );
    nearest_preceding_text(dom, control, &[control], &others).map(|(text, _, _)| text)
}

/// Nearest common ancestor of a set of nodes
pub fn common_ancestor(dom: &DomSnapshot, nodes: &[usize]) -> Option<usize> {
    let (&first, rest) = nodes.split_first()?;
    std::iter::once(first)
        .chain(dom.ancestors(first))
        .find(|&candidate| {
            rest.iter()
                .all(|&n| n == candidate || dom.is_descendant(n, candidate))
        })
}

/// Structural CSS path, anchored at the nearest ancestor with a unique id
pub fn element_path(dom: &DomSnapshot, idx: usize) -> String {
    let mut segments = Vec::new();
    let mut current = Some(idx);
    while let Some(i) = current {
        let node = dom.node(i);
        if let Some(id) = node.attr("id").filter(|id| !id.is_empty())
            && dom.query(&Selector::id(id)).len() == 1
        {
            segments.push(format!("{}[id=\"{}\"]", node.tag, escape_attr(id)));
            break;
        }
        segments.push(format!("{}:nth-of-type({})", node.tag, nth_of_type(dom, i)));
        current = node.parent;
    }
    segments.reverse();
    segments.join(" > ")
}

/// Most stable unique selector for a control
pub fn field_selector(dom: &DomSnapshot, idx: usize) -> Selector {
    let node = dom.node(idx);
    let unique = |sel: &Selector| dom.query(sel) == vec![idx];

    if matches!(
        control_kind(dom, idx),
        Some(ElementKind::Radio | ElementKind::Checkbox)
    ) && let (Some(name), Some(value)) = (node.attr("name"), node.attr("value"))
    {
        let sel = Selector::css(format!(
            "input[name=\"{}\"][value=\"{}\"]",
            escape_attr(name),
            escape_attr(value)
        ));
        if unique(&sel) {
            return sel;
        }
    }
    if let Some(id) = node.attr("id").filter(|id| !id.is_empty()) {
        let sel = Selector::id(id);
        if unique(&sel) {
            return sel;
        }
    }
    if let Some(name) = node.attr("name").filter(|n| !n.is_empty()) {
        let sel = Selector::name(name);
        if unique(&sel) {
            return sel;
        }
    }
    Selector::css(element_path(dom, idx))
}

fn infer_type(dom: &DomSnapshot, group: &Group) -> SemanticType {
    let node = dom.node(group.members[0]);
    match group.kind {
        ElementKind::Select if node.has_attr("multiple") => SemanticType::MultiChoice,
        ElementKind::Select | ElementKind::Radio => SemanticType::SingleChoice,
        ElementKind::Checkbox if group.members.len() > 1 => SemanticType::MultiChoice,
        ElementKind::Checkbox => SemanticType::Boolean,
        ElementKind::Textarea => SemanticType::LongText,
        ElementKind::Text => {
            let inputmode = node.attr("inputmode").unwrap_or("");
            match node.input_type().as_str() {
                "number" | "range" => SemanticType::Numeric,
                _ if matches!(inputmode, "numeric" | "decimal") => SemanticType::Numeric,
                "date" => SemanticType::Date,
                "text" | "email" | "tel" | "url" | "password" | "search" => {
                    SemanticType::ShortText
                }
                _ => SemanticType::Unknown,
            }
        }
    }
}

fn numeric_bounds(dom: &DomSnapshot, idx: usize) -> Option<NumericBounds> {
    let node = dom.node(idx);
    let parse = |name: &str| node.attr(name).and_then(|v| v.trim().parse::<f64>().ok());
    match (parse("min"), parse("max")) {
        (Some(min), Some(max)) if min <= max => Some(NumericBounds { min, max }),
        _ if node.input_type() == "range" => Some(NumericBounds {
            min: 0.0,
            max: 100.0,
        }),
        _ => None,
    }
}

fn option_label(dom: &DomSnapshot, control: usize) -> Option<String> {
    direct_label(dom, control).map(|(text, _, _)| text)
}

struct Candidate {
    text: String,
    association: Association,
    semantic_type: SemanticType,
    container: usize,
    kind: ElementKind,
    members: Vec<usize>,
    choices: Vec<Choice>,
    labels: Vec<Option<String>>,
    bounds: Option<NumericBounds>,
}

fn candidate_for(dom: &DomSnapshot, group: &Group, others: &HashSet<usize>) -> Option<Candidate> {
    let members = &group.members;
    let first = members[0];
    let is_option_set = matches!(group.kind, ElementKind::Radio)
        || (group.kind == ElementKind::Checkbox && members.len() > 1);

    let (text, anchor, association) = if is_option_set {
        let mut excluded = others.clone();
        excluded.extend(owned_label_nodes(dom, members.iter().copied()));
        fieldset_legend(dom, members)
            .or_else(|| {
                common_ancestor(dom, members)
                    .and_then(|c| labelled_by(dom, c).map(|(t, n)| (t, n, Association::LabelledBy)))
            })
            .or_else(|| nearest_preceding_text(dom, first, members, &excluded))?
    } else {
        direct_label(dom, first).or_else(|| nearest_preceding_text(dom, first, members, others))?
    };

    let mut span = members.clone();
    span.push(anchor);
    let container = common_ancestor(dom, &span)?;

    let choices = match group.kind {
        ElementKind::Select => dom
            .node(first)
            .options
            .iter()
            .filter(|o| !o.value.trim().is_empty())
            .map(|o| Choice {
                value: o.value.clone(),
                label: if o.label.trim().is_empty() {
                    o.value.clone()
                } else {
                    collapse_ws(&o.label)
                },
            })
            .collect(),
        _ if is_option_set => members
            .iter()
            .map(|&m| {
                let value = dom.node(m).attr("value").unwrap_or("on").to_string();
                let label = option_label(dom, m).unwrap_or_else(|| value.clone());
                Choice { value, label }
            })
            .collect(),
        _ => Vec::new(),
    };

    let labels = members
        .iter()
        .map(|&m| {
            if is_option_set {
                option_label(dom, m)
            } else {
                Some(text.clone())
            }
        })
        .collect();

    Some(Candidate {
        semantic_type: infer_type(dom, group),
        bounds: numeric_bounds(dom, first),
        text,
        association,
        container,
        kind: group.kind,
        members: members.clone(),
        choices,
        labels,
    })
}

/// Detect questions in a snapshot
pub fn detect_questions(dom: &DomSnapshot) -> Vec<Question> {
    let groups = group_controls(dom);
    let mut questions = Vec::new();

    for (g, group) in groups.iter().enumerate() {
        // Labels of every other control are never this group's question text
        let others = owned_label_nodes(
            dom,
            groups
                .iter()
                .enumerate()
                .filter(|(o, _)| *o != g)
                .flat_map(|(_, other)| other.members.iter().copied()),
        );

        let Some(candidate) = candidate_for(dom, group, &others) else {
            debug!(
                "Skipping {:?} control at node {}: no associated text",
                group.kind, group.members[0]
            );
            continue;
        };

        let id = QuestionId::derive(&candidate.text, questions.len());
        let container = Selector::css(element_path(dom, candidate.container));
        let same_kind_in_container: Vec<usize> = dom
            .descendants(candidate.container)
            .filter(|&i| control_kind(dom, i) == Some(candidate.kind) && is_usable_control(dom, i))
            .collect();

        let fields = candidate
            .members
            .iter()
            .zip(candidate.labels)
            .map(|(&m, label)| InputField {
                selector: field_selector(dom, m),
                kind: candidate.kind,
                visible: dom.is_rendered(m),
                enabled: dom.is_enabled(m),
                question_id: id.clone(),
                label,
                option_value: match candidate.kind {
                    ElementKind::Radio | ElementKind::Checkbox => {
                        Some(dom.node(m).attr("value").unwrap_or("on").to_string())
                    }
                    _ => None,
                },
                position: same_kind_in_container
                    .iter()
                    .position(|&i| i == m)
                    .unwrap_or(0),
                container: Some(container.clone()),
            })
            .collect();

        debug!(
            "Question '{}' ({}) via {:?}",
            candidate.text, candidate.semantic_type, candidate.association
        );
        questions.push(Question {
            id,
            text: candidate.text,
            semantic_type: candidate.semantic_type,
            fields,
            confidence: candidate.association.confidence(),
            choices: candidate.choices,
            bounds: candidate.bounds,
        });
    }

    questions
}

#[cfg(test)]
#[path = "extractor_test.rs"]
mod extractor_test;
