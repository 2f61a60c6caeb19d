use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier of a detected question
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestionId(pub String);

impl QuestionId {
    /// Derive an id from the normalized question text and its position on the page.
    ///
    /// The same text at the same position always yields the same id, so repeated
    /// extractor passes over an unchanged page agree on identity.
    pub fn derive(text: &str, position: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_text(text).as_bytes());
        hasher.update(b"#");
        hasher.update(position.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        QuestionId(digest[..16].to_string())
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, collapse whitespace and strip required-field markers.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
        .to_lowercase()
}

/// Inferred meaning of a question's expected answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticType {
    ShortText,
    LongText,
    SingleChoice,
    MultiChoice,
    Boolean,
    Numeric,
    Date,
    Unknown,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::ShortText => "short-text",
            SemanticType::LongText => "long-text",
            SemanticType::SingleChoice => "single-choice",
            SemanticType::MultiChoice => "multi-choice",
            SemanticType::Boolean => "boolean",
            SemanticType::Numeric => "numeric",
            SemanticType::Date => "date",
            SemanticType::Unknown => "unknown",
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, SemanticType::SingleChoice | SemanticType::MultiChoice)
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared kind of a form control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Text,
    Select,
    Checkbox,
    Radio,
    Textarea,
}

impl ElementKind {
    /// Tag name the control renders as
    pub fn tag(&self) -> &'static str {
        match self {
            ElementKind::Select => "select",
            ElementKind::Textarea => "textarea",
            _ => "input",
        }
    }
}

/// How a locator string should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorStrategy {
    /// A CSS selector
    Css,
    /// The element's `id` attribute
    Id,
    /// The element's `name` attribute
    Name,
}

/// A locator for an element. Never a live handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub strategy: SelectorStrategy,
    pub locator: String,
}

impl Selector {
    pub fn css(locator: impl Into<String>) -> Self {
        Self {
            strategy: SelectorStrategy::Css,
            locator: locator.into(),
        }
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self {
            strategy: SelectorStrategy::Id,
            locator: id.into(),
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            strategy: SelectorStrategy::Name,
            locator: name.into(),
        }
    }

    /// Render as a CSS selector understood by every backend
    pub fn to_css(&self) -> String {
        match self.strategy {
            SelectorStrategy::Css => self.locator.clone(),
            SelectorStrategy::Id => format!("[id=\"{}\"]", escape_attr(&self.locator)),
            SelectorStrategy::Name => format!("[name=\"{}\"]", escape_attr(&self.locator)),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.strategy, self.locator)
    }
}

/// Escape a value for use inside a double-quoted CSS attribute selector
pub fn escape_attr(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One enumerated option of a choice question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

/// Numeric bounds declared by a control (`min`/`max`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericBounds {
    pub min: f64,
    pub max: f64,
}

/// A form control detected as part of a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub selector: Selector,
    pub kind: ElementKind,
    /// Visibility at detection time; re-verified before use
    pub visible: bool,
    /// Enabled state at detection time; re-verified before use
    pub enabled: bool,
    /// Owning question (back-reference only)
    pub question_id: QuestionId,
    /// Text of the label this control was associated with
    pub label: Option<String>,
    /// `value` attribute of a radio/checkbox option
    pub option_value: Option<String>,
    /// Index among same-kind controls inside the question container
    pub position: usize,
    /// Element enclosing the question's label and controls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Selector>,
}

/// A detected, user-answerable prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    pub semantic_type: SemanticType,
    pub fields: Vec<InputField>,
    /// Association strength, 0 to 1
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<NumericBounds>,
}

impl Question {
    /// Key under which answers to this question are cached
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_text(&self.text).as_bytes());
        hasher.update(b"|");
        hasher.update(self.semantic_type.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Find a choice by value or label, case-insensitively
    pub fn find_choice(&self, candidate: &str) -> Option<&Choice> {
        let wanted = normalize_text(candidate);
        self.choices
            .iter()
            .find(|c| normalize_text(&c.value) == wanted)
            .or_else(|| {
                self.choices
                    .iter()
                    .find(|c| normalize_text(&c.label) == wanted)
            })
    }
}

/// A resolved answer value, typed per semantic type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AnswerValue {
    Text(String),
    Choice(String),
    Choices(Vec<String>),
    Boolean(bool),
    Number(f64),
    Date(NaiveDate),
}

impl AnswerValue {
    /// Text typed into a free-text control
    pub fn as_input_text(&self) -> String {
        match self {
            AnswerValue::Text(s) | AnswerValue::Choice(s) => s.clone(),
            AnswerValue::Choices(values) => values.join(", "),
            AnswerValue::Boolean(b) => if *b { "yes" } else { "no" }.to_string(),
            AnswerValue::Number(n) => format_number(*n),
            AnswerValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    /// Whether a choice-like answer selects the given option value
    pub fn selects(&self, option_value: &str) -> bool {
        match self {
            AnswerValue::Choice(v) => v == option_value,
            AnswerValue::Choices(vs) => vs.iter().any(|v| v == option_value),
            AnswerValue::Boolean(b) => *b,
            _ => false,
        }
    }
}

/// Render integral numbers without a trailing `.0`
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Source of an answer's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Cache,
    Service,
    Fallback,
    /// Supplied by a pluggable collaborator (e.g. a verification-code source)
    Collaborator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: QuestionId,
    pub value: AnswerValue,
    pub provenance: Provenance,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NotVisible,
    NotEnabled,
    NoSelectorMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    Timeout,
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum FillStatus {
    Filled,
    Skipped(SkipReason),
    Failed(FailReason),
}

/// Result of filling one input field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillOutcome {
    pub question_id: QuestionId,
    /// Selector of the field as detected
    pub selector: Selector,
    pub status: FillStatus,
    /// Replacement selector when the field had to be healed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healed: Option<Selector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Extractor pass the field belongs to
    pub pass: u64,
}

/// Counts of fill outcomes by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillSummary {
    pub filled: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FillSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a FillOutcome>) -> Self {
        let mut summary = FillSummary::default();
        for outcome in outcomes {
            match outcome.status {
                FillStatus::Filled => summary.filled += 1,
                FillStatus::Skipped(_) => summary.skipped += 1,
                FillStatus::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Ratio of filled to attempted fields; skipped fields are ignored.
    /// Nothing attempted counts as 0.
    pub fn fill_ratio(&self) -> f64 {
        let attempted = self.filled + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.filled as f64 / attempted as f64
        }
    }
}

/// Parse a date answer in `YYYY-MM-DD` form
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid date '{}': {}", s, e))
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
