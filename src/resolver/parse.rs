//! Interpreting raw service values against a question's semantic type

use serde_json::Value;

use super::service::ServiceError;
use crate::types::{AnswerValue, Question, SemanticType, parse_date};

/// Longest free-text answer kept before truncation
pub const MAX_TEXT_CHARS: usize = 200;

const AFFIRMATIVE: &[&str] = &["yes", "y", "true", "agree", "correct", "1"];
const NEGATIVE: &[&str] = &["no", "n", "false", "disagree", "incorrect", "0"];

fn unparsable(question: &Question, value: &Value) -> ServiceError {
    let value = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ServiceError::Unparsable {
        value,
        semantic_type: question.semantic_type,
    }
}

/// Parse a service value for the question; anything that does not fit the type is
/// an error rather than a coerced guess.
pub fn parse_value(question: &Question, raw: &Value) -> Result<AnswerValue, ServiceError> {
    let fail = || unparsable(question, raw);
    match question.semantic_type {
        SemanticType::ShortText | SemanticType::LongText | SemanticType::Unknown => {
            let text = match raw {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return Err(fail()),
            };
            if text.is_empty() {
                return Err(fail());
            }
            Ok(AnswerValue::Text(truncate(&text)))
        }
        SemanticType::Boolean => match raw {
            Value::Bool(b) => Ok(AnswerValue::Boolean(*b)),
            Value::String(s) => parse_yes_no(s).map(AnswerValue::Boolean).ok_or_else(fail),
            Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(AnswerValue::Boolean(true)),
                Some(0) => Ok(AnswerValue::Boolean(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        SemanticType::SingleChoice => {
            let candidate = scalar_text(raw).ok_or_else(fail)?;
            question
                .find_choice(&candidate)
                .map(|c| AnswerValue::Choice(c.value.clone()))
                .ok_or_else(fail)
        }
        SemanticType::MultiChoice => {
            let candidates: Vec<String> = match raw {
                Value::Array(items) => items.iter().map(scalar_text).collect::<Option<_>>(),
                Value::String(s) => Some(s.split(',').map(|p| p.trim().to_string()).collect()),
                _ => None,
            }
            .ok_or_else(fail)?;

            let mut values: Vec<String> = Vec::new();
            for candidate in candidates.iter().filter(|c| !c.is_empty()) {
                let choice = question.find_choice(candidate).ok_or_else(fail)?;
                if !values.contains(&choice.value) {
                    values.push(choice.value.clone());
                }
            }
            if values.is_empty() {
                return Err(fail());
            }
            Ok(AnswerValue::Choices(values))
        }
        SemanticType::Numeric => {
            let number = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => first_number(s),
                _ => None,
            }
            .ok_or_else(fail)?;
            if let Some(bounds) = question.bounds
                && !(bounds.min..=bounds.max).contains(&number)
            {
                return Err(fail());
            }
            Ok(AnswerValue::Number(number))
        }
        SemanticType::Date => match raw {
            Value::String(s) => parse_date(s).map(AnswerValue::Date).map_err(|_| fail()),
            _ => Err(fail()),
        },
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Yes/no words; a negative word anywhere wins over an affirmative one
fn parse_yes_no(text: &str) -> Option<bool> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.iter().any(|w| NEGATIVE.contains(w)) {
        Some(false)
    } else if words.iter().any(|w| AFFIRMATIVE.contains(w)) {
        Some(true)
    } else {
        None
    }
}

/// First decimal number in free text, e.g. "about 42 years" -> 42
fn first_number(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;
    let mut end = start;
    let mut seen_dot = false;
    while end < chars.len() {
        match chars[end] {
            c if c.is_ascii_digit() => end += 1,
            '.' if !seen_dot && chars.get(end + 1).is_some_and(|c| c.is_ascii_digit()) => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    let negative = start > 0 && chars[start - 1] == '-';
    let digits: String = chars[start..end].iter().collect();
    let value: f64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_TEXT_CHARS {
        let head: String = text.chars().take(MAX_TEXT_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
