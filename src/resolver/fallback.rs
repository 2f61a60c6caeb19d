//! Deterministic answers used when the reasoning service cannot be relied on

use chrono::NaiveDate;

use crate::types::{Answer, AnswerValue, Provenance, Question, SemanticType};

pub const FALLBACK_CONFIDENCE: f64 = 0.3;

const TEXT_TEMPLATES: &[&str] = &[
    "I'm not sure about this",
    "I don't have a strong opinion",
    "I'd need to think about this more",
    "Not really sure",
];

/// Numeric range assumed when a control declares none
const DEFAULT_NUMERIC_RANGE: (f64, f64) = (1.0, 10.0);

fn template_for(question: &Question) -> &'static str {
    let seed: usize = question.id.0.bytes().map(usize::from).sum();
    TEXT_TEMPLATES[seed % TEXT_TEMPLATES.len()]
}

/// The value a question gets without the service: mid-range numbers, the first
/// choice, or a neutral phrase picked by question id.
pub fn fallback_value(question: &Question) -> AnswerValue {
    let text = || AnswerValue::Text(template_for(question).to_string());
    match question.semantic_type {
        SemanticType::SingleChoice => question
            .choices
            .first()
            .map(|c| AnswerValue::Choice(c.value.clone()))
            .unwrap_or_else(text),
        SemanticType::MultiChoice => question
            .choices
            .first()
            .map(|c| AnswerValue::Choices(vec![c.value.clone()]))
            .unwrap_or_else(text),
        SemanticType::Boolean => AnswerValue::Boolean(true),
        SemanticType::Numeric => {
            let (min, max) = question
                .bounds
                .map(|b| (b.min, b.max))
                .unwrap_or(DEFAULT_NUMERIC_RANGE);
            AnswerValue::Number(((min + max) / 2.0).floor().max(min))
        }
        SemanticType::Date => NaiveDate::from_ymd_opt(1990, 1, 1)
            .map(AnswerValue::Date)
            .unwrap_or_else(text),
        SemanticType::ShortText | SemanticType::LongText | SemanticType::Unknown => text(),
    }
}

pub fn fallback_answer(question: &Question, cause: &str) -> Answer {
    Answer {
        question_id: question.id.clone(),
        value: fallback_value(question),
        provenance: Provenance::Fallback,
        confidence: FALLBACK_CONFIDENCE,
        reasoning: Some(format!("fallback answer: {}", cause)),
    }
}
