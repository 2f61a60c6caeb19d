//! Human-like shaping of free-text answers.
//!
//! Every draw is derived from the question id, so the same question is always shaped
//! the same way and cached answers stay stable between runs.

use sha2::{Digest, Sha256};

use crate::config::ShapingConfig;
use crate::types::{Answer, AnswerValue, Question, SemanticType};

const UNCERTAINTY_PREFIXES: &[&str] = &[
    "I'm not entirely sure, but I think",
    "If I had to guess, I'd say",
    "From what I remember",
    "I believe",
    "As far as I know",
];

const HEDGES: &[&str] = &[
    "probably",
    "likely",
    "I suppose",
    "perhaps",
    "it seems to me",
    "in my opinion",
    "I'd say",
];

/// Uniform draw in `[0, 1)` for one decision about one question
fn draw(question: &Question, salt: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(question.id.0.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

fn pick(options: &'static [&'static str], roll: f64) -> &'static str {
    let index = (roll * options.len() as f64) as usize;
    options[index.min(options.len() - 1)]
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn shape_text(text: &str, question: &Question, config: &ShapingConfig) -> String {
    let mut shaped = text.to_string();
    if draw(question, "uncertainty") < config.uncertainty_rate {
        let prefix = pick(UNCERTAINTY_PREFIXES, draw(question, "uncertainty-phrase"));
        shaped = format!("{} {}", prefix, lowercase_first(&shaped));
    }
    if draw(question, "hedging") < config.hedging_rate {
        let hedge = pick(HEDGES, draw(question, "hedging-phrase"));
        shaped = format!("{}, {}", shaped, hedge);
    }
    shaped
}

/// Soften a text answer and lower its confidence. Other answer kinds only lose
/// confidence; nothing changes when shaping is disabled.
pub fn humanize(mut answer: Answer, question: &Question, config: &ShapingConfig) -> Answer {
    if !config.enabled {
        return answer;
    }
    let is_text = matches!(
        question.semantic_type,
        SemanticType::ShortText | SemanticType::LongText
    );
    if is_text && let AnswerValue::Text(text) = &answer.value {
        let shaped = shape_text(text, question, config);
        answer.value = AnswerValue::Text(shaped);
    }
    let drop = 0.1 + 0.2 * draw(question, "confidence");
    answer.confidence = (answer.confidence - drop).max(config.confidence_floor);
    answer
}
