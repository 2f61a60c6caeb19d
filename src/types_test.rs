// Unit tests for types module

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn test_normalize_text() {
    assert_eq!(normalize_text("  Your   Email: *"), "your email");
    assert_eq!(normalize_text("Age"), "age");
    assert_eq!(normalize_text("\tFavourite\ncolour  "), "favourite colour");
}

#[test]
fn test_question_id_is_stable() {
    let a = QuestionId::derive("Your email:", 0);
    let b = QuestionId::derive("your   EMAIL", 0);
    assert_eq!(a, b);
    assert_eq!(a.0.len(), 16);

    // Same text at another position is a different question
    let c = QuestionId::derive("Your email:", 1);
    assert_ne!(a, c);
}

#[test]
fn test_selector_to_css() {
    assert_eq!(Selector::id("email").to_css(), "[id=\"email\"]");
    assert_eq!(Selector::name("q\"1").to_css(), "[name=\"q\\\"1\"]");
    assert_eq!(Selector::css("form > input").to_css(), "form > input");
}

#[test]
fn test_cache_key_depends_on_type() {
    let mut question = Question {
        id: QuestionId::derive("Age", 0),
        text: "Age".to_string(),
        semantic_type: SemanticType::Numeric,
        fields: vec![],
        confidence: 0.9,
        choices: vec![],
        bounds: None,
    };
    let numeric = question.cache_key();
    question.text = "  AGE:".to_string();
    assert_eq!(question.cache_key(), numeric);

    question.semantic_type = SemanticType::ShortText;
    assert_ne!(question.cache_key(), numeric);
}

#[test]
fn test_find_choice_by_value_or_label() {
    let question = Question {
        id: QuestionId::derive("Colour", 0),
        text: "Colour".to_string(),
        semantic_type: SemanticType::SingleChoice,
        fields: vec![],
        confidence: 0.9,
        choices: vec![
            Choice {
                value: "r".to_string(),
                label: "Red".to_string(),
            },
            Choice {
                value: "b".to_string(),
                label: "Blue".to_string(),
            },
        ],
        bounds: None,
    };

    assert_eq!(question.find_choice("B").map(|c| c.label.as_str()), Some("Blue"));
    assert_eq!(question.find_choice("red").map(|c| c.value.as_str()), Some("r"));
    assert!(question.find_choice("green").is_none());
}

#[test]
fn test_answer_value_input_text() {
    assert_eq!(AnswerValue::Number(5.0).as_input_text(), "5");
    assert_eq!(AnswerValue::Number(2.5).as_input_text(), "2.5");
    assert_eq!(AnswerValue::Boolean(false).as_input_text(), "no");
    let date = parse_date("2001-02-03").unwrap();
    assert_eq!(AnswerValue::Date(date).as_input_text(), "2001-02-03");
    assert!(parse_date("03/02/2001").is_err());
}

#[test]
fn test_fill_ratio_ignores_skipped() {
    let summary = FillSummary {
        filled: 2,
        skipped: 4,
        failed: 3,
    };
    assert!((summary.fill_ratio() - 0.4).abs() < f64::EPSILON);

    let nothing = FillSummary {
        filled: 0,
        skipped: 3,
        failed: 0,
    };
    assert_eq!(nothing.fill_ratio(), 0.0);
}

#[test]
fn test_fill_status_serialization() {
    let json = serde_json::to_value(FillStatus::Skipped(SkipReason::NoSelectorMatch)).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"status": "skipped", "reason": "no-selector-match"})
    );
    let json = serde_json::to_value(FillStatus::Filled).unwrap();
    assert_eq!(json, serde_json::json!({"status": "filled"}));
}
