// Unit tests for the precision filler

use super::*;
use crate::extractor::detect_questions;
use crate::memory::{ClickEffect, DomBuilder, MemoryPage, PageFault};
use crate::page::Rect;
use crate::types::{Provenance, SemanticType};
use pretty_assertions::assert_eq;

fn registration_page() -> DomSnapshot {
    let mut b = DomBuilder::new("https://example.com/register");
    let form = b.element(None, "form", &[("id", "f")], "");
    b.element(Some(form), "label", &[("for", "name")], "Full name");
    b.element(Some(form), "input", &[("id", "name"), ("name", "name")], "");
    b.element(Some(form), "label", &[("for", "country")], "Country");
    let select = b.element(Some(form), "select", &[("id", "country")], "");
    b.option(select, "fr", "France").option(select, "de", "Germany");
    let fieldset = b.element(Some(form), "fieldset", &[], "");
    b.element(Some(fieldset), "legend", &[], "Colour");
    let red = b.element(Some(fieldset), "label", &[], "Red");
    b.element(
        Some(red),
        "input",
        &[("type", "radio"), ("name", "colour"), ("value", "red")],
        "",
    );
    let blue = b.element(Some(fieldset), "label", &[], "Blue");
    b.element(
        Some(blue),
        "input",
        &[("type", "radio"), ("name", "colour"), ("value", "blue")],
        "",
    );
    let news = b.element(Some(form), "label", &[], "Subscribe");
    b.element(
        Some(news),
        "input",
        &[("type", "checkbox"), ("name", "news"), ("value", "yes")],
        "",
    );
    b.element(Some(form), "button", &[("type", "submit")], "Register");
    b.build()
}

fn answer(question: &Question, value: AnswerValue) -> Answer {
    Answer {
        question_id: question.id.clone(),
        value,
        provenance: Provenance::Service,
        confidence: 0.9,
        reasoning: None,
    }
}

fn registration_answers(questions: &[Question]) -> Vec<Answer> {
    vec![
        answer(&questions[0], AnswerValue::Text("Ada Lovelace".to_string())),
        answer(&questions[1], AnswerValue::Choice("de".to_string())),
        answer(&questions[2], AnswerValue::Choice("blue".to_string())),
        answer(&questions[3], AnswerValue::Boolean(true)),
    ]
}

fn filler(page: &Arc<MemoryPage>) -> PrecisionFiller {
    PrecisionFiller::new(page.clone(), &FlowConfig::default())
}

fn statuses(outcomes: &[FillOutcome]) -> Vec<FillStatus> {
    outcomes.iter().map(|o| o.status).collect()
}

fn rename_id(dom: &mut DomSnapshot, from: &str, to: &str) {
    for node in dom.nodes.iter_mut() {
        if node.attr("id") == Some(from) {
            node.attrs.insert("id".to_string(), to.to_string());
        }
        if node.attr("for") == Some(from) {
            node.attrs.insert("for".to_string(), to.to_string());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_fills_every_kind_of_control() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    assert_eq!(questions.len(), 4);
    let page = Arc::new(MemoryPage::new(dom));

    let outcomes = filler(&page)
        .fill(&questions, &registration_answers(&questions), 1, ResolutionMode::Direct)
        .await;

    // One outcome per text/select/checkbox field, only the chosen radio
    assert_eq!(statuses(&outcomes), vec![FillStatus::Filled; 4]);
    assert!(outcomes.iter().all(|o| o.pass == 1 && o.healed.is_none()));
    assert_eq!(page.value_of("#name").as_deref(), Some("Ada Lovelace"));
    assert_eq!(page.value_of("#country").as_deref(), Some("de"));
    assert!(page.is_checked("input[value=\"blue\"]"));
    assert!(!page.is_checked("input[value=\"red\"]"));
    assert!(page.is_checked("input[name=\"news\"]"));

    // Text is typed one keystroke at a time
    let keystrokes = page.actions().iter().filter(|a| a.kind == "type").count();
    assert_eq!(keystrokes, "Ada Lovelace".len());
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_selector_is_healed() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.mutate(true, |dom| rename_id(dom, "name", "full-name"));

    let outcomes = filler(&page)
        .fill(&questions[..1], &registration_answers(&questions), 1, ResolutionMode::Direct)
        .await;

    assert_eq!(outcomes[0].status, FillStatus::Filled);
    assert_eq!(outcomes[0].selector, Selector::id("name"));
    assert_eq!(outcomes[0].healed, Some(Selector::id("full-name")));
    assert_eq!(page.value_of("#full-name").as_deref(), Some("Ada Lovelace"));
}

#[tokio::test(start_paused = true)]
async fn test_unhealable_selector_is_skipped_not_failed() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.mutate(true, |dom| {
        for node in dom.nodes.iter_mut() {
            if node.attr("id") == Some("name") {
                node.tag = "span".to_string();
                node.attrs.remove("id");
                node.attrs.remove("name");
            }
        }
    });

    let outcomes = filler(&page)
        .fill(&questions[..1], &registration_answers(&questions), 1, ResolutionMode::Direct)
        .await;

    assert_eq!(
        statuses(&outcomes),
        vec![FillStatus::Skipped(SkipReason::NoSelectorMatch)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_hidden_and_disabled_fields_are_skipped() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.mutate(false, |dom| {
        for node in dom.nodes.iter_mut() {
            match node.attr("id") {
                Some("name") => node.display_none = true,
                Some("country") => {
                    node.attrs.insert("disabled".to_string(), String::new());
                }
                _ => {}
            }
        }
    });

    let outcomes = filler(&page)
        .fill(&questions[..2], &registration_answers(&questions), 2, ResolutionMode::Direct)
        .await;

    assert_eq!(
        statuses(&outcomes),
        vec![
            FillStatus::Skipped(SkipReason::NotVisible),
            FillStatus::Skipped(SkipReason::NotEnabled),
        ]
    );
    assert!(page.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ignored_input_fails_verification() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.fault("#name", PageFault::IgnoreInput)
        .fault("#country", PageFault::Error);

    let outcomes = filler(&page)
        .fill(&questions[..2], &registration_answers(&questions), 1, ResolutionMode::Direct)
        .await;

    assert_eq!(
        statuses(&outcomes),
        vec![FillStatus::Failed(FailReason::Exception); 2]
    );
    assert!(
        outcomes[0]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("Value mismatch"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_field_times_out() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.fault("#name", PageFault::Hang);

    let outcomes = filler(&page)
        .fill(&questions[..1], &registration_answers(&questions), 1, ResolutionMode::Direct)
        .await;

    assert_eq!(statuses(&outcomes), vec![FillStatus::Failed(FailReason::Timeout)]);
}

#[tokio::test(start_paused = true)]
async fn test_multi_select_is_verified_as_a_set() {
    let mut b = DomBuilder::new("https://example.com/profile");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "label", &[("for", "langs")], "Languages spoken");
    let select = b.element(
        Some(form),
        "select",
        &[("id", "langs"), ("name", "langs"), ("multiple", "")],
        "",
    );
    b.option(select, "en", "English")
        .option(select, "fr", "French")
        .option(select, "de", "German");
    let dom = b.build();
    let questions = detect_questions(&dom);
    assert_eq!(questions[0].semantic_type, SemanticType::MultiChoice);

    let page = Arc::new(MemoryPage::new(dom));
    // English starts out selected and is not part of the answer
    page.mutate(false, |dom| {
        let node = &mut dom.nodes[select];
        node.selected = vec!["en".to_string()];
        node.value = "en".to_string();
    });
    let answers = vec![answer(
        &questions[0],
        AnswerValue::Choices(vec!["de".to_string(), "fr".to_string()]),
    )];

    let outcomes = filler(&page)
        .fill(&questions, &answers, 1, ResolutionMode::Direct)
        .await;

    assert_eq!(statuses(&outcomes), vec![FillStatus::Filled]);
    assert_eq!(page.selected_of("#langs"), vec!["fr", "de"]);
    // The element value is the first selected option, not the last one chosen
    assert_eq!(page.value_of("#langs").as_deref(), Some("fr"));
}

#[tokio::test(start_paused = true)]
async fn test_fields_under_unrendered_ancestors_are_not_visible() {
    let mut b = DomBuilder::new("https://example.com/survey");
    let form = b.element(None, "form", &[], "");
    let first = b.element(Some(form), "div", &[("id", "first")], "");
    b.element(Some(first), "label", &[("for", "city")], "City");
    b.element(Some(first), "input", &[("id", "city")], "");
    let second = b.element(Some(form), "div", &[("id", "second")], "");
    b.element(Some(second), "label", &[("for", "pet")], "Pet name");
    b.element(Some(second), "input", &[("id", "pet")], "");
    let dom = b.build();
    let questions = detect_questions(&dom);
    assert_eq!(questions.len(), 2);

    let page = Arc::new(MemoryPage::new(dom));
    page.mutate(false, |dom| {
        dom.nodes[first].visibility_hidden = true;
        dom.nodes[second].rect = Rect::default();
    });
    let answers = vec![
        answer(&questions[0], AnswerValue::Text("Lyon".to_string())),
        answer(&questions[1], AnswerValue::Text("Rex".to_string())),
    ];

    let outcomes = filler(&page)
        .fill(&questions, &answers, 1, ResolutionMode::Direct)
        .await;

    assert_eq!(
        statuses(&outcomes),
        vec![FillStatus::Skipped(SkipReason::NotVisible); 2]
    );
    assert!(page.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_radio_answer_matching_no_option_fails_once() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    let answers = vec![answer(&questions[2], AnswerValue::Choice("green".to_string()))];

    let outcomes = filler(&page)
        .fill(&questions[2..3], &answers, 1, ResolutionMode::Direct)
        .await;

    assert_eq!(statuses(&outcomes), vec![FillStatus::Failed(FailReason::Exception)]);
}

#[tokio::test(start_paused = true)]
async fn test_submit_detects_navigation() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.on_click(
        "button",
        ClickEffect::Navigate("https://example.com/welcome".to_string()),
    );

    assert!(filler(&page).submit(&questions).await.unwrap());
    assert_eq!(page.dom().url, "https://example.com/welcome");
}

#[tokio::test(start_paused = true)]
async fn test_submit_detects_success_text() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));
    page.on_click(
        "button",
        ClickEffect::ShowText("Thank you for registering".to_string()),
    );

    assert!(filler(&page).submit(&questions).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_submit_without_signal_is_unconfirmed() {
    let dom = registration_page();
    let questions = detect_questions(&dom);
    let page = Arc::new(MemoryPage::new(dom));

    assert!(!filler(&page).submit(&questions).await.unwrap());
    assert_eq!(page.actions().len(), 1);
}

#[test]
fn test_submit_control_preference() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "button", &[("type", "button")], "Cancel");
    let next = b.element(Some(form), "button", &[("type", "button")], "Continue");
    let dom = b.build();
    assert_eq!(find_submit_control(&dom, Some(form)), Some(next));

    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "button", &[("type", "button")], "Continue");
    let submit = b.element(Some(form), "input", &[("type", "submit"), ("value", "Go")], "");
    let dom = b.build();
    assert_eq!(find_submit_control(&dom, Some(form)), Some(submit));

    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    let only = b.element(Some(form), "button", &[("type", "button")], "Maybe");
    let dom = b.build();
    assert_eq!(find_submit_control(&dom, Some(form)), Some(only));
}
