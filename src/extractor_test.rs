// Unit tests for the page model extractor

use super::*;
use crate::memory::{DomBuilder, MemoryPage};
use pretty_assertions::assert_eq;

fn signup_page() -> DomSnapshot {
    let mut b = DomBuilder::new("https://example.com/signup");
    let form = b.element(None, "form", &[("id", "signup")], "");
    b.element(Some(form), "label", &[("for", "email")], "Email address");
    b.element(
        Some(form),
        "input",
        &[("id", "email"), ("name", "email"), ("type", "email")],
        "",
    );
    let row = b.element(Some(form), "div", &[], "");
    b.element(Some(row), "span", &[], "Age");
    b.element(
        Some(row),
        "input",
        &[("name", "age"), ("type", "number"), ("min", "18"), ("max", "99")],
        "",
    );
    let fieldset = b.element(Some(form), "fieldset", &[], "");
    b.element(Some(fieldset), "legend", &[], "Favourite colour");
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
    b.element(
        Some(form),
        "input",
        &[("type", "hidden"), ("name", "token"), ("value", "abc")],
        "",
    );
    b.element(Some(form), "label", &[("for", "secret")], "Secret");
    let secret = b.element(
        Some(form),
        "input",
        &[("id", "secret"), ("name", "secret")],
        "",
    );
    b.hide(secret);
    b.element(Some(form), "button", &[("type", "submit")], "Sign up");
    b.build()
}

#[test]
fn test_detects_label_proximity_and_legend_questions() {
    let dom = signup_page();
    let questions = detect_questions(&dom);

    let texts: Vec<&str> = questions.iter().map(|q| q.text.as_str()).collect();
    assert_eq!(texts, vec!["Email address", "Age", "Favourite colour"]);

    let email = &questions[0];
    assert_eq!(email.semantic_type, SemanticType::ShortText);
    assert_eq!(email.confidence, Association::LabelFor.confidence());
    assert_eq!(email.fields.len(), 1);
    assert_eq!(email.fields[0].selector, Selector::id("email"));
    assert_eq!(email.fields[0].label.as_deref(), Some("Email address"));
    assert_eq!(
        email.fields[0].container,
        Some(Selector::css("form[id=\"signup\"]"))
    );

    let age = &questions[1];
    assert_eq!(age.semantic_type, SemanticType::Numeric);
    assert_eq!(age.confidence, Association::Proximity(0).confidence());
    assert_eq!(age.bounds, Some(NumericBounds { min: 18.0, max: 99.0 }));
    assert_eq!(age.fields[0].selector, Selector::name("age"));
    assert_eq!(
        age.fields[0].container,
        Some(Selector::css("form[id=\"signup\"] > div:nth-of-type(1)"))
    );

    let colour = &questions[2];
    assert_eq!(colour.semantic_type, SemanticType::SingleChoice);
    assert_eq!(colour.confidence, Association::Legend.confidence());
    assert_eq!(colour.fields.len(), 2);
    assert_eq!(
        colour.choices,
        vec![
            Choice {
                value: "red".to_string(),
                label: "Red".to_string()
            },
            Choice {
                value: "blue".to_string(),
                label: "Blue".to_string()
            },
        ]
    );
    assert_eq!(
        colour.fields[1].selector,
        Selector::css("input[name=\"colour\"][value=\"blue\"]")
    );
    assert_eq!(colour.fields[1].option_value.as_deref(), Some("blue"));
    assert_eq!(colour.fields[1].position, 1);

    for question in &questions {
        for field in &question.fields {
            assert_eq!(field.question_id, question.id);
        }
    }
}

#[test]
fn test_explicit_label_outranks_proximity() {
    assert!(Association::LabelFor.confidence() > Association::WrappingLabel.confidence());
    assert!(Association::WrappingLabel.confidence() > Association::Proximity(0).confidence());
    assert!(Association::Proximity(0).confidence() > Association::Proximity(2).confidence());
}

#[test]
fn test_ids_are_derived_from_text_and_position() {
    let questions = detect_questions(&signup_page());
    assert_eq!(questions[0].id, QuestionId::derive("Email address", 0));
    assert_eq!(questions[2].id, QuestionId::derive("Favourite colour", 2));
}

#[tokio::test]
async fn test_detect_is_idempotent_and_read_only() {
    let page = MemoryPage::new(signup_page());
    let extractor = PageModelExtractor::new();

    let first = extractor.detect(&page).await.unwrap();
    let second = extractor.detect(&page).await.unwrap();

    assert_eq!(first, second);
    assert!(page.actions().is_empty());
}

#[test]
fn test_unlabelled_control_is_not_a_question() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "input", &[("name", "orphan")], "");
    assert!(detect_questions(&b.build()).is_empty());
}

#[test]
fn test_text_before_another_control_is_not_reused() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    let row = b.element(Some(form), "div", &[], "");
    b.element(Some(row), "span", &[], "Nickname");
    b.element(Some(row), "input", &[("name", "nick")], "");
    b.element(Some(row), "input", &[("name", "other")], "");

    let questions = detect_questions(&b.build());
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].text, "Nickname");
    assert_eq!(questions[0].fields[0].selector, Selector::name("nick"));
}

#[test]
fn test_excludes_hidden_collapsed_and_disabled_controls() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    let ghost = b.element(Some(form), "div", &[], "");
    b.element(Some(ghost), "label", &[("for", "a")], "Invisible");
    b.element(Some(ghost), "input", &[("id", "a")], "");
    let flat = b.element(Some(form), "div", &[], "");
    b.element(Some(flat), "label", &[("for", "b")], "Collapsed");
    b.element(Some(flat), "input", &[("id", "b")], "");
    let locked = b.element(Some(form), "fieldset", &[("disabled", "")], "");
    b.element(Some(locked), "label", &[("for", "c")], "Locked");
    b.element(Some(locked), "input", &[("id", "c")], "");
    b.element(Some(form), "label", &[("for", "d")], "Read me");
    b.element(Some(form), "input", &[("id", "d"), ("disabled", "")], "");
    b.element(Some(form), "label", &[("for", "e")], "Visible");
    b.element(Some(form), "input", &[("id", "e")], "");
    b.invisible(ghost).collapse(flat);

    let questions = detect_questions(&b.build());
    let texts: Vec<&str> = questions.iter().map(|q| q.text.as_str()).collect();
    assert_eq!(texts, vec!["Visible"]);
}

#[test]
fn test_checkbox_group_and_single_checkbox() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    let hobbies = b.element(Some(form), "div", &[], "");
    b.element(Some(hobbies), "p", &[], "Hobbies");
    let chess = b.element(Some(hobbies), "label", &[], "Chess");
    b.element(
        Some(chess),
        "input",
        &[("type", "checkbox"), ("name", "hobby"), ("value", "chess")],
        "",
    );
    let go = b.element(Some(hobbies), "label", &[], "Go");
    b.element(
        Some(go),
        "input",
        &[("type", "checkbox"), ("name", "hobby"), ("value", "go")],
        "",
    );
    let terms = b.element(Some(form), "label", &[], "I agree to the terms");
    b.element(
        Some(terms),
        "input",
        &[("type", "checkbox"), ("name", "terms"), ("value", "yes")],
        "",
    );

    let questions = detect_questions(&b.build());
    assert_eq!(questions.len(), 2);

    let group = &questions[0];
    assert_eq!(group.text, "Hobbies");
    assert_eq!(group.semantic_type, SemanticType::MultiChoice);
    assert_eq!(group.fields.len(), 2);
    assert_eq!(group.confidence, Association::Proximity(1).confidence());
    assert_eq!(group.fields[0].label.as_deref(), Some("Chess"));

    let single = &questions[1];
    assert_eq!(single.text, "I agree to the terms");
    assert_eq!(single.semantic_type, SemanticType::Boolean);
    assert_eq!(single.confidence, Association::WrappingLabel.confidence());
    assert!(single.choices.is_empty());
    assert_eq!(single.fields[0].option_value.as_deref(), Some("yes"));
}

#[test]
fn test_select_and_labelled_textarea() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    b.element(Some(form), "label", &[("for", "country")], "Country");
    let select = b.element(
        Some(form),
        "select",
        &[("id", "country"), ("name", "country")],
        "",
    );
    b.option(select, "", "Choose...")
        .option(select, "fr", "France")
        .option(select, "de", "Germany");
    let section = b.element(Some(form), "section", &[], "");
    b.element(Some(section), "h3", &[("id", "bio-title")], "Tell us about yourself");
    b.element(
        Some(section),
        "textarea",
        &[("name", "bio"), ("aria-labelledby", "bio-title")],
        "",
    );

    let questions = detect_questions(&b.build());
    assert_eq!(questions.len(), 2);

    let country = &questions[0];
    assert_eq!(country.semantic_type, SemanticType::SingleChoice);
    assert_eq!(
        country.choices.iter().map(|c| c.value.as_str()).collect::<Vec<_>>(),
        vec!["fr", "de"]
    );
    assert_eq!(country.fields[0].kind, ElementKind::Select);

    let bio = &questions[1];
    assert_eq!(bio.text, "Tell us about yourself");
    assert_eq!(bio.semantic_type, SemanticType::LongText);
    assert_eq!(bio.confidence, Association::LabelledBy.confidence());
}

#[test]
fn test_structural_selector_when_attributes_are_ambiguous() {
    let mut b = DomBuilder::new("https://example.com");
    let form = b.element(None, "form", &[], "");
    let first = b.element(Some(form), "div", &[], "");
    b.element(Some(first), "span", &[], "First");
    b.element(Some(first), "input", &[("name", "dup")], "");
    let second = b.element(Some(form), "div", &[], "");
    b.element(Some(second), "span", &[], "Second");
    let target = b.element(Some(second), "input", &[("name", "dup")], "");
    let dom = b.build();

    let questions = detect_questions(&dom);
    assert_eq!(questions.len(), 2);
    let selector = &questions[1].fields[0].selector;
    assert_eq!(selector.strategy, crate::types::SelectorStrategy::Css);
    assert_eq!(dom.query(selector), vec![target]);
}
