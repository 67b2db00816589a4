//! Tests for warning classification.

use mirrord_driver::supervisor::{SuppressionId, WarningClassifier, WarningRule, WarningRuleError};

#[test]
fn default_rules_match_agent_version_mismatch() {
    let classifier = WarningClassifier::with_default_rules();
    assert_eq!(
        classifier.classify("Agent version 3.0.0 does not match the local mirrord version"),
        Some(SuppressionId::AgentVersionMismatch)
    );
}

#[test]
fn partial_match_is_not_enough() {
    let classifier = WarningClassifier::with_default_rules();
    assert_eq!(classifier.classify("Agent version 3.0.0 is old"), None);
    assert_eq!(classifier.classify(""), None);
}

#[test]
fn first_matching_rule_wins() {
    let mut classifier = WarningClassifier::new();
    classifier.add_rule(
        WarningRule::contains_all(["targetless"], SuppressionId::RunningTargetless).unwrap(),
    );
    classifier.add_rule(
        WarningRule::pattern(r"(?i)targetless|outdated", SuppressionId::PossiblyOutdatedBinary)
            .unwrap(),
    );

    assert_eq!(
        classifier.classify("running targetless with an outdated binary"),
        Some(SuppressionId::RunningTargetless)
    );
    assert_eq!(
        classifier.classify("Outdated binary"),
        Some(SuppressionId::PossiblyOutdatedBinary)
    );
}

#[test]
fn empty_classifier_matches_nothing() {
    let classifier = WarningClassifier::new();
    assert!(classifier.is_empty());
    assert_eq!(
        classifier.classify("Agent version 1 does not match the local mirrord version 2"),
        None
    );
}

#[test]
fn invalid_rules_are_rejected() {
    assert!(matches!(
        WarningRule::pattern("(unclosed", SuppressionId::RunningTargetless),
        Err(WarningRuleError::InvalidPattern(_))
    ));
    assert!(matches!(
        WarningRule::contains_all(Vec::<String>::new(), SuppressionId::RunningTargetless),
        Err(WarningRuleError::Empty)
    ));
}

#[test]
fn suppression_ids_use_snake_case_keys() {
    let ids: Vec<SuppressionId> =
        serde_json::from_str(r#"["agent_version_mismatch","running_targetless"]"#).unwrap();
    assert_eq!(
        ids,
        vec![
            SuppressionId::AgentVersionMismatch,
            SuppressionId::RunningTargetless
        ]
    );
}

#[test]
fn suppression_ids_have_presentable_names() {
    assert_eq!(
        SuppressionId::AgentVersionMismatch.presentable_name(),
        "mirrord agent version mismatch"
    );
    assert_eq!(
        SuppressionId::RunningTargetless.to_string(),
        "running_targetless"
    );
}
