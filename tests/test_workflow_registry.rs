use astrocal::registry::workflows::{session_bucket, DeactivationRequest, HistoryAction, HISTORY_LIMIT, SPLIT_EPSILON};
use astrocal::registry::ActivationRequest;
use astrocal::{CalError, ProcessingType, WorkflowRegistry, WorkflowVersion};
use std::sync::Arc;

const T: ProcessingType = ProcessingType::Production;

fn registry(versions: usize) -> WorkflowRegistry {
    let registry = WorkflowRegistry::new();
    for i in 0..versions {
        registry
            .create(WorkflowVersion::new("wf", &format!("v{}", i), T))
            .unwrap();
    }
    registry
}

#[test]
fn test_concurrent_activations_never_exceed_total() {
    let registry = Arc::new(registry(10));
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry
                    .activate("wf", &format!("v{}", i), T, &ActivationRequest::new("ops", "load").with_split(30.0))
                    .is_ok()
            })
        })
        .collect();
    let succeeded = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
    assert_eq!(succeeded, 3);

    let active = registry.list_active(Some("wf"), Some(T));
    assert_eq!(active.len(), 3);
    let total: f64 = active.iter().map(|v| v.traffic_split).sum();
    assert!(total <= 100.0 + SPLIT_EPSILON);
}

#[test]
fn test_selection_follows_cumulative_split() {
    let registry = registry(2);
    registry.setup_ab("wf", T, "v0", "v1", 80.0, 20.0, "ops", "trial").unwrap();

    for session in ["abc", "night-1", "night-2", "session-42", ""] {
        let expected = if session_bucket(session) < 80.0 { "v0" } else { "v1" };
        let chosen = registry.select_for_session("wf", T, session).unwrap();
        assert_eq!(chosen.version, expected, "session {}", session);
    }
}

#[test]
fn test_single_and_no_active_version() {
    let registry = registry(2);
    assert!(registry.select_for_session("wf", T, "s").is_none());

    registry.activate("wf", "v1", T, &ActivationRequest::new("ops", "go")).unwrap();
    assert_eq!(registry.select_for_session("wf", T, "anything").unwrap().version, "v1");
}

#[test]
fn test_deactivate_records_actor() {
    let registry = registry(1);
    registry.activate("wf", "v0", T, &ActivationRequest::new("ops", "go")).unwrap();
    let v = registry
        .deactivate(
            "wf",
            "v0",
            T,
            &DeactivationRequest {
                actor: "oncall".to_string(),
                reason: "incident".to_string(),
            },
        )
        .unwrap();
    assert!(!v.active);
    assert_eq!(v.deactivated_by.as_deref(), Some("oncall"));
    assert_eq!(registry.history("wf", T, 1)[0].action, HistoryAction::Deactivate);
}

#[test]
fn test_history_is_capped() {
    let registry = registry(2);
    for i in 0..(HISTORY_LIMIT + 20) {
        let target = if i % 2 == 0 { "v0" } else { "v1" };
        registry.rollback("wf", T, target, "ops", &format!("round {}", i)).unwrap();
    }
    let history = registry.history("wf", T, usize::MAX);
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history[0].reason, format!("round {}", HISTORY_LIMIT + 19));
}

#[test]
fn test_processing_types_are_separate_groups() {
    let registry = registry(1);
    assert!(matches!(
        registry.activate("wf", "v0", ProcessingType::Experimental, &ActivationRequest::new("a", "r")),
        Err(CalError::WorkflowNotFound(_))
    ));
    assert!(registry.list_active(None, Some(ProcessingType::Experimental)).is_empty());
}
