use astrocal::context::{parse_id, ExperimentInfo};
use astrocal::{ProcessingContext, ProcessingType};

#[test]
fn test_every_type_round_trips_through_its_id() {
    for t in ProcessingType::ALL {
        let ctx = ProcessingContext::of_type(t, "s");
        assert!(ctx.id.starts_with(&format!("{}-", t.prefix())));
        assert_eq!(ProcessingContext::parse_type(&ctx.id).unwrap(), t);
    }
}

#[test]
fn test_derived_contexts_keep_root() {
    let root = ProcessingContext::production("night-1", Default::default()).with_input_key("raw/frame.fits");
    let child = root.derive("night-1-retry");
    let grandchild = child.derive("night-1-retry-2");

    assert_eq!(child.lineage.parent_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(grandchild.lineage.parent_id.as_deref(), Some(child.id.as_str()));
    assert_eq!(grandchild.lineage.root_id, root.id);
    assert_eq!(grandchild.lineage.depth, 2);
    assert_eq!(grandchild.processing_type, ProcessingType::Production);
    assert!(!grandchild.is_root());
    assert_ne!(child.id, root.id);
}

#[test]
fn test_storage_prefixes() {
    let prod = ProcessingContext::production("s", Default::default());
    let date = prod.created_at.format("%Y-%m-%d").to_string();
    assert_eq!(prod.storage_prefix(), format!("production/{}/{}", date, prod.id));

    let exp = ProcessingContext::experimental(
        "s",
        ExperimentInfo {
            experiment_name: Some("star-mask".to_string()),
            ..Default::default()
        },
    );
    let date = exp.created_at.format("%Y-%m-%d").to_string();
    assert_eq!(exp.storage_prefix(), format!("experimental/star-mask/{}/{}", date, exp.id));

    let unnamed = ProcessingContext::experimental("s", ExperimentInfo::default());
    assert!(unnamed.storage_prefix().starts_with("experimental/unnamed/"));

    let test = ProcessingContext::test("s");
    assert!(test.storage_prefix().starts_with("test/"));
}

#[test]
fn test_parse_id_parts() {
    let ctx = ProcessingContext::experimental("s", ExperimentInfo::default());
    let (t, date, uuid) = parse_id(&ctx.id).unwrap();
    assert_eq!(t, ProcessingType::Experimental);
    assert_eq!(date, ctx.created_at.date_naive());
    assert!(ctx.id.ends_with(&uuid.to_string()));
}

#[test]
fn test_context_serializes_with_role() {
    let ctx = ProcessingContext::experimental("s", ExperimentInfo::default());
    let json = serde_json::to_string(&ctx).unwrap();
    assert!(json.contains("\"role\":\"experimental\""));
    let back: ProcessingContext = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ctx);
}
