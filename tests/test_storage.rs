use astrocal::io::storage::intermediate_key;
use astrocal::{CalError, FrameStore, LocalStore, MemoryStore, StepType};
use std::sync::Arc;
use tempfile::TempDir;

fn exercise(store: &dyn FrameStore) {
    store.put("prod/2024-01-01/a/bias-subtraction/00-default.fits", b"one").unwrap();
    store.put("prod/2024-01-01/a/flat-correction/02-default.fits", b"two").unwrap();
    store.put("exp/other.fits", b"three").unwrap();

    assert_eq!(store.get("exp/other.fits").unwrap(), b"three");
    assert_eq!(
        store.list("prod/2024-01-01/a").unwrap(),
        vec![
            "prod/2024-01-01/a/bias-subtraction/00-default.fits".to_string(),
            "prod/2024-01-01/a/flat-correction/02-default.fits".to_string(),
        ]
    );

    store.put("exp/other.fits", b"replaced").unwrap();
    assert_eq!(store.get("exp/other.fits").unwrap(), b"replaced");

    store.delete("exp/other.fits").unwrap();
    assert!(matches!(store.get("exp/other.fits"), Err(CalError::StorageNotFound(_))));
    assert!(store.list("exp").unwrap().is_empty());
}

#[test]
fn test_memory_store_contract() {
    exercise(&MemoryStore::new());
}

#[test]
fn test_local_store_contract() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    exercise(&store);
    assert!(dir.path().join("prod/2024-01-01/a/flat-correction/02-default.fits").exists());
}

#[test]
fn test_local_store_rejects_escaping_keys() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    for key in ["../outside.fits", "/abs.fits", "a/../../b", "a//b", "with space.fits"] {
        assert!(store.put(key, b"x").is_err(), "{}", key);
    }
}

#[test]
fn test_intermediate_keys_sort_in_step_order() {
    let mut keys = vec![
        intermediate_key("test/2024-05-01/id", StepType::CosmicRayRemoval, 3, "lacosmic"),
        intermediate_key("test/2024-05-01/id", StepType::BiasSubtraction, 0, "default"),
        intermediate_key("test/2024-05-01/id", StepType::FlatCorrection, 2, "default"),
    ];
    keys.sort_by_key(|k| k.rsplit('/').next().map(str::to_string));
    assert!(keys[0].ends_with("/00-default.fits"));
    assert!(keys[2].ends_with("/03-lacosmic.fits"));
}

#[test]
fn test_concurrent_puts() {
    let store = Arc::new(MemoryStore::new());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..25 {
                    store.put(&format!("t{}/f{:02}.fits", t, i), &[t as u8]).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(store.len(), 200);
    assert_eq!(store.list("t3/").unwrap().len(), 25);
}
