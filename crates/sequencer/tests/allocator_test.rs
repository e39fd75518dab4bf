use anyhow::Result;
use sequencer::{
    AllocatorConfig, AllocatorError, DeleteMode, MemoryStore, NewRecord, ResourceClass,
    SequentialAllocator, StoreError, TenantId, UniqueConstraint, MAX_SAFE_SEQUENTIAL_ID,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

const TENANT: &str = "64f1c2a9e4b0a1b2c3d4e5f6";
const OTHER_TENANT: &str = "650a1b2c3d4e5f60718293a4";
const HOUSE: &str = "house";

fn fast_config() -> AllocatorConfig {
    AllocatorConfig::default().with_backoff(
        Duration::from_millis(1),
        Duration::from_millis(2),
        Duration::from_millis(8),
    )
}

fn allocator() -> SequentialAllocator<MemoryStore> {
    SequentialAllocator::new(Arc::new(MemoryStore::new()), fast_config()).unwrap()
}

async fn create(allocator: &SequentialAllocator<MemoryStore>, name: &str) -> Result<u64, AllocatorError> {
    allocator
        .allocate_and_create(TENANT, HOUSE, NewRecord::named(name))
        .await
        .map(|record| record.sequential_id.get())
}

#[tokio::test]
async fn test_first_allocation_is_one() -> Result<()> {
    let allocator = allocator();

    let record = allocator
        .allocate_and_create(TENANT, HOUSE, NewRecord::named("Red").with_payload(json!({ "motto": "Courage" })))
        .await?;

    assert_eq!(record.sequential_id.get(), 1);
    assert_eq!(record.display_name, "Red");
    assert_eq!(record.tenant_id.as_str(), TENANT);
    assert_eq!(record.resource_class.as_str(), HOUSE);
    assert_eq!(record.payload, json!({ "motto": "Courage" }));
    Ok(())
}

#[tokio::test]
async fn test_house_scenario_rejected_duplicate_consumes_no_id() -> Result<()> {
    let allocator = allocator();

    assert_eq!(create(&allocator, "Red").await?, 1);
    assert_eq!(create(&allocator, "Blue").await?, 2);

    let err = create(&allocator, "red").await.unwrap_err();
    assert!(matches!(err, AllocatorError::DuplicateName { .. }), "got {err:?}");
    assert!(err.is_client_error());

    assert_eq!(create(&allocator, "Green").await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_name_is_case_insensitive_and_trimmed() -> Result<()> {
    let allocator = allocator();

    assert_eq!(create(&allocator, "North House").await?, 1);
    for variant in ["north house", "NORTH HOUSE", "  North House  "] {
        let err = create(&allocator, variant).await.unwrap_err();
        assert!(matches!(err, AllocatorError::DuplicateName { .. }), "{variant:?}: {err:?}");
    }
    assert_eq!(allocator.peek_next(TENANT, HOUSE).await?.get(), 2);
    Ok(())
}

#[tokio::test]
async fn test_deleted_id_is_never_reused() -> Result<()> {
    let allocator = allocator();

    for name in ["Red", "Blue", "Green"] {
        create(&allocator, name).await?;
    }
    allocator.remove(TENANT, HOUSE, 2, DeleteMode::Hard).await?;
    assert_eq!(create(&allocator, "Yellow").await?, 4);

    // Removing the current highest id must not roll the sequence back either
    allocator.remove(TENANT, HOUSE, 4, DeleteMode::Hard).await?;
    assert_eq!(create(&allocator, "Purple").await?, 5);

    let live: Vec<u64> = allocator
        .list(TENANT, HOUSE)
        .await?
        .into_iter()
        .map(|record| record.sequential_id.get())
        .collect();
    assert_eq!(live, vec![1, 3, 5]);
    Ok(())
}

#[tokio::test]
async fn test_soft_delete_frees_name_but_not_id() -> Result<()> {
    let allocator = allocator();

    create(&allocator, "Red").await?;
    allocator.remove(TENANT, HOUSE, 1, DeleteMode::Soft).await?;

    assert!(matches!(
        allocator.get(TENANT, HOUSE, 1).await,
        Err(AllocatorError::NotFound { sequential_id: 1, .. })
    ));
    assert_eq!(create(&allocator, "red").await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_tenants_and_classes_are_isolated() -> Result<()> {
    let allocator = allocator();

    assert_eq!(create(&allocator, "Red").await?, 1);
    assert_eq!(create(&allocator, "Blue").await?, 2);

    let other = allocator
        .allocate_and_create(OTHER_TENANT, HOUSE, NewRecord::named("Red"))
        .await?;
    assert_eq!(other.sequential_id.get(), 1);

    let invoice = allocator
        .allocate_and_create(TENANT, "invoice", NewRecord::named("Red"))
        .await?;
    assert_eq!(invoice.sequential_id.get(), 1);

    assert_eq!(create(&allocator, "Green").await?, 3);
    assert_eq!(allocator.list(OTHER_TENANT, HOUSE).await?.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_are_unique_and_gapless() -> Result<()> {
    const CALLERS: u64 = 200;
    let allocator = Arc::new(allocator());

    let mut tasks = JoinSet::new();
    for i in 0..CALLERS {
        let allocator = allocator.clone();
        tasks.spawn(async move {
            // Exhaustion is transient; callers are expected to retry it
            loop {
                match allocator
                    .allocate_and_create(TENANT, HOUSE, NewRecord::named(format!("House {i}")))
                    .await
                {
                    Err(e) if e.is_retryable() => continue,
                    other => return other,
                }
            }
        });
    }

    let mut ids = BTreeSet::new();
    while let Some(joined) = tasks.join_next().await {
        let record = joined??;
        assert!(ids.insert(record.sequential_id.get()), "duplicate id {}", record.sequential_id);
    }

    assert_eq!(ids, (1..=CALLERS).collect::<BTreeSet<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_racers_for_first_id_get_one_and_two() -> Result<()> {
    let allocator = Arc::new(allocator());

    let a = tokio::spawn({
        let allocator = allocator.clone();
        async move { allocator.allocate_and_create(TENANT, HOUSE, NewRecord::named("Red")).await }
    });
    let b = tokio::spawn({
        let allocator = allocator.clone();
        async move { allocator.allocate_and_create(TENANT, HOUSE, NewRecord::named("Blue")).await }
    });

    let mut ids = vec![a.await??.sequential_id.get(), b.await??.sequential_id.get()];
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_legacy_ids_are_ignored() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let tenant = TenantId::parse(TENANT)?;
    let class = ResourceClass::parse(HOUSE)?;

    store.seed_raw(&tenant, &class, json!(3), "Legacy Three");
    store.seed_raw(&tenant, &class, json!("abc"), "Legacy Text");
    store.seed_raw(&tenant, &class, json!(null), "Legacy Null");
    store.seed_raw(&tenant, &class, json!(-12), "Legacy Negative");
    store.seed_raw(&tenant, &class, json!(7.5), "Legacy Fraction");
    store.seed_raw(&tenant, &class, json!(1e300), "Legacy Huge");
    store.seed_raw(&tenant, &class, json!(true), "Legacy Bool");

    let allocator = SequentialAllocator::new(store.clone(), fast_config())?;
    let record = allocator
        .allocate_and_create(TENANT, HOUSE, NewRecord::named("Fresh"))
        .await?;
    assert_eq!(record.sequential_id.get(), 4);

    // Corrupt rows are not listed, but their names still count as taken
    let listed: Vec<u64> = allocator
        .list(TENANT, HOUSE)
        .await?
        .iter()
        .map(|record| record.sequential_id.get())
        .collect();
    assert_eq!(listed, vec![3, 4]);
    assert!(matches!(
        allocator
            .allocate_and_create(TENANT, HOUSE, NewRecord::named("legacy text"))
            .await,
        Err(AllocatorError::DuplicateName { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_legacy_numeric_string_counts_toward_max() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let tenant = TenantId::parse(TENANT)?;
    let class = ResourceClass::parse(HOUSE)?;
    store.seed_raw(&tenant, &class, json!("9"), "Legacy Nine");

    let allocator = SequentialAllocator::new(store, fast_config())?;
    assert_eq!(allocator.peek_next(TENANT, HOUSE).await?.get(), 10);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_sequence_overflows() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let tenant = TenantId::parse(TENANT)?;
    let class = ResourceClass::parse(HOUSE)?;
    store.seed_raw(&tenant, &class, json!(MAX_SAFE_SEQUENTIAL_ID), "Last Safe");

    let allocator = SequentialAllocator::new(store.clone(), fast_config())?;
    assert!(matches!(
        allocator.peek_next(TENANT, HOUSE).await,
        Err(AllocatorError::SequenceOverflow { .. })
    ));

    let err = create(&allocator, "Red").await.unwrap_err();
    assert!(matches!(err, AllocatorError::SequenceOverflow { .. }), "got {err:?}");
    assert!(!err.is_retryable());
    assert_eq!(store.insert_attempts(), 0);

    // Other classes are unaffected
    let record = allocator
        .allocate_and_create(TENANT, "invoice", NewRecord::named("Red"))
        .await?;
    assert_eq!(record.sequential_id.get(), 1);
    Ok(())
}

#[tokio::test]
async fn test_default_config_allocator_uses_given_store() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let allocator = SequentialAllocator::with_default_config(store.clone());

    assert_eq!(allocator.config(), &AllocatorConfig::default());
    assert!(Arc::ptr_eq(allocator.store(), &store));

    assert_eq!(create(&allocator, "Red").await?, 1);
    assert_eq!(
        store.document_count(&TenantId::parse(TENANT)?, &ResourceClass::parse(HOUSE)?),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_retry_exhaustion_under_permanent_conflict() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.fail_inserts_with(UniqueConstraint::SequentialId);
    let allocator = SequentialAllocator::new(store.clone(), fast_config().with_max_attempts(4))?;

    let started = Instant::now();
    let err = allocator
        .allocate_and_create(TENANT, HOUSE, NewRecord::named("Red"))
        .await
        .unwrap_err();

    assert!(
        matches!(err, AllocatorError::AllocationExhausted { attempts: 4, .. }),
        "got {err:?}"
    );
    assert!(err.is_retryable());
    assert_eq!(store.insert_attempts(), 4);
    assert!(started.elapsed() < Duration::from_secs(2));

    store.clear_faults();
    assert_eq!(create(&allocator, "Red").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_deadline_bounds_retry_loop() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.fail_inserts_with(UniqueConstraint::SequentialId);
    let config = AllocatorConfig::default()
        .with_max_attempts(10_000)
        .with_backoff(Duration::from_millis(10), Duration::ZERO, Duration::from_millis(10))
        .with_deadline(Duration::from_millis(100));
    let allocator = SequentialAllocator::new(store.clone(), config)?;

    let started = Instant::now();
    let err = allocator
        .allocate_and_create(TENANT, HOUSE, NewRecord::named("Red"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocatorError::AllocationExhausted { .. }), "got {err:?}");
    assert!(store.insert_attempts() < 100);
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn test_name_race_at_write_is_duplicate_not_retry() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.fail_inserts_with(UniqueConstraint::DisplayName);
    let allocator = SequentialAllocator::new(store.clone(), fast_config())?;

    let err = create(&allocator, "Red").await.unwrap_err();
    assert!(matches!(err, AllocatorError::DuplicateName { .. }), "got {err:?}");
    assert_eq!(store.insert_attempts(), 1);
    Ok(())
}

#[tokio::test]
async fn test_storage_errors_pass_through() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.fail_with_unavailable("connection reset by peer");
    let allocator = SequentialAllocator::new(store.clone(), fast_config())?;

    let err = create(&allocator, "Red").await.unwrap_err();
    assert!(
        matches!(err, AllocatorError::Storage(StoreError::Unavailable(ref message)) if message == "connection reset by peer"),
        "got {err:?}"
    );
    assert!(err.is_retryable());
    assert_eq!(store.insert_attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_slow_storage_call_times_out() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set_latency(Duration::from_millis(500));
    let config = fast_config().with_call_timeout(Duration::from_millis(20));
    let allocator = SequentialAllocator::new(store, config)?;

    let err = create(&allocator, "Red").await.unwrap_err();
    assert!(
        matches!(
            err,
            AllocatorError::Storage(StoreError::Timeout { operation: "query_max_sequential_id", .. })
        ),
        "got {err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_malformed_input_is_rejected_before_storage() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let allocator = SequentialAllocator::new(store.clone(), fast_config())?;

    let err = allocator
        .allocate_and_create("not-an-object-id", HOUSE, NewRecord::named("Red"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocatorError::InvalidTenant(_)));
    assert!(!err.is_retryable());

    let err = allocator
        .allocate_and_create(TENANT, "", NewRecord::named("Red"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocatorError::InvalidResourceClass(_)));

    let err = allocator
        .allocate_and_create(TENANT, HOUSE, NewRecord::named("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocatorError::InvalidDisplayName(_)));

    assert_eq!(store.insert_attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_rename_keeps_id_and_guards_names() -> Result<()> {
    let allocator = allocator();
    create(&allocator, "Red").await?;
    create(&allocator, "Blue").await?;

    let renamed = allocator.rename(TENANT, HOUSE, 1, "Crimson").await?;
    assert_eq!(renamed.sequential_id.get(), 1);
    assert_eq!(renamed.display_name, "Crimson");

    // Changing only the casing of its own name is allowed
    let recased = allocator.rename(TENANT, HOUSE, 2, "BLUE").await?;
    assert_eq!(recased.display_name, "BLUE");

    let err = allocator.rename(TENANT, HOUSE, 1, "blue").await.unwrap_err();
    assert!(matches!(err, AllocatorError::DuplicateName { .. }));

    let err = allocator.rename(TENANT, HOUSE, 42, "Green").await.unwrap_err();
    assert!(matches!(err, AllocatorError::NotFound { sequential_id: 42, .. }));

    // The old name is free again
    assert_eq!(create(&allocator, "red").await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_get_and_remove_missing_records() -> Result<()> {
    let allocator = allocator();
    create(&allocator, "Red").await?;

    assert_eq!(allocator.get(TENANT, HOUSE, 1).await?.display_name, "Red");
    assert!(matches!(
        allocator.get(TENANT, HOUSE, 0).await,
        Err(AllocatorError::NotFound { sequential_id: 0, .. })
    ));
    assert!(matches!(
        allocator.remove(TENANT, HOUSE, 7, DeleteMode::Hard).await,
        Err(AllocatorError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let result = SequentialAllocator::new(
        Arc::new(MemoryStore::new()),
        AllocatorConfig::default().with_max_attempts(0),
    );
    assert!(matches!(result, Err(AllocatorError::InvalidConfig(_))));
}
