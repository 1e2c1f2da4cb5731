use aspectdb::AspectDb;
use aspectdb::batch::{AspectUpsert, IngestBatch};
use aspectdb::config::AspectDbConfig;
use aspectdb::error::AspectDbErrorCode;
use aspectdb::ingest::IngestOptions;
use aspectdb::publish::NoopChangeEventPublisher;
use aspectdb::record::AuditStamp;
use aspectdb::registry::StaticEntityRegistry;
use aspectdb::retention::{RetentionConfig, RetentionPolicy};
use aspectdb::store::state::PairKey;
use aspectdb::store::Isolation;
use aspectdb::urn::Urn;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn open_db(dir: &Path, config: AspectDbConfig) -> AspectDb {
    let registry = Arc::new(StaticEntityRegistry::new().with_entity(
        "dataset",
        "datasetKey",
        &["ownership", "schema"],
    ));
    AspectDb::open(config, dir, registry, Arc::new(NoopChangeEventPublisher)).expect("open store")
}

fn audit() -> AuditStamp {
    AuditStamp::new("urn:corpuser:tester", 1_000)
}

fn urn(value: &str) -> Urn {
    Urn::parse(&format!("dataset:{value}")).expect("urn")
}

fn ingest(db: &AspectDb, value: &str, aspect: &str, payload: serde_json::Value) {
    db.ingest(
        &IngestBatch::single(AspectUpsert::new(urn(value), aspect, payload)),
        audit(),
        &IngestOptions::default(),
    )
    .expect("ingest");
}

#[test]
fn concurrent_writers_on_one_pair_lose_nothing() {
    let dir = tempdir().expect("tempdir");
    let db = open_db(dir.path(), AspectDbConfig::development());

    let threads = 4u64;
    let writes_per_thread = 10u64;
    thread::scope(|scope| {
        for t in 0..threads {
            let db = &db;
            scope.spawn(move || {
                for i in 0..writes_per_thread {
                    ingest(db, "hot", "ownership", json!({"thread": t, "write": i}));
                }
            });
        }
    });

    let total = threads * writes_per_thread;
    assert_eq!(
        db.current_version(&urn("hot"), "ownership"),
        Some(total - 1),
        "every distinct write must bump the counter exactly once"
    );
    for slot in 1..total {
        assert!(
            db.get_version(&urn("hot"), "ownership", slot).is_some(),
            "historical slot {slot} must exist"
        );
    }
    assert!(db.get_latest(&urn("hot"), "ownership").is_some());
}

#[test]
fn disjoint_pairs_make_progress_in_parallel() {
    let dir = tempdir().expect("tempdir");
    let db = open_db(dir.path(), AspectDbConfig::development());

    thread::scope(|scope| {
        for t in 0..4u64 {
            let db = &db;
            scope.spawn(move || {
                let entity = format!("e{t}");
                for i in 0..10u64 {
                    ingest(db, &entity, "ownership", json!({"write": i}));
                }
            });
        }
    });

    for t in 0..4u64 {
        let entity = urn(&format!("e{t}"));
        assert_eq!(db.current_version(&entity, "ownership"), Some(9));
        assert_eq!(
            db.get_latest(&entity, "ownership").expect("latest").payload(),
            &json!({"write": 9})
        );
    }
}

#[test]
fn snapshot_readers_never_see_a_torn_batch() {
    let dir = tempdir().expect("tempdir");
    let db = open_db(dir.path(), AspectDbConfig::development());
    ingest(&db, "e1", "ownership", json!({"rev": 0}));
    db.ingest(
        &IngestBatch::single(AspectUpsert::new(urn("e1"), "schema", json!({"rev": 0}))),
        audit(),
        &IngestOptions::default(),
    )
    .expect("seed schema");

    thread::scope(|scope| {
        let writer = {
            let db = &db;
            scope.spawn(move || {
                for rev in 1..30u64 {
                    // Both aspects advance in one atomic batch.
                    let batch = IngestBatch::new()
                        .with_unit(AspectUpsert::new(urn("e1"), "ownership", json!({"rev": rev})))
                        .with_unit(AspectUpsert::new(urn("e1"), "schema", json!({"rev": rev})));
                    db.ingest(&batch, audit(), &IngestOptions::default())
                        .expect("paired ingest");
                }
            })
        };

        for _ in 0..60 {
            let txn = db.begin_transaction(Isolation::RepeatableRead);
            let (_, ownership) = txn
                .read_latest(&PairKey::new(urn("e1"), "ownership"))
                .expect("seeded");
            let (_, schema) = txn
                .read_latest(&PairKey::new(urn("e1"), "schema"))
                .expect("seeded");
            assert_eq!(
                ownership.payload["rev"], schema.payload["rev"],
                "one snapshot must never mix two batches"
            );
        }

        writer.join().expect("writer thread");
    });
}

#[test]
fn held_pair_lock_times_out_then_the_retry_lands() {
    let dir = tempdir().expect("tempdir");
    let db = open_db(
        dir.path(),
        AspectDbConfig::development().with_pair_lock_timeout_ms(50),
    );
    ingest(&db, "e1", "ownership", json!({"rev": 0}));

    let barrier = Barrier::new(2);
    thread::scope(|scope| {
        let holder = {
            let db = &db;
            let barrier = &barrier;
            scope.spawn(move || {
                let mut txn = db.begin_transaction(Isolation::RepeatableRead);
                txn.locked_latest(&PairKey::new(urn("e1"), "ownership"))
                    .expect("lock");
                barrier.wait();
                thread::sleep(Duration::from_millis(300));
                txn.commit().expect("holder commit");
            })
        };

        barrier.wait();
        let err = db
            .ingest(
                &IngestBatch::single(AspectUpsert::new(
                    urn("e1"),
                    "ownership",
                    json!({"rev": 1}),
                )),
                audit(),
                &IngestOptions::default(),
            )
            .expect_err("lock is held well past the timeout");
        assert_eq!(err.code(), AspectDbErrorCode::LockTimeout);
        assert!(err.is_retryable());

        // Retrying the identical call succeeds once the holder commits.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match db.ingest(
                &IngestBatch::single(AspectUpsert::new(
                    urn("e1"),
                    "ownership",
                    json!({"rev": 1}),
                )),
                audit(),
                &IngestOptions::default(),
            ) {
                Ok(_) => break,
                Err(err) if err.is_retryable() && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(25));
                }
                Err(err) => panic!("retry should eventually land: {err}"),
            }
        }

        holder.join().expect("holder thread");
    });

    assert_eq!(
        db.get_latest(&urn("e1"), "ownership").expect("latest").payload(),
        &json!({"rev": 1})
    );
}

#[test]
fn retention_racing_ingestion_keeps_the_pair_coherent() {
    let dir = tempdir().expect("tempdir");
    let config = AspectDbConfig::development()
        .with_retention(
            RetentionConfig::default()
                .with_aspect_policy("ownership", RetentionPolicy::keep_versions(2)),
        )
        .with_retention_worker(false);
    let db = open_db(dir.path(), config);

    let writes = 20u64;
    thread::scope(|scope| {
        let writer = {
            let db = &db;
            scope.spawn(move || {
                for rev in 0..writes {
                    ingest(db, "e1", "ownership", json!({"rev": rev}));
                }
            })
        };

        for _ in 0..10 {
            // Races the writer on purpose; every outcome must be a clean
            // trim or a retryable error, never a torn pair.
            if let Err(err) = db.apply_retention(&urn("e1"), "ownership") {
                assert_eq!(err.code(), AspectDbErrorCode::Retention);
            }
            thread::sleep(Duration::from_millis(5));
        }

        writer.join().expect("writer thread");
    });

    let removed = db.apply_retention(&urn("e1"), "ownership").expect("final trim");
    assert!(removed <= writes as usize);

    assert_eq!(db.current_version(&urn("e1"), "ownership"), Some(writes - 1));
    assert_eq!(
        db.get_latest(&urn("e1"), "ownership").expect("latest").payload(),
        &json!({"rev": writes - 1})
    );
    assert!(db.get_version(&urn("e1"), "ownership", writes - 1).is_some());
    assert!(db.get_version(&urn("e1"), "ownership", writes - 2).is_some());
    for slot in 1..(writes - 2) {
        assert!(
            db.get_version(&urn("e1"), "ownership", slot).is_none(),
            "slot {slot} must be trimmed by the final pass"
        );
    }
}
