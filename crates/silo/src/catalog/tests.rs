#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map, Value};
    use uuid::Uuid;

    use crate::catalog::{BucketCatalog, BucketState};
    use crate::comparison::BinaryComparator;
    use crate::error::CatalogError;
    use crate::{CatalogConfig, CombinePolicy, CommitInfo, SessionId, TimeseriesOptions, WriteBatch};

    const NS: &str = "db.weather";
    const T0: i64 = 1_700_000_000_000;

    fn options() -> TimeseriesOptions {
        TimeseriesOptions::new("t").with_meta_field("tag")
    }

    fn plain_options() -> TimeseriesOptions {
        TimeseriesOptions::new("t")
    }

    fn insert(
        catalog: &BucketCatalog,
        ns: &str,
        opts: &TimeseriesOptions,
        doc: Value,
        session: SessionId,
    ) -> Arc<WriteBatch> {
        catalog
            .insert(
                ns,
                Arc::new(BinaryComparator),
                opts,
                doc,
                CombinePolicy::Disallow,
                session,
            )
            .unwrap()
    }

    fn commit(catalog: &BucketCatalog, batch: &Arc<WriteBatch>) {
        assert!(batch.claim_commit_rights());
        assert!(futures_block(catalog.prepare_commit(batch)));
        catalog.finish(batch, CommitInfo::ok());
    }

    /// Drives a short future to completion without a runtime, for tests that
    /// are otherwise synchronous.
    fn futures_block<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn stat(catalog: &BucketCatalog, ns: &str, name: &str) -> u64 {
        let mut out = Map::new();
        catalog.append_execution_stats(ns, &mut out);
        out.get(name).and_then(Value::as_u64).unwrap_or(0)
    }

    fn num_buckets(catalog: &BucketCatalog) -> usize {
        catalog.buckets.read().unwrap().all.len()
    }

    fn num_open_buckets(catalog: &BucketCatalog) -> usize {
        catalog.buckets.read().unwrap().open.len()
    }

    /// Structural invariants that must hold at any quiescent point.
    fn check_invariants(catalog: &BucketCatalog) {
        let maps = catalog.buckets.read().unwrap();
        let states = catalog.states.lock().unwrap();
        let idle = catalog.idle.lock().unwrap();

        let mut memory_total = 0;
        for (suffix, bucket) in &maps.all {
            let inner = bucket.lock();
            assert_eq!(*suffix, bucket.suffix());

            // Every owned bucket is either the open bucket of its key or
            // latched full.
            let open_count = maps
                .open
                .values()
                .filter(|open| Arc::ptr_eq(open, bucket))
                .count();
            assert!(
                open_count == 1 || (open_count == 0 && inner.full),
                "bucket {} neither open nor full",
                inner.id
            );

            // Idle membership tracks pending work exactly.
            let unused = inner.batches.is_empty() && inner.prepared_batch.is_none();
            if idle.contains(&bucket.suffix()) {
                assert!(unused, "idle bucket {} has pending work", inner.id);
            }
            if !unused {
                assert!(!idle.contains(&bucket.suffix()));
            }

            assert!(inner.num_committed_measurements <= inner.num_measurements);
            assert!(states.contains_key(&inner.id), "bucket {} has no state", inner.id);
            memory_total += inner.memory_usage;
        }

        // State entries never outlive their bucket.
        for id in states.keys() {
            assert!(
                maps.all.contains_key(&id.suffix()),
                "state entry {} without bucket",
                id
            );
        }

        for (key, bucket) in &maps.open {
            let inner = bucket.lock();
            if !inner.ns.is_empty() {
                assert_eq!(key.ns, inner.ns);
                assert_eq!(key.metadata, inner.metadata);
            }
        }

        assert_eq!(memory_total, catalog.memory_usage());
    }

    #[test]
    fn test_single_insert() {
        let catalog = BucketCatalog::default();
        let batch = insert(
            &catalog,
            "db.c",
            &plain_options(),
            json!({ "t": T0, "v": 1 }),
            Uuid::new_v4(),
        );

        assert!(batch.active());
        assert_eq!(batch.num_measurements(), 1);
        assert_eq!(num_buckets(&catalog), 1);
        assert!(catalog.memory_usage() > 0);

        assert!(batch.claim_commit_rights());
        assert!(futures_block(catalog.prepare_commit(&batch)));
        assert_eq!(batch.measurements(), vec![json!({ "t": T0, "v": 1 })]);
        assert_eq!(batch.new_field_names(), vec!["t".to_owned(), "v".to_owned()]);
        assert_eq!(batch.num_previously_committed(), 0);

        catalog.finish(&batch, CommitInfo::ok());
        check_invariants(&catalog);
    }

    #[test]
    fn test_insert_rejects_bad_time_field() {
        let catalog = BucketCatalog::default();
        for doc in [json!({ "v": 1 }), json!({ "t": "yesterday", "v": 1 })] {
            let result = catalog.insert(
                NS,
                Arc::new(BinaryComparator),
                &plain_options(),
                doc,
                CombinePolicy::Allow,
                Uuid::new_v4(),
            );
            match result {
                Err(CatalogError::BadTimeField {
                    field,
                }) => assert_eq!(field, "t"),
                other => panic!("expected BadTimeField, got {:?}", other),
            }
        }
        // A rejected insert leaves no trace.
        assert_eq!(num_buckets(&catalog), 0);
        assert!(catalog.server_status().is_none());
    }

    #[test]
    fn test_metadata_reordering_lands_in_same_bucket() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();
        let first = insert(
            &catalog,
            NS,
            &options(),
            json!({ "t": T0, "tag": { "a": 1, "b": { "c": 1, "d": 2 } }, "v": 1 }),
            session,
        );
        let second = insert(
            &catalog,
            NS,
            &options(),
            json!({ "t": T0 + 1000, "tag": { "b": { "d": 2, "c": 1 }, "a": 1 }, "v": 2 }),
            session,
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(num_buckets(&catalog), 1);
        assert_eq!(second.num_measurements(), 2);
        check_invariants(&catalog);
    }

    #[test]
    fn test_distinct_metadata_opens_distinct_buckets() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();
        insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "a", "v": 1 }), session);
        insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "b", "v": 1 }), session);

        assert_eq!(num_buckets(&catalog), 2);
        assert_eq!(stat(&catalog, NS, "numBucketsOpenedDueToMetadata"), 2);
        check_invariants(&catalog);
    }

    #[test]
    fn test_size_rollover() {
        let config = CatalogConfig {
            max_bucket_size_bytes: 512,
            ..CatalogConfig::default()
        };
        let catalog = BucketCatalog::new(config);
        let session = Uuid::new_v4();
        let pad = "x".repeat(180);

        let first = insert(
            &catalog,
            NS,
            &plain_options(),
            json!({ "t": T0, "pad": pad }),
            session,
        );
        let mut latest = first.clone();
        let mut inserted = 1;
        while Arc::ptr_eq(&latest, &first) {
            inserted += 1;
            assert!(inserted < 10, "rollover never triggered");
            latest = insert(
                &catalog,
                NS,
                &plain_options(),
                json!({ "t": T0 + inserted, "pad": pad }),
                session,
            );
        }

        assert_eq!(stat(&catalog, NS, "numBucketsClosedDueToSize"), 1);
        assert_eq!(num_buckets(&catalog), 2);
        assert_eq!(num_open_buckets(&catalog), 1);

        // The replacement bucket starts over with the triggering insert.
        assert_eq!(latest.num_measurements(), 1);
        let open = catalog.buckets.read().unwrap().open.values().next().unwrap().clone();
        assert_eq!(open.lock().num_measurements, 1);

        // The full bucket is latched until its batch drains.
        assert!(catalog
            .buckets
            .read()
            .unwrap()
            .all
            .values()
            .any(|bucket| bucket.lock().full));
        check_invariants(&catalog);
    }

    #[test]
    fn test_count_rollover() {
        let config = CatalogConfig {
            max_bucket_count: 2,
            ..CatalogConfig::default()
        };
        let catalog = BucketCatalog::new(config);
        let session = Uuid::new_v4();

        let first = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), session);
        let again = insert(&catalog, NS, &plain_options(), json!({ "t": T0 + 1, "v": 2 }), session);
        assert!(Arc::ptr_eq(&first, &again));

        let third = insert(&catalog, NS, &plain_options(), json!({ "t": T0 + 2, "v": 3 }), session);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(stat(&catalog, NS, "numBucketsClosedDueToCount"), 1);
        assert_eq!(third.num_measurements(), 1);
        check_invariants(&catalog);
    }

    #[test]
    fn test_time_forward_rollover() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let first = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), session);
        let hour_later = T0 + 3600 * 1000;
        let second = insert(
            &catalog,
            NS,
            &plain_options(),
            json!({ "t": hour_later, "v": 2 }),
            session,
        );

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(stat(&catalog, NS, "numBucketsClosedDueToTimeForward"), 1);
        assert_eq!(num_buckets(&catalog), 2);
        check_invariants(&catalog);
    }

    #[test]
    fn test_backward_time_lowers_nominal_time() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let batch = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), session);
        let id_before = catalog.bucket_id_of(&batch).unwrap();
        assert_eq!(id_before.time().timestamp_millis(), T0);

        let earlier = T0 - 100_000;
        let again = insert(
            &catalog,
            NS,
            &plain_options(),
            json!({ "t": earlier, "v": 2 }),
            session,
        );

        assert!(Arc::ptr_eq(&batch, &again));
        assert_eq!(num_buckets(&catalog), 1);
        assert_eq!(stat(&catalog, NS, "numBucketsClosedDueToTimeBackward"), 0);

        let id_after = catalog.bucket_id_of(&batch).unwrap();
        assert_eq!(id_after.time().timestamp_millis(), earlier);
        assert_eq!(catalog.bucket_state(&id_after), Some(BucketState::Normal));
        assert_eq!(catalog.bucket_state(&id_before), None);
        check_invariants(&catalog);
    }

    #[test]
    fn test_backward_time_closes_committed_bucket() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let batch = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), session);
        commit(&catalog, &batch);

        let second = insert(
            &catalog,
            NS,
            &plain_options(),
            json!({ "t": T0 - 100_000, "v": 2 }),
            session,
        );

        assert!(!Arc::ptr_eq(&batch, &second));
        assert_eq!(stat(&catalog, NS, "numBucketsClosedDueToTimeBackward"), 1);
        check_invariants(&catalog);
    }

    #[test]
    fn test_commit_flow_produces_full_then_diff() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let first = insert(
            &catalog,
            NS,
            &options(),
            json!({ "t": T0, "tag": "site", "v": 5 }),
            session,
        );
        assert!(first.claim_commit_rights());
        assert!(futures_block(catalog.prepare_commit(&first)));

        // First commit carries the full control documents, without metadata.
        assert_eq!(first.min_diff(), json!({ "t": T0, "v": 5 }));
        assert_eq!(first.max_diff(), json!({ "t": T0, "v": 5 }));
        catalog.finish(&first, CommitInfo::ok());
        match first.result_if_ready() {
            Some(Ok(info)) => assert!(info.result.is_ok()),
            other => panic!("expected a successful commit, got {:?}", other),
        }

        let second = insert(
            &catalog,
            NS,
            &options(),
            json!({ "t": T0 + 1000, "tag": "site", "v": 2 }),
            session,
        );
        assert!(second.claim_commit_rights());
        assert!(futures_block(catalog.prepare_commit(&second)));

        // Second commit only diffs what moved: the max time and the min v.
        assert_eq!(second.num_previously_committed(), 1);
        assert_eq!(second.min_diff(), json!({ "u": { "v": 2 } }));
        assert_eq!(second.max_diff(), json!({ "u": { "t": T0 + 1000 } }));
        catalog.finish(&second, CommitInfo::ok());

        assert_eq!(stat(&catalog, NS, "numCommits"), 2);
        assert_eq!(stat(&catalog, NS, "numBucketInserts"), 1);
        assert_eq!(stat(&catalog, NS, "numBucketUpdates"), 1);
        assert_eq!(stat(&catalog, NS, "numMeasurementsCommitted"), 2);
        assert_eq!(stat(&catalog, NS, "avgNumMeasurementsPerCommit"), 1);
        check_invariants(&catalog);
    }

    #[test]
    fn test_failed_commit_keeps_counts() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let batch = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), session);
        assert!(batch.claim_commit_rights());
        assert!(futures_block(catalog.prepare_commit(&batch)));
        catalog.finish(&batch, CommitInfo::failed("disk on fire"));

        match batch.result_if_ready() {
            Some(Ok(info)) => match info.result {
                Err(CatalogError::CommitFailed {
                    reason,
                }) => assert_eq!(reason, "disk on fire"),
                other => panic!("expected CommitFailed, got {:?}", other),
            },
            other => panic!("expected delivered info, got {:?}", other),
        }
        assert_eq!(stat(&catalog, NS, "numCommits"), 0);
        assert_eq!(stat(&catalog, NS, "numMeasurementsCommitted"), 0);

        // Nothing was committed, so the bucket still reports zero.
        let open = catalog.buckets.read().unwrap().open.values().next().unwrap().clone();
        assert_eq!(open.lock().num_committed_measurements, 0);
        check_invariants(&catalog);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_commit_waits_for_prepared_batch() {
        let catalog = Arc::new(BucketCatalog::default());

        let batch_a = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), Uuid::new_v4());
        let batch_b = insert(&catalog, NS, &plain_options(), json!({ "t": T0 + 1, "v": 2 }), Uuid::new_v4());
        assert!(!Arc::ptr_eq(&batch_a, &batch_b));

        assert!(batch_a.claim_commit_rights());
        assert!(batch_b.claim_commit_rights());
        assert!(catalog.prepare_commit(&batch_a).await);

        let waiter = {
            let catalog = catalog.clone();
            let batch_b = batch_b.clone();
            tokio::spawn(async move { catalog.prepare_commit(&batch_b).await })
        };

        // Only one batch per bucket may be prepared at a time.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        catalog.finish(&batch_a, CommitInfo::ok());
        assert!(waiter.await.unwrap());
        catalog.finish(&batch_b, CommitInfo::ok());

        assert!(stat(&catalog, NS, "numWaits") >= 1);
        assert_eq!(stat(&catalog, NS, "numCommits"), 2);
        check_invariants(&catalog);
    }

    #[tokio::test]
    async fn test_clear_during_prepare_signals_write_conflict() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let batch = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "x", "v": 1 }), session);
        assert!(batch.claim_commit_rights());
        assert!(catalog.prepare_commit(&batch).await);

        let id = catalog.bucket_id_of(&batch).unwrap();
        assert_eq!(catalog.bucket_state(&id), Some(BucketState::Prepared));

        match catalog.clear_bucket(&id) {
            Err(CatalogError::WriteConflict {
                bucket_id,
            }) => assert_eq!(bucket_id, id),
            other => panic!("expected WriteConflict, got {:?}", other),
        }
        assert_eq!(catalog.bucket_state(&id), Some(BucketState::PreparedAndCleared));

        // The committer's finish delivers the cleared error to all waiters.
        catalog.finish(&batch, CommitInfo::ok());
        match batch.wait_result().await {
            Err(CatalogError::BucketCleared {
                bucket_id, ..
            }) => assert_eq!(bucket_id, id),
            other => panic!("expected BucketCleared, got {:?}", other),
        }
        assert_eq!(catalog.bucket_state(&id), Some(BucketState::Cleared));

        // The next insert replaces the cleared bucket with a fresh one.
        let replacement = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "x", "v": 2 }), session);
        let new_id = catalog.bucket_id_of(&replacement).unwrap();
        assert_ne!(new_id, id);
        assert_eq!(catalog.bucket_state(&id), None);
        assert_eq!(num_buckets(&catalog), 1);
        check_invariants(&catalog);
    }

    #[test]
    fn test_clear_unprepared_bucket_is_silent() {
        let catalog = BucketCatalog::default();
        let batch = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), Uuid::new_v4());
        let id = catalog.bucket_id_of(&batch).unwrap();

        assert!(catalog.clear_bucket(&id).is_ok());
        assert_eq!(catalog.bucket_state(&id), Some(BucketState::Cleared));

        // The cleared bucket is reaped on next touch and the pending batch
        // observes the error.
        let replacement = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 2 }), Uuid::new_v4());
        assert_ne!(catalog.bucket_id_of(&replacement), Some(id));
        match batch.result_if_ready() {
            Some(Err(CatalogError::BucketCleared { .. })) => {},
            other => panic!("expected BucketCleared, got {:?}", other),
        }
        check_invariants(&catalog);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let catalog = BucketCatalog::default();
        let batch = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), Uuid::new_v4());

        assert!(batch.claim_commit_rights());
        catalog.abort(&batch);
        assert_eq!(num_buckets(&catalog), 0);
        match batch.result_if_ready() {
            Some(Err(CatalogError::BucketCleared { .. })) => {},
            other => panic!("expected BucketCleared, got {:?}", other),
        }

        // A second abort changes nothing.
        catalog.abort(&batch);
        assert_eq!(num_buckets(&catalog), 0);
        match batch.result_if_ready() {
            Some(Err(CatalogError::BucketCleared { .. })) => {},
            other => panic!("expected BucketCleared, got {:?}", other),
        }
        check_invariants(&catalog);
    }

    #[test]
    fn test_abort_fails_every_pending_batch() {
        let catalog = BucketCatalog::default();
        let batch_a = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), Uuid::new_v4());
        let batch_b = insert(&catalog, NS, &plain_options(), json!({ "t": T0 + 1, "v": 2 }), Uuid::new_v4());

        assert!(batch_a.claim_commit_rights());
        catalog.abort(&batch_a);

        for batch in [&batch_a, &batch_b] {
            match batch.result_if_ready() {
                Some(Err(CatalogError::BucketCleared { .. })) => {},
                other => panic!("expected BucketCleared, got {:?}", other),
            }
        }
        assert_eq!(num_buckets(&catalog), 0);
        check_invariants(&catalog);
    }

    #[test]
    fn test_idle_eviction_under_memory_pressure() {
        let config = CatalogConfig {
            idle_bucket_expiry_memory_usage_threshold: 1,
            ..CatalogConfig::default()
        };
        let catalog = BucketCatalog::new(config);
        let session = Uuid::new_v4();

        let batch = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "old", "v": 1 }), session);
        commit(&catalog, &batch);
        assert_eq!(catalog.num_idle_buckets(), 1);
        assert!(catalog.memory_usage() > 1);

        // Allocating for fresh metadata reaps the idle bucket first.
        insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "new", "v": 1 }), session);
        assert_eq!(stat(&catalog, NS, "numBucketsClosedDueToMemoryThreshold"), 1);
        assert_eq!(num_buckets(&catalog), 1);
        assert_eq!(catalog.num_idle_buckets(), 0);
        check_invariants(&catalog);
    }

    #[test]
    fn test_combine_allow_shares_one_batch() {
        let catalog = BucketCatalog::default();

        let first = catalog
            .insert(
                NS,
                Arc::new(BinaryComparator),
                &plain_options(),
                json!({ "t": T0, "v": 1 }),
                CombinePolicy::Allow,
                Uuid::new_v4(),
            )
            .unwrap();
        let second = catalog
            .insert(
                NS,
                Arc::new(BinaryComparator),
                &plain_options(),
                json!({ "t": T0 + 1, "v": 2 }),
                CombinePolicy::Allow,
                Uuid::new_v4(),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.claim_commit_rights());
        assert!(futures_block(catalog.prepare_commit(&first)));
        assert_eq!(
            first.measurements(),
            vec![json!({ "t": T0, "v": 1 }), json!({ "t": T0 + 1, "v": 2 })]
        );
        catalog.finish(&first, CommitInfo::ok());
        check_invariants(&catalog);
    }

    #[test]
    fn test_combine_disallow_keeps_batches_apart() {
        let catalog = BucketCatalog::default();
        let first = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), Uuid::new_v4());
        let second = insert(&catalog, NS, &plain_options(), json!({ "t": T0 + 1, "v": 2 }), Uuid::new_v4());

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(num_buckets(&catalog), 1);
        check_invariants(&catalog);
    }

    #[test]
    fn test_clear_namespace_aborts_buckets_and_drops_stats() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();
        let batch = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "a", "v": 1 }), session);
        insert(&catalog, "db.other", &options(), json!({ "t": T0, "tag": "b", "v": 1 }), session);
        assert_eq!(stat(&catalog, NS, "numBucketsOpenedDueToMetadata"), 1);

        catalog.clear_namespace(NS);

        match batch.result_if_ready() {
            Some(Err(CatalogError::BucketCleared {
                namespace, ..
            })) => assert_eq!(namespace, NS),
            other => panic!("expected BucketCleared, got {:?}", other),
        }
        assert_eq!(num_buckets(&catalog), 1);
        assert_eq!(stat(&catalog, NS, "numBucketsOpenedDueToMetadata"), 0);
        assert_eq!(stat(&catalog, "db.other", "numBucketsOpenedDueToMetadata"), 1);
        check_invariants(&catalog);
    }

    #[test]
    fn test_clear_database_matches_by_prefix() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();
        insert(&catalog, "db.a", &plain_options(), json!({ "t": T0, "v": 1 }), session);
        insert(&catalog, "db.b", &plain_options(), json!({ "t": T0, "v": 1 }), session);
        insert(&catalog, "dbx.c", &plain_options(), json!({ "t": T0, "v": 1 }), session);

        catalog.clear_database("db");

        assert_eq!(num_buckets(&catalog), 1);
        let survivor = catalog.buckets.read().unwrap().open.keys().next().unwrap().ns.clone();
        assert_eq!(survivor, "dbx.c");
        check_invariants(&catalog);
    }

    #[test]
    fn test_cleared_bucket_is_not_resurrected_by_rollover() {
        // Clearing a namespace while its batches are unresolved must never
        // bring the old bucket id back, even though the key is reused.
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();

        let batch = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "x", "v": 1 }), session);
        let old_id = catalog.bucket_id_of(&batch).unwrap();
        catalog.clear_namespace(NS);

        let replacement = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "x", "v": 2 }), session);
        let new_id = catalog.bucket_id_of(&replacement).unwrap();

        assert_ne!(old_id, new_id);
        assert_eq!(catalog.bucket_state(&old_id), None);
        assert_eq!(catalog.bucket_state(&new_id), Some(BucketState::Normal));
        check_invariants(&catalog);
    }

    #[test]
    fn test_get_metadata() {
        let catalog = BucketCatalog::default();
        let batch = insert(
            &catalog,
            NS,
            &options(),
            json!({ "t": T0, "tag": { "site": "lab" }, "v": 1 }),
            Uuid::new_v4(),
        );
        assert_eq!(catalog.get_metadata(&batch), json!({ "tag": { "site": "lab" } }));

        assert!(batch.claim_commit_rights());
        catalog.abort(&batch);
        assert_eq!(catalog.get_metadata(&batch), json!({}));
    }

    #[test]
    fn test_missing_meta_field_groups_under_null() {
        let catalog = BucketCatalog::default();
        let session = Uuid::new_v4();
        let without = insert(&catalog, NS, &options(), json!({ "t": T0, "v": 1 }), session);
        let with_null = insert(&catalog, NS, &options(), json!({ "t": T0 + 1, "tag": null, "v": 2 }), session);

        assert!(Arc::ptr_eq(&without, &with_null));
        assert_eq!(catalog.get_metadata(&without), json!({ "tag": null }));
    }

    #[test]
    fn test_server_status_reports_catalog_totals() {
        let catalog = BucketCatalog::default();
        assert!(catalog.server_status().is_none());

        let session = Uuid::new_v4();
        let batch = insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "a", "v": 1 }), session);
        insert(&catalog, NS, &options(), json!({ "t": T0, "tag": "b", "v": 1 }), session);
        commit(&catalog, &batch);

        let status = catalog.server_status().unwrap();
        assert_eq!(status.get("numBuckets"), Some(&json!(2)));
        assert_eq!(status.get("numOpenBuckets"), Some(&json!(2)));
        assert_eq!(status.get("numIdleBuckets"), Some(&json!(1)));
        assert!(status.get("memoryUsage").and_then(Value::as_u64).unwrap() > 0);
    }

    #[test]
    fn test_finish_retires_drained_full_bucket() {
        let config = CatalogConfig {
            max_bucket_count: 1,
            ..CatalogConfig::default()
        };
        let catalog = BucketCatalog::new(config);
        let session = Uuid::new_v4();

        let first = insert(&catalog, NS, &plain_options(), json!({ "t": T0, "v": 1 }), session);
        // The second insert rolls the bucket over while `first` is pending,
        // so the old bucket stays latched full.
        let second = insert(&catalog, NS, &plain_options(), json!({ "t": T0 + 1, "v": 2 }), session);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(num_buckets(&catalog), 2);

        commit(&catalog, &first);
        // Draining the full bucket retires it; the open one remains.
        assert_eq!(num_buckets(&catalog), 1);
        assert_eq!(num_open_buckets(&catalog), 1);
        check_invariants(&catalog);
    }
}
