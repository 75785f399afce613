#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    use ellie_core::*;
    use ellie_store::SqliteStore;

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn new_memory(org: OrgId, title: &str, content: &str) -> NewMemory {
        NewMemory::new(org, MemoryKind::Fact, title, content, 3, 0.8, base_time())
    }

    fn message(org: OrgId, room: RoomId, id: u128, offset_secs: i64, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::from_u128(id),
            org_id: org,
            room_id: room,
            project_id: None,
            conversation_id: None,
            author: "ana".into(),
            content: content.into(),
            created_at: base_time() + Duration::seconds(offset_secs),
        }
    }

    // ── Memories ───────────────────────────────────────────────

    mod memories {
        use super::*;

        #[test]
        fn test_insert_and_get_preserves_fields() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            let mut m = new_memory(org, "Billing uses Postgres", "billing-db runs Postgres 16")
                .with_metadata("source_message_id", serde_json::json!("abc"));
            m.room_id = Some(room);
            m.embedding = Some(vec![0.5, -0.25, 1.0]);
            let id = store.add_memory(&m).unwrap();

            let got = store.get_memory(org, id).unwrap().unwrap();
            assert_eq!(got.title, "Billing uses Postgres");
            assert_eq!(got.kind, MemoryKind::Fact);
            assert_eq!(got.status, MemoryStatus::Active);
            assert_eq!(got.room_id, Some(room));
            assert_eq!(got.occurred_at, base_time());
            assert_eq!(got.metadata["source_message_id"], serde_json::json!("abc"));
            assert_eq!(got.embedding, Some(vec![0.5, -0.25, 1.0]));
        }

        #[test]
        fn test_get_is_scoped_by_org() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let id = store.add_memory(&new_memory(org, "t", "c")).unwrap();
            assert!(store.get_memory(Uuid::new_v4(), id).unwrap().is_none());
        }

        #[test]
        fn test_open_persists_across_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("ellie.db");
            let org = Uuid::new_v4();
            let id = {
                let store = SqliteStore::open(&path).unwrap();
                store.add_memory(&new_memory(org, "durable", "kept on disk")).unwrap()
            };
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.get_memory(org, id).unwrap().unwrap().title, "durable");
        }
    }

    // ── Ingestion ──────────────────────────────────────────────

    mod ingestion {
        use super::*;
        use ellie_config::schema::IngestionConfig;
        use ellie_workers::{IngestionStore, IngestionWorker, Worker, extractor_from_config};

        #[tokio::test]
        async fn test_new_room_listed_with_start_cursor() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            store.add_chat_message(&message(org, room, 1, 0, "hello there")).unwrap();

            let rooms = store.rooms_needing_ingestion(10).await.unwrap();
            assert_eq!(rooms, vec![RoomCursor::start(org, room)]);
        }

        #[tokio::test]
        async fn test_cursor_progression() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            let first = message(org, room, 1, 0, "first");
            let second = message(org, room, 2, 5, "second");
            store.add_chat_message(&second).unwrap();
            store.add_chat_message(&first).unwrap();

            let mut cursor = RoomCursor::start(org, room);
            let batch = store.messages_after(&cursor, 10).await.unwrap();
            assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![first.id, second.id]);

            cursor.advance_to(&second);
            store.save_cursor(&cursor).await.unwrap();
            assert!(store.rooms_needing_ingestion(10).await.unwrap().is_empty());

            let third = message(org, room, 3, 9, "third");
            store.add_chat_message(&third).unwrap();
            let rooms = store.rooms_needing_ingestion(10).await.unwrap();
            assert_eq!(rooms, vec![cursor.clone()]);
            let batch = store.messages_after(&rooms[0], 10).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].id, third.id);
        }

        #[tokio::test]
        async fn test_same_timestamp_ordered_by_id() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            let a = message(org, room, 10, 0, "same instant a");
            let b = message(org, room, 11, 0, "same instant b");
            store.add_chat_message(&b).unwrap();
            store.add_chat_message(&a).unwrap();

            let mut cursor = RoomCursor::start(org, room);
            cursor.advance_to(&a);
            let batch = store.messages_after(&cursor, 10).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].id, b.id);
        }

        #[tokio::test]
        async fn test_messages_after_respects_limit() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            for i in 0..5 {
                store.add_chat_message(&message(org, room, i as u128 + 1, i, "msg")).unwrap();
            }
            let batch = store.messages_after(&RoomCursor::start(org, room), 3).await.unwrap();
            assert_eq!(batch.len(), 3);
            assert_eq!(batch[2].id, Uuid::from_u128(3));
        }

        #[tokio::test]
        async fn test_entity_mentions_count_once_per_memory() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let m1 = store.add_memory(&new_memory(org, "a", "billing-db")).unwrap();
            let m2 = store.add_memory(&new_memory(org, "b", "billing-db")).unwrap();

            store.record_entity_mention(org, "billing-db", m1).await.unwrap();
            store.record_entity_mention(org, "Billing-DB", m2).await.unwrap();
            store.record_entity_mention(org, "billing-db", m2).await.unwrap();

            let entity = store.find_entity(org, "BILLING-DB").unwrap().unwrap();
            assert_eq!(entity.name, "billing-db");
            assert_eq!(entity.mention_count, 2);
            assert!(!entity.stale);
            assert!(entity.synthesis_memory_id.is_none());
        }

        #[tokio::test]
        async fn test_empty_entity_name_rejected() {
            let store = SqliteStore::open_in_memory().unwrap();
            let err = store
                .record_entity_mention(Uuid::new_v4(), "  ", Uuid::new_v4())
                .await
                .unwrap_err();
            assert!(matches!(err, EllieError::Validation(_)));
        }

        #[tokio::test]
        async fn test_worker_against_sqlite() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            for m in [
                message(org, room, 1, 0, "We decided to use Postgres for `billing-db` storage"),
                message(org, room, 2, 1, "ok thanks"),
                message(org, room, 3, 2, "Lesson learned: the `billing-db` failover takes 40 seconds"),
            ] {
                store.add_chat_message(&m).unwrap();
            }
            let cfg = IngestionConfig::default();
            let extractor = extractor_from_config(&cfg, None).unwrap();
            let worker = IngestionWorker::new(store.clone(), extractor, cfg).unwrap();

            assert_eq!(worker.run_once().await.unwrap(), 3);
            let memories = store.list_memories(org, MemoryStatus::Active, 10).unwrap();
            assert_eq!(memories.len(), 2);
            assert!(memories.iter().all(|m| m.room_id == Some(room)));
            assert_eq!(store.find_entity(org, "billing-db").unwrap().unwrap().mention_count, 2);

            assert_eq!(worker.run_once().await.unwrap(), 0);
        }
    }

    // ── Dedup ──────────────────────────────────────────────────

    mod dedup {
        use super::*;
        use ellie_workers::{DedupApplication, DedupStore};

        fn seeded() -> (SqliteStore, OrgId, MemoryId, MemoryId, MemoryId) {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let mut ids = Vec::new();
            for (i, title) in ["deploys on friday", "friday deploys", "unrelated"].iter().enumerate() {
                let mut m = new_memory(org, title, "content");
                m.occurred_at = base_time() + Duration::minutes(i as i64);
                m.embedding = Some(vec![1.0, i as f32]);
                ids.push(store.add_memory(&m).unwrap());
            }
            (store, org, ids[0], ids[1], ids[2])
        }

        fn application(org: OrgId) -> DedupApplication {
            DedupApplication {
                org_id: org,
                merged: None,
                keep: None,
                deprecate: vec![],
                pairs: vec![],
                model: "mock".into(),
                trace_id: "trace-1".into(),
            }
        }

        #[tokio::test]
        async fn test_keep_deprecate_records_pairs() {
            let (store, org, a, b, c) = seeded();
            let app = DedupApplication {
                keep: Some(a),
                deprecate: vec![b],
                pairs: vec![(a, b)],
                ..application(org)
            };
            assert_eq!(store.apply_dedup(&app).await.unwrap(), None);

            let old = store.get_memory(org, b).unwrap().unwrap();
            assert_eq!(old.status, MemoryStatus::Deprecated);
            assert_eq!(old.superseded_by, Some(a));

            let reviewed = store.reviewed_pairs(org, &[(b, a), (a, c)]).await.unwrap();
            assert!(reviewed.contains(&(b, a)));
            assert!(!reviewed.contains(&(a, c)));
            assert!(store.is_pair_reviewed(org, a, b).unwrap());

            let active: Vec<MemoryId> = store
                .active_embedded_memories(org, 10)
                .await
                .unwrap()
                .iter()
                .map(|m| m.id)
                .collect();
            assert_eq!(active, vec![c, a]);
        }

        #[tokio::test]
        async fn test_inactive_target_rejected_without_writes() {
            let (store, org, a, b, c) = seeded();
            let first = DedupApplication {
                keep: Some(a),
                deprecate: vec![b],
                ..application(org)
            };
            store.apply_dedup(&first).await.unwrap();

            let stale = DedupApplication {
                keep: Some(a),
                deprecate: vec![c, b],
                pairs: vec![(a, c)],
                ..application(org)
            };
            let err = store.apply_dedup(&stale).await.unwrap_err();
            assert!(matches!(err, EllieError::Validation(_)));
            assert_eq!(store.get_memory(org, c).unwrap().unwrap().status, MemoryStatus::Active);
            assert!(!store.is_pair_reviewed(org, a, c).unwrap());
        }

        #[tokio::test]
        async fn test_merge_inserts_and_supersedes() {
            let (store, org, a, b, _) = seeded();
            let merged = new_memory(org, "deploys happen on friday", "merged").with_metadata(
                "merged_from",
                serde_json::json!([a.to_string(), b.to_string()]),
            );
            let app = DedupApplication {
                merged: Some(merged),
                deprecate: vec![a, b],
                pairs: vec![(a, b)],
                ..application(org)
            };
            let id = store.apply_dedup(&app).await.unwrap().unwrap();

            let m = store.get_memory(org, id).unwrap().unwrap();
            assert!(m.is_active());
            assert!(m.embedding.is_none());
            for old in [a, b] {
                assert_eq!(store.get_memory(org, old).unwrap().unwrap().superseded_by, Some(id));
            }
        }

        #[tokio::test]
        async fn test_failed_reviews_expire_and_refresh() {
            let (store, org, a, b, c) = seeded();
            let failed_at = base_time();
            store.record_failed_review(org, &[(a, b)], failed_at).await.unwrap();

            let recent = store
                .failed_pairs(org, &[(b, a), (a, c)], failed_at - Duration::hours(1))
                .await
                .unwrap();
            assert!(recent.contains(&(b, a)));
            assert!(!recent.contains(&(a, c)));
            assert!(store.failed_pairs(org, &[(a, b)], failed_at).await.unwrap().is_empty());
            assert!(store.failed_pairs(Uuid::new_v4(), &[(a, b)], failed_at - Duration::hours(1)).await.unwrap().is_empty());

            // A second failure moves the window forward.
            store.record_failed_review(org, &[(b, a)], failed_at + Duration::hours(2)).await.unwrap();
            let later = store
                .failed_pairs(org, &[(a, b)], failed_at + Duration::hours(1))
                .await
                .unwrap();
            assert!(later.contains(&(a, b)));
            assert!(!store.is_pair_reviewed(org, a, b).unwrap());
        }

        #[tokio::test]
        async fn test_dedup_orgs_lists_orgs_with_active_memories() {
            let (store, org, ..) = seeded();
            assert_eq!(store.dedup_orgs().await.unwrap(), vec![org]);
        }
    }

    // ── Taxonomy ───────────────────────────────────────────────

    mod taxonomy {
        use super::*;
        use ellie_workers::{Assignment, TaxonomyStore};

        fn node(org: OrgId, parent: Option<&TaxonomyNode>, slug: &str) -> TaxonomyNode {
            TaxonomyNode {
                id: Uuid::new_v4(),
                org_id: org,
                parent_id: parent.map(|p| p.id),
                slug: slug.into(),
                depth: parent.map_or(0, |p| p.depth + 1),
            }
        }

        #[tokio::test]
        async fn test_nodes_and_orgs() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let root = node(org, None, "engineering");
            let child = node(org, Some(&root), "databases");
            store.add_taxonomy_node(&child).unwrap();
            store.add_taxonomy_node(&root).unwrap();

            assert_eq!(store.orgs_with_taxonomy().await.unwrap(), vec![org]);
            assert_eq!(store.taxonomy_nodes(org).await.unwrap(), vec![root, child]);
            assert!(store.taxonomy_nodes(Uuid::new_v4()).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_classification_upserts_and_marks_memory() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let root = node(org, None, "engineering");
            store.add_taxonomy_node(&root).unwrap();
            let m1 = store.add_memory(&new_memory(org, "one", "c")).unwrap();
            let m2 = store.add_memory(&new_memory(org, "two", "c")).unwrap();
            assert_eq!(store.unclassified_memories(org, Utc::now(), 10).await.unwrap().len(), 2);

            let assign = |confidence| Assignment {
                node_id: root.id,
                path: "engineering".into(),
                confidence,
            };
            store
                .save_classification(org, m1, &[assign(0.9)], "mock", "trace-1")
                .await
                .unwrap();
            store
                .save_classification(org, m1, &[assign(0.7)], "mock", "trace-2")
                .await
                .unwrap();

            assert_eq!(store.classifications(m1).unwrap(), vec![(root.id, 0.7)]);
            let left = store.unclassified_memories(org, Utc::now(), 10).await.unwrap();
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].id, m2);
        }

        #[tokio::test]
        async fn test_failed_memory_waits_behind_fresh_ones() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            store.add_taxonomy_node(&node(org, None, "engineering")).unwrap();
            let stuck = store.add_memory(&new_memory(org, "stuck", "c")).unwrap();
            let fresh = store.add_memory(&new_memory(org, "fresh", "c")).unwrap();

            let failed_at = Utc::now();
            store.record_classification_failure(org, stuck, failed_at).await.unwrap();

            let waiting = store
                .unclassified_memories(org, failed_at - Duration::hours(1), 10)
                .await
                .unwrap();
            assert_eq!(waiting.iter().map(|m| m.id).collect::<Vec<_>>(), vec![fresh]);

            let due = store
                .unclassified_memories(org, failed_at + Duration::hours(1), 10)
                .await
                .unwrap();
            assert_eq!(due.iter().map(|m| m.id).collect::<Vec<_>>(), vec![fresh, stuck]);

            let first = store
                .unclassified_memories(org, failed_at + Duration::hours(1), 1)
                .await
                .unwrap();
            assert_eq!(first[0].id, fresh);
        }

        #[tokio::test]
        async fn test_classifying_unknown_memory_fails() {
            let store = SqliteStore::open_in_memory().unwrap();
            let err = store
                .save_classification(Uuid::new_v4(), Uuid::new_v4(), &[], "mock", "t")
                .await
                .unwrap_err();
            assert!(matches!(err, EllieError::Validation(_)));
        }
    }

    // ── Synthesis ──────────────────────────────────────────────

    mod synthesis {
        use super::*;
        use ellie_workers::{DedupApplication, DedupStore, IngestionStore, SynthesisStore, SynthesisWrite};

        async fn mentioned(store: &SqliteStore, org: OrgId, n: i64) -> Vec<MemoryId> {
            let mut ids = Vec::new();
            for i in 0..n {
                let mut m = new_memory(org, &format!("billing-db note {i}"), "about billing-db");
                m.occurred_at = base_time() + Duration::minutes(i);
                let id = store.add_memory(&m).unwrap();
                store.record_entity_mention(org, "billing-db", id).await.unwrap();
                ids.push(id);
            }
            ids
        }

        #[tokio::test]
        async fn test_threshold_and_source_order() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let ids = mentioned(&store, org, 3).await;

            assert!(store.entities_needing_synthesis(4, 10).await.unwrap().is_empty());
            let entities = store.entities_needing_synthesis(3, 10).await.unwrap();
            assert_eq!(entities.len(), 1);

            let sources = store.entity_source_memories(org, entities[0].id, 10).await.unwrap();
            assert_eq!(sources.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);
        }

        #[tokio::test]
        async fn test_save_then_stale_then_update_in_place() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            mentioned(&store, org, 3).await;
            let entity = store.entities_needing_synthesis(3, 10).await.unwrap().remove(0);

            let write = SynthesisWrite {
                existing: None,
                memory: new_memory(org, "billing-db", "The billing database."),
            };
            let def_id = store.save_synthesis(&entity, &write).await.unwrap();
            let fresh = store.find_entity(org, "billing-db").unwrap().unwrap();
            assert_eq!(fresh.synthesis_memory_id, Some(def_id));
            assert!(!fresh.stale);
            assert!(store.entities_needing_synthesis(3, 10).await.unwrap().is_empty());

            // A new mention makes the definition stale again.
            let extra = store.add_memory(&new_memory(org, "more", "billing-db again")).unwrap();
            store.record_entity_mention(org, "billing-db", extra).await.unwrap();
            let stale = store.entities_needing_synthesis(3, 10).await.unwrap().remove(0);
            assert!(stale.stale);
            assert_eq!(stale.mention_count, 4);

            let update = SynthesisWrite {
                existing: stale.synthesis_memory_id,
                memory: new_memory(org, "billing-db", "The billing database, Postgres 16."),
            };
            assert_eq!(store.save_synthesis(&stale, &update).await.unwrap(), def_id);
            let def = store.get_memory(org, def_id).unwrap().unwrap();
            assert_eq!(def.content, "The billing database, Postgres 16.");
            assert!(!store.find_entity(org, "billing-db").unwrap().unwrap().stale);
        }

        #[tokio::test]
        async fn test_update_in_place_stores_new_vector() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            mentioned(&store, org, 3).await;
            let entity = store.entities_needing_synthesis(3, 10).await.unwrap().remove(0);
            let mut first = new_memory(org, "billing-db", "The billing database.");
            first.embedding = Some(vec![1.0, 0.0]);
            let def_id = store
                .save_synthesis(&entity, &SynthesisWrite { existing: None, memory: first })
                .await
                .unwrap();

            let mut second = new_memory(org, "billing-db", "The billing database, now in eu-west.");
            second.embedding = Some(vec![0.25, 0.75]);
            let update = SynthesisWrite {
                existing: Some(def_id),
                memory: second,
            };
            assert_eq!(store.save_synthesis(&entity, &update).await.unwrap(), def_id);
            let def = store.get_memory(org, def_id).unwrap().unwrap();
            assert_eq!(def.content, "The billing database, now in eu-west.");
            assert!(def.has_embedding());
            assert_eq!(def.embedding, Some(vec![0.25, 0.75]));

            // Without a vector the stale one is dropped so backfill picks it up.
            let bare = SynthesisWrite {
                existing: Some(def_id),
                memory: new_memory(org, "billing-db", "The billing database, retired."),
            };
            store.save_synthesis(&entity, &bare).await.unwrap();
            assert!(store.get_memory(org, def_id).unwrap().unwrap().embedding.is_none());
        }

        #[tokio::test]
        async fn test_deprecated_definition_is_not_revived() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let ids = mentioned(&store, org, 3).await;
            let entity = store.entities_needing_synthesis(3, 10).await.unwrap().remove(0);
            let write = SynthesisWrite {
                existing: None,
                memory: new_memory(org, "billing-db", "The billing database."),
            };
            let def_id = store.save_synthesis(&entity, &write).await.unwrap();

            store
                .apply_dedup(&DedupApplication {
                    org_id: org,
                    merged: None,
                    keep: Some(ids[0]),
                    deprecate: vec![def_id],
                    pairs: vec![(ids[0], def_id)],
                    model: "mock".into(),
                    trace_id: "t".into(),
                })
                .await
                .unwrap();

            let update = SynthesisWrite {
                existing: Some(def_id),
                memory: new_memory(org, "billing-db", "The billing database, Postgres 16."),
            };
            let new_id = store.save_synthesis(&entity, &update).await.unwrap();
            assert_ne!(new_id, def_id);

            let old = store.get_memory(org, def_id).unwrap().unwrap();
            assert_eq!(old.status, MemoryStatus::Deprecated);
            assert_eq!(old.superseded_by, Some(ids[0]));
            assert_eq!(old.content, "The billing database.");

            let fresh = store.get_memory(org, new_id).unwrap().unwrap();
            assert!(fresh.is_active());
            assert_eq!(fresh.content, "The billing database, Postgres 16.");
            let relinked = store.find_entity(org, "billing-db").unwrap().unwrap();
            assert_eq!(relinked.synthesis_memory_id, Some(new_id));
        }

        #[tokio::test]
        async fn test_skipped_entity_returns_on_next_mention() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            mentioned(&store, org, 3).await;
            let entity = store.entities_needing_synthesis(3, 10).await.unwrap().remove(0);

            store.skip_entity(&entity).await.unwrap();
            assert!(store.entities_needing_synthesis(3, 10).await.unwrap().is_empty());

            let extra = store.add_memory(&new_memory(org, "more", "billing-db again")).unwrap();
            store.record_entity_mention(org, "billing-db", extra).await.unwrap();
            let back = store.entities_needing_synthesis(3, 10).await.unwrap();
            assert_eq!(back.len(), 1);
            assert_eq!(back[0].mention_count, 4);

            let write = SynthesisWrite {
                existing: None,
                memory: new_memory(org, "billing-db", "The billing database."),
            };
            store.save_synthesis(&back[0], &write).await.unwrap();
            let extra = store.add_memory(&new_memory(org, "even more", "billing-db once more")).unwrap();
            store.record_entity_mention(org, "billing-db", extra).await.unwrap();
            assert_eq!(store.entities_needing_synthesis(3, 10).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_deprecated_sources_excluded() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let ids = mentioned(&store, org, 2).await;
            store
                .apply_dedup(&DedupApplication {
                    org_id: org,
                    merged: None,
                    keep: Some(ids[1]),
                    deprecate: vec![ids[0]],
                    pairs: vec![(ids[0], ids[1])],
                    model: "mock".into(),
                    trace_id: "t".into(),
                })
                .await
                .unwrap();
            let entity = store.find_entity(org, "billing-db").unwrap().unwrap();
            let sources = store.entity_source_memories(org, entity.id, 10).await.unwrap();
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].id, ids[1]);
        }
    }

    // ── Backfill ───────────────────────────────────────────────

    mod backfill {
        use super::*;
        use ellie_llm::MockEmbedding;
        use ellie_workers::{BackfillStore, BackfillWorker, Worker};

        #[tokio::test]
        async fn test_backfill_fills_missing_vectors() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let org = Uuid::new_v4();
            let id = store.add_memory(&new_memory(org, "needs vector", "content")).unwrap();
            let mut embedded = new_memory(org, "has vector", "content");
            embedded.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
            store.add_memory(&embedded).unwrap();

            assert_eq!(store.memories_missing_embedding(10).await.unwrap().len(), 1);
            let worker = BackfillWorker::new(store.clone(), Arc::new(MockEmbedding::new(4)), 8);
            assert_eq!(worker.run_once().await.unwrap(), 1);

            assert_eq!(store.get_memory(org, id).unwrap().unwrap().embedding.map(|e| e.len()), Some(4));
            assert!(store.memories_missing_embedding(10).await.unwrap().is_empty());
            assert_eq!(worker.run_once().await.unwrap(), 0);
        }
    }

    // ── Retrieval ──────────────────────────────────────────────

    mod retrieval {
        use super::*;
        use ellie_retrieval::{
            CandidateSource, InjectionRecord, InjectionStore, RetrievalCascade, RetrievalRequest, RetrievalStore,
            RetrievalStrategy, StrategyStore, Tier,
        };
        use ellie_workers::{DedupApplication, DedupStore};

        #[tokio::test]
        async fn test_scoped_searches() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            let project = Uuid::new_v4();

            let mut in_room = new_memory(org, "postgres failover", "room note");
            in_room.room_id = Some(room);
            in_room.project_id = Some(Uuid::new_v4());
            let in_room = store.add_memory(&in_room).unwrap();
            let mut in_project = new_memory(org, "postgres upgrade", "project note");
            in_project.project_id = Some(project);
            let in_project = store.add_memory(&in_project).unwrap();
            let unscoped = store.add_memory(&new_memory(org, "postgres basics", "org note")).unwrap();
            store.add_memory(&new_memory(Uuid::new_v4(), "postgres elsewhere", "other org")).unwrap();

            let room_hits = store.search_room_context(org, room, "postgres", 10).await.unwrap();
            assert_eq!(room_hits.iter().map(|h| h.memory.id).collect::<Vec<_>>(), vec![in_room]);

            let project_hits = store.search_project_memories(org, project, "postgres", 10).await.unwrap();
            assert_eq!(project_hits.len(), 1);
            assert_eq!(project_hits[0].memory.id, in_project);

            assert_eq!(store.search_memories_org_wide(org, "postgres", 10).await.unwrap().len(), 3);

            let candidates = store
                .injection_candidates(org, Some(project), "postgres", 10)
                .await
                .unwrap();
            let ids: Vec<MemoryId> = candidates.iter().map(|h| h.memory.id).collect();
            assert!(ids.contains(&in_project) && ids.contains(&unscoped));
            assert!(!ids.contains(&in_room));
        }

        #[tokio::test]
        async fn test_scores_rank_and_empty_query() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let partial = store.add_memory(&new_memory(org, "postgres", "a database")).unwrap();
            let full = store
                .add_memory(&new_memory(org, "postgres failover", "takes forty seconds"))
                .unwrap();

            let hits = store.search_memories_org_wide(org, "postgres failover", 10).await.unwrap();
            assert_eq!(hits[0].memory.id, full);
            assert_eq!(hits[1].memory.id, partial);
            assert!(hits[0].score > hits[1].score);
            assert_eq!(store.search_memories_org_wide(org, "postgres failover", 1).await.unwrap().len(), 1);
            assert!(store.search_memories_org_wide(org, "  ", 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_deprecated_hidden_and_supersedes_reported() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let old = store.add_memory(&new_memory(org, "deploy window", "tuesdays")).unwrap();
            let new = store.add_memory(&new_memory(org, "deploy window", "fridays")).unwrap();
            store
                .apply_dedup(&DedupApplication {
                    org_id: org,
                    merged: None,
                    keep: Some(new),
                    deprecate: vec![old],
                    pairs: vec![(old, new)],
                    model: "mock".into(),
                    trace_id: "t".into(),
                })
                .await
                .unwrap();

            let hits = store.search_memories_org_wide(org, "deploy window", 10).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].memory.id, new);
            assert_eq!(hits[0].supersedes, Some(old));
        }

        #[tokio::test]
        async fn test_chat_history_search() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            store.add_chat_message(&message(org, room, 1, 0, "the failover took ages")).unwrap();
            store.add_chat_message(&message(org, room, 2, 1, "lunch?")).unwrap();

            let hits = store.search_chat_history(org, "failover", 10).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].id, Uuid::from_u128(1));
            assert!(store.search_chat_history(Uuid::new_v4(), "failover", 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_cascade_over_sqlite_falls_through_to_chat() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            store.add_chat_message(&message(org, room, 1, 0, "kafka lag spiked at noon")).unwrap();

            let cascade = RetrievalCascade::new(store.clone());
            let req = RetrievalRequest {
                org_id: org,
                room_id: Some(room),
                project_id: None,
                query: "kafka lag".into(),
                limit: 5,
            };
            let outcome = cascade.retrieve(&req).await.unwrap();
            assert_eq!(outcome.tier_used, Tier::ChatHistory);

            let mut m = new_memory(org, "kafka lag", "consumer group rebalances");
            m.room_id = Some(room);
            store.add_memory(&m).unwrap();
            let outcome = cascade.retrieve(&req).await.unwrap();
            assert_eq!(outcome.tier_used, Tier::RoomContext);
        }

        #[tokio::test]
        async fn test_strategy_activation() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            assert!(store.active_strategy(org).await.unwrap().is_none());

            let v1 = RetrievalStrategy {
                version: 1,
                ..Default::default()
            };
            let v2 = RetrievalStrategy {
                version: 2,
                steps: vec![],
                ..Default::default()
            };
            store.save_strategy(org, &v1, true).unwrap();
            store.save_strategy(org, &v2, false).unwrap();
            assert_eq!(store.active_strategy(org).await.unwrap(), Some(v1));

            store.save_strategy(org, &v2, true).unwrap();
            assert_eq!(store.active_strategy(org).await.unwrap(), Some(v2));
        }

        #[tokio::test]
        async fn test_injection_ledger() {
            let store = SqliteStore::open_in_memory().unwrap();
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            let record = |minutes| InjectionRecord {
                org_id: org,
                room_id: room,
                memory_id: Uuid::new_v4(),
                score: 0.8,
                injected_at: base_time() + Duration::minutes(minutes),
            };
            store.record_injection(&record(0)).await.unwrap();
            let late = record(10);
            store.record_injection(&late).await.unwrap();

            let recent = store
                .recent_injections(org, room, base_time() + Duration::minutes(5))
                .await
                .unwrap();
            assert_eq!(recent, vec![late]);

            store.add_chat_message(&message(org, room, 1, 0, "a")).unwrap();
            store.add_chat_message(&message(org, room, 2, 1, "b")).unwrap();
            assert_eq!(store.room_message_count(org, room).await.unwrap(), 2);
            assert_eq!(store.room_message_count(org, Uuid::new_v4()).await.unwrap(), 0);
        }
    }
}
