#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use uuid::Uuid;

    use ellie_core::*;
    use ellie_retrieval::*;

    fn memory(org: OrgId, title: &str, content: &str) -> Memory {
        let now = Utc::now();
        Memory {
            id: Uuid::new_v4(),
            org_id: org,
            kind: MemoryKind::Fact,
            title: title.into(),
            content: content.into(),
            metadata: Default::default(),
            importance: 3,
            confidence: 0.8,
            status: MemoryStatus::Active,
            superseded_by: None,
            occurred_at: now,
            project_id: None,
            conversation_id: None,
            room_id: None,
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[derive(Default)]
    struct FakeStore {
        room: Vec<Memory>,
        project: Vec<Memory>,
        org: Vec<Memory>,
        chat: Vec<ChatMessage>,
        fail_org: bool,
        injections: Mutex<Vec<InjectionRecord>>,
        message_count: u64,
    }

    fn hits(memories: &[Memory], limit: usize) -> Vec<MemoryHit> {
        memories.iter().take(limit).map(|m| MemoryHit::new(m.clone(), 0.5)).collect()
    }

    #[async_trait]
    impl RetrievalStore for FakeStore {
        async fn search_room_context(&self, _: OrgId, _: RoomId, _: &str, limit: usize) -> Result<Vec<MemoryHit>> {
            Ok(hits(&self.room, limit))
        }
        async fn search_project_memories(&self, _: OrgId, _: ProjectId, _: &str, limit: usize) -> Result<Vec<MemoryHit>> {
            Ok(hits(&self.project, limit))
        }
        async fn search_memories_org_wide(&self, _: OrgId, _: &str, limit: usize) -> Result<Vec<MemoryHit>> {
            if self.fail_org {
                return Err(EllieError::Store("connection reset".into()));
            }
            Ok(hits(&self.org, limit))
        }
        async fn search_chat_history(&self, _: OrgId, _: &str, limit: usize) -> Result<Vec<ChatMessage>> {
            Ok(self.chat.iter().take(limit).cloned().collect())
        }
    }

    #[async_trait]
    impl CandidateSource for FakeStore {
        async fn injection_candidates(
            &self,
            _: OrgId,
            _: Option<ProjectId>,
            _: &str,
            limit: usize,
        ) -> Result<Vec<MemoryHit>> {
            Ok(self.org.iter().take(limit).map(|m| MemoryHit::new(m.clone(), 0.9)).collect())
        }
    }

    #[async_trait]
    impl InjectionStore for FakeStore {
        async fn recent_injections(&self, _: OrgId, room: RoomId, since: DateTime<Utc>) -> Result<Vec<InjectionRecord>> {
            Ok(self
                .injections
                .lock()
                .iter()
                .filter(|r| r.room_id == room && r.injected_at >= since)
                .cloned()
                .collect())
        }
        async fn room_message_count(&self, _: OrgId, _: RoomId) -> Result<u64> {
            Ok(self.message_count)
        }
        async fn record_injection(&self, record: &InjectionRecord) -> Result<()> {
            self.injections.lock().push(record.clone());
            Ok(())
        }
    }

    fn request(org: OrgId, query: &str) -> RetrievalRequest {
        RetrievalRequest {
            org_id: org,
            room_id: Some(Uuid::new_v4()),
            project_id: Some(Uuid::new_v4()),
            query: query.into(),
            limit: 5,
        }
    }

    // ── Cascade ────────────────────────────────────────────────

    mod cascade {
        use super::*;

        #[tokio::test]
        async fn test_org_only_results_use_tier_two() {
            let org = Uuid::new_v4();
            let store = FakeStore {
                org: vec![memory(org, "Postgres", "We use Postgres for billing")],
                ..Default::default()
            };
            let cascade = RetrievalCascade::new(Arc::new(store));
            let out = cascade.retrieve(&request(org, "postgres")).await.unwrap();
            assert_eq!(out.tier_used, Tier::Memory);
            assert_eq!(out.tier_used.number(), 2);
            assert!(!out.no_information);
            assert_eq!(out.items[0].source, "org_memory");
        }

        #[tokio::test]
        async fn test_nothing_found_is_tier_five() {
            let cascade = RetrievalCascade::new(Arc::new(FakeStore::default()));
            let out = cascade.retrieve(&request(Uuid::new_v4(), "anything")).await.unwrap();
            assert_eq!(out.tier_used, Tier::NoInformation);
            assert!(out.no_information);
            assert!(out.items.is_empty());
        }

        #[tokio::test]
        async fn test_blank_query_short_circuits() {
            let org = Uuid::new_v4();
            let store = FakeStore {
                fail_org: true,
                ..Default::default()
            };
            let cascade = RetrievalCascade::new(Arc::new(store));
            let out = cascade.retrieve(&request(org, "   ")).await.unwrap();
            assert!(out.no_information);
        }

        #[tokio::test]
        async fn test_room_context_wins() {
            let org = Uuid::new_v4();
            let store = FakeStore {
                room: vec![memory(org, "Room note", "deploy on fridays is banned")],
                org: vec![memory(org, "Other", "unrelated")],
                ..Default::default()
            };
            let out = RetrievalCascade::new(Arc::new(store))
                .retrieve(&request(org, "deploy"))
                .await
                .unwrap();
            assert_eq!(out.tier_used, Tier::RoomContext);
            assert_eq!(out.items.len(), 1);
        }

        #[tokio::test]
        async fn test_project_hits_first_and_deduplicated() {
            let org = Uuid::new_v4();
            let shared = memory(org, "Shared", "both scopes");
            let project_only = memory(org, "Project", "project scope");
            let org_only = memory(org, "Org", "org scope");
            let store = FakeStore {
                project: vec![project_only.clone(), shared.clone()],
                org: vec![shared.clone(), org_only.clone()],
                ..Default::default()
            };
            let out = RetrievalCascade::new(Arc::new(store))
                .retrieve(&request(org, "scope"))
                .await
                .unwrap();
            let ids: Vec<_> = out.items.iter().filter_map(|i| i.memory_id).collect();
            assert_eq!(ids, vec![project_only.id, shared.id, org_only.id]);
            assert_eq!(out.items[1].source, "project_memory");
        }

        #[tokio::test]
        async fn test_tier_two_capped_at_limit() {
            let org = Uuid::new_v4();
            let store = FakeStore {
                project: (0..4).map(|i| memory(org, &format!("p{i}"), "x")).collect(),
                org: (0..4).map(|i| memory(org, &format!("o{i}"), "x")).collect(),
                ..Default::default()
            };
            let mut req = request(org, "x");
            req.limit = 3;
            let out = RetrievalCascade::new(Arc::new(store)).retrieve(&req).await.unwrap();
            assert_eq!(out.items.len(), 3);
        }

        #[tokio::test]
        async fn test_store_failure_is_hard_error() {
            let store = FakeStore {
                fail_org: true,
                ..Default::default()
            };
            let err = RetrievalCascade::new(Arc::new(store))
                .retrieve(&request(Uuid::new_v4(), "x"))
                .await
                .unwrap_err();
            assert!(matches!(err, EllieError::Store(_)));
        }

        #[tokio::test]
        async fn test_chat_history_tier() {
            let org = Uuid::new_v4();
            let msg = ChatMessage {
                id: Uuid::new_v4(),
                org_id: org,
                room_id: Uuid::new_v4(),
                project_id: None,
                conversation_id: None,
                author: "maya".into(),
                content: "the staging cluster lives in eu-west".into(),
                created_at: Utc::now(),
            };
            let store = FakeStore {
                chat: vec![msg.clone()],
                ..Default::default()
            };
            let out = RetrievalCascade::new(Arc::new(store))
                .retrieve(&request(org, "staging"))
                .await
                .unwrap();
            assert_eq!(out.tier_used, Tier::ChatHistory);
            assert_eq!(out.items[0].room_id, Some(msg.room_id));
            assert!(out.items[0].snippet.starts_with("maya: "));
        }

        #[tokio::test]
        async fn test_raw_log_tier_and_snippet_truncation() {
            let dir = tempfile::tempdir().unwrap();
            let org = Uuid::new_v4();
            let own = dir.path().join(org.to_string());
            std::fs::create_dir(&own).unwrap();
            std::fs::write(
                own.join("a.jsonl"),
                format!(
                    "{{\"org_id\":\"{}\",\"text\":\"Kafka topic retention is seven days\"}}\nnot json but kafka\n",
                    org
                ),
            )
            .unwrap();
            let cascade = RetrievalCascade::new(Arc::new(FakeStore::default()))
                .with_scanner(Arc::new(JsonlLogScanner::new(dir.path())))
                .with_limits(10, 12);
            let out = cascade.retrieve(&request(org, "KAFKA")).await.unwrap();
            assert_eq!(out.tier_used, Tier::RawLogs);
            assert_eq!(out.items.len(), 2);
            assert_eq!(out.items[0].id, "a.jsonl:1");
            assert!(out.items[0].snippet.chars().count() <= 12);
        }
    }

    // ── Log scanner ────────────────────────────────────────────

    mod logscan {
        use super::*;

        #[tokio::test]
        async fn test_other_org_lines_are_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let org = Uuid::new_v4();
            std::fs::write(
                dir.path().join("b.jsonl"),
                format!("{{\"org_id\":\"{}\",\"message\":\"secret plan\"}}\n", Uuid::new_v4()),
            )
            .unwrap();
            let hits = JsonlLogScanner::new(dir.path()).scan(org, "secret", 10).await.unwrap();
            assert!(hits.is_empty());
        }

        #[tokio::test]
        async fn test_files_read_in_name_order_until_limit() {
            let dir = tempfile::tempdir().unwrap();
            let org = Uuid::new_v4();
            let own = dir.path().join(org.to_string());
            std::fs::create_dir(&own).unwrap();
            std::fs::write(own.join("2.jsonl"), "{\"content\":\"match two\"}\n").unwrap();
            std::fs::write(own.join("1.jsonl"), "{\"content\":\"match one\"}\n").unwrap();
            std::fs::write(own.join("notes.txt"), "match ignored\n").unwrap();
            let hits = JsonlLogScanner::new(dir.path()).scan(org, "match", 1).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].text, "match one");
        }

        #[tokio::test]
        async fn test_untagged_shared_lines_are_not_visible() {
            let dir = tempfile::tempdir().unwrap();
            let org = Uuid::new_v4();
            std::fs::write(
                dir.path().join("shared.jsonl"),
                format!("{{\"text\":\"rollout notes\"}}\nplain rollout line\n{{\"org_id\":\"{org}\",\"text\":\"rollout for us\"}}\n"),
            )
            .unwrap();
            let hits = JsonlLogScanner::new(dir.path()).scan(org, "rollout", 10).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].text, "rollout for us");
            assert_eq!(hits[0].location, "shared.jsonl:3");
        }

        #[tokio::test]
        async fn test_invalid_utf8_does_not_hide_other_files() {
            let dir = tempfile::tempdir().unwrap();
            let org = Uuid::new_v4();
            let own = dir.path().join(org.to_string());
            std::fs::create_dir(&own).unwrap();
            std::fs::write(own.join("a.jsonl"), b"\xff\xfe garbage\nfailover drill \xff\n".to_vec()).unwrap();
            std::fs::write(own.join("b.jsonl"), "{\"message\":\"failover works\"}\n").unwrap();
            let hits = JsonlLogScanner::new(dir.path()).scan(org, "failover", 10).await.unwrap();
            assert_eq!(hits.len(), 2);
            assert!(hits[0].text.starts_with("failover drill"));
            assert_eq!(hits[1].text, "failover works");
        }

        #[tokio::test]
        async fn test_missing_directory_is_empty() {
            let hits = JsonlLogScanner::new("/definitely/not/here")
                .scan(Uuid::new_v4(), "x", 5)
                .await
                .unwrap();
            assert!(hits.is_empty());
        }
    }

    // ── Plan ───────────────────────────────────────────────────

    mod plan {
        use super::*;

        fn strategy() -> RetrievalStrategy {
            RetrievalStrategy {
                version: 3,
                steps: vec![
                    StrategyStep {
                        scope: PlanScope::Org,
                        query_template: "{query}".into(),
                        reason: "base".into(),
                    },
                    StrategyStep {
                        scope: PlanScope::Chat,
                        query_template: "{query}".into(),
                        reason: "history".into(),
                    },
                ],
                expansions: vec![
                    TopicExpansion {
                        keywords: vec!["deploy".into(), "release train".into()],
                        scope: PlanScope::Org,
                        query_template: "deployment process".into(),
                        reason: "deploy topic".into(),
                    },
                    TopicExpansion {
                        keywords: vec!["billing".into()],
                        scope: PlanScope::Org,
                        query_template: "{QUERY}".into(),
                        reason: "unused".into(),
                    },
                ],
            }
        }

        #[test]
        fn test_expansions_follow_base_steps() {
            let plan = build_plan(&strategy(), Uuid::nil(), "how do we deploy?");
            assert_eq!(plan.strategy_version, 3);
            assert_eq!(plan.steps.len(), 3);
            assert_eq!(plan.steps[2].query, "deployment process");
        }

        #[test]
        fn test_keyword_requires_whole_words() {
            let plan = build_plan(&strategy(), Uuid::nil(), "redeployment notes");
            assert_eq!(plan.steps.len(), 2);
            let plan = build_plan(&strategy(), Uuid::nil(), "next Release Train date");
            assert_eq!(plan.steps.len(), 3);
        }

        #[test]
        fn test_dedup_by_scope_and_lowercased_query() {
            let mut s = strategy();
            s.expansions[0].query_template = "{query}".into();
            let plan = build_plan(&s, Uuid::nil(), "Deploy");
            // The expansion renders to the same org query as the base step.
            assert_eq!(plan.steps.len(), 2);
            assert_eq!(plan.steps[0].reason, "base");
        }

        struct NoStrategy;

        #[async_trait]
        impl StrategyStore for NoStrategy {
            async fn active_strategy(&self, _: OrgId) -> Result<Option<RetrievalStrategy>> {
                Ok(None)
            }
        }

        #[tokio::test]
        async fn test_default_strategy_when_none_stored() {
            let plan = RetrievalPlanner::new(Arc::new(NoStrategy)).plan(Uuid::nil(), "q").await.unwrap();
            assert_eq!(plan.strategy_version, 0);
            let scopes: Vec<_> = plan.steps.iter().map(|s| s.scope).collect();
            assert_eq!(scopes, vec![PlanScope::Room, PlanScope::Project, PlanScope::Org, PlanScope::Chat]);
        }
    }

    // ── Injection scoring ──────────────────────────────────────

    mod injection {
        use super::*;

        fn candidate(similarity: f64, importance: u8, age_days: i64, confidence: f64, now: DateTime<Utc>) -> InjectionCandidate {
            InjectionCandidate {
                id: Uuid::new_v4(),
                title: "t".into(),
                content: "c".into(),
                similarity,
                importance,
                confidence,
                occurred_at: now - Duration::days(age_days),
                supersedes: None,
            }
        }

        #[test]
        fn test_strong_candidate_passes() {
            let now = Utc::now();
            let c = candidate(0.95, 5, 1, 0.9, now);
            let bundle = build_bundle(now, 0, 0, &[c], 0.62, 5);
            assert_eq!(bundle.items.len(), 1);
            assert!(bundle.items[0].score > 0.9);
        }

        #[test]
        fn test_weak_old_candidate_excluded() {
            let now = Utc::now();
            let c = candidate(0.20, 1, 365, 0.5, now);
            assert!(build_bundle(now, 0, 0, &[c], 0.50, 5).is_empty());
        }

        #[test]
        fn test_non_finite_components_collapse() {
            let now = Utc::now();
            let c = candidate(f64::NAN, 3, 0, f64::INFINITY, now);
            let s = score_candidate(now, 0, 0, &c);
            assert!(s.score.is_finite());
            assert_eq!(s.similarity, 0.0);
        }

        #[test]
        fn test_future_occurrence_counts_as_fresh() {
            let now = Utc::now();
            let c = candidate(0.5, 3, -10, 0.5, now);
            assert_eq!(score_candidate(now, 0, 0, &c).recency, 1.0);
        }

        #[test]
        fn test_stage_damping_and_novelty_lower_score() {
            let now = Utc::now();
            let c = candidate(0.7, 3, 2, 0.7, now);
            let early = score_candidate(now, 5, 0, &c).score;
            let late = score_candidate(now, 100, 3, &c).score;
            assert!((early - late - (0.08 * 0.55 + 0.12 * 0.75)).abs() < 1e-9);
        }

        #[test]
        fn test_ranking_ties_break_on_id() {
            let now = Utc::now();
            let mut a = candidate(0.8, 4, 1, 0.8, now);
            let mut b = a.clone();
            a.id = Uuid::from_u128(2);
            b.id = Uuid::from_u128(1);
            let bundle = build_bundle(now, 0, 0, &[a, b], 0.0, 5);
            assert_eq!(bundle.items[0].candidate.id, Uuid::from_u128(1));
        }

        #[test]
        fn test_hard_cap_of_ten() {
            let now = Utc::now();
            let many: Vec<_> = (0..15).map(|_| candidate(0.9, 4, 1, 0.9, now)).collect();
            assert_eq!(build_bundle(now, 0, 0, &many, 0.0, 50).items.len(), 10);
        }

        #[test]
        fn test_supersession_note_rendered() {
            let now = Utc::now();
            let old = Uuid::new_v4();
            let mut c = candidate(0.9, 4, 1, 0.9, now);
            c.supersedes = Some(old);
            let bundle = build_bundle(now, 0, 0, &[c], 0.5, 5);
            assert!(bundle.text.contains(&format!("previous decision {old} has been superseded")));
        }
    }

    // ── Injector service ───────────────────────────────────────

    mod injector {
        use super::*;

        fn injector(store: Arc<FakeStore>) -> ProactiveInjector {
            let tuning = TunerConfig {
                min_relevance: 0.5,
                ..Default::default()
            };
            ProactiveInjector::new(store.clone(), store, tuning)
        }

        #[tokio::test]
        async fn test_empty_message_rejected() {
            let store = Arc::new(FakeStore::default());
            let err = injector(store).inject(Uuid::nil(), Uuid::nil(), None, "  ", Utc::now()).await.unwrap_err();
            assert!(matches!(err, EllieError::Validation(_)));
        }

        #[tokio::test]
        async fn test_injects_then_cools_down() {
            let org = Uuid::new_v4();
            let room = Uuid::new_v4();
            let store = Arc::new(FakeStore {
                org: vec![memory(org, "Retries", "Use exponential backoff for webhooks")],
                ..Default::default()
            });
            let inj = injector(store.clone());
            let now = Utc::now();

            let first = inj.inject(org, room, None, "webhook retries?", now).await.unwrap();
            assert_eq!(first.items.len(), 1);
            assert!(first.text.contains("exponential backoff"));
            assert_eq!(store.injections.lock().len(), 1);

            let second = inj.inject(org, room, None, "webhook retries?", now + Duration::minutes(5)).await.unwrap();
            assert!(second.is_empty());
            assert_eq!(store.injections.lock().len(), 1);

            let later = inj.inject(org, room, None, "webhook retries?", now + Duration::hours(7)).await.unwrap();
            assert_eq!(later.items.len(), 1);
        }

        #[tokio::test]
        async fn test_embedding_similarity_overrides_lexical_score() {
            let org = Uuid::new_v4();
            let mut m = memory(org, "Unrelated", "gardening tips");
            m.embedding = Some(vec![0.0, 1.0]);
            let store = Arc::new(FakeStore {
                org: vec![m],
                ..Default::default()
            });
            let embedder = ellie_llm::MockEmbedding::new(2).pin("deploy", vec![1.0, 0.0]);
            let inj = ProactiveInjector::new(
                store.clone(),
                store.clone(),
                TunerConfig {
                    min_relevance: 0.7,
                    ..Default::default()
                },
            )
            .with_embedder(Arc::new(embedder));
            let bundle = inj.inject(org, Uuid::new_v4(), None, "deploy", Utc::now()).await.unwrap();
            assert!(bundle.is_empty());
            assert!(store.injections.lock().is_empty());
        }

        #[tokio::test]
        async fn test_strict_sensitivity_raises_threshold() {
            let org = Uuid::new_v4();
            // Scores about 0.87 with a fresh memory and an empty room.
            let store = Arc::new(FakeStore {
                org: vec![memory(org, "Retries", "Use exponential backoff for webhooks")],
                ..Default::default()
            });
            let tuning = TunerConfig {
                min_relevance: 0.80,
                ..Default::default()
            };
            let standard = ProactiveInjector::new(store.clone(), store.clone(), tuning.clone());
            let bundle = standard.inject(org, Uuid::new_v4(), None, "webhook retries?", Utc::now()).await.unwrap();
            assert_eq!(bundle.items.len(), 1);

            let strict = ProactiveInjector::new(
                store.clone(),
                store.clone(),
                TunerConfig {
                    sensitivity: Sensitivity::Strict,
                    ..tuning
                },
            );
            let bundle = strict.inject(org, Uuid::new_v4(), None, "webhook retries?", Utc::now()).await.unwrap();
            assert!(bundle.is_empty());
        }

        #[tokio::test]
        async fn test_rendered_text_respects_max_chars() {
            let org = Uuid::new_v4();
            let store = Arc::new(FakeStore {
                org: vec![memory(org, "Long", &"x".repeat(2000))],
                ..Default::default()
            });
            let inj = ProactiveInjector::new(
                store.clone(),
                store,
                TunerConfig {
                    min_relevance: 0.5,
                    max_chars: 400,
                    ..Default::default()
                },
            );
            let bundle = inj.inject(org, Uuid::new_v4(), None, "long", Utc::now()).await.unwrap();
            assert!(bundle.text.chars().count() <= 400);
        }
    }
}
