// BDD-style tests for the event log: sequence assignment, filtered reads,
// cursors, and projection rebuild determinism.

use super::*;
use crate::db::{setup_schema, test_db, unique_project, EventFilter};
use crate::events::{EventPayload, EventType};
use crate::types::AgentName;

async fn register(db: &SwarmDb, project: &ProjectKey, name: &str) {
    db.register_agent(project, &AgentName::new(name), None, None, None)
        .await
        .unwrap_or_else(|e| panic!("register {} failed: {}", name, e));
}

mod event_log {
    use super::*;

    mod when_events_are_appended {
        use super::*;

        mod given_a_fresh_project {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_sequences_start_at_one_and_stay_contiguous() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("event-log");

                for name in ["alpha", "beta", "gamma"] {
                    register(&db, &project, name).await;
                }

                let events = db
                    .read_events(&EventFilter::for_project(&project))
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));

                let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
                assert_eq!(sequences, vec![1, 2, 3], "Sequences should be 1..=3 with no gaps");

                let latest = db
                    .get_latest_sequence(&project)
                    .await
                    .unwrap_or_else(|e| panic!("latest failed: {}", e));
                assert_eq!(latest, 3);
            }
        }

        mod given_two_projects_sharing_one_store {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_each_project_numbers_its_own_events() {
                let db = test_db().await;
                setup_schema(&db).await;
                let first = unique_project("event-log-a");
                let second = unique_project("event-log-b");

                register(&db, &first, "alpha").await;
                register(&db, &first, "beta").await;
                register(&db, &second, "gamma").await;

                assert_eq!(db.get_latest_sequence(&first).await.unwrap_or_default(), 2);
                assert_eq!(db.get_latest_sequence(&second).await.unwrap_or_default(), 1);
            }
        }
    }

    mod when_events_are_read_back {
        use super::*;

        mod given_a_type_filter {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_only_matching_events_come_back_in_order() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("event-filter");

                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;
                db.send_message(
                    &project,
                    &AgentName::new("alpha"),
                    &[AgentName::new("beta")],
                    "subject",
                    "body",
                    crate::types::SendOptions::default(),
                )
                .await
                .unwrap_or_else(|e| panic!("send failed: {}", e));

                let filter = EventFilter::for_project(&project)
                    .with_types(vec![EventType::MessageSent]);
                let events = db
                    .read_events(&filter)
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));

                assert_eq!(events.len(), 1);
                assert!(matches!(
                    events[0].payload,
                    EventPayload::MessageSent { .. }
                ));
            }
        }

        mod given_an_after_sequence_offset {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_reads_resume_past_the_offset_and_respect_the_limit() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("event-resume");

                for n in 0..5 {
                    register(&db, &project, &format!("agent-{}", n)).await;
                }

                let filter = EventFilter::for_project(&project)
                    .after_sequence(2)
                    .with_limit(2);
                let events = db
                    .read_events(&filter)
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));

                let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
                assert_eq!(sequences, vec![3, 4]);
            }
        }
    }

    mod when_a_consumer_tracks_a_cursor {
        use super::*;

        mod given_new_events_since_its_last_read {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_read_new_events_delivers_each_event_once_and_advances() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("cursor");

                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;

                let first_batch = db
                    .read_new_events(&project, "monitor", None)
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));
                assert_eq!(first_batch.len(), 2);

                let empty = db
                    .read_new_events(&project, "monitor", None)
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));
                assert!(empty.is_empty(), "Second read should see nothing new");

                register(&db, &project, "gamma").await;
                let third = db
                    .read_new_events(&project, "monitor", None)
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));
                assert_eq!(third.len(), 1);
                assert_eq!(third[0].sequence, 3);
            }
        }

        mod given_a_stale_advance {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_the_cursor_never_moves_backwards() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("cursor-monotonic");

                db.advance_cursor(&project, "monitor", 7)
                    .await
                    .unwrap_or_else(|e| panic!("advance failed: {}", e));
                let cursor = db
                    .advance_cursor(&project, "monitor", 3)
                    .await
                    .unwrap_or_else(|e| panic!("advance failed: {}", e));

                assert_eq!(cursor.after_sequence, 7);
            }
        }
    }

    mod when_projections_are_rebuilt_from_the_log {
        use super::*;

        mod given_a_mixed_workload {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_the_rebuilt_state_fingerprints_identically() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("replay");

                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;
                let receipt = db
                    .send_message(
                        &project,
                        &AgentName::new("alpha"),
                        &[AgentName::new("beta")],
                        "handoff",
                        "take over src/db",
                        crate::types::SendOptions::default(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("send failed: {}", e));
                db.mark_message_read(&project, receipt.message_id, &AgentName::new("beta"))
                    .await
                    .unwrap_or_else(|e| panic!("read failed: {}", e));
                db.reserve_files(
                    &project,
                    &AgentName::new("alpha"),
                    &["src/db/**".to_string()],
                    &crate::types::ReserveOptions {
                        exclusive: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {}", e));

                let before = db
                    .projection_fingerprint(&project)
                    .await
                    .unwrap_or_else(|e| panic!("fingerprint failed: {}", e));

                let applied = db
                    .rebuild_projections(&project)
                    .await
                    .unwrap_or_else(|e| panic!("rebuild failed: {}", e));
                assert_eq!(applied, 5, "Every appended event should be re-applied");

                let after = db
                    .projection_fingerprint(&project)
                    .await
                    .unwrap_or_else(|e| panic!("fingerprint failed: {}", e));

                assert_eq!(before, after, "Replay must be deterministic");
            }
        }
    }
}
