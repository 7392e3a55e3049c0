// BDD-style tests for file reservations: glob conflict detection, partial
// grants, renewal, release, and expiry.

use super::*;
use crate::db::{setup_schema, test_db, unique_project};
use crate::types::{AgentName, ReleaseFilter, ReserveOptions};

async fn register(db: &SwarmDb, project: &ProjectKey, name: &str) {
    db.register_agent(project, &AgentName::new(name), None, None, None)
        .await
        .unwrap_or_else(|e| panic!("register {} failed: {}", name, e));
}

fn exclusive() -> ReserveOptions {
    ReserveOptions {
        exclusive: true,
        ..Default::default()
    }
}

mod file_reservations {
    use super::*;

    mod when_paths_overlap_an_exclusive_hold {
        use super::*;

        mod given_a_glob_held_by_another_agent {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_overlapping_paths_conflict_and_the_rest_are_granted() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-partial");
                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;

                let first = db
                    .reserve_files(
                        &project,
                        &AgentName::new("alpha"),
                        &["src/db/**".to_string()],
                        &exclusive(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                assert!(first.fully_granted());

                let second = db
                    .reserve_files(
                        &project,
                        &AgentName::new("beta"),
                        &["src/db/messages.rs".to_string(), "docs/plan.md".to_string()],
                        &exclusive(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("reserve failed: {}", e));

                assert_eq!(second.granted.len(), 1);
                assert_eq!(second.granted[0].path_pattern, "docs/plan.md");
                assert_eq!(second.conflicts.len(), 1);
                assert_eq!(second.conflicts[0].path, "src/db/messages.rs");
                assert_eq!(second.conflicts[0].held_by, AgentName::new("alpha"));
                assert_eq!(second.conflicts[0].path_pattern, "src/db/**");
            }
        }

        mod given_the_same_agent_re_reserving {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_renewal_is_granted_without_conflict() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-renew");
                register(&db, &project, "alpha").await;

                let mut last_granted_id = None;
                for _ in 0..2 {
                    let outcome = db
                        .reserve_files(
                            &project,
                            &AgentName::new("alpha"),
                            &["src/**".to_string()],
                            &exclusive(),
                        )
                        .await
                        .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                    assert!(outcome.fully_granted());
                    last_granted_id = Some(outcome.granted[0].id);
                }

                let active = db
                    .get_active_reservations(&project, None)
                    .await
                    .unwrap_or_else(|e| panic!("list failed: {}", e));
                assert_eq!(active.len(), 1, "Renewal replaces the superseded hold");
                assert_eq!(Some(active[0].id), last_granted_id);
            }
        }

        mod given_a_shared_hold {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_shared_requests_pass_and_exclusive_requests_conflict() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-shared");
                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;

                db.reserve_files(
                    &project,
                    &AgentName::new("alpha"),
                    &["docs/**".to_string()],
                    &ReserveOptions::default(),
                )
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {}", e));

                let shared = db
                    .reserve_files(
                        &project,
                        &AgentName::new("beta"),
                        &["docs/readme.md".to_string()],
                        &ReserveOptions::default(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                assert!(shared.fully_granted(), "Shared-on-shared overlap is fine");

                let exclusive_over_shared = db
                    .reserve_files(
                        &project,
                        &AgentName::new("beta"),
                        &["docs/guide.md".to_string()],
                        &exclusive(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                assert_eq!(
                    exclusive_over_shared.conflicts.len(),
                    1,
                    "An exclusive request conflicts with another agent's shared hold"
                );
            }
        }
    }

    mod when_reservations_are_released {
        use super::*;

        mod given_a_release_by_path {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_the_path_frees_up_for_other_agents() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-release");
                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;

                db.reserve_files(
                    &project,
                    &AgentName::new("alpha"),
                    &["src/lib.rs".to_string()],
                    &exclusive(),
                )
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {}", e));

                let released = db
                    .release_files(
                        &project,
                        &AgentName::new("alpha"),
                        &ReleaseFilter {
                            paths: vec!["./src/lib.rs".to_string()],
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap_or_else(|e| panic!("release failed: {}", e));
                assert_eq!(released.len(), 1);
                assert!(released[0].released_at.is_some());

                let outcome = db
                    .reserve_files(
                        &project,
                        &AgentName::new("beta"),
                        &["src/lib.rs".to_string()],
                        &exclusive(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                assert!(outcome.fully_granted());
            }
        }

        mod given_an_empty_release_filter {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_everything_the_agent_holds_is_released() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-release-all");
                register(&db, &project, "alpha").await;

                db.reserve_files(
                    &project,
                    &AgentName::new("alpha"),
                    &["src/a.rs".to_string(), "src/b.rs".to_string()],
                    &exclusive(),
                )
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {}", e));

                let released = db
                    .release_files(&project, &AgentName::new("alpha"), &ReleaseFilter::default())
                    .await
                    .unwrap_or_else(|e| panic!("release failed: {}", e));
                assert_eq!(released.len(), 2);

                let active = db
                    .get_active_reservations(&project, Some(&AgentName::new("alpha")))
                    .await
                    .unwrap_or_else(|e| panic!("list failed: {}", e));
                assert!(active.is_empty());
            }
        }

        mod given_nothing_matches {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_the_release_succeeds_with_an_empty_result() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-release-none");
                register(&db, &project, "alpha").await;

                let released = db
                    .release_files(
                        &project,
                        &AgentName::new("alpha"),
                        &ReleaseFilter {
                            paths: vec!["src/missing.rs".to_string()],
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap_or_else(|e| panic!("release failed: {}", e));
                assert!(released.is_empty());
            }
        }
    }

    mod when_reservations_expire {
        use super::*;

        mod given_a_short_ttl {
            use super::*;
            use std::time::Duration;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_expired_holds_stop_blocking_without_a_reaper() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-expiry");
                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;

                db.reserve_files(
                    &project,
                    &AgentName::new("alpha"),
                    &["src/hot.rs".to_string()],
                    &ReserveOptions {
                        exclusive: true,
                        ttl_seconds: Some(1),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {}", e));

                tokio::time::sleep(Duration::from_millis(1200)).await;

                let active = db
                    .get_active_reservations(&project, None)
                    .await
                    .unwrap_or_else(|e| panic!("list failed: {}", e));
                assert!(active.is_empty(), "Expired holds are invisible to queries");

                let outcome = db
                    .reserve_files(
                        &project,
                        &AgentName::new("beta"),
                        &["src/hot.rs".to_string()],
                        &exclusive(),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                assert!(outcome.fully_granted());

                let reaped = db
                    .reap_expired_reservations(&project)
                    .await
                    .unwrap_or_else(|e| panic!("reap failed: {}", e));
                assert_eq!(reaped, 1);
            }
        }
    }

    mod when_conflicts_are_checked_without_reserving {
        use super::*;

        mod given_an_active_exclusive_hold {
            use super::*;

            #[tokio::test]
            #[ignore = "requires DATABASE_URL or SWARM_TEST_DATABASE_URL"]
            async fn then_the_dry_run_reports_conflicts_and_grants_nothing() {
                let db = test_db().await;
                setup_schema(&db).await;
                let project = unique_project("resv-dryrun");
                register(&db, &project, "alpha").await;
                register(&db, &project, "beta").await;

                db.reserve_files(
                    &project,
                    &AgentName::new("alpha"),
                    &["src/**/*.rs".to_string()],
                    &exclusive(),
                )
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {}", e));
                let before = db
                    .get_latest_sequence(&project)
                    .await
                    .unwrap_or_else(|e| panic!("latest failed: {}", e));

                let conflicts = db
                    .check_reservation_conflicts(
                        &project,
                        &["src/db/mod.rs".to_string(), "README.md".to_string()],
                        Some(&AgentName::new("beta")),
                    )
                    .await
                    .unwrap_or_else(|e| panic!("check failed: {}", e));

                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].path, "src/db/mod.rs");

                let after = db
                    .get_latest_sequence(&project)
                    .await
                    .unwrap_or_else(|e| panic!("latest failed: {}", e));
                assert_eq!(before, after, "Dry runs append nothing to the log");
            }
        }
    }
}
