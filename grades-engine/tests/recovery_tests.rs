//! Task persistence across restarts
//!
//! Tasks are written to `recompute_tasks` before workers see them; a new
//! engine on the same database file picks them up in `start`.

mod helpers;

use grades_common::db::init_database;
use grades_common::UserId;
use grades_engine::coordinator::{EnqueueOutcome, TaskKind};
use grades_engine::db::tasks::load_unfinished_tasks;
use grades_engine::services::ReadPolicy;
use helpers::*;
use tempfile::TempDir;

#[tokio::test]
async fn test_unfinished_tasks_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("grades.db");
    let db = init_database(&db_path).await.unwrap();

    // First run: work is queued but never processed
    let first = engine_on(db.clone(), fast_settings());
    first
        .provider
        .publish(
            outline("v1", 1, homework_policy(1, 0))
                .subsection("ch1", "hw1", Some("HW"), true)
                .problem("hw1", "p1", None, 2.0)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    // Each score write queues its problem before returning
    record(&first, 1, "p1", 2.0, 2.0).await;
    record(&first, 2, "p1", 1.0, 2.0).await;

    let queue = first.engine.coordinator().queue();
    let course_task = |user| TaskKind::RecomputeCourse {
        user_id: UserId(user),
        course_id: course(),
        rederive: true,
    };
    assert_eq!(queue.enqueue(course_task(1), None).await.unwrap(), EnqueueOutcome::Inserted);
    assert_eq!(queue.enqueue(course_task(2), None).await.unwrap(), EnqueueOutcome::Inserted);
    let taken = queue.next_ready().await.unwrap().unwrap();
    assert_eq!(
        taken.kind,
        TaskKind::ResolveProblem {
            user_id: UserId(1),
            course_id: course(),
            problem_key: key("p1"),
        }
    );

    let rows = load_unfinished_tasks(&db).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.iter().filter(|r| r.state == "in_flight").count(), 1);
    assert_eq!(rows.iter().filter(|r| r.kind.contains("resolve_problem")).count(), 2);
    drop(first);

    // Second run over the same file, sharing the published content
    let second = engine_on(db.clone(), fast_settings());
    second
        .provider
        .publish(
            outline("v1", 1, homework_policy(1, 0))
                .subsection("ch1", "hw1", Some("HW"), true)
                .problem("hw1", "p1", None, 2.0)
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    second.engine.start().await.unwrap();
    settle(&second).await;

    for (user, expected) in [(1, 1.0), (2, 0.5)] {
        let grade = second
            .engine
            .read_course_grade(UserId(user), &course(), ReadPolicy::Eager)
            .await
            .unwrap()
            .into_grade()
            .unwrap();
        assert_eq!(grade.percent_grade, expected);
    }
    assert!(load_unfinished_tasks(&db).await.unwrap().is_empty());

    second.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_queued_work_for_next_start() {
    let db = grades_common::db::init_memory_database().await.unwrap();
    let t = engine_on(db.clone(), fast_settings());
    t.engine.start().await.unwrap();
    t.engine.shutdown().await;

    t.engine
        .coordinator()
        .queue()
        .enqueue(
            TaskKind::RecomputeSubsection {
                user_id: UserId(9),
                course_id: course(),
                subsection_key: key("hw1"),
            },
            None,
        )
        .await
        .unwrap();

    let rows = load_unfinished_tasks(&db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, "queued");
    assert!(rows[0].kind.contains("recompute_subsection"));
}
