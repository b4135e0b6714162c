// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! End-to-end lifecycle tests through the full in-memory stack: submit,
//! stage, hand off, synthesized backend events, terminal transition, and
//! exactly-once billing.

mod common;

use common::TestStack;
use nimbus_core::accounting::UsageLedger;
use nimbus_core::job::{JobCondition, JobState};
use nimbus_core::registry::JobRegistry;

#[tokio::test]
async fn test_end_to_end_success_bills_exactly_once() {
    let stack = TestStack::start();

    let job_id = stack
        .orchestrator
        .submit(TestStack::submission())
        .await
        .unwrap();
    let job = stack.registry.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::InQueue);

    stack.orchestrator.job_verified(&job_id).await.unwrap();

    let mut input: &[u8] = b">seq1\nACGTACGT\n";
    let written = stack
        .orchestrator
        .submit_file(&job_id, "query", input.len() as u64, &mut input)
        .await
        .unwrap();
    assert_eq!(written, 15);

    stack.orchestrator.job_prepared(&job_id).await.unwrap();
    let job = stack.registry.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.provider_job_id.is_some());
    assert!(job.started_at.is_some());

    // The backend reports progress and completion, duplicated the way an
    // at-least-once watcher would deliver it.
    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::running())
        .await;
    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::complete())
        .await;
    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::complete())
        .await;

    stack.await_state(&job_id, JobState::Success).await;
    let job = stack.registry.get_job(&job_id).await.unwrap().unwrap();
    let started_at = job.started_at.unwrap();
    let completed_at = job.completed_at.unwrap();

    let ledger = stack.ledger.clone();
    stack.shutdown().await;

    assert_eq!(ledger.len().await, 1);
    let record = ledger.get(&job_id).await.unwrap();
    assert_eq!(record.owner, "alice");
    assert_eq!(record.project.as_deref(), Some("genomics"));
    assert_eq!(record.node_count, 1);
    assert_eq!(
        record.duration,
        (completed_at - started_at).to_std().unwrap()
    );
    assert_eq!(record.completed_at, completed_at);
}

#[tokio::test]
async fn test_duplicate_terminal_events_do_not_double_bill() {
    let stack = TestStack::start();

    let job_id = stack
        .orchestrator
        .submit(TestStack::submission())
        .await
        .unwrap();
    stack.orchestrator.job_verified(&job_id).await.unwrap();
    stack.orchestrator.job_prepared(&job_id).await.unwrap();

    for _ in 0..5 {
        stack
            .sandbox
            .emit_condition(&job_id, JobCondition::complete())
            .await;
    }

    stack.await_state(&job_id, JobState::Success).await;

    let ledger = stack.ledger.clone();
    stack.shutdown().await;

    assert_eq!(ledger.len().await, 1);
    let record = ledger.get(&job_id).await.unwrap();
    // Aggregated project usage equals one event's duration, not five.
    assert_eq!(
        ledger.usage_for_project("genomics").await.unwrap(),
        record.duration
    );
}

#[tokio::test]
async fn test_stale_events_after_terminal_state_are_absorbed() {
    let stack = TestStack::start();

    let job_id = stack
        .orchestrator
        .submit(TestStack::submission())
        .await
        .unwrap();
    stack.orchestrator.job_verified(&job_id).await.unwrap();
    stack.orchestrator.job_prepared(&job_id).await.unwrap();

    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::failed("DeadlineExceeded"))
        .await;
    stack.await_state(&job_id, JobState::Failure).await;

    // A poller replaying an old window delivers stale progress.
    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::running())
        .await;
    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::complete())
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let job = stack.registry.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failure);

    let ledger = stack.ledger.clone();
    stack.shutdown().await;
    assert_eq!(ledger.len().await, 1);
}

#[tokio::test]
async fn test_cleanup_after_success_expires_job() {
    let stack = TestStack::start();

    let job_id = stack
        .orchestrator
        .submit(TestStack::submission())
        .await
        .unwrap();
    stack.orchestrator.job_verified(&job_id).await.unwrap();
    stack.orchestrator.job_prepared(&job_id).await.unwrap();
    stack
        .sandbox
        .emit_condition(&job_id, JobCondition::complete())
        .await;
    stack.await_state(&job_id, JobState::Success).await;

    stack.orchestrator.cleanup(&job_id).await.unwrap();
    assert!(stack.sandbox.is_deleted(&job_id).await);

    let job = stack.registry.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Expired);

    stack.shutdown().await;
}
