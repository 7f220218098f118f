mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use ticket_dispatch::config::OrchestratorConfig;
use ticket_dispatch::error::DispatchError;
use ticket_dispatch::launcher::{MockSessionLauncher, SessionHandle, SessionLauncher};
use ticket_dispatch::monitor::{EligibleReason, MonitorEvent};
use ticket_dispatch::orchestrator::{spawn_orchestrator, DispatchEvent, DrainState, OrchestratorHandle};
use ticket_dispatch::store::MemoryTicketSource;
use ticket_dispatch::types::{Role, SessionKey, Ticket, TicketStatus};

use common::{make_ticket, make_ticket_with_deps, settle, test_orchestrator_config};

// --- Test helpers ---

struct Harness {
    handle: OrchestratorHandle,
    task: tokio::task::JoinHandle<()>,
    source: Arc<MemoryTicketSource>,
    launcher: Arc<MockSessionLauncher>,
    events: broadcast::Receiver<DispatchEvent>,
}

fn start(config: OrchestratorConfig, tickets: Vec<Ticket>) -> Harness {
    start_with_launcher(config, tickets, MockSessionLauncher::new())
}

fn start_with_launcher(
    config: OrchestratorConfig,
    tickets: Vec<Ticket>,
    launcher: MockSessionLauncher,
) -> Harness {
    let source = Arc::new(MemoryTicketSource::new(tickets));
    let launcher = Arc::new(launcher);
    let (events_tx, events) = broadcast::channel(64);
    let (handle, task) = spawn_orchestrator(
        config,
        Arc::clone(&source),
        Arc::clone(&launcher),
        events_tx,
    );
    Harness {
        handle,
        task,
        source,
        launcher,
        events,
    }
}

fn key(role: Role, id: &str) -> SessionKey {
    SessionKey::new(role, id)
}

fn swe(id: &str) -> SessionKey {
    key(Role::Swe, id)
}

fn drain_events(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn active_keys(handle: &OrchestratorHandle) -> Vec<SessionKey> {
    handle
        .active_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|s| key(s.role, &s.ticket_id))
        .collect()
}

fn eligible(ticket: Ticket, role: Role) -> MonitorEvent {
    MonitorEvent::Eligible {
        ticket,
        role,
        reason: EligibleReason::New,
    }
}

// =============================================================================
// Concurrency cap
// =============================================================================

#[tokio::test(start_paused = true)]
async fn max_one_launches_first_and_queues_second_until_completion() {
    let t3 = make_ticket("T-3", TicketStatus::Todo);
    let t4 = make_ticket("T-4", TicketStatus::Todo);
    let h = start(test_orchestrator_config(1), vec![t3.clone(), t4.clone()]);

    h.handle
        .submit_events(vec![eligible(t3.clone(), Role::Swe), eligible(t4, Role::Swe)])
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.launcher.launches(), vec![swe("T-3")]);
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.queued, vec![swe("T-4")]);
    assert_eq!(active_keys(&h.handle).await, vec![swe("T-3")]);
    assert_eq!(status.drain, DrainState::Idle);

    h.source.set_status("T-3", TicketStatus::Completed);
    h.handle
        .on_completion(t3, Role::Swe, TicketStatus::Todo, TicketStatus::Completed)
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.launcher.launches(), vec![swe("T-3"), swe("T-4")]);
    assert_eq!(active_keys(&h.handle).await, vec![swe("T-4")]);
    assert!(h.handle.status().await.unwrap().queued.is_empty());
}

#[tokio::test(start_paused = true)]
async fn many_eligible_tickets_never_exceed_cap() {
    let tickets: Vec<Ticket> = (1..=10)
        .map(|n| make_ticket(&format!("T-{}", n), TicketStatus::Todo))
        .collect();
    let h = start(test_orchestrator_config(3), tickets.clone());

    let batch = tickets
        .into_iter()
        .map(|t| eligible(t, Role::Swe))
        .collect();
    h.handle.submit_events(batch).await.unwrap();
    settle().await;

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.active.len(), 3);
    assert_eq!(status.queued.len(), 7);
    assert_eq!(h.launcher.launch_count(), 3);
    assert_eq!(status.queued[0], swe("T-4"));
}

// =============================================================================
// Drain coalescing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn enqueue_during_slow_launch_marks_restart_pending_then_drains_both() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let t2 = make_ticket("T-2", TicketStatus::Todo);
    let h = start_with_launcher(
        test_orchestrator_config(2),
        vec![t1.clone(), t2.clone()],
        MockSessionLauncher::with_delay(Duration::from_secs(5)),
    );

    assert!(h.handle.enqueue(t1, Role::Swe).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle.status().await.unwrap().drain, DrainState::Draining);
    assert_eq!(h.launcher.launch_count(), 0);

    assert!(h.handle.enqueue(t2, Role::Swe).await.unwrap());
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.drain, DrainState::DrainingRestartPending);
    assert_eq!(status.queued, vec![swe("T-1"), swe("T-2")]);

    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(h.launcher.launches(), vec![swe("T-1"), swe("T-2")]);
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.drain, DrainState::Idle);
    assert!(status.queued.is_empty());
    assert_eq!(active_keys(&h.handle).await, vec![swe("T-1"), swe("T-2")]);
}

#[tokio::test(start_paused = true)]
async fn repeated_enqueues_during_one_launch_coalesce_into_one_restart() {
    let tickets: Vec<Ticket> = (1..=4)
        .map(|i| make_ticket(&format!("T-{}", i), TicketStatus::Todo))
        .collect();
    let h = start_with_launcher(
        test_orchestrator_config(4),
        tickets.clone(),
        MockSessionLauncher::with_delay(Duration::from_secs(5)),
    );

    for ticket in &tickets {
        h.handle.enqueue(ticket.clone(), Role::Swe).await.unwrap();
    }
    assert_eq!(
        h.handle.status().await.unwrap().drain,
        DrainState::DrainingRestartPending
    );

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        h.launcher.launches(),
        vec![swe("T-1"), swe("T-2"), swe("T-3"), swe("T-4")]
    );
    assert_eq!(h.handle.status().await.unwrap().drain, DrainState::Idle);
}

// =============================================================================
// Queue admission
// =============================================================================

#[tokio::test(start_paused = true)]
async fn duplicate_enqueue_keeps_one_entry() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let t2 = make_ticket("T-2", TicketStatus::Todo);
    let h = start(test_orchestrator_config(1), vec![t1.clone(), t2.clone()]);

    assert!(h.handle.enqueue(t1, Role::Swe).await.unwrap());
    settle().await;

    assert!(h.handle.enqueue(t2.clone(), Role::Swe).await.unwrap());
    assert!(!h.handle.enqueue(t2.clone(), Role::Swe).await.unwrap());
    settle().await;

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.queued, vec![swe("T-2")]);
}

#[tokio::test(start_paused = true)]
async fn same_ticket_different_roles_are_distinct_entries() {
    let t1 = make_ticket("T-1", TicketStatus::InReview);
    let h = start(test_orchestrator_config(2), vec![t1.clone()]);

    assert!(h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap());
    assert!(h.handle.enqueue(t1, Role::Qa).await.unwrap());
    settle().await;

    let mut active = active_keys(&h.handle).await;
    active.sort();
    assert_eq!(active, vec![swe("T-1"), key(Role::Qa, "T-1")]);
}

// =============================================================================
// Dependency re-validation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn queued_entry_with_unmet_dependency_is_dropped() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let t2 = make_ticket_with_deps("T-2", TicketStatus::Todo, &["T-1"]);
    let h = start(test_orchestrator_config(2), vec![t1, t2.clone()]);

    h.handle.enqueue(t2, Role::Swe).await.unwrap();
    settle().await;

    assert_eq!(h.launcher.launch_count(), 0);
    assert!(h.handle.status().await.unwrap().queued.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dependency_reopened_after_enqueue_is_caught_at_dispatch() {
    let t1 = make_ticket("T-1", TicketStatus::Completed);
    let t2 = make_ticket_with_deps("T-2", TicketStatus::Todo, &["T-1"]);
    let h = start(test_orchestrator_config(1), vec![t1, t2.clone()]);

    // The monitor saw T-1 completed, but the store moved on before dispatch
    h.source.set_status("T-1", TicketStatus::InProgress);
    h.handle.enqueue(t2, Role::Swe).await.unwrap();
    settle().await;

    assert_eq!(h.launcher.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_dependency_is_dropped() {
    let t1 = make_ticket_with_deps("T-1", TicketStatus::Todo, &["T-404"]);
    let h = start(test_orchestrator_config(1), vec![t1.clone()]);

    h.handle.enqueue(t1, Role::Swe).await.unwrap();
    settle().await;

    assert_eq!(h.launcher.launch_count(), 0);
}

// =============================================================================
// Cooldown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn re_enqueue_during_active_session_is_skipped() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let h = start(test_orchestrator_config(2), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;
    h.source.set_status("T-1", TicketStatus::InProgress);

    h.handle.enqueue(t1, Role::Swe).await.unwrap();
    settle().await;

    assert_eq!(h.launcher.launch_count(), 1);
    assert_eq!(active_keys(&h.handle).await, vec![swe("T-1")]);
}

#[tokio::test(start_paused = true)]
async fn completed_session_is_suppressed_by_cooldown() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let h = start(test_orchestrator_config(2), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;

    h.source.set_status("T-1", TicketStatus::Blocked);
    h.handle
        .on_completion(t1.clone(), Role::Swe, TicketStatus::Todo, TicketStatus::Blocked)
        .await
        .unwrap();
    settle().await;

    let status = h.handle.status().await.unwrap();
    assert!(status.active.is_empty());
    assert_eq!(status.cooling_down, vec![swe("T-1")]);

    h.handle.enqueue(t1, Role::Swe).await.unwrap();
    settle().await;

    assert_eq!(h.launcher.launch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn todo_status_overrides_cooldown() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let h = start(test_orchestrator_config(2), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;
    h.handle
        .on_completion(t1.clone(), Role::Swe, TicketStatus::InProgress, TicketStatus::Blocked)
        .await
        .unwrap();
    settle().await;

    // Store still says todo: treated as rework
    h.handle.enqueue(t1, Role::Swe).await.unwrap();
    settle().await;

    assert_eq!(h.launcher.launches(), vec![swe("T-1"), swe("T-1")]);
}

#[tokio::test(start_paused = true)]
async fn cooldown_expires_after_window() {
    let t1 = make_ticket("T-1", TicketStatus::InReview);
    let h = start(test_orchestrator_config(2), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Qa).await.unwrap();
    settle().await;
    h.handle
        .on_completion(t1.clone(), Role::Qa, TicketStatus::InReview, TicketStatus::Blocked)
        .await
        .unwrap();
    settle().await;
    assert_eq!(h.handle.status().await.unwrap().cooling_down.len(), 1);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    settle().await;

    assert!(h.handle.status().await.unwrap().cooling_down.is_empty());

    h.handle.enqueue(t1, Role::Qa).await.unwrap();
    settle().await;
    assert_eq!(h.launcher.launch_count(), 2);
}

// =============================================================================
// Completion handling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn swe_to_review_guarantees_qa_entry() {
    let t5 = make_ticket("T-5", TicketStatus::Todo);
    let h = start(test_orchestrator_config(2), vec![t5.clone()]);

    h.handle.enqueue(t5.clone(), Role::Swe).await.unwrap();
    settle().await;

    h.source.set_status("T-5", TicketStatus::InReview);
    let mut in_review = t5;
    in_review.status = TicketStatus::InReview;
    h.handle
        .on_completion(in_review, Role::Swe, TicketStatus::Todo, TicketStatus::InReview)
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        h.launcher.launches(),
        vec![swe("T-5"), key(Role::Qa, "T-5")]
    );
}

#[tokio::test(start_paused = true)]
async fn qa_entry_is_ensured_even_without_active_session() {
    let t5 = make_ticket("T-5", TicketStatus::InReview);
    let h = start(test_orchestrator_config(2), vec![t5.clone()]);

    h.handle
        .on_completion(t5, Role::Swe, TicketStatus::InProgress, TicketStatus::InReview)
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.launcher.launches(), vec![key(Role::Qa, "T-5")]);
}

#[tokio::test(start_paused = true)]
async fn qa_entry_not_duplicated_when_monitor_already_queued_it() {
    let t5 = make_ticket("T-5", TicketStatus::InReview);
    let t6 = make_ticket("T-6", TicketStatus::Todo);
    let h = start(test_orchestrator_config(1), vec![t5.clone(), t6.clone()]);

    // Hold the only slot so the QA entry stays queued
    h.handle.enqueue(t6, Role::Swe).await.unwrap();
    settle().await;

    h.handle
        .submit_events(vec![
            eligible(t5.clone(), Role::Qa),
            MonitorEvent::RoleCompleted {
                ticket: t5,
                role: Role::Swe,
                from: TicketStatus::Todo,
                to: TicketStatus::InReview,
            },
        ])
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        h.handle.status().await.unwrap().queued,
        vec![key(Role::Qa, "T-5")]
    );
}

#[tokio::test(start_paused = true)]
async fn completion_without_active_session_is_ignored() {
    let t1 = make_ticket("T-1", TicketStatus::Completed);
    let mut h = start(test_orchestrator_config(1), vec![t1.clone()]);

    h.handle
        .on_completion(t1, Role::Qa, TicketStatus::InReview, TicketStatus::Completed)
        .await
        .unwrap();
    settle().await;

    let status = h.handle.status().await.unwrap();
    assert!(status.active.is_empty());
    assert!(status.cooling_down.is_empty());
    assert!(drain_events(&mut h.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn completion_closes_session_when_configured() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let config = OrchestratorConfig {
        close_sessions: true,
        ..test_orchestrator_config(1)
    };
    let h = start(config, vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;
    h.handle
        .on_completion(t1, Role::Swe, TicketStatus::Todo, TicketStatus::Completed)
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.launcher.closed(), vec!["mock-1".to_string()]);
}

// =============================================================================
// Rework
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sent_back_clears_cooldowns_and_stray_sessions() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let h = start(test_orchestrator_config(2), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;

    let mut in_review = t1.clone();
    in_review.status = TicketStatus::InReview;
    h.source.set_status("T-1", TicketStatus::InReview);
    h.handle
        .on_completion(in_review, Role::Swe, TicketStatus::Todo, TicketStatus::InReview)
        .await
        .unwrap();
    settle().await;
    assert_eq!(active_keys(&h.handle).await, vec![key(Role::Qa, "T-1")]);

    // QA sends it back
    h.source.set_status("T-1", TicketStatus::Todo);
    h.handle.on_sent_back(t1.clone()).await.unwrap();
    settle().await;

    let status = h.handle.status().await.unwrap();
    assert!(status.active.is_empty());
    assert!(status.cooling_down.is_empty());

    h.handle.enqueue(t1, Role::Swe).await.unwrap();
    settle().await;
    assert_eq!(
        h.launcher.launches(),
        vec![swe("T-1"), key(Role::Qa, "T-1"), swe("T-1")]
    );
}

// =============================================================================
// Fallback timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn missing_completion_frees_slot_after_cooldown() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let t2 = make_ticket("T-2", TicketStatus::Todo);
    let h = start(test_orchestrator_config(1), vec![t1.clone(), t2.clone()]);

    h.handle
        .submit_events(vec![eligible(t1, Role::Swe), eligible(t2, Role::Swe)])
        .await
        .unwrap();
    settle().await;
    h.source.set_status("T-1", TicketStatus::InProgress);
    assert_eq!(h.launcher.launches(), vec![swe("T-1")]);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    settle().await;

    assert_eq!(h.launcher.launches(), vec![swe("T-1"), swe("T-2")]);
    assert_eq!(active_keys(&h.handle).await, vec![swe("T-2")]);
}

// =============================================================================
// Launch failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn failed_launch_is_dropped_not_retried() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let t2 = make_ticket("T-2", TicketStatus::Todo);
    let mut h = start(test_orchestrator_config(2), vec![t1.clone(), t2.clone()]);
    h.launcher.fail_ticket("T-1");

    h.handle
        .submit_events(vec![eligible(t1, Role::Swe), eligible(t2, Role::Swe)])
        .await
        .unwrap();
    settle().await;
    settle().await;

    assert_eq!(h.launcher.launches(), vec![swe("T-1"), swe("T-2")]);
    let status = h.handle.status().await.unwrap();
    assert!(status.queued.is_empty());
    assert_eq!(active_keys(&h.handle).await, vec![swe("T-2")]);

    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DispatchEvent::Error(msg) if msg.contains("T-1"))));
}

struct PanickingLauncher;

impl SessionLauncher for PanickingLauncher {
    async fn launch(&self, ticket: &Ticket, _role: Role) -> Result<SessionHandle, String> {
        if ticket.id == "T-1" {
            panic!("launcher exploded");
        }
        Ok(SessionHandle {
            id: format!("ok-{}", ticket.id),
            method: "test".to_string(),
            pgid: None,
        })
    }

    async fn close(&self, _handle: &SessionHandle) {}
}

#[tokio::test(start_paused = true)]
async fn panicking_launcher_does_not_crash_orchestrator() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let t2 = make_ticket("T-2", TicketStatus::Todo);
    let source = Arc::new(MemoryTicketSource::new(vec![t1.clone(), t2.clone()]));
    let (events_tx, _events) = broadcast::channel(16);
    let (handle, _task) = spawn_orchestrator(
        test_orchestrator_config(2),
        source,
        Arc::new(PanickingLauncher),
        events_tx,
    );

    handle
        .submit_events(vec![eligible(t1, Role::Swe), eligible(t2, Role::Swe)])
        .await
        .unwrap();
    settle().await;

    let active = handle.active_sessions().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].ticket_id, "T-2");
    assert_eq!(active[0].session_id, "ok-T-2");
}

// =============================================================================
// Events and lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn launch_and_completion_publish_events() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let mut h = start(test_orchestrator_config(1), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;
    h.handle
        .on_completion(t1, Role::Swe, TicketStatus::Todo, TicketStatus::Completed)
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        drain_events(&mut h.events),
        vec![
            DispatchEvent::SessionLaunched {
                ticket_id: "T-1".to_string(),
                role: Role::Swe,
            },
            DispatchEvent::SessionCompleted {
                ticket_id: "T-1".to_string(),
                role: Role::Swe,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn active_session_reports_elapsed_time() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let h = start(test_orchestrator_config(1), vec![t1.clone()]);

    h.handle.enqueue(t1, Role::Swe).await.unwrap();
    settle().await;
    tokio::time::sleep(Duration::from_secs(90)).await;

    let active = h.handle.active_sessions().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, "mock-1");
    assert!(active[0].elapsed >= Duration::from_secs(90));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_actor_and_rejects_commands() {
    let t1 = make_ticket("T-1", TicketStatus::Todo);
    let h = start(test_orchestrator_config(1), vec![t1.clone()]);

    h.handle.enqueue(t1.clone(), Role::Swe).await.unwrap();
    settle().await;

    h.handle.shutdown().await.unwrap();
    h.task.await.unwrap();

    assert!(matches!(
        h.handle.status().await,
        Err(DispatchError::OrchestratorClosed)
    ));
    assert!(h.handle.enqueue(t1, Role::Swe).await.is_err());
}

#[tokio::test]
async fn dropping_handle_stops_actor() {
    let h = start(test_orchestrator_config(1), vec![]);
    let task = h.task;
    drop(h.handle);

    let result = task.await;
    assert!(result.is_ok(), "actor should exit cleanly, got: {:?}", result);
}
