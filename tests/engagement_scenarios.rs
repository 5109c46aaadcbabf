//! End-to-end engagement scenarios: ingest, dispatch, receipts, replies,
//! timeouts and restart recovery against a real libSQL store and a stub
//! channel transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use common::{
    FailingGenerator, Harness, RecordingGenerator, StubTransport, budget, campaign, new_lead,
    policy, transient,
};
use lead_engage::channels::{AttemptReceipt, ReceiptStatus};
use lead_engage::lead::{ConversationState, MessageDirection, StaleReason};
use lead_engage::orchestrator::Outcome;
use lead_engage::store::{LeadStore, LibSqlBackend};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// Ingest, send and deliver step 0 for one lead.
async fn delivered_lead(h: &mut Harness, id: &str, phone: &str, campaign_id: &str) {
    assert!(h.orchestrator.ingest_lead(new_lead(id, phone, campaign_id)).await.unwrap());
    h.dispatch(Utc::now() + secs(1)).await;
    let sid = h.attempt_id(id).await;
    let outcome = h.router.receipt(&sid, "delivered", None).await.unwrap();
    assert!(matches!(outcome, Outcome::Applied { .. }));
    assert_eq!(h.lead(id).await.state, ConversationState::AwaitingReply);
}

#[tokio::test]
async fn silent_lead_walks_the_sequence_then_goes_stale() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    delivered_lead(&mut h, "l1", "+1 555 000 0001", "c1").await;

    let timers = h.store.timers_for_lead("l1").await.unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].step, 0);

    // Nothing is due yet.
    assert_eq!(h.timers.fire_due(Utc::now()).await.unwrap(), 0);

    assert_eq!(h.timers.fire_due(Utc::now() + secs(61)).await.unwrap(), 1);
    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::Sent(1));
    assert_eq!(lead.current_step, 1);
    assert!(h.store.timers_for_lead("l1").await.unwrap().is_empty());

    assert_eq!(h.dispatch(Utc::now() + secs(1)).await, 1);
    let sid = h.attempt_id("l1").await;
    h.router.receipt(&sid, "delivered", None).await.unwrap();
    assert_eq!(h.lead("l1").await.state, ConversationState::AwaitingReply);

    assert_eq!(h.timers.fire_due(Utc::now() + secs(61)).await.unwrap(), 1);
    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::Stale);
    assert_eq!(lead.stale_reason, Some(StaleReason::NoResponse));
    assert!(h.store.get_pending_action("l1").await.unwrap().is_none());

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].address, "15550000001");
    assert!(sent[0].text.contains("message 1 of 2"));
    assert!(sent[1].text.contains("message 2 of 2"));
}

#[tokio::test]
async fn positive_reply_converts_without_another_send() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 3_600, budget(10))])).await;
    let mut feed = h.orchestrator.subscribe();
    delivered_lead(&mut h, "l1", "5550000002", "c1").await;

    let outcome = h
        .router
        .inbound("IN1", "whatsapp:+15550000002", "Yes please, call me")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Applied {
            from: ConversationState::AwaitingReply,
            to: ConversationState::Converted,
        }
    );

    assert!(h.store.get_pending_action("l1").await.unwrap().is_none());
    assert!(h.store.timers_for_lead("l1").await.unwrap().is_empty());
    assert_eq!(h.dispatch(Utc::now() + secs(5)).await, 0);
    assert_eq!(h.transport.sent().len(), 1);

    while let Ok(record) = feed.try_recv() {
        h.scoring.observe(&record).await.unwrap();
    }
    let score = h.lead("l1").await.score;
    assert!(score > 11.0 && score <= 21.0, "score was {score}");

    let history = h.store.list_transitions("l1", 50).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.trigger, "replied");
    assert!(last.reply_latency_secs.is_some());
}

#[tokio::test]
async fn transient_failures_retry_with_backoff_until_the_cap() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    h.transport.fail_next(3, transient());
    h.orchestrator
        .ingest_lead(new_lead("l1", "5550000003", "c1"))
        .await
        .unwrap();

    let t = Utc::now() + secs(1);
    assert_eq!(h.dispatch(t).await, 0);
    let pending = h.store.get_pending_action("l1").await.unwrap().unwrap();
    assert_eq!(pending.attempts, 1);
    assert!((pending.scheduled_at - (t + secs(1))).num_milliseconds().abs() < 1);

    // Backoff not elapsed.
    assert_eq!(h.dispatch(t + chrono::Duration::milliseconds(500)).await, 0);
    assert_eq!(h.transport.calls(), 1);

    h.dispatch(t + secs(5)).await;
    assert_eq!(h.transport.calls(), 2);
    assert_eq!(h.lead("l1").await.state, ConversationState::AwaitingFirstSend);

    h.dispatch(t + secs(20)).await;
    assert_eq!(h.transport.calls(), 3);

    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::Stale);
    assert_eq!(lead.stale_reason, Some(StaleReason::RetriesExhausted));
    assert!(h.store.get_pending_action("l1").await.unwrap().is_none());

    assert_eq!(h.dispatch(t + secs(60)).await, 0);
    assert_eq!(h.transport.calls(), 3);

    let stats = h.orchestrator.stats().snapshot();
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.surfaced_failures, 1);
}

#[tokio::test]
async fn fatal_receipt_code_goes_stale_immediately() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    h.orchestrator
        .ingest_lead(new_lead("l1", "5550000004", "c1"))
        .await
        .unwrap();
    h.dispatch(Utc::now() + secs(1)).await;
    let sid = h.attempt_id("l1").await;

    h.router
        .receipt(&sid, "undelivered", Some("21211"))
        .await
        .unwrap();
    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::Stale);
    assert_eq!(lead.stale_reason, Some(StaleReason::DeliveryFailed));
}

#[tokio::test]
async fn redelivered_receipts_and_replies_apply_once() {
    let mut h = Harness::new(policy(vec![campaign("c1", 3, 60, budget(10))])).await;
    delivered_lead(&mut h, "l1", "5550000005", "c1").await;
    let before = h.store.list_transitions("l1", 50).await.unwrap().len();

    // Same receipt again, plus an intermediate status and an unknown sid.
    let sid = h.transport.sent()[0].attempt_id.clone();
    assert_eq!(h.router.receipt(&sid, "delivered", None).await.unwrap(), Outcome::Duplicate);
    assert_eq!(h.router.receipt(&sid, "sent", None).await.unwrap(), Outcome::Ignored);
    assert_eq!(h.router.receipt("SM9999", "delivered", None).await.unwrap(), Outcome::Ignored);

    let first = h.router.inbound("IN7", "5550000005", "maybe later").await.unwrap();
    assert!(matches!(first, Outcome::Applied { .. }));
    let again = h.router.inbound("IN7", "5550000005", "maybe later").await.unwrap();
    assert_eq!(again, Outcome::Duplicate);

    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::Replied);
    assert_eq!(lead.current_step, 1);
    assert_eq!(
        h.store.list_transitions("l1", 50).await.unwrap().len(),
        before + 1
    );
    assert_eq!(h.orchestrator.stats().snapshot().duplicates, 2);
}

#[tokio::test]
async fn terminal_states_absorb_later_events() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    delivered_lead(&mut h, "l1", "5550000006", "c1").await;
    let timer = h.store.timers_for_lead("l1").await.unwrap().remove(0);

    let stop = h.router.inbound("IN1", "5550000006", "stop").await.unwrap();
    assert_eq!(
        stop,
        Outcome::Applied {
            from: ConversationState::AwaitingReply,
            to: ConversationState::OptedOut,
        }
    );
    assert!(h.store.timers_for_lead("l1").await.unwrap().is_empty());

    assert_eq!(h.router.inbound("IN2", "5550000006", "yes!").await.unwrap(), Outcome::Discarded);
    assert_eq!(h.router.timed_out(&timer).await.unwrap(), Outcome::Discarded);
    assert_eq!(h.router.manual_opt_out("l1", None).await.unwrap(), Outcome::Discarded);

    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::OptedOut);
    assert!(lead.opted_out);
    assert_eq!(h.dispatch(Utc::now() + secs(120)).await, 0);
}

#[tokio::test]
async fn opt_out_cancels_a_queued_send() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    h.orchestrator
        .ingest_lead(new_lead("l1", "5550000007", "c1"))
        .await
        .unwrap();

    let outcome = h.router.manual_opt_out("l1", Some("req-1")).await.unwrap();
    assert!(matches!(outcome, Outcome::Applied { .. }));
    assert_eq!(h.router.manual_opt_out("l1", Some("req-1")).await.unwrap(), Outcome::Duplicate);

    assert_eq!(h.dispatch(Utc::now() + secs(1)).await, 0);
    assert_eq!(h.transport.calls(), 0);
    assert!(h.store.get_pending_action("l1").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_waits_for_an_in_flight_opt_out() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    h.orchestrator
        .ingest_lead(new_lead("l1", "5550000008", "c1"))
        .await
        .unwrap();

    // Hold the lead the way a transition in progress does.
    let held = h.dispatcher.lead_locks().acquire("l1").await;

    let router = Arc::clone(&h.router);
    let opt_out = tokio::spawn(async move { router.manual_opt_out("l1", None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!opt_out.is_finished(), "orchestrator shares the dispatcher's lead lock");

    let dispatcher = Arc::clone(&h.dispatcher);
    let now = Utc::now() + secs(1);
    let dispatch = tokio::spawn(async move { dispatcher.run_once(now).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.calls(), 0);

    drop(held);
    let opted = tokio::time::timeout(TEST_TIMEOUT, opt_out)
        .await
        .expect("opt-out should finish")
        .unwrap()
        .unwrap();
    assert!(matches!(opted, Outcome::Applied { .. }));
    let sent = tokio::time::timeout(TEST_TIMEOUT, dispatch)
        .await
        .expect("dispatch should finish")
        .unwrap();
    h.pump().await;

    assert_eq!(sent, 0);
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.lead("l1").await.state, ConversationState::OptedOut);
    assert!(h.store.get_pending_action("l1").await.unwrap().is_none());
}

#[tokio::test]
async fn render_failures_retry_then_go_stale() {
    let generator = Arc::new(FailingGenerator::default());
    let mut h = Harness::with_generator(
        policy(vec![campaign("c1", 2, 60, budget(10))]),
        generator.clone(),
    )
    .await;
    h.orchestrator
        .ingest_lead(new_lead("l1", "5550000009", "c1"))
        .await
        .unwrap();

    let t = Utc::now() + secs(1);
    assert_eq!(h.dispatch(t).await, 0);
    let action = h.store.get_pending_action("l1").await.unwrap().unwrap();
    assert_eq!(action.render_attempts, 1);
    assert!(action.scheduled_at > t + chrono::Duration::milliseconds(900));
    assert_eq!(h.lead("l1").await.state, ConversationState::AwaitingFirstSend);

    // Not due again until the backoff passes.
    assert_eq!(h.dispatch(t + chrono::Duration::milliseconds(500)).await, 0);
    assert_eq!(generator.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    assert_eq!(h.dispatch(t + secs(2)).await, 0);
    assert_eq!(generator.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    let lead = h.lead("l1").await;
    assert_eq!(lead.state, ConversationState::Stale);
    assert_eq!(lead.stale_reason, Some(StaleReason::RenderFailed));
    assert!(h.store.get_pending_action("l1").await.unwrap().is_none());
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.dispatcher.stats_snapshot().await.render_failures, 2);
}

#[tokio::test]
async fn receipt_sweep_settles_missed_receipts() {
    let mut h = Harness::new(policy(vec![campaign("c1", 2, 60, budget(10))])).await;
    h.orchestrator
        .ingest_lead(new_lead("l1", "5550000010", "c1"))
        .await
        .unwrap();
    let sent_at = Utc::now() + secs(1);
    assert_eq!(h.dispatch(sent_at).await, 1);
    let sid = h.attempt_id("l1").await;

    // Still pending at the transport.
    let window = chrono::Duration::minutes(5);
    assert_eq!(h.dispatcher.sweep_receipts(sent_at + secs(600), window).await.unwrap(), 0);

    h.transport
        .statuses
        .lock()
        .unwrap()
        .insert(sid, ReceiptStatus::Delivered);
    // Too recent to poll yet.
    assert_eq!(h.dispatcher.sweep_receipts(sent_at + secs(60), window).await.unwrap(), 0);
    assert_eq!(h.dispatcher.sweep_receipts(sent_at + secs(600), window).await.unwrap(), 1);

    h.pump().await;
    assert_eq!(h.lead("l1").await.state, ConversationState::AwaitingReply);
    assert_eq!(h.store.timers_for_lead("l1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn queue_depth_alert_raises_once_and_clears() {
    let mut config = policy(vec![campaign("c1", 1, 60, budget(10))]);
    config.max_queue_depth = 2;
    let mut h = Harness::new(config).await;

    for i in 0..4 {
        h.orchestrator
            .ingest_lead(new_lead(&format!("l{i}"), &format!("555000050{i}"), "c1"))
            .await
            .unwrap();
    }
    assert_eq!(h.dispatcher.queue_depth().await, 4);
    assert!(h.dispatcher.over_depth().await);
    assert_eq!(h.dispatcher.stats_snapshot().await.queue_alerts, 1);

    assert_eq!(h.dispatch(Utc::now() + secs(1)).await, 4);
    h.orchestrator
        .ingest_lead(new_lead("l9", "5550000509", "c1"))
        .await
        .unwrap();
    assert!(!h.dispatcher.over_depth().await);
    assert_eq!(h.dispatcher.stats_snapshot().await.queue_alerts, 1);
}

#[tokio::test]
async fn conversation_log_feeds_the_next_render() {
    let generator = Arc::new(RecordingGenerator::default());
    let mut h = Harness::with_generator(
        policy(vec![campaign("c1", 2, 60, budget(10))]),
        generator.clone(),
    )
    .await;
    delivered_lead(&mut h, "l1", "5550000011", "c1").await;
    h.router
        .inbound("IN1", "5550000011", "maybe later")
        .await
        .unwrap();
    assert_eq!(h.dispatch(Utc::now() + secs(1)).await, 1);

    let histories = generator.histories.lock().unwrap().clone();
    assert_eq!(histories.len(), 2);
    assert!(histories[0].is_empty());
    assert_eq!(
        histories[1],
        vec![
            "outbound: Hi Lead, message 1 of 2".to_string(),
            "inbound: maybe later".to_string(),
        ]
    );

    let log = h.store.conversation("l1", 10).await.unwrap();
    let directions: Vec<MessageDirection> = log.iter().map(|m| m.direction).collect();
    assert_eq!(
        directions,
        [
            MessageDirection::Outbound,
            MessageDirection::Inbound,
            MessageDirection::Outbound,
        ]
    );
    assert_eq!(log[2].body, "Hi Lead, message 2 of 2");
    assert_eq!(log[2].step, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reply_and_timeout_advance_one_step() {
    let mut h = Harness::new(policy(vec![campaign("c1", 3, 60, budget(100))])).await;
    let ids: Vec<String> = (0..8).map(|i| format!("race-{i}")).collect();
    for (i, id) in ids.iter().enumerate() {
        delivered_lead(&mut h, id, &format!("55500010{i:02}"), "c1").await;
    }

    enum Race {
        Reply(String, String),
        Timeout(lead_engage::store::ReplyTimer),
        Receipt(String),
    }

    let mut work = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let timer = h.store.timers_for_lead(id).await.unwrap().remove(0);
        let phone = format!("55500010{i:02}");
        work.push(Race::Reply(format!("IN-{id}"), phone.clone()));
        work.push(Race::Reply(format!("IN-{id}"), phone));
        work.push(Race::Timeout(timer.clone()));
        work.push(Race::Timeout(timer));
    }
    for message in h.transport.sent() {
        work.push(Race::Receipt(message.attempt_id));
    }
    work.shuffle(&mut StdRng::seed_from_u64(7));

    let handles: Vec<_> = work
        .into_iter()
        .map(|item| {
            let router = Arc::clone(&h.router);
            tokio::spawn(async move {
                match item {
                    Race::Reply(message_id, from) => {
                        router.inbound(&message_id, &from, "maybe later").await
                    }
                    Race::Timeout(timer) => router.timed_out(&timer).await,
                    Race::Receipt(sid) => router.receipt(&sid, "delivered", None).await,
                }
            })
        })
        .collect();

    let results = tokio::time::timeout(TEST_TIMEOUT, futures::future::join_all(handles))
        .await
        .expect("events should settle");
    for result in results {
        result.unwrap().unwrap();
    }

    let unresolved = h.store.list_unresolved_actions().await.unwrap();
    for id in &ids {
        let lead = h.lead(id).await;
        assert_eq!(lead.current_step, 1, "lead {id} in {}", lead.state);
        assert!(
            matches!(lead.state, ConversationState::Replied | ConversationState::Sent(1)),
            "lead {id} in {}",
            lead.state
        );
        let pending: Vec<_> = unresolved.iter().filter(|a| &a.lead_id == id).collect();
        assert_eq!(pending.len(), 1, "lead {id}");
        assert_eq!(pending[0].step, 1);
    }
}

#[tokio::test]
async fn campaign_budget_throttles_and_refills() {
    let mut h = Harness::new(policy(vec![campaign("c1", 1, 60, budget(2))])).await;
    for i in 0..5 {
        h.orchestrator
            .ingest_lead(new_lead(&format!("l{i}"), &format!("555000020{i}"), "c1"))
            .await
            .unwrap();
    }

    let t = Utc::now() + secs(1);
    assert_eq!(h.dispatch(t).await, 2);
    assert_eq!(h.dispatch(t + secs(30)).await, 0);
    assert_eq!(h.dispatch(t + secs(61)).await, 2);
    assert_eq!(h.dispatch(t + secs(122)).await, 1);
    assert_eq!(h.transport.sent().len(), 5);
    assert!(h.dispatcher.stats_snapshot().await.throttled > 0);
}

#[tokio::test]
async fn channel_budget_is_shared_round_robin() {
    let mut config = policy(vec![
        campaign("a", 1, 60, budget(10)),
        campaign("b", 1, 60, budget(10)),
    ]);
    config.channel_budget = budget(2);
    let mut h = Harness::new(config).await;

    for i in 0..3 {
        for (n, c) in ["a", "b"].into_iter().enumerate() {
            h.orchestrator
                .ingest_lead(new_lead(&format!("{c}{i}"), &format!("55500030{n}{i}"), c))
                .await
                .unwrap();
        }
    }

    let t = Utc::now() + secs(1);
    assert_eq!(h.dispatch(t).await, 2);

    let mut campaigns = Vec::new();
    for message in h.transport.sent() {
        let action = h
            .store
            .find_action_by_attempt(&message.attempt_id)
            .await
            .unwrap()
            .unwrap();
        campaigns.push(action.campaign_id);
    }
    campaigns.sort();
    assert_eq!(campaigns, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn restart_reconciles_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engage.db");
    let config = policy(vec![campaign("c1", 2, 60, budget(10))]);

    let (l1_sid, since) = {
        let store = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let mut h = Harness::with_store(store, Arc::new(StubTransport::default()), config.clone());

        // l1 sent, receipt never arrived. l4 delivered, timer row lost.
        h.orchestrator.ingest_lead(new_lead("l1", "5550000401", "c1")).await.unwrap();
        h.orchestrator.ingest_lead(new_lead("l4", "5550000404", "c1")).await.unwrap();
        assert_eq!(h.dispatch(Utc::now() + secs(1)).await, 2);
        let l1_sid = h.attempt_id("l1").await;
        let l4_sid = h.attempt_id("l4").await;
        h.router.receipt(&l4_sid, "delivered", None).await.unwrap();
        h.store.delete_timer("l4", 0).await.unwrap();

        // l2 and l3 crashed between recording the attempt and the transport call.
        let since = Utc::now() - secs(5);
        for (id, phone) in [("l2", "5550000402"), ("l3", "5550000403")] {
            h.orchestrator.ingest_lead(new_lead(id, phone, "c1")).await.unwrap();
            let action = h.store.get_pending_action(id).await.unwrap().unwrap();
            h.store.record_attempt(action.id, since).await.unwrap();
        }
        (l1_sid, since)
    };

    let transport = Arc::new(StubTransport::default());
    transport
        .statuses
        .lock()
        .unwrap()
        .insert(l1_sid.clone(), ReceiptStatus::Delivered);
    transport.history.lock().unwrap().push((
        "15550000402".into(),
        AttemptReceipt {
            attempt_id: "WA-l2".into(),
            sent_at: since + secs(1),
            status: ReceiptStatus::Pending,
        },
    ));

    let store = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let mut h = Harness::with_store(store, Arc::clone(&transport), config);
    let report = h.orchestrator.recover(Utc::now()).await.unwrap();
    assert_eq!(report.reconcile.resolved, 1);
    assert_eq!(report.reconcile.adopted, 1);
    assert_eq!(report.reconcile.requeued, 1);
    assert_eq!(report.timers_rearmed, 1);

    h.pump().await;
    assert_eq!(h.lead("l1").await.state, ConversationState::AwaitingReply);
    assert_eq!(h.attempt_id("l2").await, "WA-l2");
    assert_eq!(h.store.timers_for_lead("l4").await.unwrap().len(), 1);

    assert_eq!(h.dispatch(Utc::now() + secs(1)).await, 1);
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, "15550000403");

    // Recovery is idempotent.
    let again = h.orchestrator.recover(Utc::now()).await.unwrap();
    assert_eq!(again.timers_rearmed, 0);
    assert_eq!(again.actions_recreated, 0);
}
