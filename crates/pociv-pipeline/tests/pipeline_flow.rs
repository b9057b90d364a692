//! End-to-end runs through score -> eligibility -> mint -> notify against the
//! sled store and the in-process chain.

mod common;

use std::sync::Arc;

use common::{rating, settings, target_wallet, FlakyGateway, TestEnv, TARGET};
use pociv_core::chain::{AttestationChain, AttestationRequest};
use pociv_core::payload::AttestationPayload;
use pociv_core::{
    AttestationStatus, GatewayError, NotificationKind, NotificationStatus, RunOutcome, RunStep,
    Tier,
};
use pociv_pipeline::{PipelineError, SubmitDisposition};

// ========== Outcomes ==========

#[tokio::test]
async fn below_threshold_is_notified_without_mint() {
    let env = TestEnv::new();
    env.link_target_wallet();
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(1, &[3, 3, 3, 2, 3]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");

    assert_eq!(run.step, RunStep::Notified);
    assert_eq!(run.score, Some(2.8));
    assert_eq!(run.outcome, Some(RunOutcome::BelowThreshold));
    assert_eq!(run.tier, None);
    let vid = run.validation_id.expect("validation");
    assert_eq!(env.storage.get_attestation(&vid).expect("get"), None);
    assert_eq!(env.chain.broadcast_count(), 0);

    let sent = env.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, TARGET);
    assert_eq!(
        sent[0].kind,
        NotificationKind::BelowThreshold {
            score: 2.8,
            threshold: 3.0
        }
    );
}

#[tokio::test]
async fn threshold_is_inclusive() {
    let env = TestEnv::new();
    env.link_target_wallet();
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(2, &[3, 3, 3, 3, 3]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert_eq!(
        run.outcome,
        Some(RunOutcome::Minted {
            tier: Some(Tier::Bronze)
        })
    );
    assert_eq!(env.chain.landed_count(), 1);
}

#[tokio::test]
async fn eligible_rating_mints_silver_stamp() {
    let env = TestEnv::new();
    let wallet = env.link_target_wallet();
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(3, &[5, 4, 4, 5, 3]))
        .await
        .expect("submit");
    assert_eq!(ack.disposition, SubmitDisposition::Created);
    let run = orch.drive(ack.run_id).await.expect("drive");

    assert_eq!(run.step, RunStep::Notified);
    assert_eq!(run.score, Some(4.2));
    assert_eq!(run.tier, Some(Tier::Silver));
    assert!(matches!(
        run.notification,
        Some(NotificationStatus::Delivered { .. })
    ));

    let vid = run.validation_id.expect("validation");
    let validation = env.storage.get_validation(&vid).expect("get").expect("validation");
    let record = env.storage.get_attestation(&vid).expect("get").expect("attestation");
    assert_eq!(record.status, AttestationStatus::Minted);
    assert_eq!(record.recipient, wallet);
    assert_eq!(record.attempts, 1);

    let payload = AttestationPayload::from_validation(&validation, &common::settings())
        .expect("payload");
    assert_eq!(payload.scaled_score, 420);
    assert_eq!(payload.metric_ratings, [5, 4, 4, 5, 3]);
    assert_eq!(payload.source_ref, "discord:77:3");
    assert_eq!(payload.community_context, "mvp_pilot_v1");
    assert_eq!(env.chain.payload_hash(&record.mint_key), Some(payload.hash()));

    let uid = record.attestation_uid.expect("uid");
    let attestation = run.attestation.as_ref().expect("attestation ref");
    assert_eq!(attestation.uid, Some(uid));

    let sent = env.notifier.sent();
    assert_eq!(sent.len(), 1);
    let message = sent[0].message();
    assert!(message.contains("Silver Civility Stamp"), "{message}");
    assert!(
        message.contains(&format!(
            "https://optimism-sepolia.easscan.org/attestation/view/0x{}",
            uid.to_hex()
        )),
        "{message}"
    );
}

#[tokio::test]
async fn missing_wallet_yields_no_wallet_notice() {
    let env = TestEnv::new();
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(4, &[4, 4, 4, 4, 4]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");

    assert_eq!(run.outcome, Some(RunOutcome::NoWallet));
    assert_eq!(env.chain.broadcast_count(), 0);
    let sent = env.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::NoWallet { score: 4.0 });
}

// ========== Mint Failure ==========

#[tokio::test]
async fn exhausted_mint_fails_and_notifies() {
    let env = TestEnv::new();
    env.link_target_wallet();
    env.chain.fail_submits(5);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(5, &[5, 5, 5, 5, 5]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");

    assert_eq!(run.step, RunStep::Notified);
    assert_eq!(run.outcome, Some(RunOutcome::MintFailed));
    assert!(run.mint_failed());
    assert_eq!(env.chain.broadcast_count(), 5);
    assert_eq!(env.chain.landed_count(), 0);

    let vid = run.validation_id.expect("validation");
    let record = env.storage.get_attestation(&vid).expect("get").expect("attestation");
    assert_eq!(record.status, AttestationStatus::Failed);
    assert_eq!(record.attempts, 5);

    let sent = env.notifier.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0].kind {
        NotificationKind::MintFailed { reason, .. } => {
            assert!(reason.contains("exhausted after 5 attempts"), "{reason}")
        }
        other => panic!("unexpected notification {other:?}"),
    }

    // Driving again does nothing.
    orch.drive(ack.run_id).await.expect("drive");
    assert_eq!(env.chain.broadcast_count(), 5);
    assert_eq!(env.notifier.sent().len(), 1);
}

#[tokio::test]
async fn failed_mint_can_be_retried_with_new_generation() {
    let env = TestEnv::new();
    env.link_target_wallet();
    env.chain.fail_submits(5);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(6, &[5, 5, 4, 5, 5]))
        .await
        .expect("submit");
    let failed = orch.drive(ack.run_id).await.expect("drive");
    let vid = failed.validation_id.expect("validation");
    let first_key = env
        .storage
        .get_attestation(&vid)
        .expect("get")
        .expect("attestation")
        .mint_key;

    let reopened = orch.retry_failed_mint(ack.run_id).await.expect("retry");
    assert_eq!(reopened.step, RunStep::MintAttempted);
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert_eq!(
        run.outcome,
        Some(RunOutcome::Minted {
            tier: Some(Tier::Gold)
        })
    );

    let record = env.storage.get_attestation(&vid).expect("get").expect("attestation");
    assert_eq!(record.status, AttestationStatus::Minted);
    assert_eq!(record.generation, 1);
    assert_ne!(record.mint_key, first_key);
    assert_eq!(env.chain.landed_count(), 1);

    let kinds: Vec<_> = env.notifier.sent().iter().map(|n| n.kind_name()).collect();
    assert_eq!(kinds, vec!["mint_failed", "minted"]);
}

#[tokio::test]
async fn abandoned_run_is_not_resumed_or_retried() {
    let env = TestEnv::new();
    env.link_target_wallet();
    env.chain.fail_submits(5);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(7, &[5, 5, 5, 5, 5]))
        .await
        .expect("submit");
    orch.drive(ack.run_id).await.expect("drive");

    let run = orch.abandon(ack.run_id).await.expect("abandon");
    assert!(run.abandoned);
    assert!(orch.unfinished_runs(10).await.expect("list").is_empty());
    assert!(matches!(
        orch.retry_failed_mint(ack.run_id).await,
        Err(PipelineError::NotRetryable { .. })
    ));
    let counts = orch.counts().await.expect("counts");
    assert_eq!(counts.abandoned, 1);
}

#[tokio::test]
async fn unmined_transaction_keeps_run_open_until_it_lands() {
    let env = TestEnv::new();
    env.link_target_wallet();
    env.chain.hold_receipts(true);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(8, &[5, 5, 5, 5, 5]))
        .await
        .expect("submit");
    let err = orch.drive(ack.run_id).await.expect_err("pending on chain");
    assert!(matches!(err, PipelineError::MintUnresolved { .. }), "{err}");
    assert!(!err.is_fatal());

    let run = orch.get_run(&ack.run_id).await.expect("get").expect("run");
    assert_eq!(run.step, RunStep::MintAttempted);
    assert!(!run.is_finished());
    assert!(!run.quarantined);
    let vid = run.validation_id.expect("validation");
    let record = env.storage.get_attestation(&vid).expect("get").expect("attestation");
    assert_eq!(record.status, AttestationStatus::Pending);
    assert_eq!(record.broadcasts, 1);

    // Neither operator action applies while the transaction may still land.
    assert!(matches!(
        orch.retry_failed_mint(ack.run_id).await,
        Err(PipelineError::NotRetryable { .. })
    ));
    assert!(matches!(
        orch.abandon(ack.run_id).await,
        Err(PipelineError::NotAbandonable { .. })
    ));
    assert_eq!(orch.unfinished_runs(10).await.expect("list"), vec![ack.run_id]);
    assert!(env.notifier.sent().is_empty());

    env.chain.hold_receipts(false);
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert_eq!(run.step, RunStep::Notified);
    assert!(matches!(run.outcome, Some(RunOutcome::Minted { .. })));
    assert_eq!(env.chain.broadcast_count(), 1);
    assert_eq!(env.chain.landed_count(), 1);
    let kinds: Vec<_> = env.notifier.sent().iter().map(|n| n.kind_name()).collect();
    assert_eq!(kinds, vec!["minted"]);
}

#[tokio::test]
async fn retry_refuses_when_failed_generation_landed_late() {
    let env = TestEnv::new();
    env.link_target_wallet();
    env.chain.fail_submits(5);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(9, &[5, 5, 5, 5, 5]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert_eq!(run.outcome, Some(RunOutcome::MintFailed));
    let vid = run.validation_id.expect("validation");
    let failed = env.storage.get_attestation(&vid).expect("get").expect("attestation");

    // The failed generation's transaction shows up on chain after the fact.
    let validation = env.storage.get_validation(&vid).expect("get").expect("validation");
    let payload = AttestationPayload::from_validation(&validation, &settings()).expect("payload");
    env.chain
        .submit_attestation(&AttestationRequest {
            schema_uid: settings().schema_uid,
            chain_id: settings().chain_id,
            recipient: target_wallet(),
            data: payload.encode(),
            mint_key: failed.mint_key,
        })
        .await
        .expect("late submit");

    let err = orch
        .retry_failed_mint(ack.run_id)
        .await
        .expect_err("prior generation landed");
    assert!(
        matches!(err, PipelineError::PriorGenerationLanded { generation: 0, .. }),
        "{err}"
    );

    let record = env.storage.get_attestation(&vid).expect("get").expect("attestation");
    assert_eq!(record, failed);
    let run = orch.get_run(&ack.run_id).await.expect("get").expect("run");
    assert_eq!(run.step, RunStep::Notified);
    assert_eq!(env.chain.landed_count(), 1);
}

// ========== Notification ==========

#[tokio::test]
async fn notification_failure_does_not_fail_run() {
    let env = TestEnv::new();
    env.link_target_wallet();
    env.notifier.set_failing(true);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(8, &[5, 4, 4, 5, 3]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");

    assert_eq!(run.step, RunStep::Notified);
    assert!(matches!(
        run.notification,
        Some(NotificationStatus::Failed { ref reason }) if reason.contains("relay unreachable")
    ));
    assert_eq!(env.chain.landed_count(), 1);
}

#[tokio::test]
async fn slow_notifier_is_reported_as_timeout() {
    let env = TestEnv::new();
    env.notifier.set_delay_ms(1_000);
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(9, &[1, 2, 1, 2, 1]))
        .await
        .expect("submit");
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert!(matches!(
        run.notification,
        Some(NotificationStatus::Failed { ref reason }) if reason.contains("timed out")
    ));
}

// ========== Gateway ==========

#[tokio::test]
async fn gateway_timeout_is_recorded_and_recoverable() {
    let env = TestEnv::new();
    env.link_target_wallet();
    let gateway = Arc::new(FlakyGateway::new(env.storage.clone()));
    let orch = env.orchestrator_with(gateway.clone());

    let ack = orch
        .submit_rating(rating(10, &[4, 4, 5, 4, 4]))
        .await
        .expect("submit");
    gateway.stall_user_reads(true);
    let err = orch.drive(ack.run_id).await.expect_err("stalled");
    assert!(matches!(err, PipelineError::Gateway(GatewayError::Timeout)));
    assert!(!err.is_fatal());

    let stalled = env.storage.get_run(&ack.run_id).expect("get").expect("run");
    assert_eq!(stalled.step, RunStep::Scored);
    assert_eq!(stalled.pending_intent, Some(RunStep::EligibilityChecked));
    assert_eq!(stalled.step_errors, 1);
    assert_eq!(stalled.last_error.as_deref(), Some("gateway error: store call timed out"));

    gateway.stall_user_reads(false);
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert_eq!(run.step, RunStep::Notified);
    assert_eq!(run.last_error, None);
}

#[tokio::test]
async fn minted_run_writes_intent_and_result_per_step() {
    let env = TestEnv::new();
    env.link_target_wallet();
    let gateway = Arc::new(FlakyGateway::new(env.storage.clone()));
    let orch = env.orchestrator_with(gateway.clone());

    let ack = orch
        .submit_rating(rating(11, &[5, 4, 4, 5, 3]))
        .await
        .expect("submit");
    orch.drive(ack.run_id).await.expect("drive");
    // Five steps, two writes each.
    assert_eq!(gateway.run_writes(), 10);
}

#[tokio::test]
async fn wallet_linked_after_submit_is_honored() {
    let env = TestEnv::new();
    let orch = env.orchestrator();

    let ack = orch
        .submit_rating(rating(12, &[4, 5, 4, 5, 4]))
        .await
        .expect("submit");
    env.link_target_wallet();
    let run = orch.drive(ack.run_id).await.expect("drive");
    assert!(matches!(run.outcome, Some(RunOutcome::Minted { .. })));
}
