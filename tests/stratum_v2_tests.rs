//! End-to-end tests for the v2 dialect: NX handshake, channel lifecycle,
//! and share submission over the encrypted transport.

mod common;

use common::*;
use forgepool::stratum::v2::messages::*;
use std::sync::Arc;

fn setup_connection() -> SetupConnection {
    SetupConnection {
        protocol: 0,
        min_version: 2,
        max_version: 2,
        flags: 0,
        endpoint_host: "pool.test".into(),
        endpoint_port: 3333,
        vendor: "testminer".into(),
        hardware_version: "1".into(),
        firmware: "fw-0.1".into(),
        device_id: "dev-1".into(),
    }
}

const TEMPLATE_TS: u32 = 0x5f5e0ff0;

#[tokio::test]
async fn handshake_setup_open_submit_round_trip() {
    let pool = spawn_pool(test_config(), Arc::new(ZeroEngine)).await;
    publish_and_wait(&pool, test_template(100, TEMPLATE_TS)).await;

    let mut client = V2Client::connect(pool.addr).await;

    client.send(setup_connection()).await;
    let frame = client.recv_type(MessageType::SetupConnectionSuccess as u8).await;
    let success = SetupConnectionSuccess::from_frame(&frame).unwrap();
    assert_eq!(success.used_version, 2);

    client
        .send(OpenStandardMiningChannel {
            request_id: 42,
            user_identity: "alice.rig2".into(),
            nominal_hash_rate: 1_000_000.0,
            max_target: [0xff; 32],
        })
        .await;
    let frame = client.recv_type(MessageType::OpenStandardMiningChannelSuccess as u8).await;
    let open = OpenStandardMiningChannelSuccess::from_frame(&frame).unwrap();
    assert_eq!(open.request_id, 42);
    assert_eq!(open.extranonce_prefix.len(), 4);

    // Tip announcement and work arrive after the channel opens.
    let frame = client.recv_type(MessageType::SetNewPrevHash as u8).await;
    let prev = SetNewPrevHash::from_frame(&frame).unwrap();
    assert_eq!(prev.prev_hash, [0xab; 32]);

    let frame = client.recv_type(MessageType::NewMiningJob as u8).await;
    let job = NewMiningJob::from_frame(&frame).unwrap();
    assert!(job.clean_jobs);
    assert_eq!(job.job_id, prev.job_id);
    // The prefix already carries the pool-side extranonce.
    assert!(job.coinbase_prefix.ends_with(&open.extranonce_prefix));

    client
        .send(SubmitSharesStandard {
            channel_id: open.channel_id,
            sequence_number: 7,
            job_id: job.job_id,
            nonce: 0xdeadbeef,
            ntime: TEMPLATE_TS,
            version: job.version,
            extranonce2: vec![0, 0, 0, 1],
        })
        .await;
    let frame = client.recv_type(MessageType::SubmitSharesSuccess as u8).await;
    let accepted = SubmitSharesSuccess::from_frame(&frame).unwrap();
    assert_eq!(accepted.last_sequence_number, 7);
    assert_eq!(accepted.channel_id, open.channel_id);

    let stats = pool.context.batch.statistics();
    assert_eq!(stats.valid, 1);
    assert_eq!(stats.blocks, 1);
    assert_eq!(pool.provider.submission_count(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn duplicate_v2_share_reports_an_error() {
    let pool = spawn_pool(test_config(), Arc::new(ZeroEngine)).await;
    publish_and_wait(&pool, test_template(100, TEMPLATE_TS)).await;

    let mut client = V2Client::connect(pool.addr).await;
    client.send(setup_connection()).await;
    client.recv_type(MessageType::SetupConnectionSuccess as u8).await;
    client
        .send(OpenStandardMiningChannel {
            request_id: 1,
            user_identity: "alice".into(),
            nominal_hash_rate: 0.0,
            max_target: [0xff; 32],
        })
        .await;
    let open = OpenStandardMiningChannelSuccess::from_frame(
        &client.recv_type(MessageType::OpenStandardMiningChannelSuccess as u8).await,
    )
    .unwrap();
    let job = NewMiningJob::from_frame(&client.recv_type(MessageType::NewMiningJob as u8).await)
        .unwrap();

    let submit = SubmitSharesStandard {
        channel_id: open.channel_id,
        sequence_number: 1,
        job_id: job.job_id,
        nonce: 1,
        ntime: TEMPLATE_TS,
        version: job.version,
        extranonce2: vec![0, 0, 0, 2],
    };
    client.send(submit.clone()).await;
    client.recv_type(MessageType::SubmitSharesSuccess as u8).await;

    client.send(SubmitSharesStandard { sequence_number: 2, ..submit }).await;
    let error = SubmitSharesError::from_frame(
        &client.recv_type(MessageType::SubmitSharesError as u8).await,
    )
    .unwrap();
    assert_eq!(error.sequence_number, 2);
    assert_eq!(error.error_code, "duplicate-share");

    pool.shutdown().await;
}

#[tokio::test]
async fn version_mismatch_is_refused() {
    let pool = spawn_pool(test_config(), Arc::new(ZeroEngine)).await;
    let mut client = V2Client::connect(pool.addr).await;

    let mut setup = setup_connection();
    setup.min_version = 3;
    setup.max_version = 4;
    client.send(setup).await;
    let error = SetupConnectionError::from_frame(
        &client.recv_type(MessageType::SetupConnectionError as u8).await,
    )
    .unwrap();
    assert_eq!(error.error_code, "protocol-version-mismatch");

    pool.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_pushes_reconnect() {
    let pool = spawn_pool(test_config(), Arc::new(ZeroEngine)).await;
    publish_and_wait(&pool, test_template(100, TEMPLATE_TS)).await;

    let mut client = V2Client::connect(pool.addr).await;
    client.send(setup_connection()).await;
    client.recv_type(MessageType::SetupConnectionSuccess as u8).await;
    client
        .send(OpenStandardMiningChannel {
            request_id: 3,
            user_identity: "alice".into(),
            nominal_hash_rate: 0.0,
            max_target: [0xff; 32],
        })
        .await;
    client.recv_type(MessageType::OpenStandardMiningChannelSuccess as u8).await;

    pool.cancel.cancel();

    let reconnect =
        Reconnect::from_frame(&client.recv_type(MessageType::Reconnect as u8).await).unwrap();
    // Empty host: come back to the same endpoint.
    assert_eq!(reconnect.new_host, "");
    assert_eq!(reconnect.new_port, 0);

    pool.context.batch.stop().await;
}

#[tokio::test]
async fn idle_session_is_told_why_the_channel_closed() {
    let mut config = test_config();
    config.stratum.idle_timeout_secs = 1;
    let pool = spawn_pool(config, Arc::new(ZeroEngine)).await;
    publish_and_wait(&pool, test_template(100, TEMPLATE_TS)).await;

    let mut client = V2Client::connect(pool.addr).await;
    client.send(setup_connection()).await;
    client.recv_type(MessageType::SetupConnectionSuccess as u8).await;
    client
        .send(OpenStandardMiningChannel {
            request_id: 4,
            user_identity: "alice".into(),
            nominal_hash_rate: 0.0,
            max_target: [0xff; 32],
        })
        .await;
    client.recv_type(MessageType::OpenStandardMiningChannelSuccess as u8).await;

    // Go quiet past the one-second idle deadline.
    let close =
        CloseChannel::from_frame(&client.recv_type(MessageType::CloseChannel as u8).await).unwrap();
    assert_eq!(close.reason_code, "idle-timeout");

    pool.shutdown().await;
}

#[tokio::test]
async fn submit_before_channel_open_is_unauthorized() {
    let pool = spawn_pool(test_config(), Arc::new(ZeroEngine)).await;
    publish_and_wait(&pool, test_template(100, TEMPLATE_TS)).await;

    let mut client = V2Client::connect(pool.addr).await;
    client.send(setup_connection()).await;
    client.recv_type(MessageType::SetupConnectionSuccess as u8).await;

    client
        .send(SubmitSharesStandard {
            channel_id: 1,
            sequence_number: 9,
            job_id: 1,
            nonce: 1,
            ntime: TEMPLATE_TS,
            version: 0x2000_0000,
            extranonce2: vec![0, 0, 0, 1],
        })
        .await;
    let error = SubmitSharesError::from_frame(
        &client.recv_type(MessageType::SubmitSharesError as u8).await,
    )
    .unwrap();
    assert_eq!(error.error_code, "unauthorized");

    pool.shutdown().await;
}
