mod common;

use std::time::Duration;

use anyhow::{bail, Result};
use chat_session::{
    message::{AuthScheme, Envelope},
    ChatError, ConnectionState, SessionConfig, SubscriptionState,
};
use common::{fast_config, login, subscribe, Harness};
use serde_json::json;

#[tokio::test]
async fn subscriptions_are_restored_after_reconnect() -> Result<()> {
    let (harness, mut server) = Harness::connected(fast_config()).await?;
    login(&harness, &mut server, "tok1", "usr1").await?;
    subscribe(&harness, &mut server, "grpB").await?;
    subscribe(&harness, &mut server, "grpA").await?;

    drop(server);
    harness.wait_until_dropped().await?;

    let mut server = harness.accept_handshake().await?;
    let login = server.recv().await?;
    match &login {
        Envelope::Login(login) => {
            assert_eq!(login.scheme, AuthScheme::Token);
            assert_eq!(login.secret, "tok1");
        }
        other => bail!("expected login, got {other:?}"),
    }
    server
        .reply(&login, 200, json!({"user": "usr1", "token": "tok1"}))
        .await?;

    let first = server.recv().await?;
    let second = server.recv().await?;
    let names: Vec<&str> = [&first, &second]
        .iter()
        .map(|request| match request {
            Envelope::Subscribe(sub) => sub.topic.as_str(),
            other => other.kind(),
        })
        .collect();
    assert_eq!(names, vec!["grpA", "grpB"]);

    server.reply(&first, 200, json!({})).await?;
    server.reply(&second, 403, json!({})).await?;
    harness.wait_for(ConnectionState::Connected).await?;

    let session = &harness.session;
    assert_eq!(session.topic("grpA").state().await?, SubscriptionState::Subscribed);
    assert_eq!(session.topic("grpB").state().await?, SubscriptionState::Unsubscribed);
    assert_eq!(session.user_id().as_deref(), Some("usr1"));
    assert!(server.is_silent_for(Duration::from_millis(150)).await);
    assert_eq!(harness.dials(), 2);
    Ok(())
}

#[tokio::test]
async fn refused_token_waits_for_an_explicit_login() -> Result<()> {
    let (harness, mut server) = Harness::connected(fast_config()).await?;
    login(&harness, &mut server, "tok1", "usr1").await?;
    subscribe(&harness, &mut server, "grpA").await?;

    drop(server);
    harness.wait_until_dropped().await?;

    let mut server = harness.accept_handshake().await?;
    let reauth = server.recv().await?;
    if !matches!(reauth, Envelope::Login(_)) {
        bail!("expected login, got {}", reauth.kind());
    }
    server.reply(&reauth, 401, json!({})).await?;
    harness.wait_for(ConnectionState::Unauthenticated).await?;

    let error = harness
        .session
        .publish("grpA", "still there?")
        .await
        .expect_err("not logged in");
    assert!(matches!(error, ChatError::Unauthenticated), "{error:?}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.dials(), 2);
    assert!(server.is_silent_for(Duration::from_millis(50)).await);

    login(&harness, &mut server, "tok2", "usr1").await?;
    let resubscribe = server.recv().await?;
    match &resubscribe {
        Envelope::Subscribe(sub) => assert_eq!(sub.topic, "grpA"),
        other => bail!("expected subscribe, got {other:?}"),
    }
    server.reply(&resubscribe, 200, json!({})).await?;
    harness.wait_for(ConnectionState::Connected).await?;

    let publishing = tokio::spawn({
        let session = harness.session.clone();
        async move { session.publish("grpA", "back").await }
    });
    let request = server.recv().await?;
    server.reply(&request, 202, json!({"seq": 7})).await?;
    assert_eq!(publishing.await??, 7);
    Ok(())
}

#[tokio::test]
async fn dial_failures_back_off_until_the_server_returns() -> Result<()> {
    let (harness, server) = Harness::connected(fast_config()).await?;
    harness.refuse_connections(true);

    drop(server);
    harness.wait_until_dropped().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(harness.dials() >= 3, "only {} dials", harness.dials());
    assert_ne!(harness.session.state(), ConnectionState::Connected);
    let error = harness
        .session
        .publish("grpA", "queued?")
        .await
        .expect_err("offline");
    assert!(error.is_retry_safe());
    let backing_off = harness.session.snapshot().await?;
    assert!(backing_off.reconnect_attempt >= 2, "{backing_off:?}");

    harness.refuse_connections(false);
    let _server = harness.accept_handshake().await?;
    harness.wait_for(ConnectionState::Connected).await?;

    let snapshot = harness.session.snapshot().await?;
    assert_eq!(snapshot.reconnect_attempt, 0);
    assert_eq!(snapshot.pending_requests, 0);
    Ok(())
}

#[tokio::test]
async fn explicit_disconnect_stops_reconnecting() -> Result<()> {
    let (harness, mut server) = Harness::connected(fast_config()).await?;
    login(&harness, &mut server, "tok1", "usr1").await?;
    subscribe(&harness, &mut server, "grpA").await?;

    let publishing = tokio::spawn({
        let session = harness.session.clone();
        async move { session.publish("grpA", "last words").await }
    });
    server.recv().await?;

    harness.session.disconnect().await?;

    let error = publishing.await?.expect_err("cut off by disconnect");
    assert!(matches!(error, ChatError::ConnectionLost), "{error:?}");
    assert_eq!(harness.session.state(), ConnectionState::Disconnected);
    assert_eq!(harness.session.user_id(), None);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(harness.dials(), 1);
    let snapshot = harness.session.snapshot().await?;
    assert!(snapshot.topics.is_empty());
    Ok(())
}

#[tokio::test]
async fn silent_connection_is_redialed_after_idle_timeout() -> Result<()> {
    let config = SessionConfig {
        idle_timeout: Some(Duration::from_millis(300)),
        ..fast_config()
    };
    let (harness, _silent) = Harness::connected(config).await?;

    harness.wait_until_dropped().await?;
    let _server = harness.accept_handshake().await?;
    harness.wait_for(ConnectionState::Connected).await?;
    assert_eq!(harness.dials(), 2);
    Ok(())
}

#[tokio::test]
async fn dropped_session_closes_the_worker() -> Result<()> {
    let (harness, _server) = Harness::connected(fast_config()).await?;
    let mut changes = harness.session.state_changes();
    drop(harness);

    tokio::time::timeout(
        common::STEP,
        changes.wait_for(|state| *state == ConnectionState::Closed),
    )
    .await??;
    Ok(())
}
