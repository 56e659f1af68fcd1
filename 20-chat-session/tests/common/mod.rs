#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use chat_session::{
    codec::{decode, encode},
    message::{Ctrl, Envelope},
    transport::{BoxedStream, Connector},
    ConnectionState, Session, SessionConfig,
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
    sync::{mpsc, Mutex},
    time::timeout,
};

pub const STEP: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with short backoff so reconnect tests run quickly.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        initial_reconnect_backoff: Duration::from_millis(20),
        max_reconnect_backoff: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

/// Hands the server half of every dialed duplex pipe to the test.
#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicBool>,
    dials: Arc<AtomicUsize>,
}

impl Connector for MemoryConnector {
    fn connect(&self, _addr: String) -> BoxFuture<'static, io::Result<BoxedStream>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refuse = self.refuse.load(Ordering::SeqCst);
        let accepted = self.accepted.clone();
        Box::pin(async move {
            if refuse {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            accepted
                .send(server)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

pub struct Harness {
    pub session: Session,
    accepted: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    refuse: Arc<AtomicBool>,
    dials: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        init_tracing();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            accepted: accepted_tx,
            refuse: Arc::new(AtomicBool::new(false)),
            dials: Arc::new(AtomicUsize::new(0)),
        };
        let refuse = Arc::clone(&connector.refuse);
        let dials = Arc::clone(&connector.dials);
        Self {
            session: Session::with_connector(config, connector),
            accepted: Mutex::new(accepted_rx),
            refuse,
            dials,
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Waits for the session to dial and returns the server side.
    pub async fn accept(&self) -> Result<FakeServer> {
        let mut accepted = self.accepted.lock().await;
        let stream = timeout(STEP, accepted.recv())
            .await
            .context("no dial before timeout")?
            .ok_or_else(|| anyhow!("connector dropped"))?;
        Ok(FakeServer::new(stream))
    }

    /// Accepts a dial and answers the handshake.
    pub async fn accept_handshake(&self) -> Result<FakeServer> {
        let mut server = self.accept().await?;
        let hello = server.recv().await?;
        if !matches!(hello, Envelope::Hello(_)) {
            bail!("expected hello, got {}", hello.kind());
        }
        server.reply(&hello, 201, json!({"ver": "0.16.5"})).await?;
        Ok(server)
    }

    /// Connects the session to a fresh fake server.
    pub async fn connected(config: SessionConfig) -> Result<(Self, FakeServer)> {
        let harness = Self::new(config);
        let session = harness.session.clone();
        let connecting = tokio::spawn(async move { session.connect().await });
        let server = harness.accept_handshake().await?;
        connecting.await??;
        assert_eq!(harness.session.state(), ConnectionState::Connected);
        Ok((harness, server))
    }

    pub async fn wait_for(&self, target: ConnectionState) -> Result<()> {
        self.session.wait_for_state(target, STEP).await?;
        Ok(())
    }

    /// Waits until the session leaves `Connected`.
    pub async fn wait_until_dropped(&self) -> Result<()> {
        let mut changes = self.session.state_changes();
        timeout(STEP, changes.wait_for(|state| *state != ConnectionState::Connected))
            .await
            .context("session never noticed the drop")??;
        Ok(())
    }
}

pub struct FakeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn recv(&mut self) -> Result<Envelope> {
        let line = timeout(STEP, self.lines.next_line())
            .await
            .context("no request before timeout")??
            .ok_or_else(|| anyhow!("client closed the stream"))?;
        Ok(decode(line.as_bytes())?)
    }

    /// True when nothing arrives within `window`.
    pub async fn is_silent_for(&mut self, window: Duration) -> bool {
        timeout(window, self.lines.next_line()).await.is_err()
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.writer.write_all(&encode(envelope)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn reply(&mut self, request: &Envelope, code: u16, params: Value) -> Result<()> {
        let tag = request
            .tag()
            .ok_or_else(|| anyhow!("{} request has no tag", request.kind()))?;
        self.send(&ctrl(Some(tag), code, params)).await
    }
}

pub fn ctrl(tag: Option<&str>, code: u16, params: Value) -> Envelope {
    let params: BTreeMap<String, Value> = match params {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    Envelope::Ctrl(Ctrl {
        tag: tag.map(str::to_string),
        topic: None,
        code,
        text: if code < 400 { "ok".into() } else { "error".into() },
        params,
    })
}

/// Subscribes the session to `topic`, answering as the server.
pub async fn subscribe(harness: &Harness, server: &mut FakeServer, topic: &str) -> Result<()> {
    let session = harness.session.clone();
    let name = topic.to_string();
    let subscribing = tokio::spawn(async move { session.subscribe(&name).await });
    let request = server.recv().await?;
    match &request {
        Envelope::Subscribe(sub) if sub.topic == topic => {}
        other => bail!("expected subscribe to {topic}, got {other:?}"),
    }
    server.reply(&request, 200, json!({})).await?;
    subscribing.await??;
    Ok(())
}

/// Logs in with `token`, answering as the server.
pub async fn login(
    harness: &Harness,
    server: &mut FakeServer,
    token: &str,
    user: &str,
) -> Result<()> {
    let session = harness.session.clone();
    let presented = token.to_string();
    let logging_in = tokio::spawn(async move { session.login(&presented).await });
    let request = server.recv().await?;
    if !matches!(request, Envelope::Login(_)) {
        bail!("expected login, got {}", request.kind());
    }
    server
        .reply(&request, 200, json!({"user": user, "token": token}))
        .await?;
    let returned = logging_in.await??;
    assert_eq!(returned, token);
    Ok(())
}
