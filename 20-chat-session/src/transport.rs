//! The physical connection to the chat server.
//!
//! A [`Connection`] splits one byte stream into a reader task and a writer
//! task. The reader decodes frames and forwards envelopes to the session
//! worker; the writer drains an outbound queue so `send` never blocks the
//! worker. Both report unexpected termination through the same
//! [`TransportEvent::Closed`], which is emitted at most once per connection.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{codec::FrameReader, error::ChatError, message::Envelope};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to the server. Swapped for an in-memory connector in
/// tests.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, addr: String) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: String) -> BoxFuture<'static, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            info!(%addr, "connected");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Why a connection ended without being asked to.
#[derive(Debug)]
pub enum CloseReason {
    Eof,
    Io(io::Error),
    IdleTimeout(Duration),
}

#[derive(Debug)]
pub enum TransportEvent {
    Envelope {
        generation: u64,
        envelope: Envelope,
    },
    Closed {
        generation: u64,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub max_frame_len: usize,
    /// Silence longer than this is treated as a dead connection.
    pub idle_timeout: Option<Duration>,
}

pub struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    pub fn open(
        stream: BoxedStream,
        generation: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
        options: ConnectionOptions,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let notifier = CloseNotifier {
            generation,
            closed: Arc::clone(&closed),
            events: events.clone(),
        };

        let reader = tokio::spawn(read_loop(
            FrameReader::new(BufReader::new(read_half), options.max_frame_len),
            options.idle_timeout,
            generation,
            events,
            notifier.clone(),
        ));
        let writer = tokio::spawn(write_loop(write_half, queue, notifier));

        Self {
            generation,
            outbound,
            closed,
            reader,
            writer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Queues an encoded frame. Fails fast once the connection is closed.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), ChatError> {
        if !self.is_open() {
            return Err(ChatError::NotConnected);
        }
        self.outbound
            .send(frame)
            .map_err(|_| ChatError::NotConnected)
    }

    /// Shuts the connection down without emitting a `Closed` event.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(generation = self.generation, "closing connection");
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
struct CloseNotifier {
    generation: u64,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl CloseNotifier {
    fn notify(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(generation = self.generation, ?reason, "connection closed");
        let _ = self.events.send(TransportEvent::Closed {
            generation: self.generation,
            reason,
        });
    }
}

async fn read_loop<R>(
    mut frames: FrameReader<R>,
    idle_timeout: Option<Duration>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    notifier: CloseNotifier,
) where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let reason = loop {
        let next = match idle_timeout {
            Some(limit) => match timeout(limit, frames.next_frame()).await {
                Ok(next) => next,
                Err(_) => break CloseReason::IdleTimeout(limit),
            },
            None => frames.next_frame().await,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(error))) => {
                warn!(generation, %error, "dropping unreadable frame");
                continue;
            }
            Ok(None) => break CloseReason::Eof,
            Err(error) => break CloseReason::Io(error),
        };

        match crate::codec::decode(&frame) {
            Ok(envelope) => {
                if events
                    .send(TransportEvent::Envelope {
                        generation,
                        envelope,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                warn!(generation, %error, len = frame.len(), "dropping malformed frame");
            }
        }
    };

    notifier.notify(reason);
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    notifier: CloseNotifier,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(error) = result {
            notifier.notify(CloseReason::Io(error));
            return;
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shutdown writer cleanly");
    }
}
