use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ServerArgs,
    protocol::{self, DEFAULT_MAX_LINE_BYTES, NAME_PROMPT, read_line, write_line},
    registry::{JoinError, Member, Registry, SessionId},
};

/// How long handlers get to wind down once shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long a closing session's writer may keep flushing queued lines.
const WRITER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: Option<usize>,
    pub outbound_buffer: usize,
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: None,
            outbound_buffer: 256,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            max_clients: args.max_clients,
            outbound_buffer: args.outbound_buffer.max(1),
            max_line_bytes: args.max_line_bytes.max(1),
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    registry: Arc<Registry>,
    config: ServerConfig,
}

impl ChatServer {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::with_capacity(config.max_clients));
        Self {
            listener,
            shared: Arc::new(Shared { registry, config }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.shared.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, shared } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &shared, &stop_rx, &mut handlers);
                }
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "connection handler panicked");
                    }
                }
            }
        }

        drop(listener);
        handle_shutdown(&shared, stop_tx, handlers).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(
    shared: &Shared,
    stop_tx: watch::Sender<bool>,
    mut handlers: JoinSet<()>,
) {
    let members = shared.registry.close_all().await;
    info!(members, "chat server shutting down");
    stop_tx.send_replace(true);

    let drained = timeout(SHUTDOWN_GRACE, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = handlers.len(),
            "aborting handlers that did not finish in time"
        );
        handlers.shutdown().await;
    }
    info!("chat server stopped");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    shared: &Arc<Shared>,
    stop: &watch::Receiver<bool>,
    handlers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, shared, stop, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Arc<Shared>,
    stop: &watch::Receiver<bool>,
    handlers: &mut JoinSet<()>,
) {
    let shared = Arc::clone(shared);
    let stop = stop.clone();
    debug!(%peer, "connection accepted");
    handlers.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, shared, stop).await {
            warn!(%peer, error = ?err, "client connection closed with error");
        }
    });
}

/// The handler-owned side of a connected participant.
struct Session {
    id: SessionId,
    name: String,
    peer: SocketAddr,
}

/// What ended a wait for the next inbound line.
enum Inbound {
    Line(String),
    PeerClosed,
    WriterGone,
    Shutdown,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbound, queue) = session_queue(&shared.config);
    let writer_task = tokio::spawn(drain_outbound(writer, queue, peer));

    let result = run_session(&shared, peer, &mut reader, &outbound, &mut stop).await;

    drop(outbound);
    finish_writer(writer_task, peer).await;
    debug!(%peer, "connection closed");
    result
}

/// The prompt may still be queued when the welcome is, so the queue holds
/// one line beyond the configured buffer.
fn session_queue(config: &ServerConfig) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(config.outbound_buffer + 1)
}

async fn run_session<R>(
    shared: &Shared,
    peer: SocketAddr,
    reader: &mut R,
    outbound: &mpsc::Sender<String>,
    stop: &mut watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let Some(session) = perform_handshake(shared, peer, reader, outbound, stop).await? else {
        return Ok(());
    };

    let relayed = relay_messages(shared, &session, reader, outbound, stop).await;

    shared
        .registry
        .depart(session.id, &protocol::leave_notice(&session.name))
        .await;
    info!(peer = %session.peer, name = %session.name, "client left");

    relayed
}

/// Prompts for a name and admits the session. `None` means the connection
/// ended before the session joined.
async fn perform_handshake<R>(
    shared: &Shared,
    peer: SocketAddr,
    reader: &mut R,
    outbound: &mpsc::Sender<String>,
    stop: &mut watch::Receiver<bool>,
) -> Result<Option<Session>>
where
    R: AsyncBufRead + Unpin,
{
    outbound.send(NAME_PROMPT.to_string()).await?;

    let max_line_bytes = shared.config.max_line_bytes;
    let submitted = match next_inbound(reader, max_line_bytes, outbound, stop).await? {
        Inbound::Line(line) => line,
        other => {
            debug!(%peer, reason = other.describe(), "connection ended before naming");
            return Ok(None);
        }
    };

    let session = Session {
        id: shared.registry.next_id(),
        name: protocol::resolve_name(&submitted, peer.port()),
        peer,
    };
    let member = Member::new(session.name.clone(), outbound.clone());
    let joined = shared
        .registry
        .join(
            session.id,
            member,
            &protocol::join_notice(&session.name),
            |online| protocol::welcome(&session.name, online),
        )
        .await;

    match joined {
        Ok(online) => {
            info!(%peer, name = %session.name, online, "client joined");
            Ok(Some(session))
        }
        Err(JoinError::Full { capacity }) => {
            info!(%peer, capacity, "refusing client, chat is full");
            outbound.send(protocol::chat_full(capacity)).await?;
            Ok(None)
        }
    }
}

async fn relay_messages<R>(
    shared: &Shared,
    session: &Session,
    reader: &mut R,
    outbound: &mpsc::Sender<String>,
    stop: &mut watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match next_inbound(reader, shared.config.max_line_bytes, outbound, stop).await? {
            Inbound::Line(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                let report = shared
                    .registry
                    .broadcast(&protocol::chat_line(&session.name, &text), Some(session.id))
                    .await;
                debug!(
                    name = %session.name,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    evicted = report.evicted.len(),
                    "relayed message"
                );
            }
            other => {
                debug!(name = %session.name, reason = other.describe(), "session closing");
                return Ok(());
            }
        }
    }
}

async fn next_inbound<R>(
    reader: &mut R,
    max_line_bytes: usize,
    outbound: &mpsc::Sender<String>,
    stop: &mut watch::Receiver<bool>,
) -> Result<Inbound>
where
    R: AsyncBufRead + Unpin,
{
    select! {
        line = read_line(reader, max_line_bytes) => Ok(match line? {
            Some(line) => Inbound::Line(line),
            None => Inbound::PeerClosed,
        }),
        _ = outbound.closed() => Ok(Inbound::WriterGone),
        _ = stop_requested(stop) => Ok(Inbound::Shutdown),
    }
}

/// Resolves once shutdown is signalled or the server side of the signal is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

impl Inbound {
    fn describe(&self) -> &'static str {
        match self {
            Inbound::Line(_) => "line",
            Inbound::PeerClosed => "peer closed the connection",
            Inbound::WriterGone => "peer stopped accepting data",
            Inbound::Shutdown => "server shutting down",
        }
    }
}

/// Writes queued lines to the socket until every sender is gone or a write fails.
async fn drain_outbound(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<String>,
    peer: SocketAddr,
) {
    while let Some(line) = queue.recv().await {
        if let Err(err) = write_line(&mut writer, &line).await {
            debug!(%peer, ?err, "failed to deliver line to client");
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(%peer, ?err, "failed to shut down client writer");
    }
}

async fn finish_writer(mut writer_task: JoinHandle<()>, peer: SocketAddr) {
    match timeout(WRITER_GRACE, &mut writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%peer, error = ?err, "client writer task failed"),
        Err(_) => {
            debug!(%peer, "client writer did not flush in time");
            writer_task.abort();
        }
    }
}
