//! WebSocket transport: connection handles, read/write loops, accept and
//! connect.
//!
//! Every socket is split in two. A writer task owns the write half and drains
//! an unbounded channel; the rest of the crate only ever holds a
//! [`PeerConnection`], which pushes into that channel and so never blocks.
//! The read half is consumed by a read loop that hands each text frame to a
//! callback on the reading task.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_CLOSE_TIMEOUT;
use crate::error::NetworkError;
use crate::identity::ConnectionId;
use crate::lifecycle::ConnectionManager;
use crate::message::{self, Message};

/// Close code sent when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Policy close codes sent by the server. Both sit in the 4000–4999 range
/// reserved for applications, so clients can tell them from ordinary closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Host not allow-listed, or registration did not arrive in time.
    Unauthorized,
    /// The identity already has a live connection.
    AlreadyConnected,
}

impl CloseCode {
    /// The numeric code carried in the close frame.
    pub fn code(self) -> u16 {
        match self {
            Self::Unauthorized => 4000,
            Self::AlreadyConnected => 4001,
        }
    }

    /// Map a numeric close code back to a policy code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(Self::Unauthorized),
            4001 => Some(Self::AlreadyConnected),
            _ => None,
        }
    }
}

/// Close code and reason observed when a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// The policy code, if the close was a policy rejection.
    pub fn policy(&self) -> Option<CloseCode> {
        CloseCode::from_code(self.code)
    }
}

/// A frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// A cheap, cloneable handle to one WebSocket connection.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerConnection {
    /// Create a handle feeding `tx`.
    pub fn new(remote_addr: SocketAddr, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: ConnectionId::generate(),
            remote_addr,
            tx,
        }
    }

    /// Create a handle together with the receiving end of its queue.
    pub fn channel(remote_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(remote_addr, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The remote host as matched against allow-lists, e.g. `127.0.0.1`.
    pub fn host(&self) -> String {
        self.remote_addr.ip().to_canonical().to_string()
    }

    /// Queue a text frame. Returns `false` if the connection is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    /// Encode and queue a typed message.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), NetworkError> {
        let text = message::encode(message)?;
        if self.send_text(text) {
            Ok(())
        } else {
            Err(NetworkError::Transport(format!(
                "connection to {} is closed",
                self.remote_addr
            )))
        }
    }

    /// Queue a close frame. Frames queued after it are discarded.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain `rx` into `sink` until a close frame is written or every handle is
/// dropped. `close_sent` fires once our close frame is on the wire.
pub(crate) async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    close_sent: oneshot::Sender<()>,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    debug!("Send failed, stopping writer: {e}");
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: WsCloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(WsMessage::Close(Some(frame))).await;
                let _ = close_sent.send(());
                return;
            }
        }
    }
    // Flushes any close reply tungstenite queued while reading.
    let _ = sink.close().await;
}

/// Feed text frames to `on_text` until the peer closes or the socket fails.
/// Returns the peer's close frame, if it sent one.
pub(crate) async fn read_loop<St, E, F>(
    mut stream: St,
    remote_addr: SocketAddr,
    mut on_text: F,
) -> Option<CloseInfo>
where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
    F: FnMut(&str),
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => on_text(text.as_str()),
            Ok(WsMessage::Close(frame)) => {
                debug!("{remote_addr} sent close");
                return Some(match frame {
                    Some(frame) => CloseInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_string(),
                    },
                    None => CloseInfo {
                        code: u16::from(WsCloseCode::Status),
                        reason: String::new(),
                    },
                });
            }
            Ok(_) => {} // Binary/ping/pong
            Err(e) => {
                error!("WebSocket error from {remote_addr}: {e}");
                break;
            }
        }
    }
    None
}

/// Like [`read_loop`], but once `close_sent` fires (or the writer is gone)
/// the peer gets only `grace` to answer before the read half is dropped.
pub(crate) async fn read_until_closed<St, E, F>(
    stream: St,
    remote_addr: SocketAddr,
    close_sent: oneshot::Receiver<()>,
    grace: Duration,
    on_text: F,
) -> Option<CloseInfo>
where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
    F: FnMut(&str),
{
    let reading = read_loop(stream, remote_addr, on_text);
    tokio::pin!(reading);

    tokio::select! {
        close = &mut reading => close,
        _ = close_sent => match tokio::time::timeout(grace, reading).await {
            Ok(close) => close,
            Err(_) => {
                warn!("{remote_addr} did not answer the close frame within {grace:?}, dropping it");
                None
            }
        },
    }
}

/// Accept WebSocket connections on `listener` and hand them to `manager`
/// until `shutdown` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    manager: ConnectionManager,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            handle_inbound(stream, peer_addr, manager).await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("WebSocket server shutting down");
                break;
            }
        }
    }
}

async fn handle_inbound(stream: TcpStream, peer_addr: SocketAddr, manager: ConnectionManager) {
    let grace = manager.close_timeout();
    let ws_stream = match tokio::time::timeout(grace, accept_async(stream)).await {
        Ok(Ok(ws_stream)) => ws_stream,
        Ok(Err(e)) => {
            warn!("WebSocket handshake failed for {peer_addr}: {e}");
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake from {peer_addr} did not finish within {grace:?}");
            return;
        }
    };

    let (sink, stream) = ws_stream.split();
    let (conn, rx) = PeerConnection::channel(peer_addr);
    let (close_sent_tx, close_sent) = oneshot::channel();
    let writer = tokio::spawn(write_loop(sink, rx, close_sent_tx));
    let id = conn.id();

    if manager.open(conn) {
        let close = read_until_closed(stream, peer_addr, close_sent, grace, |text| {
            manager.handle_text(id, text)
        })
        .await;
        manager.handle_close(id, close);
    } else {
        read_until_closed(stream, peer_addr, close_sent, grace, |_| {}).await;
    }

    let _ = writer.await;
}

type ClientStream = futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The read side of a client connection, for the caller to drive with
/// [`ClientReader::run`].
pub(crate) struct ClientReader {
    stream: ClientStream,
    remote_addr: SocketAddr,
    close_sent: oneshot::Receiver<()>,
}

impl ClientReader {
    /// Feed text frames to `on_text` until the connection ends.
    pub(crate) async fn run<F: FnMut(&str)>(self, on_text: F) -> Option<CloseInfo> {
        read_until_closed(
            self.stream,
            self.remote_addr,
            self.close_sent,
            DEFAULT_CLOSE_TIMEOUT,
            on_text,
        )
        .await
    }
}

/// Connect to a server, spawn the writer task and return the handle plus the
/// read side for the caller to drive.
pub(crate) async fn connect(
    url: &str,
    timeout: Duration,
) -> Result<(PeerConnection, ClientReader), NetworkError> {
    let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| NetworkError::Timeout(timeout))?
        .map_err(|e| NetworkError::Transport(format!("Connect to {url} failed: {e}")))?;

    let remote_addr = match ws_stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    }
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let (sink, stream) = ws_stream.split();
    let (conn, rx) = PeerConnection::channel(remote_addr);
    let (close_sent_tx, close_sent) = oneshot::channel();
    tokio::spawn(write_loop(sink, rx, close_sent_tx));

    let reader = ClientReader {
        stream,
        remote_addr,
        close_sent,
    };
    Ok((conn, reader))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
