//! Socket halves for the runtime endpoint.
//!
//! The runtime speaks JSON documents over text frames on
//! `ws://<host>:<port>/`. [`open`] dials it and hands back a
//! [`SocketWriter`] (kept behind the connection's write mutex) and a
//! [`SocketReader`] (moved into the reader task).
//!
//! Fragmented messages are reassembled by tungstenite, so
//! [`SocketReader::next_inbound`] only yields whole documents.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code reported when the peer sent a close frame without a status.
pub const NO_STATUS: u16 = 1005;

/// Something the reader task has to act on.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// One complete JSON document (text, or binary that is valid UTF-8).
    Document(String),
    /// Keep-alive ping; answer with [`SocketWriter::pong`].
    Ping(Vec<u8>),
    /// The runtime closed the socket.
    Closed {
        /// Close status code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Sending half of the runtime socket.
#[derive(Debug)]
pub struct SocketWriter {
    sink: SplitSink<Socket, Message>,
}

impl SocketWriter {
    /// Write one JSON document as a text frame.
    pub async fn send_document(&mut self, document: &str) -> Result<()> {
        self.write(Message::Text(document.to_owned())).await
    }

    /// Answer a ping with the same payload.
    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.write(Message::Pong(payload)).await
    }

    /// Start the closing handshake with `code` and `reason`.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.write(Message::Close(Some(frame))).await
    }

    async fn write(&mut self, message: Message) -> Result<()> {
        self.sink
            .send(message)
            .await
            .map_err(|e| Error::Write(e.to_string()))
    }
}

/// Receiving half of the runtime socket.
#[derive(Debug)]
pub struct SocketReader {
    stream: SplitStream<Socket>,
}

impl SocketReader {
    /// Next event the connection cares about, or `None` once the stream ends.
    ///
    /// Pongs, raw frames and non-UTF-8 binary payloads are dropped here.
    pub async fn next_inbound(&mut self) -> Option<Result<Inbound>> {
        while let Some(next) = self.stream.next().await {
            let message = match next {
                Ok(message) => message,
                Err(e) => return Some(Err(Error::ConnectFailed(format!("socket read: {e}")))),
            };
            if let Some(inbound) = classify(message) {
                return Some(Ok(inbound));
            }
        }
        None
    }
}

fn classify(message: Message) -> Option<Inbound> {
    match message {
        Message::Text(text) => Some(Inbound::Document(text)),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(Inbound::Document(text)),
            Err(e) => {
                log::debug!("[Connection] Dropping {}-byte binary frame", e.as_bytes().len());
                None
            }
        },
        Message::Ping(payload) => Some(Inbound::Ping(payload)),
        Message::Close(frame) => Some(match frame {
            Some(frame) => Inbound::Closed {
                code: frame.code.into(),
                reason: frame.reason.into_owned(),
            },
            None => Inbound::Closed {
                code: NO_STATUS,
                reason: String::new(),
            },
        }),
        Message::Pong(_) | Message::Frame(_) => None,
    }
}

/// Runtime endpoint for `host` and `port`.
#[must_use]
pub fn endpoint_url(host: &str, port: u16) -> String {
    format!("ws://{host}:{port}/")
}

/// Dial the runtime at `host:port`.
pub async fn open(host: &str, port: u16) -> Result<(SocketWriter, SocketReader)> {
    let url = endpoint_url(host, port);
    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::ConnectFailed(format!("{url}: {e}")))?;
    let (sink, stream) = socket.split();
    Ok((SocketWriter { sink }, SocketReader { stream }))
}
