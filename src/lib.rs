//! fingate - drive an application runtime from Rust.
//!
//! The runtime exposes an inter-application bus over a local WebSocket. This
//! crate connects to it, launches a small agent application inside it, and
//! turns "call this method" / "listen to this event" into local futures.
//!
//! # Architecture
//!
//! ```text
//! ProxyObject / InvokeResult      proxy       remote references
//!            │
//!         Gateway                 gateway     RPC session (envelopes, listeners)
//!            │
//!       InterAppBus               bus         topic pub/sub, wildcard sources
//!            │
//!        Connection               connection  handshake, acks, worker pool
//!            │
//!  SocketWriter / SocketReader    ws          tokio-tungstenite halves
//! ```
//!
//! `correlation` provides the id → waiter table used twice: for connection
//! acks and for gateway responses.
//!
//! # Usage
//!
//! ```ignore
//! let conn = Connection::new(ConnectionOptions::new("127.0.0.1", 9696));
//! conn.connect().await?;
//! let gateway = Gateway::open(conn, GatewayOptions::default()).await?;
//! let version = gateway.invoke("fin.System.getVersion", &[]).await?;
//! println!("{}", version.as_str().unwrap_or("?"));
//! gateway.close().await?;
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod proxy;
pub mod ws;

pub use bus::{InterAppBus, MessageListener, SubscriptionKey, Transport};
pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionObserver, ConnectionOptions, ConnectionState};
pub use error::{Error, ErrorKind, Result};
pub use gateway::{EventHandler, Gateway, GatewayListener, GatewayOptions};
pub use protocol::Identity;
pub use proxy::{InvokeResult, ProxyListener, ProxyObject};
