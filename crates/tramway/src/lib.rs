#![deny(unsafe_code)]

//! Client-side framework for the tramway service bus.
//!
//! Services on the bus are reached over multiplexed TCP connections: a
//! central *locator* maps service names to `(host, port, version)`, and every
//! frame on a connection carries a *band* naming the session it belongs to.
//! This crate is the service connection manager - it resolves names, keeps
//! one live channel per service, multiplexes concurrent sessions over it,
//! routes inbound frames back to their session handlers, and rides out
//! disconnects by failing live sessions once and reconnecting with backoff.
//!
//! # Example
//!
//! ```no_run
//! use tramway::{ServiceManager, SessionEvent, session_queue};
//! use tramway::wire::Frame;
//!
//! # async fn demo() -> Result<(), tramway::Error> {
//! let manager = ServiceManager::new();
//! let echo = manager.get("echo", 1).await?;
//!
//! const PING: u64 = 3;
//!
//! let (handler, mut events) = session_queue();
//! let (band, writer) = echo.create_session(handler)?;
//! writer.send(Frame::new(band, PING, b"ping".to_vec())).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Frame(frame) if frame.is_choke() => break,
//!         SessionEvent::Frame(frame) => println!("chunk: {:?}", frame.payload),
//!         SessionEvent::Failed(error) => return Err(error),
//!     }
//! }
//! # Ok(()) }
//! ```

mod channel;
mod connection;
mod errors;
mod executor;
mod handler;
mod manager;
mod resolver;
pub mod worker;

pub use channel::FrameSender;
pub use connection::{ServiceConnection, SessionId};
pub use errors::{Error, ServiceStatus};
pub use handler::{session_queue, QueueHandler, SessionEvent, SessionHandler};
pub use manager::{ManagerConfig, RetryPolicy, ServiceManager};
pub use resolver::{
    default_locator_endpoints, locator, Resolution, Resolver, DEFAULT_LOCATOR_PORT,
};

pub use tramway_wire as wire;
