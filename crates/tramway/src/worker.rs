//! Worker-process bootstrap.
//!
//! A worker is spawned by the bus's supervising runtime and told where to
//! phone home through its process options. It blocks `SIGPIPE` before any
//! socket is opened, owns a [`ServiceManager`] for user code, and keeps a
//! control session alive on which it announces itself and answers
//! heartbeats.

use std::net::SocketAddr;

use tramway_wire::Frame;

use crate::errors::Error;
use crate::handler::{session_queue, SessionEvent};
use crate::manager::{ManagerConfig, ServiceManager};

/// Event ids of the control protocol spoken with the supervising runtime.
/// Verb ids sit above the reserved streaming events.
pub mod control {
    /// `handshake(uuid)` - the worker announces itself.
    pub const HANDSHAKE: u64 = 3;
    /// Liveness probe; the worker echoes it back.
    pub const HEARTBEAT: u64 = 4;
    /// The runtime asks the worker to exit.
    pub const TERMINATE: u64 = 5;
}

/// Version of the control protocol.
const CONTROL_VERSION: u32 = 1;

/// Options handed to a worker process by the runtime that spawned it.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Control endpoint of the supervising runtime.
    pub endpoint: SocketAddr,
    /// This worker's identity.
    pub uuid: String,
    /// Optional locator override for the worker's own manager.
    pub locator: Option<SocketAddr>,
}

/// A malformed worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl std::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionsError::Missing(opt) => write!(f, "missing required option {opt}"),
            OptionsError::Invalid(opt) => write!(f, "invalid value for option {opt}"),
        }
    }
}

impl std::error::Error for OptionsError {}

impl WorkerOptions {
    /// Parse `--endpoint <addr> --uuid <id> [--locator <addr>]` from an
    /// argument list (without the program name).
    pub fn from_args<I>(args: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut endpoint = None;
        let mut uuid = None;
        let mut locator = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--endpoint" => {
                    let value = args.next().ok_or(OptionsError::Missing("--endpoint"))?;
                    endpoint = Some(
                        value
                            .parse()
                            .map_err(|_| OptionsError::Invalid("--endpoint"))?,
                    );
                }
                "--uuid" => {
                    uuid = Some(args.next().ok_or(OptionsError::Missing("--uuid"))?);
                }
                "--locator" => {
                    let value = args.next().ok_or(OptionsError::Missing("--locator"))?;
                    locator = Some(
                        value
                            .parse()
                            .map_err(|_| OptionsError::Invalid("--locator"))?,
                    );
                }
                // Unknown options are the runtime's business, not ours.
                _ => {}
            }
        }

        Ok(Self {
            endpoint: endpoint.ok_or(OptionsError::Missing("--endpoint"))?,
            uuid: uuid.ok_or(OptionsError::Missing("--uuid"))?,
            locator,
        })
    }
}

/// A worker process's connection machinery.
pub struct Worker {
    options: WorkerOptions,
    manager: ServiceManager,
}

impl Worker {
    /// Build the worker. Blocks `SIGPIPE` before anything touches a socket.
    /// Must be called inside a tokio runtime.
    pub fn new(options: WorkerOptions) -> Self {
        block_sigpipe();
        let mut config = ManagerConfig::default();
        if let Some(locator) = options.locator {
            config.locator_endpoints = vec![locator];
        }
        Self {
            options,
            manager: ServiceManager::with_config(config),
        }
    }

    /// The manager, for user code running inside the worker.
    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Connect to the supervising runtime, announce ourselves, and answer
    /// heartbeats until told to terminate or the stream ends.
    pub async fn run(&self) -> Result<(), Error> {
        let conn = self
            .manager
            .get_endpoint(self.options.endpoint, CONTROL_VERSION)
            .await?;

        let (handler, mut events) = session_queue();
        let (band, writer) = conn.create_session(handler)?;

        let hello = postcard::to_allocvec(&(self.options.uuid.as_str(),))
            .map_err(|e| Error::BadResponse(format!("encoding handshake: {e}")))?;
        writer.send(Frame::new(band, control::HANDSHAKE, hello)).await?;

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Frame(frame) if frame.event == control::HEARTBEAT => {
                    writer
                        .send(Frame::new(band, control::HEARTBEAT, Vec::new()))
                        .await?;
                }
                SessionEvent::Frame(frame) if frame.event == control::TERMINATE => return Ok(()),
                SessionEvent::Frame(frame) if frame.is_choke() => return Ok(()),
                SessionEvent::Frame(frame) => {
                    tracing::debug!(event = frame.event, "ignoring unknown control event");
                }
                SessionEvent::Failed(error) => return Err(error),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn block_sigpipe() {
    // A peer closing mid-write must surface as an EPIPE error on the socket,
    // not kill the process.
    #[allow(unsafe_code)]
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_sigpipe() {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn options_parse() {
        let options = WorkerOptions::from_args(args(&[
            "--endpoint",
            "127.0.0.1:4040",
            "--uuid",
            "worker-1",
        ]))
        .unwrap();
        assert_eq!(options.endpoint, "127.0.0.1:4040".parse().unwrap());
        assert_eq!(options.uuid, "worker-1");
        assert!(options.locator.is_none());
    }

    #[test]
    fn options_accept_a_locator_override() {
        let options = WorkerOptions::from_args(args(&[
            "--endpoint",
            "127.0.0.1:4040",
            "--uuid",
            "worker-1",
            "--locator",
            "127.0.0.1:10053",
        ]))
        .unwrap();
        assert_eq!(options.locator, Some("127.0.0.1:10053".parse().unwrap()));
    }

    #[test]
    fn options_require_endpoint_and_uuid() {
        assert_eq!(
            WorkerOptions::from_args(args(&["--uuid", "w"])).unwrap_err(),
            OptionsError::Missing("--endpoint")
        );
        assert_eq!(
            WorkerOptions::from_args(args(&["--endpoint", "127.0.0.1:1"])).unwrap_err(),
            OptionsError::Missing("--uuid")
        );
        assert_eq!(
            WorkerOptions::from_args(args(&["--endpoint", "nonsense", "--uuid", "w"]))
                .unwrap_err(),
            OptionsError::Invalid("--endpoint")
        );
    }

    #[test]
    fn unknown_options_are_ignored() {
        let options = WorkerOptions::from_args(args(&[
            "--app",
            "echo",
            "--endpoint",
            "127.0.0.1:4040",
            "--uuid",
            "worker-1",
        ]))
        .unwrap();
        assert_eq!(options.uuid, "worker-1");
    }
}
