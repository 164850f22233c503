//! The per-service connection: a connect/serve/drain/reconnect state machine
//! multiplexing many sessions over one channel.
//!
//! A connection owns at most one [`Channel`] at a time. Inbound frames are
//! demultiplexed to session handlers by band; a transport error retires the
//! channel, fails every live session once, and schedules a reconnect with
//! backoff. Handler callbacks always run with no connection lock held.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use tramway_wire::Frame;

use crate::channel::{Channel, ChannelEvent, FrameSender};
use crate::errors::{Error, ServiceStatus};
use crate::executor::Executor;
use crate::handler::SessionHandler;
use crate::manager::{ManagerInner, RetryPolicy};

/// Session identifier, unique within one channel's lifetime.
pub type SessionId = u64;

/// Depth of the queue between a channel's tasks and the dispatch loop.
const DISPATCH_QUEUE_DEPTH: usize = 1024;

/// How a connection finds its peer.
pub(crate) enum ConnectTarget {
    /// Resolve the name through the locator on every (re)connect.
    Resolve(String),
    /// Preconfigured endpoints; no locator traffic.
    Direct(Vec<SocketAddr>),
}

/// A connection to one service, shared by all its users.
///
/// Cheap to clone; all clones refer to the same underlying state.
#[derive(Clone)]
pub struct ServiceConnection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    /// Service name or endpoint text, for logs.
    display_name: String,
    target: ConnectTarget,
    version: u32,
    manager: Weak<ManagerInner>,
    connect_timeout: Duration,
    retry: RetryPolicy,
    /// Route handler callbacks through the manager's serialized executor
    /// instead of running them on the dispatch loop.
    use_default_executor: bool,
    executor: Executor,
    state: Mutex<ConnState>,
}

struct ConnState {
    status: ServiceStatus,
    /// Most recently resolved endpoint, if any.
    endpoint: Option<SocketAddr>,
    channel: Option<Channel>,
    /// Bumped every time a channel is attached or retired; events from stale
    /// epochs are dropped.
    epoch: u64,
    /// Next session id; starts at 1 and resets with each new channel.
    next_session: SessionId,
    sessions: HashMap<SessionId, Arc<dyn SessionHandler>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
}

enum ConnectRole {
    /// This caller drives the attempt.
    Drive,
    /// An attempt is already in flight; wait for its outcome.
    Wait(oneshot::Receiver<Result<(), Error>>),
    Done(Result<(), Error>),
}

impl ServiceConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        display_name: String,
        target: ConnectTarget,
        version: u32,
        manager: Weak<ManagerInner>,
        connect_timeout: Duration,
        retry: RetryPolicy,
        use_default_executor: bool,
        executor: Executor,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                display_name,
                target,
                version,
                manager,
                connect_timeout,
                retry,
                use_default_executor,
                executor,
                state: Mutex::new(ConnState {
                    status: ServiceStatus::Disconnected,
                    endpoint: None,
                    channel: None,
                    epoch: 0,
                    next_session: 1,
                    sessions: HashMap::new(),
                    connect_waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Service name (or endpoint text for endpoint-identified connections).
    pub fn name(&self) -> &str {
        &self.inner.display_name
    }

    /// Protocol version this connection requires.
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.state.lock().status
    }

    /// The endpoint currently connected to (or last connected to).
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.inner.state.lock().endpoint
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn manager(&self) -> Result<Arc<ManagerInner>, Error> {
        self.inner.manager.upgrade().ok_or(Error::BrokenManager)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Open a new session and hand back its id plus the channel's writer.
    ///
    /// Only valid while `Connected`: returns [`Error::NotConnected`] when
    /// disconnected and [`Error::WaitForConnection`] while connecting or
    /// draining.
    pub fn create_session(
        &self,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<(SessionId, FrameSender), Error> {
        let mut st = self.inner.state.lock();
        match st.status {
            ServiceStatus::Disconnected => Err(Error::NotConnected),
            ServiceStatus::Connecting | ServiceStatus::Draining => Err(Error::WaitForConnection),
            ServiceStatus::Connected => {
                let Some(channel) = st.channel.as_ref() else {
                    return Err(Error::NotConnected);
                };
                let writer = channel.writer();
                let id = st.next_session;
                st.next_session += 1;
                st.sessions.insert(id, handler);
                Ok((id, writer))
            }
        }
    }

    /// Cancel a session before completion.
    ///
    /// Removes the entry and fails the handler with [`Error::Cancelled`].
    /// Returns false if the session had already completed.
    pub fn cancel_session(&self, id: SessionId) -> bool {
        let (handler, release) = {
            let mut st = self.inner.state.lock();
            let handler = st.sessions.remove(&id);
            let release = handler.is_some()
                && st.status == ServiceStatus::Draining
                && st.sessions.is_empty();
            (handler, release)
        };
        let Some(handler) = handler else {
            return false;
        };
        self.invoke_fail(handler, Error::Cancelled);
        if release {
            self.release();
        }
        true
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Establish the connection.
    ///
    /// Idempotent under concurrency: while an attempt is in flight, further
    /// callers attach to it instead of starting their own.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// recurses indirectly through `drive_connect` -> `resolve_name` ->
    /// the locator's `connect`; an opaque `impl Future` return type can't
    /// close that cycle, so the future is boxed to give it a concrete type.
    pub fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(async move {
        let role = {
            let mut st = self.inner.state.lock();
            match st.status {
                ServiceStatus::Connected => ConnectRole::Done(Ok(())),
                ServiceStatus::Draining => ConnectRole::Done(Err(Error::WaitForConnection)),
                ServiceStatus::Connecting => {
                    let (tx, rx) = oneshot::channel();
                    st.connect_waiters.push(tx);
                    ConnectRole::Wait(rx)
                }
                ServiceStatus::Disconnected => {
                    st.status = ServiceStatus::Connecting;
                    ConnectRole::Drive
                }
            }
        };

        match role {
            ConnectRole::Done(result) => result,
            ConnectRole::Wait(rx) => rx.await.unwrap_or(Err(Error::NotConnected)),
            ConnectRole::Drive => {
                // Drive on a separate task so a caller dropping this future
                // cannot leave the connection stuck in Connecting.
                let conn = self.clone();
                let attempt = tokio::spawn(async move {
                    let result = conn.drive_connect().await;
                    conn.finish_connect(&result);
                    result
                });
                attempt.await.unwrap_or(Err(Error::NotConnected))
            }
        }
        })
    }

    /// Retire the current channel, fail every live session, and connect
    /// again.
    ///
    /// Fails with [`Error::WaitForConnection`] while a connect attempt or a
    /// drain is in progress; a draining connection is not resurrected.
    pub async fn reconnect(&self) -> Result<(), Error> {
        let draining = {
            let st = self.inner.state.lock();
            match st.status {
                ServiceStatus::Connecting => return Err(Error::WaitForConnection),
                ServiceStatus::Draining => true,
                _ => false,
            }
        };

        if draining {
            // Nothing to reconnect: fail what is left and let the manager
            // drop the connection.
            self.retire_channel(Error::NotConnected);
            self.release();
            return Err(Error::WaitForConnection);
        }

        self.retire_channel(Error::NotConnected);
        self.connect().await
    }

    /// Stop accepting sessions and release once the last one completes.
    ///
    /// Fails with [`Error::WaitForConnection`] while a connect attempt is in
    /// flight. Draining an already-draining connection is a no-op.
    pub fn soft_destroy(&self) -> Result<(), Error> {
        let release = {
            let mut st = self.inner.state.lock();
            match st.status {
                ServiceStatus::Connecting => return Err(Error::WaitForConnection),
                ServiceStatus::Draining => return Ok(()),
                ServiceStatus::Disconnected | ServiceStatus::Connected => {
                    st.status = ServiceStatus::Draining;
                    st.sessions.is_empty()
                }
            }
        };
        if release {
            self.release();
        }
        Ok(())
    }

    /// Mark disconnected, retire the channel and fail all sessions with
    /// `error`. The session counter restarts with the next channel.
    fn retire_channel(&self, error: Error) {
        let (channel, handlers) = {
            let mut st = self.inner.state.lock();
            st.status = ServiceStatus::Disconnected;
            st.epoch += 1;
            st.next_session = 1;
            (st.channel.take(), std::mem::take(&mut st.sessions))
        };
        for (_, handler) in handlers {
            self.invoke_fail(handler, error.clone());
        }
        // Dropped last: the writer keeps draining for any session that still
        // holds a FrameSender.
        drop(channel);
    }

    async fn drive_connect(&self) -> Result<(), Error> {
        let endpoints = match &self.inner.target {
            ConnectTarget::Direct(endpoints) => endpoints.clone(),
            ConnectTarget::Resolve(name) => {
                let manager = self.manager()?;
                let resolution = ManagerInner::resolve_name(&manager, name).await?;
                if resolution.version != self.inner.version {
                    return Err(Error::BadVersion {
                        requested: self.inner.version,
                        advertised: resolution.version,
                    });
                }
                resolution.endpoints
            }
        };

        let mut last_err = Error::Transport(io::ErrorKind::ConnectionRefused);
        for endpoint in endpoints {
            match tokio::time::timeout(self.inner.connect_timeout, TcpStream::connect(endpoint))
                .await
            {
                Ok(Ok(stream)) => {
                    self.install_channel(endpoint, stream);
                    return Ok(());
                }
                Ok(Err(err)) => {
                    debug!(
                        service = %self.inner.display_name,
                        %endpoint,
                        error = %err,
                        "endpoint refused"
                    );
                    last_err = Error::transport(&err);
                }
                Err(_) => {
                    debug!(
                        service = %self.inner.display_name,
                        %endpoint,
                        "endpoint connect timed out"
                    );
                    last_err = Error::Transport(io::ErrorKind::TimedOut);
                }
            }
        }
        Err(last_err)
    }

    fn install_channel(&self, endpoint: SocketAddr, stream: TcpStream) {
        let (events_tx, events_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        let channel = Channel::attach(stream, events_tx);
        // Waiters are drained in the same critical section that flips the
        // status, so a reconnect racing in right after cannot have its own
        // waiters answered by this attempt.
        let (epoch, waiters) = {
            let mut st = self.inner.state.lock();
            st.epoch += 1;
            st.channel = Some(channel);
            st.endpoint = Some(endpoint);
            st.next_session = 1;
            st.status = ServiceStatus::Connected;
            (st.epoch, std::mem::take(&mut st.connect_waiters))
        };
        self.spawn_dispatch(epoch, events_rx);
        for tx in waiters {
            let _ = tx.send(Ok(()));
        }
    }

    /// Settle a failed connect attempt. Success is settled by
    /// `install_channel`.
    fn finish_connect(&self, result: &Result<(), Error>) {
        let Err(error) = result else { return };
        let (waiters, failed) = {
            let mut st = self.inner.state.lock();
            st.status = ServiceStatus::Disconnected;
            st.channel = None;
            (
                std::mem::take(&mut st.connect_waiters),
                std::mem::take(&mut st.sessions),
            )
        };
        for (_, handler) in failed {
            self.invoke_fail(handler, Error::NotConnected);
        }
        for tx in waiters {
            let _ = tx.send(Err(error.clone()));
        }
    }

    // ========================================================================
    // Demultiplexing
    // ========================================================================

    /// One dispatch loop per channel. Exits on the first transport error or
    /// when both channel tasks are gone.
    fn spawn_dispatch(&self, epoch: u64, mut events: mpsc::Receiver<ChannelEvent>) {
        let conn = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Frame(frame) => conn.on_frame(epoch, frame),
                    ChannelEvent::Error(error) => {
                        conn.on_error(epoch, error);
                        break;
                    }
                }
            }
        });
    }

    /// Route an inbound frame to its session handler.
    fn on_frame(&self, epoch: u64, frame: Frame) {
        let (handler, release) = {
            let mut st = self.inner.state.lock();
            if st.epoch != epoch {
                debug!(
                    service = %self.inner.display_name,
                    band = frame.band,
                    "dropping frame from retired channel"
                );
                return;
            }
            let Some(handler) = st.sessions.get(&frame.band).cloned() else {
                // Benign race with session completion.
                debug!(
                    service = %self.inner.display_name,
                    band = frame.band,
                    "dropping frame for unknown band"
                );
                return;
            };
            let mut release = false;
            if frame.is_choke() {
                st.sessions.remove(&frame.band);
                release = st.status == ServiceStatus::Draining && st.sessions.is_empty();
            }
            (handler, release)
        };
        if release {
            self.release();
        }
        self.invoke_deliver(handler, frame);
    }

    /// First transport error on the current channel: retire it and try to
    /// come back. The reconnect outcome is observed only for logging.
    fn on_error(&self, epoch: u64, error: Error) {
        {
            let st = self.inner.state.lock();
            if st.epoch != epoch {
                return;
            }
        }
        debug!(
            service = %self.inner.display_name,
            %error,
            "transport error, scheduling reconnect"
        );
        let conn = self.clone();
        tokio::spawn(async move { conn.reconnect_with_backoff().await });
    }

    async fn reconnect_with_backoff(&self) {
        let policy = self.inner.retry.clone();
        match self.reconnect().await {
            Ok(()) => return,
            // Someone else is already connecting, or the connection is
            // draining; either way this task is done.
            Err(Error::WaitForConnection) => return,
            Err(error) => debug!(
                service = %self.inner.display_name,
                attempt = 1,
                %error,
                "reconnect attempt failed"
            ),
        }
        for attempt in 2..=policy.max_attempts {
            tokio::time::sleep(policy.backoff_for_attempt(attempt - 1)).await;
            match self.connect().await {
                Ok(()) => return,
                Err(Error::WaitForConnection) => return,
                Err(error) => debug!(
                    service = %self.inner.display_name,
                    attempt,
                    %error,
                    "reconnect attempt failed"
                ),
            }
        }
        warn!(
            service = %self.inner.display_name,
            attempts = policy.max_attempts,
            "giving up on reconnect"
        );
    }

    // ========================================================================
    // Handler callbacks
    // ========================================================================

    fn invoke_deliver(&self, handler: Arc<dyn SessionHandler>, frame: Frame) {
        let service = self.inner.display_name.clone();
        self.run_callback(Box::new(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.deliver(frame))) {
                warn!(
                    service = %service,
                    message = %panic_message(&panic),
                    "session handler panicked while handling a frame"
                );
            }
        }));
    }

    fn invoke_fail(&self, handler: Arc<dyn SessionHandler>, error: Error) {
        let service = self.inner.display_name.clone();
        self.run_callback(Box::new(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.fail(error))) {
                warn!(
                    service = %service,
                    message = %panic_message(&panic),
                    "session handler panicked while failing"
                );
            }
        }));
    }

    fn run_callback(&self, job: Box<dyn FnOnce() + Send>) {
        if self.inner.use_default_executor {
            if let Err(job) = self.inner.executor.post(job) {
                job();
            }
        } else {
            job();
        }
    }

    /// Ask the manager to drop this connection from its registry. A missing
    /// manager is fine here: there is no registry left to clean.
    fn release(&self) {
        if let Ok(manager) = self.manager() {
            manager.release(self);
        }
    }
}

impl std::fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConnection")
            .field("name", &self.inner.display_name)
            .field("version", &self.inner.version)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // Tear-down finality: anything still in the table gets its one fail.
        let handlers = std::mem::take(&mut self.state.get_mut().sessions);
        for (_, handler) in handlers {
            let _ = catch_unwind(AssertUnwindSafe(|| handler.fail(Error::NotConnected)));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
