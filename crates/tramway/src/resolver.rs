//! Name resolution through the locator service.
//!
//! The locator is an ordinary service whose `resolve` verb maps a service
//! name to `((host, port), version, …)`. The resolver issues exactly one
//! such RPC per call over a locator connection owned by the manager, then
//! expands the returned `host:port` to socket addresses.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tramway_wire::{event, Frame};

use crate::connection::ServiceConnection;
use crate::errors::Error;
use crate::handler::{session_queue, SessionEvent};

/// Event ids of the locator's protocol. Verb ids sit above the reserved
/// streaming events.
pub mod locator {
    /// `resolve(name) -> ((host, port), version, …)`.
    pub const RESOLVE: u64 = 3;
}

/// Port of the default locator endpoint.
pub const DEFAULT_LOCATOR_PORT: u16 = 10053;

/// The default locator endpoint list: the IPv6 any-address on port 10053.
pub fn default_locator_endpoints() -> Vec<SocketAddr> {
    vec![SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        DEFAULT_LOCATOR_PORT,
    )]
}

/// Result of resolving a service name.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Socket addresses for the advertised endpoint, in OS resolution order.
    /// Callers try them in order.
    pub endpoints: Vec<SocketAddr>,
    /// Protocol version the service speaks.
    pub version: u32,
}

/// A single-purpose client for the locator's `resolve` verb.
///
/// Reentrant: concurrent calls are independent, each opening its own session
/// on the shared locator connection.
#[derive(Debug, Clone)]
pub struct Resolver {
    endpoints: Vec<SocketAddr>,
    timeout: Duration,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            endpoints: default_locator_endpoints(),
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with(endpoints: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { endpoints, timeout }
    }

    /// The configured locator endpoints.
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    pub fn set_endpoints(&mut self, endpoints: Vec<SocketAddr>) {
        self.endpoints = endpoints;
    }

    /// The per-call deadline, also used by connections as their per-endpoint
    /// connect timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Resolve `name` over an established locator connection.
    ///
    /// Awaits exactly one response frame. Trailing tuple fields in the
    /// response payload are ignored for forward compatibility.
    pub async fn resolve_via(
        &self,
        locator: &ServiceConnection,
        name: &str,
    ) -> Result<Resolution, Error> {
        let (handler, mut events) = session_queue();
        // A session we cannot open means the locator link is unusable.
        let (band, writer) = locator
            .create_session(handler)
            .map_err(|_| Error::LocatorUnavailable)?;

        let args = postcard::to_allocvec(&(name,))
            .map_err(|e| Error::BadResponse(format!("encoding resolve request: {e}")))?;
        if writer
            .send(Frame::new(band, locator::RESOLVE, args))
            .await
            .is_err()
        {
            locator.cancel_session(band);
            return Err(Error::LocatorUnavailable);
        }

        let reply = match tokio::time::timeout(self.timeout, events.recv()).await {
            Ok(reply) => reply,
            Err(_) => {
                locator.cancel_session(band);
                return Err(Error::ResolveTimeout);
            }
        };

        // One response is all we need; drop the session either way.
        locator.cancel_session(band);

        match reply {
            Some(SessionEvent::Frame(frame)) => decode_resolution(&frame).await,
            Some(SessionEvent::Failed(_)) | None => Err(Error::LocatorUnavailable),
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

async fn decode_resolution(frame: &Frame) -> Result<Resolution, Error> {
    match frame.event {
        event::CHUNK => {}
        event::ERROR => {
            let detail: (u32, String) = postcard::from_bytes(&frame.payload)
                .unwrap_or((0, "unreadable locator error".to_owned()));
            return Err(Error::BadResponse(format!(
                "locator error {}: {}",
                detail.0, detail.1
            )));
        }
        event::CHOKE => {
            return Err(Error::BadResponse(
                "locator stream ended before a resolution arrived".to_owned(),
            ));
        }
        other => {
            return Err(Error::BadResponse(format!(
                "unexpected locator event {other}"
            )));
        }
    }

    let ((host, port), version): ((String, u16), u32) = postcard::from_bytes(&frame.payload)
        .map_err(|e| Error::BadResponse(format!("decoding resolution: {e}")))?;

    let endpoints: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| Error::transport(&e))?
        .collect();
    if endpoints.is_empty() {
        return Err(Error::BadResponse(format!("host {host} did not resolve")));
    }

    Ok(Resolution { endpoints, version })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_is_v6_any() {
        let endpoints = default_locator_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints[0].ip().is_unspecified());
        assert_eq!(endpoints[0].port(), DEFAULT_LOCATOR_PORT);
    }

    #[tokio::test]
    async fn resolution_decode_ignores_trailing_fields() {
        let payload =
            postcard::to_allocvec(&(("127.0.0.1", 4040u16), 3u32, ("future", "fields"))).unwrap();
        let frame = Frame::new(1, event::CHUNK, payload);
        let resolution = decode_resolution(&frame).await.unwrap();
        assert_eq!(resolution.version, 3);
        assert_eq!(resolution.endpoints, vec!["127.0.0.1:4040".parse().unwrap()]);
    }

    #[tokio::test]
    async fn locator_error_event_is_a_bad_response() {
        let payload = postcard::to_allocvec(&(2u32, "no such service")).unwrap();
        let frame = Frame::new(1, event::ERROR, payload);
        let err = decode_resolution(&frame).await.unwrap_err();
        assert!(matches!(err, Error::BadResponse(_)));
    }
}
