#![deny(unsafe_code)]

//! Wire-level types for the tramway service bus protocol.
//!
//! Every message exchanged with a service is a [`Frame`]: a *band* naming the
//! session the frame belongs to, an *event* selecting a verb within the
//! destination service's protocol, and an opaque payload whose codec is owned
//! by that verb. The protocol is symmetric - the locator that maps service
//! names to endpoints is itself just a service with a `resolve` verb.
//!
//! Frames travel over byte streams as `[u32 be length][frame bytes]`; see
//! [`LengthPrefixedFramed`].

mod framing;

pub use framing::{LengthPrefixedFramed, MAX_FRAME_LEN};

use serde::{Deserialize, Serialize};

/// Reserved event ids shared by every service protocol.
///
/// Verb-specific event ids start above these; the reserved range carries the
/// primitive streaming events every session understands.
pub mod event {
    /// A payload-carrying chunk of a session's stream.
    pub const CHUNK: u64 = 0;
    /// An error report for the session, payload `(code, message)`.
    pub const ERROR: u64 = 1;
    /// Stream-termination marker. Carries an empty payload and is the last
    /// frame a session ever sees.
    pub const CHOKE: u64 = 2;
}

/// A single multiplexed protocol frame.
///
/// The `band` is allocated by whichever peer opened the session and scopes
/// the frame to that session; `event` selects the verb. Payload bytes are
/// passed through untouched by the framing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub band: u64,
    pub event: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(band: u64, event: u64, payload: Vec<u8>) -> Self {
        Self {
            band,
            event,
            payload,
        }
    }

    /// The stream-termination frame for a band.
    pub fn choke(band: u64) -> Self {
        Self::new(band, event::CHOKE, Vec::new())
    }

    /// Whether this frame terminates its session's stream.
    pub fn is_choke(&self) -> bool {
        self.event == event::CHOKE
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame(band={}, event={}, {} bytes)",
            self.band,
            self.event,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_through_postcard() {
        let frame = Frame::new(7, event::CHUNK, b"pong".to_vec());
        let bytes = postcard::to_allocvec(&frame).unwrap();
        let decoded: Frame = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn choke_is_empty_and_terminal() {
        let frame = Frame::choke(3);
        assert!(frame.is_choke());
        assert!(frame.payload.is_empty());
        assert_eq!(frame.band, 3);
    }

    #[test]
    fn trailing_payload_fields_are_ignored() {
        // A newer peer may append tuple fields; decoding a known prefix of
        // the payload must keep working.
        let payload = postcard::to_allocvec(&(("localhost", 4040u16), 1u32, "extra")).unwrap();
        let (endpoint, version): ((String, u16), u32) = postcard::from_bytes(&payload).unwrap();
        assert_eq!(endpoint, ("localhost".to_owned(), 4040));
        assert_eq!(version, 1);
    }
}
