//! Frame decoders
//!
//! Each native backend has its own decoder, chosen once when the backend
//! starts. All of them honour the same contract:
//!
//! - non IPv4-over-Ethernet frames yield `Ok(None)`
//! - IPv4 frames that are not TCP yield `Ok(None)`
//! - frames touching the loopback address yield `Ok(None)`
//! - malformed or truncated frames yield `Err(DecodeError)`, which the
//!   capture loop reports to the consumer as a `None` event and moves on
//!
//! `byte_length` is always the raw frame length as delivered by the backend.

pub mod datalink;
pub mod libpcap;

use crate::backend::BackendKind;
use chrono::{DateTime, Utc};
use packetviz_core::NormalizedPacketEvent;
use thiserror::Error;

/// Per-frame decode failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{layer} header truncated ({len} bytes available)")]
    Truncated { layer: &'static str, len: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

pub type DecodeResult = Result<Option<NormalizedPacketEvent>, DecodeError>;

/// Decoder signature shared by every native backend
pub type DecodeFn = fn(&[u8], DateTime<Utc>) -> DecodeResult;

/// Decode a frame captured by `kind`.
///
/// Backends without raw frames (connection polling) never produce an event
/// here.
pub fn decode(frame: &[u8], kind: BackendKind) -> DecodeResult {
    match kind.decoder() {
        Some(decoder) => decoder(frame, Utc::now()),
        None => Ok(None),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use packetviz_core::PortPair;

    #[test]
    fn test_decode_dispatches_per_backend() {
        let frame = frames::tcp([10, 0, 0, 5], [93, 184, 216, 34], 51000, 443, b"hi");

        for kind in [BackendKind::Libpcap, BackendKind::Datalink] {
            let event = decode(&frame, kind).unwrap().unwrap();
            assert_eq!(event.source_address, "10.0.0.5");
            assert_eq!(event.dest_address, "93.184.216.34");
            assert_eq!(event.byte_length, Some(frame.len() as u64));
        }
    }

    #[test]
    fn test_polling_backend_has_no_decoder() {
        let frame = frames::tcp([10, 0, 0, 5], [93, 184, 216, 34], 51000, 443, b"");
        assert_eq!(decode(&frame, BackendKind::ConnectionPoll), Ok(None));
    }

    #[test]
    fn test_decoders_agree_on_filtering() {
        let cases = vec![
            frames::udp([10, 0, 0, 5], [8, 8, 8, 8], 5353, 53),
            frames::tcp_v6(51000, 443),
            frames::arp(),
            frames::tcp([127, 0, 0, 1], [127, 0, 0, 1], 4000, 51000, b""),
            frames::tcp([10, 0, 0, 5], [127, 0, 0, 1], 4000, 51000, b""),
        ];

        for frame in &cases {
            for kind in [BackendKind::Libpcap, BackendKind::Datalink] {
                assert_eq!(decode(frame, kind), Ok(None), "{:?} on {:?}", kind, frame);
            }
        }

        // 802.1Q-tagged frames pass or fail the same filters on every backend
        let tagged = vec![
            (
                frames::vlan_tagged(&frames::tcp([10, 0, 0, 5], [93, 184, 216, 34], 51000, 443, b"")),
                true,
            ),
            (
                frames::vlan_tagged(&frames::tcp([10, 0, 0, 5], [127, 0, 0, 1], 4000, 51000, b"")),
                false,
            ),
            (
                frames::vlan_tagged(&frames::udp([10, 0, 0, 5], [8, 8, 8, 8], 5353, 53)),
                false,
            ),
        ];
        for (frame, emits) in &tagged {
            for kind in [BackendKind::Libpcap, BackendKind::Datalink] {
                let event = decode(frame, kind).unwrap();
                assert_eq!(event.is_some(), *emits, "{:?} on {:?}", kind, frame);
                if let Some(event) = event {
                    assert_eq!(event.source_address, "10.0.0.5");
                    assert_eq!(event.ports, Some(PortPair::new(51000, 443)));
                }
            }
        }
    }

    #[test]
    fn test_decoders_report_truncation() {
        let frame = frames::tcp([10, 0, 0, 5], [93, 184, 216, 34], 51000, 443, b"");

        for cut in [6, 20, 40] {
            for kind in [BackendKind::Libpcap, BackendKind::Datalink] {
                assert!(
                    decode(&frame[..cut], kind).is_err(),
                    "{:?} accepted a {}-byte frame",
                    kind,
                    cut
                );
            }
        }
    }
}
