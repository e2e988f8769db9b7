//! RTP level types: stream identifiers, the parsed packet, sequence
//! number remapping and bitrate units.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

mod header;
mod packet;
mod seq;
mod units;

pub use header::{HeaderExtensionIds, RtpHeader, RtpHeaderExtensionUri};
pub use packet::{RtpError, RtpPacket};
pub use seq::SeqManager;
pub use units::Bitrate;

macro_rules! num_id {
    ($id:ident, $t:tt) => {
        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Synchronization source.
///
/// Uniquely identifies one encoded stream on the wire. A consumer rewrites
/// every forwarded packet to carry its own outgoing Ssrc; resends go out on
/// a separate RTX Ssrc when negotiated.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ssrc(u32);
num_id!(Ssrc, u32);

impl Ssrc {
    pub const fn new(v: u32) -> Ssrc {
        Ssrc(v)
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// Payload type.
///
/// Identifies which codec a packet carries. PTs are 7 bits in the RTP
/// header; the mapping to codecs is part of the negotiated parameters.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Pt(u8);
num_id!(Pt, u8);

impl Pt {
    pub const fn new_with_value(v: u8) -> Pt {
        Pt(v)
    }
}
