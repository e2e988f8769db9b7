//! Send-side RTP streams.

use crate::params::MimeType;
use crate::rtp::{Pt, Ssrc};

mod send;

pub use send::RtpStreamSend;

/// Static parameters of a send stream, resolved from the consumer's
/// negotiated codec and encoding.
#[derive(Debug, Clone)]
pub struct RtpStreamParams {
    pub ssrc: Ssrc,
    pub payload_type: Pt,
    pub mime_type: MimeType,
    pub clock_rate: u32,
    pub cname: String,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
    pub use_in_band_fec: bool,
    pub use_dtx: bool,
}

/// Retransmission buffer capacity when NACK is negotiated. Without NACK
/// the stream keeps no send history.
pub const RETRANSMISSION_BUFFER_SIZE: usize = 600;
