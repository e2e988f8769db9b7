//! Per-worker media routing core of a selective forwarding unit (SFU).
//!
//! The crate forwards RTP from ingress streams ("producers") to egress
//! subscriptions ("consumers") within one worker process. Each [`Consumer`]
//! rewrites packet identifiers so the receiver sees a single coherent
//! source, answers NACKs from a retransmission buffer, synthesizes RTCP
//! sender reports, and cooperates with a per-transport bandwidth arbiter
//! ([`tcc::TransportCcClient`]) that splits the estimated link capacity
//! between consumers.
//!
//! Everything is sans-IO and single-threaded: calls are synchronous, "now"
//! is always an [`std::time::Instant`] provided by the caller, and effects
//! surface as return values, through narrow listener traits, or on the
//! [`channel::Notifier`] queue. There are no internal threads and no locks;
//! parallelism is obtained by running more workers.
//!
//! [`Consumer`]: consumer::Consumer

#[macro_use]
extern crate tracing;

use thiserror::Error;

pub mod channel;
pub mod consumer;
pub mod io;
pub mod params;
pub mod rtcp;
pub mod rtp;
pub mod streams;
pub mod tcc;

mod util;

pub use consumer::{Consumer, ConsumerListener};
pub use params::MediaKind;
pub use rtp::{Pt, RtpPacket, Ssrc};

/// Errors for the whole forwarding core.
#[derive(Debug, Error)]
pub enum Error {
    /// RTP parse/serialize errors.
    #[error("{0}")]
    Rtp(#[from] rtp::RtpError),

    /// Control channel request errors.
    #[error("{0}")]
    Request(#[from] channel::RequestError),

    /// IO errors from the datagram layer.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
