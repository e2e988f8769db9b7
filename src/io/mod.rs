//! Datagram IO for the media path.

mod udp;

pub use udp::{DatagramSink, SendCallback, UdpSocket, READ_BUFFER_SIZE};
