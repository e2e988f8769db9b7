use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

/// Size of the shared receive buffer.
pub const READ_BUFFER_SIZE: usize = 65536;

thread_local! {
    // One receive buffer for every socket on the loop. Safe because the
    // media path is single-threaded and each datagram is fully consumed
    // by the receive handler before the next read. This must stay the
    // only module-level mutable state in the core.
    static READ_BUFFER: RefCell<Box<[u8; READ_BUFFER_SIZE]>> =
        RefCell::new(Box::new([0; READ_BUFFER_SIZE]));
}

/// Completion callback for a datagram send. Invoked exactly once with
/// whether the datagram fully left the socket.
pub type SendCallback = Box<dyn FnOnce(bool)>;

/// The narrow interface the forwarding core sends through. The concrete
/// transport (UDP here, TCP framing elsewhere) is a collaborator, not
/// part of the core.
pub trait DatagramSink {
    fn send_datagram(&mut self, data: &[u8], to: SocketAddr, on_complete: Option<SendCallback>);
}

struct PendingSend {
    // Payload copied into one owned block together with its callback,
    // queued until the socket is writable again.
    data: Vec<u8>,
    to: SocketAddr,
    on_complete: Option<SendCallback>,
}

/// Non-blocking UDP socket with an async-send fallback queue.
///
/// Sends try the socket directly first; on `WouldBlock` the payload is
/// copied and queued, to be flushed by [`handle_writable`] when the event
/// loop reports the socket writable. Closing is idempotent and fails all
/// queued callbacks.
///
/// [`handle_writable`]: UdpSocket::handle_writable
pub struct UdpSocket {
    io: std::net::UdpSocket,
    pending: VecDeque<PendingSend>,
    closed: bool,
    bytes_sent: u64,
    bytes_received: u64,
    send_errors: u64,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
        let io = std::net::UdpSocket::bind(addr)?;
        io.set_nonblocking(true)?;

        Ok(UdpSocket {
            io,
            pending: VecDeque::new(),
            closed: false,
            bytes_sent: 0,
            bytes_received: 0,
            send_errors: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors
    }

    /// Drain readable datagrams into `handler`. The datagram slice is
    /// only valid for the duration of the call; it points into the
    /// shared read buffer.
    pub fn receive(
        &mut self,
        handler: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }

        let mut count = 0;

        READ_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();

            loop {
                match self.io.recv_from(&mut buf[..]) {
                    Ok((n, from)) => {
                        self.bytes_received += n as u64;
                        count += 1;
                        handler(&buf[..n], from);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            Ok(())
        })?;

        Ok(count)
    }

    /// Flush queued sends after the loop reported the socket writable.
    pub fn handle_writable(&mut self) {
        while let Some(pending) = self.pending.pop_front() {
            match self.io.send_to(&pending.data, pending.to) {
                Ok(n) => {
                    self.bytes_sent += n as u64;

                    let ok = n == pending.data.len();
                    if !ok {
                        self.send_errors += 1;
                    }
                    if let Some(cb) = pending.on_complete {
                        cb(ok);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending.push_front(pending);
                    return;
                }
                Err(e) => {
                    self.send_errors += 1;
                    warn!("udp send failed: {e}");
                    if let Some(cb) = pending.on_complete {
                        cb(false);
                    }
                }
            }
        }
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Close the socket. Idempotent; queued send callbacks fire with
    /// failure.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;

        for pending in self.pending.drain(..) {
            if let Some(cb) = pending.on_complete {
                cb(false);
            }
        }
    }
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&mut self, data: &[u8], to: SocketAddr, on_complete: Option<SendCallback>) {
        if self.closed {
            if let Some(cb) = on_complete {
                cb(false);
            }
            return;
        }

        match self.io.send_to(data, to) {
            Ok(n) => {
                // A truncated send still counts the bytes that left, but
                // reports failure to the caller. Intentional bookkeeping:
                // the wire saw them even though the datagram is unusable.
                self.bytes_sent += n as u64;

                let ok = n == data.len();
                if !ok {
                    self.send_errors += 1;
                }
                if let Some(cb) = on_complete {
                    cb(ok);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Copy payload and callback into one owned block and
                // queue for the next writable event.
                self.pending.push_back(PendingSend {
                    data: data.to_vec(),
                    to,
                    on_complete,
                });
            }
            Err(e) => {
                self.send_errors += 1;
                warn!("udp send failed: {e}");
                if let Some(cb) = on_complete {
                    cb(false);
                }
            }
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
