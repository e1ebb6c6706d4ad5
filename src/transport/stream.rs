//! Stream transport: fixed 12-byte frames over a local socket to the
//! simulator process.
//!
//! The tricky part is interrupt handling. The peer may push `Irq` frames at
//! any time, including between a request and its response, so every wait
//! accumulates stray interrupts into an instance-local pending mask that the
//! next `wait_irq` drains. EINTR is only allowed to surface when no byte of
//! a frame has been read yet; mid-frame it must be retried or the stream
//! desyncs permanently.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use log::warn;

use crate::error::{HostError, HostResult};
use crate::transport::Transport;
use crate::wire::{Frame, FrameKind, FRAME_LEN};

pub struct StreamTransport {
    endpoint: PathBuf,
    stream: Option<UnixStream>,
    /// Irq bitmasks received while waiting for a response, reported on the
    /// next `wait_irq`.
    pending_irq: u32,
}

impl StreamTransport {
    pub fn new(endpoint: impl Into<PathBuf>) -> StreamTransport {
        StreamTransport { endpoint: endpoint.into(), stream: None, pending_irq: 0 }
    }

    /// Wraps an already-connected stream (tests, pre-established sessions).
    pub fn from_stream(stream: UnixStream) -> StreamTransport {
        StreamTransport { endpoint: PathBuf::new(), stream: Some(stream), pending_irq: 0 }
    }

    fn fd(&self) -> HostResult<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd()).ok_or(HostError::NotConnected)
    }

    /// Reads one frame. With `interruptible`, EINTR before the first byte
    /// returns `None`; EINTR after the first byte always retries.
    fn read_frame(&mut self, interruptible: bool) -> HostResult<Option<Frame>> {
        let fd = self.fd()?;
        let mut raw = [0u8; FRAME_LEN];
        let mut got = 0usize;
        while got < FRAME_LEN {
            let n = unsafe {
                libc::read(fd, raw[got..].as_mut_ptr().cast(), FRAME_LEN - got)
            };
            if n == 0 {
                // Orderly close without a shutdown frame; treat the same.
                self.stream = None;
                return Err(HostError::Shutdown);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    if got == 0 && interruptible {
                        return Ok(None);
                    }
                    continue;
                }
                self.stream = None;
                return Err(HostError::from_peer_io(err));
            }
            got += n as usize;
        }
        Frame::decode(&raw).map(Some)
    }

    fn write_frame(&mut self, frame: &Frame) -> HostResult<()> {
        let fd = self.fd()?;
        let raw = frame.encode();
        let mut sent = 0usize;
        while sent < FRAME_LEN {
            let n = unsafe { libc::write(fd, raw[sent..].as_ptr().cast(), FRAME_LEN - sent) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.stream = None;
                return Err(HostError::from_peer_io(err));
            }
            sent += n as usize;
        }
        Ok(())
    }

    /// Sends one request and reads frames until its response arrives.
    /// Interleaved `Irq` frames accumulate; anything else is a protocol
    /// violation.
    fn transact(&mut self, request: Frame) -> HostResult<Frame> {
        let expect = request.kind;
        self.write_frame(&request)?;
        loop {
            let Some(frame) = self.read_frame(false)? else {
                // Non-interruptible reads retry EINTR internally.
                return Err(HostError::Interrupted);
            };
            match frame.kind {
                FrameKind::Irq => self.pending_irq |= frame.data,
                FrameKind::Shutdown => {
                    self.stream = None;
                    return Err(HostError::Shutdown);
                }
                kind if kind == expect => return Ok(frame),
                kind => {
                    return Err(HostError::Protocol(format!(
                        "unexpected {kind:?} frame while awaiting {expect:?} response"
                    )));
                }
            }
        }
    }
}

impl Transport for StreamTransport {
    fn connect(&mut self) -> HostResult<()> {
        let stream = UnixStream::connect(&self.endpoint).map_err(|e| {
            HostError::Transport(format!("connect {}: {e}", self.endpoint.display()))
        })?;
        self.stream = Some(stream);
        self.pending_irq = 0;
        Ok(())
    }

    fn disconnect(&mut self) -> HostResult<()> {
        // Dropping the stream closes the descriptor.
        self.stream = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read32(&mut self, addr: u32) -> HostResult<u32> {
        let response = self.transact(Frame::read(addr))?;
        // Read responses carry the data where requests carry the address.
        Ok(response.addr)
    }

    fn write32(&mut self, addr: u32, value: u32) -> HostResult<()> {
        self.transact(Frame::write(addr, value))?;
        Ok(())
    }

    fn wait_irq(&mut self) -> HostResult<u32> {
        if self.pending_irq != 0 {
            return Ok(std::mem::take(&mut self.pending_irq));
        }
        loop {
            match self.read_frame(true)? {
                None => return Err(HostError::Interrupted),
                Some(frame) => match frame.kind {
                    FrameKind::Irq => return Ok(frame.data),
                    FrameKind::Shutdown => {
                        self.stream = None;
                        return Err(HostError::Shutdown);
                    }
                    kind => warn!("ignoring stray {kind:?} frame while idle"),
                },
            }
        }
    }

    fn has_irq_support(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};

    /// Runs a scripted peer on the other end of a socketpair.
    fn with_peer(
        script: impl FnOnce(UnixStream) + Send + 'static,
    ) -> (StreamTransport, std::thread::JoinHandle<()>) {
        let (host, peer) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || script(peer));
        (StreamTransport::from_stream(host), handle)
    }

    fn read_one(peer: &mut UnixStream) -> Frame {
        let mut raw = [0u8; FRAME_LEN];
        peer.read_exact(&mut raw).unwrap();
        Frame::decode(&raw).unwrap()
    }

    #[test]
    fn irq_between_request_and_response_is_accumulated() {
        let (mut transport, handle) = with_peer(|mut peer| {
            let request = read_one(&mut peer);
            assert_eq!(request, Frame::read(0x10));
            peer.write_all(&Frame::irq(0b10).encode()).unwrap();
            peer.write_all(&Frame { kind: FrameKind::Read, addr: 0x55, data: 0 }.encode())
                .unwrap();
        });
        assert_eq!(transport.read32(0x10).unwrap(), 0x55);
        // Exactly one later wait returns the mask; it is not duplicated.
        assert_eq!(transport.wait_irq().unwrap(), 0b10);
        handle.join().unwrap();
    }

    #[test]
    fn multiple_stray_irqs_merge_into_one_mask() {
        let (mut transport, handle) = with_peer(|mut peer| {
            let _ = read_one(&mut peer);
            peer.write_all(&Frame::irq(0b01).encode()).unwrap();
            peer.write_all(&Frame::irq(0b100).encode()).unwrap();
            peer.write_all(&Frame { kind: FrameKind::Write, addr: 0, data: 0 }.encode())
                .unwrap();
        });
        transport.write32(0x20, 7).unwrap();
        assert_eq!(transport.wait_irq().unwrap(), 0b101);
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_frame_ends_the_session() {
        let (mut transport, handle) = with_peer(|mut peer| {
            let _ = read_one(&mut peer);
            peer.write_all(&Frame::shutdown().encode()).unwrap();
        });
        assert!(matches!(transport.read32(0), Err(HostError::Shutdown)));
        assert!(!transport.is_connected());
        handle.join().unwrap();
    }

    #[test]
    fn peer_eof_reads_as_shutdown() {
        let (mut transport, handle) = with_peer(|peer| drop(peer));
        handle.join().unwrap();
        assert!(matches!(transport.wait_irq(), Err(HostError::Shutdown)));
        assert!(!transport.is_connected());
    }

    #[test]
    fn response_of_the_wrong_kind_is_a_protocol_error() {
        let (mut transport, handle) = with_peer(|mut peer| {
            let _ = read_one(&mut peer);
            peer.write_all(&Frame { kind: FrameKind::Write, addr: 0, data: 0 }.encode())
                .unwrap();
        });
        assert!(matches!(transport.read32(0), Err(HostError::Protocol(_))));
        handle.join().unwrap();
    }

    #[test]
    fn operations_require_a_connection() {
        let mut transport = StreamTransport::new("/nonexistent/endpoint.sock");
        assert!(matches!(transport.read32(0), Err(HostError::NotConnected)));
        assert!(matches!(transport.write32(0, 0), Err(HostError::NotConnected)));
        assert!(matches!(transport.connect(), Err(HostError::Transport(_))));
    }
}
