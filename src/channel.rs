//! Per-connection channel: one non-blocking socket plus its byte buffers.
//!
//! A channel comes in two variants with a common capability set. The plain
//! variant reads and writes the socket through application-level buffers.
//! The secure variant interposes a TLS session: reads pull records off the
//! socket and hand out plaintext, writes encrypt into an outbound buffer
//! that is drained opportunistically. Channels are recycled through the
//! endpoint's channel cache; `reset` rebinds a recycled channel to a fresh
//! socket.

use bytes::{Buf, BufMut, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

/// Outcome of a handshake step. `NeedRead`/`NeedWrite` name the interest the
/// caller must re-register before the handshake can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    NeedRead,
    NeedWrite,
}

struct TlsSession {
    session: rustls::ServerConnection,
    /// Encrypted bytes waiting to go out on the wire.
    out: BytesMut,
}

pub struct Channel {
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    read_cap: usize,
    write_buf: BytesMut,
    write_cap: usize,
    tls: Option<TlsSession>,
}

impl Channel {
    pub(crate) fn new(read_cap: usize, write_cap: usize) -> Self {
        Self {
            stream: None,
            read_buf: BytesMut::with_capacity(read_cap),
            read_cap,
            write_buf: BytesMut::with_capacity(write_cap),
            write_cap,
            tls: None,
        }
    }

    /// Placeholder left behind when a closed channel is recycled.
    pub(crate) fn shell() -> Self {
        Self::new(0, 0)
    }

    /// Rebind a (new or recycled) channel to an accepted socket. A secure
    /// endpoint gets a fresh TLS session per connection.
    pub(crate) fn reset(
        &mut self,
        stream: TcpStream,
        tls_config: Option<&Arc<rustls::ServerConfig>>,
    ) -> Result<(), rustls::Error> {
        self.read_buf.clear();
        self.write_buf.clear();
        self.tls = match tls_config {
            Some(config) => Some(TlsSession {
                session: rustls::ServerConnection::new(config.clone())?,
                out: BytesMut::with_capacity(16384),
            }),
            None => None,
        };
        self.stream = Some(stream);
        Ok(())
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Plain channels are born with a complete handshake.
    pub(crate) fn handshake_complete(&self) -> bool {
        match &self.tls {
            Some(tls) => !tls.session.is_handshaking(),
            None => true,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Advance the TLS handshake as far as current socket readiness allows.
    /// The hints say which readiness the caller observed; socket-level
    /// `WouldBlock` is authoritative either way.
    pub(crate) fn handshake(
        &mut self,
        readable: bool,
        writable: bool,
    ) -> io::Result<HandshakeStatus> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(HandshakeStatus::Complete);
        };
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        loop {
            while tls.session.wants_write() {
                let mut sink = (&mut tls.out).writer();
                tls.session.write_tls(&mut sink)?;
            }
            if !tls.out.is_empty() {
                if !writable {
                    return Ok(HandshakeStatus::NeedWrite);
                }
                while !tls.out.is_empty() {
                    match stream.write(&tls.out) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => tls.out.advance(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(HandshakeStatus::NeedWrite);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            if !tls.session.is_handshaking() {
                return Ok(HandshakeStatus::Complete);
            }
            if tls.session.wants_read() {
                if !readable {
                    return Ok(HandshakeStatus::NeedRead);
                }
                match tls.session.read_tls(stream) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {
                        tls.session
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::NeedRead);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                return Ok(HandshakeStatus::NeedRead);
            }
        }
    }

    /// Read application bytes. `Ok(0)` is end-of-stream; `WouldBlock` means
    /// no data is currently available.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // buffered leftover from an earlier fill goes out first
        if !self.read_buf.is_empty() {
            let n = buf.len().min(self.read_buf.len());
            buf[..n].copy_from_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return Ok(n);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        if let Some(tls) = self.tls.as_mut() {
            loop {
                match tls.session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                match tls.session.read_tls(stream) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        tls.session
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if buf.len() >= self.read_cap {
            // caller buffer is at least as large as ours, skip the copy
            return stream.read(buf);
        }

        // fill the channel buffer, hand back what fits, keep the rest
        self.read_buf.resize(self.read_cap, 0);
        match stream.read(&mut self.read_buf[..]) {
            Ok(n) => {
                self.read_buf.truncate(n);
                let out = buf.len().min(n);
                buf[..out].copy_from_slice(&self.read_buf[..out]);
                self.read_buf.advance(out);
                Ok(out)
            }
            Err(e) => {
                self.read_buf.clear();
                Err(e)
            }
        }
    }

    /// Queue application bytes for writing, flushing opportunistically.
    /// Returns how many bytes were accepted; `WouldBlock` when the write
    /// buffer is full and the socket takes nothing.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut free = self.write_cap.saturating_sub(self.write_buf.len());
        if free == 0 {
            self.flush_outbound()?;
            free = self.write_cap.saturating_sub(self.write_buf.len());
            if free == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }
        let n = free.min(data.len());
        self.write_buf.extend_from_slice(&data[..n]);
        self.flush_outbound()?;
        Ok(n)
    }

    /// Drain buffered outbound bytes to the socket. Returns `true` once
    /// everything (application and encrypted) is on the wire.
    pub fn flush_outbound(&mut self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(self.write_buf.is_empty());
        };

        if let Some(tls) = self.tls.as_mut() {
            loop {
                while !tls.out.is_empty() {
                    match stream.write(&tls.out) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => tls.out.advance(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
                if tls.session.wants_write() {
                    let mut sink = (&mut tls.out).writer();
                    tls.session.write_tls(&mut sink)?;
                    continue;
                }
                if !self.write_buf.is_empty() {
                    let n = tls.session.writer().write(&self.write_buf)?;
                    self.write_buf.advance(n);
                    continue;
                }
                return Ok(true);
            }
        }

        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Bytes queued but not yet on the wire.
    pub fn outbound_remaining(&self) -> usize {
        let tls_out = self.tls.as_ref().map(|t| t.out.len()).unwrap_or(0);
        self.write_buf.len() + tls_out
    }

    /// Close the channel. The TLS variant sends `close_notify` first so the
    /// peer sees a clean shutdown, then the socket is shut down and dropped.
    pub(crate) fn close(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.session.send_close_notify();
        }
        let _ = self.flush_outbound();
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.tls = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::time::Duration;

    /// Loopback pair: a mio stream for the channel plus the std peer.
    fn stream_pair() -> (TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn read_eventually(channel: &mut Channel, buf: &mut [u8]) -> usize {
        for _ in 0..200 {
            match channel.read(buf) {
                Ok(n) => return n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        panic!("no data arrived");
    }

    #[test]
    fn plain_handshake_is_complete() {
        let (stream, _peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, None).unwrap();
        assert!(channel.handshake_complete());
        assert_eq!(
            channel.handshake(true, true).unwrap(),
            HandshakeStatus::Complete
        );
    }

    #[test]
    fn plain_read_buffers_small_reads() {
        let (stream, mut peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, None).unwrap();

        peer.write_all(b"hello world").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(read_eventually(&mut channel, &mut buf), 5);
        assert_eq!(&buf, b"hello");

        // remainder was buffered in the channel, no socket read needed
        let mut rest = [0u8; 16];
        let n = channel.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b" world");
    }

    #[test]
    fn plain_read_direct_with_large_buffer() {
        let (stream, mut peer) = stream_pair();
        let mut channel = Channel::new(8, 64);
        channel.reset(stream, None).unwrap();

        peer.write_all(b"0123456789abcdef").unwrap();

        let mut buf = [0u8; 32];
        let n = read_eventually(&mut channel, &mut buf);
        assert!(n > 0);
    }

    #[test]
    fn plain_read_would_block_when_idle() {
        let (stream, _peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, None).unwrap();

        let mut buf = [0u8; 8];
        let err = channel.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn plain_read_eof_on_peer_close() {
        let (stream, peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, None).unwrap();

        drop(peer);

        let mut buf = [0u8; 8];
        assert_eq!(read_eventually(&mut channel, &mut buf), 0);
    }

    #[test]
    fn write_is_capped_by_buffer_size() {
        let (stream, _peer) = stream_pair();
        let mut channel = Channel::new(64, 4);
        channel.reset(stream, None).unwrap();

        // at most write_cap bytes accepted per call
        let n = channel.write(b"0123456789").unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn write_reaches_peer() {
        let (stream, mut peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, None).unwrap();

        channel.write(b"ping").unwrap();
        assert!(channel.flush_outbound().unwrap());
        assert_eq!(channel.outbound_remaining(), 0);

        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn reset_clears_buffers() {
        let (stream, mut peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, None).unwrap();

        peer.write_all(b"stale").unwrap();
        let mut buf = [0u8; 2];
        read_eventually(&mut channel, &mut buf);
        channel.close();

        let (stream2, _peer2) = stream_pair();
        channel.reset(stream2, None).unwrap();
        assert_eq!(channel.outbound_remaining(), 0);
        let err = channel.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn secure_handshake_needs_read_first() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::pki_types::CertificateDer::from(cert.cert)],
                key.into(),
            )
            .unwrap();
        let config = Arc::new(config);

        let (stream, _peer) = stream_pair();
        let mut channel = Channel::new(64, 64);
        channel.reset(stream, Some(&config)).unwrap();

        assert!(channel.is_secure());
        assert!(!channel.handshake_complete());
        // no ClientHello on the wire yet
        assert_eq!(
            channel.handshake(true, true).unwrap(),
            HandshakeStatus::NeedRead
        );
    }
}
