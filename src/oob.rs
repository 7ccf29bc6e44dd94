//! Out-of-band transport over TCP, optionally wrapped in TLS
//!
//! Every message on the stream is a frame:
//!
//! ```text
//! [magic: u32][total_length: u32][payload: total_length - 8 bytes]
//! ```
//!
//! and every payload is a 16-byte OOB header followed by one MAD. The socket
//! is non-blocking after connect; [`OobConnection::process`] resumes partial
//! reads and writes from where the previous call stopped.

use crate::mad::peek_tid;
use crate::transport::{Destination, Transport, TransportKind};
use crate::{MadError, MadResult, TlsConfig};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const NET_MAGIC: u32 = 0x31E0_CC01;
pub const FRAME_HEADER_LEN: usize = 8;
pub const OOB_HEADER_LEN: usize = 16;
pub const OOB_HEADER_VERSION: u32 = 0x80;
/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 1 << 24;

const PROCESS_WAIT: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix `payload` with the frame magic and total length
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let total = (payload.len() + FRAME_HEADER_LEN) as u32;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&NET_MAGIC.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Wrap a MAD in the OOB packet header
pub fn encode_oob_packet(mad: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OOB_HEADER_LEN + mad.len());
    out.extend_from_slice(&OOB_HEADER_VERSION.to_be_bytes());
    out.extend_from_slice(&(mad.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(mad);
    out
}

/// Extract the MAD from an OOB packet, trusting the header's length
pub fn decode_oob_packet(packet: &[u8]) -> MadResult<Vec<u8>> {
    if packet.len() < OOB_HEADER_LEN {
        return Err(MadError::error(format!("OOB packet of {} bytes has no header", packet.len())));
    }
    let length = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]) as usize;
    packet
        .get(OOB_HEADER_LEN..OOB_HEADER_LEN + length)
        .map(|mad| mad.to_vec())
        .ok_or_else(|| {
            MadError::error(format!(
                "OOB header claims {} bytes, packet carries {}",
                length,
                packet.len() - OOB_HEADER_LEN
            ))
        })
}

/// Receive state of the frame currently being read
#[derive(Debug)]
pub struct BlobInProgress {
    header: [u8; FRAME_HEADER_LEN],
    body: Option<Vec<u8>>,
    filled: usize,
}

impl Default for BlobInProgress {
    fn default() -> Self {
        Self {
            header: [0u8; FRAME_HEADER_LEN],
            body: None,
            filled: 0,
        }
    }
}

impl BlobInProgress {
    /// The bytes still missing from the current header or body; never empty
    pub fn remaining_mut(&mut self) -> &mut [u8] {
        match self.body.as_mut() {
            Some(body) => &mut body[self.filled..],
            None => &mut self.header[self.filled..],
        }
    }

    /// Account for `n` bytes written into [`remaining_mut`](Self::remaining_mut).
    /// Returns the payload once a frame completes.
    pub fn advance(&mut self, n: usize) -> MadResult<Option<Vec<u8>>> {
        self.filled += n;
        let wanted = self.body.as_ref().map_or(FRAME_HEADER_LEN, |body| body.len());
        if self.filled < wanted {
            return Ok(None);
        }
        self.filled = 0;
        if self.body.is_some() {
            return Ok(self.body.take());
        }

        let magic = u32::from_be_bytes([self.header[0], self.header[1], self.header[2], self.header[3]]);
        if magic != NET_MAGIC {
            return Err(MadError::error(format!("bad frame magic 0x{:08x}", magic)));
        }
        let total = u32::from_be_bytes([self.header[4], self.header[5], self.header[6], self.header[7]]) as usize;
        if !(FRAME_HEADER_LEN..=MAX_FRAME_LEN).contains(&total) {
            return Err(MadError::error(format!("bad frame length {}", total)));
        }
        if total == FRAME_HEADER_LEN {
            return Ok(Some(Vec::new()));
        }
        self.body = Some(vec![0u8; total - FRAME_HEADER_LEN]);
        Ok(None)
    }
}

struct OutBlob {
    data: Vec<u8>,
    sent: usize,
}

struct TlsWire {
    conn: ClientConnection,
    sock: TcpStream,
}

enum Wire {
    Plain(TcpStream),
    Tls(Box<TlsWire>),
}

impl Wire {
    fn socket(&self) -> &TcpStream {
        match self {
            Wire::Plain(sock) => sock,
            Wire::Tls(tls) => &tls.sock,
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Wire::Plain(_) => false,
            Wire::Tls(tls) => tls.conn.wants_write(),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Wire::Plain(sock) => sock.read(buf),
            Wire::Tls(tls) => loop {
                match tls.conn.reader().read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    other => return other,
                }
                if tls.conn.read_tls(&mut tls.sock)? == 0 {
                    return Ok(0);
                }
                tls.conn
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            },
        }
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Wire::Plain(sock) => sock.write(buf),
            Wire::Tls(tls) => {
                let n = tls.conn.writer().write(buf)?;
                self.flush_tls()?;
                Ok(n)
            }
        }
    }

    fn flush_tls(&mut self) -> io::Result<()> {
        if let Wire::Tls(tls) = self {
            while tls.conn.wants_write() {
                match tls.conn.write_tls(&mut tls.sock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// A framed, non-blocking connection to an out-of-band management service
pub struct OobConnection {
    wire: Wire,
    recv_blob: BlobInProgress,
    recv_queue: VecDeque<Vec<u8>>,
    send_queue: VecDeque<OutBlob>,
    err: bool,
}

impl OobConnection {
    fn new(wire: Wire) -> Self {
        Self {
            wire,
            recv_blob: BlobInProgress::default(),
            recv_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
            err: false,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.err
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.wire, Wire::Tls(_))
    }

    /// Queue one payload for sending as a frame
    pub fn enqueue(&mut self, payload: &[u8]) {
        self.send_queue.push_back(OutBlob {
            data: encode_frame(payload),
            sent: 0,
        });
    }

    /// Take the next fully received payload
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        self.recv_queue.pop_front()
    }

    /// Drop receive state left by an abandoned request along with queued
    /// requests not yet started. A frame already partly written is kept so
    /// the peer's framing stays intact.
    pub fn discard_partial(&mut self) {
        if self.recv_blob.filled > 0 || self.recv_blob.body.is_some() {
            debug!("discarding partially received frame ({} bytes)", self.recv_blob.filled);
        }
        self.recv_blob = BlobInProgress::default();
        self.recv_queue.clear();
        self.send_queue.retain(|blob| blob.sent > 0);
    }

    /// Wait up to `wait` for socket readiness, then push queued output and
    /// pull whatever input is available
    pub fn process(&mut self, wait: Duration) -> MadResult<()> {
        if self.err {
            return Err(MadError::error("connection is in error state"));
        }
        let mut flags = PollFlags::POLLIN;
        if !self.send_queue.is_empty() || self.wire.wants_write() {
            flags |= PollFlags::POLLOUT;
        }
        let timeout = PollTimeout::from(wait.as_millis().min(u16::MAX as u128) as u16);
        let polled = {
            let mut fds = [PollFd::new(self.wire.socket().as_fd(), flags)];
            poll(&mut fds, timeout)
        };
        match polled {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return self.fail(format!("poll failed: {}", e)),
        }

        if let Err(e) = self.write_pending() {
            return self.fail(format!("write failed: {}", e));
        }
        self.read_available()
    }

    fn fail(&mut self, reason: String) -> MadResult<()> {
        error!("OOB connection failed: {}", reason);
        self.err = true;
        Err(MadError::error(reason))
    }

    fn write_pending(&mut self) -> io::Result<()> {
        self.wire.flush_tls()?;
        while let Some(blob) = self.send_queue.front_mut() {
            match self.wire.write_some(&blob.data[blob.sent..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no data")),
                Ok(n) => {
                    blob.sent += n;
                    debug!("wrote {} bytes, {} to go", n, blob.data.len() - blob.sent);
                    if blob.sent == blob.data.len() {
                        self.send_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read_available(&mut self) -> MadResult<()> {
        loop {
            let read = self.wire.read_some(self.recv_blob.remaining_mut());
            match read {
                Ok(0) => return self.fail("peer closed the connection".to_string()),
                Ok(n) => match self.recv_blob.advance(n) {
                    Ok(Some(payload)) => {
                        debug!("received frame of {} bytes", payload.len());
                        self.recv_queue.push_back(payload);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.recv_blob = BlobInProgress::default();
                        return self.fail(e.to_string());
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(format!("read failed: {}", e)),
            }
        }
    }
}

/// Resolve a target as an IPv6 literal, an IPv4 literal, then a host name
pub fn resolve_target(host: &str, port: u16) -> MadResult<Vec<SocketAddr>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        return Ok(vec![SocketAddr::new(IpAddr::V6(v6), port)]);
    }
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Ok(vec![SocketAddr::new(IpAddr::V4(v4), port)]);
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| MadError::invalid_parameter(format!("cannot resolve {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(MadError::invalid_parameter(format!("{} has no addresses", host)));
    }
    Ok(addrs)
}

fn parse_certificates(pem: &[u8]) -> MadResult<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MadError::tls(format!("failed to parse certificates: {}", e)))
}

fn read_pem(path: &std::path::Path) -> MadResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| MadError::tls(format!("cannot read {}: {}", path.display(), e)))
}

/// Build the client TLS configuration: CA bundle required, client
/// certificate and key optional but only together
pub fn client_config(tls: &TlsConfig) -> MadResult<ClientConfig> {
    let ca_file = tls
        .ca_file
        .as_ref()
        .ok_or_else(|| MadError::tls("CA certificate file required"))?;
    let ca_certs = parse_certificates(&read_pem(ca_file)?)?;
    if ca_certs.is_empty() {
        return Err(MadError::tls(format!("no CA certificates in {}", ca_file.display())));
    }
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| MadError::tls(format!("failed to add CA certificate: {}", e)))?;
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| MadError::tls(format!("protocol versions: {}", e)))?
        .with_root_certificates(roots);

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = parse_certificates(&read_pem(cert_file)?)?;
            if certs.is_empty() {
                return Err(MadError::tls(format!("no certificates in {}", cert_file.display())));
            }
            let key = PrivateKeyDer::from_pem_slice(&read_pem(key_file)?)
                .map_err(|e| MadError::tls(format!("failed to parse private key: {}", e)))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| MadError::tls(format!("client certificate: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(MadError::tls("client certificate and key must be given together")),
    }
}

fn tls_handshake(mut sock: TcpStream, host: &str, tls: &TlsConfig) -> MadResult<Wire> {
    let config = client_config(tls)?;
    let name = tls.server_name.clone().unwrap_or_else(|| host.to_string());
    let server_name =
        ServerName::try_from(name.clone()).map_err(|e| MadError::invalid_parameter(format!("server name {}: {}", name, e)))?;
    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| MadError::tls(format!("TLS session: {}", e)))?;

    sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)
            .map_err(|e| MadError::reject(format!("TLS handshake with {} failed: {}", name, e)))?;
    }
    sock.set_read_timeout(None)?;
    info!("TLS session established with {}", name);
    Ok(Wire::Tls(Box::new(TlsWire { conn, sock })))
}

/// `Transport` over an out-of-band connection
pub struct OobTransport {
    conn: OobConnection,
    peer: String,
}

impl OobTransport {
    pub fn connect(host: &str, port: u16, tls: Option<&TlsConfig>) -> MadResult<Self> {
        let addrs = resolve_target(host, port)?;
        let sock = addrs
            .iter()
            .find_map(|addr| match TcpStream::connect_timeout(addr, CONNECT_TIMEOUT) {
                Ok(sock) => Some(sock),
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    None
                }
            })
            .ok_or_else(|| MadError::unavailable(format!("OOB service at {}:{}", host, port)))?;
        sock.set_nodelay(true)?;
        info!("Connected to OOB service at {}:{}", host, port);

        let wire = match tls {
            Some(tls) => tls_handshake(sock, host, tls)?,
            None => Wire::Plain(sock),
        };
        wire.socket().set_nonblocking(true)?;
        Ok(Self {
            conn: OobConnection::new(wire),
            peer: format!("{}:{}", host, port),
        })
    }

    pub fn connection(&mut self) -> &mut OobConnection {
        &mut self.conn
    }
}

impl Transport for OobTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::OutOfBand
    }

    fn resends_on_timeout(&self) -> bool {
        false
    }

    fn send_receive(&mut self, request: &[u8], _dest: &Destination, timeout_ms: u64) -> MadResult<Vec<u8>> {
        let tid = peek_tid(request).ok_or_else(|| MadError::invalid_parameter("request shorter than MAD header"))?;
        self.conn.enqueue(&encode_oob_packet(request));
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            self.conn.process(PROCESS_WAIT)?;
            while let Some(payload) = self.conn.next_message() {
                let mad = match decode_oob_packet(&payload) {
                    Ok(mad) => mad,
                    Err(e) => {
                        warn!("Discarding malformed OOB response: {}", e);
                        continue;
                    }
                };
                match peek_tid(&mad) {
                    Some(got) if got as u32 == tid as u32 => return Ok(mad),
                    got => warn!("Discarding OOB response with tid {:?} (waiting for 0x{:x})", got, tid),
                }
            }
            if Instant::now() >= deadline {
                debug!("No OOB response from {} within {}ms", self.peer, timeout_ms);
                self.conn.discard_partial();
                return Err(MadError::Timeout { timeout_ms });
            }
        }
    }

    fn send(&mut self, mad: &[u8], _dest: &Destination) -> MadResult<()> {
        self.conn.enqueue(&encode_oob_packet(mad));
        self.conn.process(Duration::ZERO)
    }

    fn close(&mut self) {
        if let Wire::Tls(tls) = &mut self.conn.wire {
            tls.conn.send_close_notify();
        }
        let _ = self.conn.wire.flush_tls();
        let _ = self.conn.wire.socket().shutdown(std::net::Shutdown::Both);
        info!("Closed OOB connection to {}", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::TcpListener;
    use std::thread;

    fn feed_in_chunks(frame: &[u8], chunk: usize) -> MadResult<Vec<Vec<u8>>> {
        let mut blob = BlobInProgress::default();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < frame.len() {
            let want = blob.remaining_mut();
            let n = want.len().min(chunk).min(frame.len() - pos);
            want[..n].copy_from_slice(&frame[pos..pos + n]);
            pos += n;
            if let Some(payload) = blob.advance(n)? {
                out.push(payload);
            }
        }
        Ok(out)
    }

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn read_frame(sock: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 8];
        sock.read_exact(&mut header).unwrap();
        let total = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; total - 8];
        sock.read_exact(&mut body).unwrap();
        body
    }

    fn mad_with_tid(tid: u64) -> Vec<u8> {
        let mut mad = vec![0u8; 56];
        mad[0] = 0x80;
        mad[1] = 0x03;
        mad[3] = 0x01;
        mad[8..16].copy_from_slice(&tid.to_be_bytes());
        mad
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&[1, 2, 3, 4]);
        assert_eq!(&frame[..8], &[0x31, 0xe0, 0xcc, 0x01, 0, 0, 0, 12]);
        assert_eq!(feed_in_chunks(&frame, 3).unwrap(), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut frame = vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 12];
        frame.extend_from_slice(&[1, 2, 3, 4]);
        assert!(feed_in_chunks(&frame, 64).is_err());
    }

    #[test]
    fn test_short_total_length_rejected() {
        let mut frame = encode_frame(&[]);
        frame[7] = 4;
        assert!(feed_in_chunks(&frame, 64).is_err());
    }

    #[test]
    fn test_oob_packet_header() {
        let mad = mad_with_tid(9);
        let packet = encode_oob_packet(&mad);
        assert_eq!(&packet[..8], &[0, 0, 0, 0x80, 0, 0, 0, 56]);
        assert_eq!(decode_oob_packet(&packet).unwrap(), mad);
        assert!(decode_oob_packet(&packet[..40]).is_err());
    }

    #[test]
    fn test_resolve_target_forms() {
        assert!(resolve_target("::1", 3245).unwrap()[0].is_ipv6());
        assert!(resolve_target("[::1]", 3245).unwrap()[0].is_ipv6());
        assert!(resolve_target("127.0.0.1", 3245).unwrap()[0].is_ipv4());
        assert!(matches!(
            resolve_target("no such host.invalid", 1),
            Err(MadError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_connect_refused_is_unavailable() {
        let (listener, port) = listener();
        drop(listener);
        assert!(matches!(
            OobTransport::connect("127.0.0.1", port, None),
            Err(MadError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_request_response_over_tcp() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let request = decode_oob_packet(&read_frame(&mut sock)).unwrap();
            let mut stale = request.clone();
            stale[15] ^= 0x55;
            stale[3] = 0x81;
            let mut response = request;
            response[3] = 0x81;
            for mad in [stale, response] {
                let frame = encode_frame(&encode_oob_packet(&mad));
                for chunk in frame.chunks(7) {
                    sock.write_all(chunk).unwrap();
                }
            }
            thread::sleep(Duration::from_millis(100));
        });

        let mut transport = OobTransport::connect("127.0.0.1", port, None).unwrap();
        let rsp = transport
            .send_receive(&mad_with_tid(0x42), &Destination::default(), 2000)
            .unwrap();
        assert_eq!(rsp[3], 0x81);
        assert_eq!(peek_tid(&rsp), Some(0x42));
        transport.close();
        server.join().unwrap();
    }

    #[test]
    fn test_bad_magic_marks_connection_errored() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = read_frame(&mut sock);
            sock.write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 12, 1, 2, 3, 4]).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut transport = OobTransport::connect("127.0.0.1", port, None).unwrap();
        let err = transport
            .send_receive(&mad_with_tid(1), &Destination::default(), 2000)
            .unwrap_err();
        assert!(matches!(err, MadError::Error { .. }));
        assert!(transport.connection().is_errored());
        assert!(transport.connection().next_message().is_none());
        server.join().unwrap();
    }

    #[test]
    fn test_silent_peer_times_out_once() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = read_frame(&mut sock);
            thread::sleep(Duration::from_millis(400));
        });

        let mut transport = OobTransport::connect("127.0.0.1", port, None).unwrap();
        let start = Instant::now();
        let err = transport
            .send_receive(&mad_with_tid(1), &Destination::default(), 200)
            .unwrap_err();
        assert!(matches!(err, MadError::Timeout { timeout_ms: 200 }));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!transport.resends_on_timeout());
        server.join().unwrap();
    }

    #[test]
    fn test_timeout_discards_partial_frame() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let first = decode_oob_packet(&read_frame(&mut sock)).unwrap();
            let frame = encode_frame(&encode_oob_packet(&first));
            sock.write_all(&frame[..20]).unwrap();

            let mut second = decode_oob_packet(&read_frame(&mut sock)).unwrap();
            second[3] = 0x81;
            sock.write_all(&encode_frame(&encode_oob_packet(&second))).unwrap();
            thread::sleep(Duration::from_millis(100));
        });

        let mut transport = OobTransport::connect("127.0.0.1", port, None).unwrap();
        let err = transport
            .send_receive(&mad_with_tid(1), &Destination::default(), 200)
            .unwrap_err();
        assert!(matches!(err, MadError::Timeout { timeout_ms: 200 }));
        assert!(!transport.connection().is_errored());

        let rsp = transport
            .send_receive(&mad_with_tid(2), &Destination::default(), 2000)
            .unwrap();
        assert_eq!(peek_tid(&rsp), Some(2));
        assert_eq!(rsp[3], 0x81);
        server.join().unwrap();
    }

    #[test]
    fn test_malformed_packet_skipped() {
        let (listener, port) = listener();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut response = decode_oob_packet(&read_frame(&mut sock)).unwrap();
            sock.write_all(&encode_frame(&[0u8; 4])).unwrap();
            response[3] = 0x81;
            sock.write_all(&encode_frame(&encode_oob_packet(&response))).unwrap();
            thread::sleep(Duration::from_millis(100));
        });

        let mut transport = OobTransport::connect("127.0.0.1", port, None).unwrap();
        let rsp = transport
            .send_receive(&mad_with_tid(7), &Destination::default(), 2000)
            .unwrap();
        assert_eq!(peek_tid(&rsp), Some(7));
        server.join().unwrap();
    }

    #[test]
    fn test_tls_config_requires_ca() {
        assert!(matches!(client_config(&TlsConfig::default()), Err(MadError::Tls { .. })));

        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, b"not a certificate").unwrap();
        let tls = TlsConfig {
            ca_file: Some(ca),
            ..Default::default()
        };
        assert!(matches!(client_config(&tls), Err(MadError::Tls { .. })));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_frame_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..65536),
            chunk in 1usize..4096,
        ) {
            let frames = feed_in_chunks(&encode_frame(&payload), chunk).unwrap();
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0], &payload);
        }
    }
}
