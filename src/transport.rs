//! TCP message channel.
//!
//! Frames are `[kind: u8][len: u32 BE][payload]`. Text frames carry JSON
//! records, binary frames carry image data, ping/pong are the transport-level
//! liveness probe. Everything runs on a non-blocking socket so the control
//! loop never stalls on the network.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use crate::config::Endpoint;
use crate::traits::{Channel, ChannelEvent, ConnectProgress};

pub const FRAME_HEADER_LEN: usize = 5;
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

// Outbound data we are willing to hold while the socket is backed up.
const MAX_PENDING_TX: usize = 2 * MAX_FRAME_LEN;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameKind {
    pub fn to_u8(self) -> u8 {
        match self {
            FrameKind::Text => 0x01,
            FrameKind::Binary => 0x02,
            FrameKind::Close => 0x08,
            FrameKind::Ping => 0x09,
            FrameKind::Pong => 0x0A,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameKind::Text),
            0x02 => Some(FrameKind::Binary),
            0x08 => Some(FrameKind::Close),
            0x09 => Some(FrameKind::Ping),
            0x0A => Some(FrameKind::Pong),
            _ => None,
        }
    }
}

pub fn encode_frame(kind: FrameKind, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(anyhow!("frame too large: {} bytes", payload.len()));
    }
    out.write_u8(kind.to_u8())?;
    out.write_u32::<BigEndian>(payload.len() as u32)?;
    out.extend_from_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `buf`.
/// Returns Ok(None) until a complete frame is buffered.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(FrameKind, Vec<u8>, usize)>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let kind = FrameKind::from_u8(buf[0])
        .ok_or_else(|| anyhow!("unknown frame kind 0x{:02x}", buf[0]))?;
    let len = BigEndian::read_u32(&buf[1..FRAME_HEADER_LEN]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("frame length {} exceeds limit", len));
    }

    let total = FRAME_HEADER_LEN + len;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((kind, buf[FRAME_HEADER_LEN..total].to_vec(), total)))
}

enum Phase {
    Connecting { deadline: Instant },
    Established,
}

struct Connection {
    socket: Socket,
    peer: SocketAddr,
    phase: Phase,
    rx: Vec<u8>,
    tx: Vec<u8>,
}

impl Connection {
    fn flush(&mut self) -> Result<()> {
        while !self.tx.is_empty() {
            match self.socket.write(&self.tx) {
                Ok(0) => return Err(anyhow!("socket closed while writing")),
                Ok(n) => {
                    self.tx.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn queue(&mut self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        if self.tx.len() + FRAME_HEADER_LEN + payload.len() > MAX_PENDING_TX {
            return Err(anyhow!("send buffer full ({} bytes pending)", self.tx.len()));
        }
        encode_frame(kind, payload, &mut self.tx)?;
        self.flush()
    }

    /// Returns false once the peer has closed its side.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.rx.extend_from_slice(&chunk[..n]);
                    if self.rx.len() >= FRAME_HEADER_LEN + MAX_FRAME_LEN {
                        return Ok(true);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Length-prefixed framing over a non-blocking TCP socket.
pub struct TcpChannel {
    connect_timeout: Duration,
    conn: Option<Connection>,
}

impl TcpChannel {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpChannel {
            connect_timeout,
            conn: None,
        }
    }

    fn established(&mut self) -> Result<&mut Connection> {
        match self.conn.as_mut() {
            Some(conn) if matches!(conn.phase, Phase::Established) => Ok(conn),
            _ => Err(anyhow!("channel not open")),
        }
    }
}

fn connect_in_progress(e: &std::io::Error) -> bool {
    if e.kind() == ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        if e.raw_os_error() == Some(libc::EINPROGRESS) {
            return true;
        }
    }
    false
}

/// Connect never does a name lookup; the endpoint must already be resolved.
fn peer_address(endpoint: &Endpoint) -> Result<SocketAddr> {
    let ip: IpAddr = endpoint
        .host
        .parse()
        .map_err(|_| anyhow!("{} is not an address literal; resolve it before connecting", endpoint.host))?;
    Ok(SocketAddr::new(ip, endpoint.port))
}

impl Channel for TcpChannel {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<ConnectProgress> {
        self.close();

        let peer = peer_address(endpoint)?;

        let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let phase = match socket.connect(&SockAddr::from(peer)) {
            Ok(()) => Phase::Established,
            Err(ref e) if connect_in_progress(e) => Phase::Connecting {
                deadline: Instant::now() + self.connect_timeout,
            },
            Err(e) => return Err(e.into()),
        };

        let progress = match phase {
            Phase::Established => ConnectProgress::Established,
            Phase::Connecting { .. } => ConnectProgress::Pending,
        };
        debug!("Connecting to {}", peer);

        self.conn = Some(Connection {
            socket,
            peer,
            phase,
            rx: Vec::new(),
            tx: Vec::new(),
        });
        Ok(progress)
    }

    fn poll_connect(&mut self) -> Result<ConnectProgress> {
        let conn = self.conn.as_mut().ok_or_else(|| anyhow!("no connection attempt"))?;

        let deadline = match conn.phase {
            Phase::Established => return Ok(ConnectProgress::Established),
            Phase::Connecting { deadline } => deadline,
        };

        if let Some(e) = conn.socket.take_error()? {
            self.conn = None;
            return Err(e.into());
        }

        match conn.socket.peer_addr() {
            Ok(_) => {
                conn.phase = Phase::Established;
                info!("Channel established with {}", conn.peer);
                Ok(ConnectProgress::Established)
            }
            Err(ref e) if e.kind() == ErrorKind::NotConnected => {
                if Instant::now() >= deadline {
                    let peer = conn.peer;
                    self.conn = None;
                    Err(anyhow!("connect to {} timed out", peer))
                } else {
                    Ok(ConnectProgress::Pending)
                }
            }
            Err(e) => {
                self.conn = None;
                Err(e.into())
            }
        }
    }

    fn poll(&mut self) -> Result<Option<ChannelEvent>> {
        let conn = match self.conn.as_mut() {
            Some(conn) if matches!(conn.phase, Phase::Established) => conn,
            _ => return Ok(None),
        };

        conn.flush()?;
        let open = conn.fill()?;

        loop {
            let (kind, payload, used) = match decode_frame(&conn.rx)? {
                Some(frame) => frame,
                None => break,
            };
            conn.rx.drain(..used);

            match kind {
                FrameKind::Text => return Ok(Some(ChannelEvent::Text(payload))),
                FrameKind::Binary => return Ok(Some(ChannelEvent::Binary(payload))),
                FrameKind::Pong => return Ok(Some(ChannelEvent::Pong)),
                FrameKind::Ping => {
                    conn.queue(FrameKind::Pong, &payload)?;
                    return Ok(Some(ChannelEvent::Ping));
                }
                FrameKind::Close => {
                    self.close();
                    return Ok(Some(ChannelEvent::Closed));
                }
            }
        }

        if !open {
            self.close();
            return Ok(Some(ChannelEvent::Closed));
        }
        Ok(None)
    }

    fn send_text(&mut self, payload: &str) -> Result<()> {
        self.established()?.queue(FrameKind::Text, payload.as_bytes())
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.established()?.queue(FrameKind::Binary, data)
    }

    fn ping(&mut self) -> Result<()> {
        self.established()?.queue(FrameKind::Ping, &[])
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if matches!(conn.phase, Phase::Established) {
                let mut bye = Vec::with_capacity(FRAME_HEADER_LEN);
                if encode_frame(FrameKind::Close, &[], &mut bye).is_ok() {
                    conn.tx.extend_from_slice(&bye);
                    let _ = conn.flush();
                }
            }
            if let Err(e) = conn.socket.shutdown(Shutdown::Both) {
                debug!("Socket shutdown: {}", e);
            }
            if !conn.tx.is_empty() {
                warn!("Dropped {} unsent bytes on close", conn.tx.len());
            }
        }
    }
}
