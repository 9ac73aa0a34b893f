//! MySQL client protocol connector.
//!
//! Speaks enough of the MySQL client/server protocol (4.1) over tokio TCP to
//! log in, run statements and probe liveness:
//!
//! ```text
//! Server → Client: Initial handshake (v10): version, connection id, scramble, plugin
//! Client → Server: Handshake response: caps, max packet, utf8mb4, user, auth, db, plugin
//! Server → Client: OK | ERR | AuthSwitchRequest (0xFE) | AuthMoreData (0x01)
//! Client → Server: COM_QUERY "SET autocommit=0"
//! ```
//!
//! Every packet is framed as `[payload_len: 3 bytes LE] [seq_id: 1 byte] [payload]`.
//!
//! Supported authentication: `mysql_native_password` and the
//! `caching_sha2_password` fast path (including auth switch between them).
//! Full `caching_sha2_password` authentication needs TLS or RSA key exchange
//! and is reported as a protocol error.
//!
//! Server error codes 1045 and 1698 classify as
//! [`ConnectError::Authentication`]; every other server error is
//! [`ConnectError::Rejected`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{ConnectTarget, Connector, Credentials, Session};
use crate::error::ConnectError;

/// Largest payload carried by a single packet.
const MAX_PACKET_SIZE: usize = 0xFF_FFFF;

/// utf8mb4_general_ci
const UTF8MB4: u8 = 45;

const HANDSHAKE_V10: u8 = 10;

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;

const OK_HEADER: u8 = 0x00;
const AUTH_MORE_DATA: u8 = 0x01;
const LOCAL_INFILE_HEADER: u8 = 0xFB;
const EOF_HEADER: u8 = 0xFE;
const ERR_HEADER: u8 = 0xFF;

const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;

const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

const ER_ACCESS_DENIED_ERROR: u16 = 1045;
const ER_ACCESS_DENIED_NO_PASSWORD_ERROR: u16 = 1698;

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Client capability flags used by this connector.
pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
}

use capability::*;

// ── MysqlConnector ───────────────────────────────────────────────────

/// [`Connector`] for MySQL-compatible servers over plain TCP.
#[derive(Clone, Debug)]
pub struct MysqlConnector {
    /// Bound on TCP connect plus login (default: 5s).
    connect_timeout: Duration,
    /// Bound on each packet read or write once connected (default: 30s).
    io_timeout: Duration,
}

impl MysqlConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

impl Default for MysqlConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let limit = self.connect_timeout;
        let session = timeout(limit, MysqlSession::establish(target, credentials, self.io_timeout))
            .await
            .map_err(|_| ConnectError::Timeout(limit))??;

        tracing::debug!(
            db = %target,
            user = %credentials.username,
            connection_id = session.connection_id,
            server_version = %session.server_version,
            "mysql session established"
        );
        Ok(Box::new(session))
    }
}

// ── MysqlSession ─────────────────────────────────────────────────────

/// An authenticated MySQL session.
pub struct MysqlSession {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    connection_id: u32,
    server_version: String,
    /// Capabilities both sides agreed on.
    capabilities: u32,
    io_timeout: Duration,
    open: bool,
}

impl MysqlSession {
    async fn establish(
        target: &ConnectTarget,
        credentials: &Credentials,
        io_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream: BufReader::new(stream),
            sequence_id: 0,
            connection_id: 0,
            server_version: String::new(),
            capabilities: 0,
            io_timeout,
            open: true,
        };

        let greeting = session.read_packet().await?;
        if greeting.first() == Some(&ERR_HEADER) {
            return Err(server_error(&greeting));
        }
        let handshake = Handshake::parse(&greeting)?;
        if handshake.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(ConnectError::Protocol(
                "server does not support protocol 4.1".into(),
            ));
        }

        session.connection_id = handshake.connection_id;
        session.server_version = handshake.server_version.clone();
        session.authenticate(&handshake, target, credentials).await?;
        session.execute("SET autocommit=0").await?;
        Ok(session)
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    async fn authenticate(
        &mut self,
        handshake: &Handshake,
        target: &ConnectTarget,
        credentials: &Credentials,
    ) -> Result<(), ConnectError> {
        let mut client_flags = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_LONG_PASSWORD
            | CLIENT_LONG_FLAG
            | CLIENT_TRANSACTIONS
            | CLIENT_PLUGIN_AUTH
            | CLIENT_MULTI_RESULTS
            | CLIENT_DEPRECATE_EOF;
        if !target.database.is_empty() {
            client_flags |= CLIENT_CONNECT_WITH_DB;
        }
        client_flags &= handshake.capabilities;
        self.capabilities = client_flags;

        // Unknown plugins get a native scramble; the server answers with an
        // auth switch if it wants something else.
        let mut plugin = match handshake.auth_plugin.as_str() {
            CACHING_SHA2_PASSWORD => CACHING_SHA2_PASSWORD,
            _ => NATIVE_PASSWORD,
        }
        .to_string();
        let auth_response = scramble_for(&plugin, &credentials.password, &handshake.scramble)?;

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(credentials.username.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        if client_flags & CLIENT_CONNECT_WITH_DB != 0 {
            response.put_slice(target.database.as_bytes());
            response.put_u8(0);
        }
        if client_flags & CLIENT_PLUGIN_AUTH != 0 {
            response.put_slice(plugin.as_bytes());
            response.put_u8(0);
        }
        self.write_packet(&response).await?;

        loop {
            let packet = self.read_packet().await?;
            match packet.first() {
                Some(&OK_HEADER) => return Ok(()),
                Some(&ERR_HEADER) => return Err(server_error(&packet)),
                Some(&EOF_HEADER) => {
                    let mut reader = PacketReader::new(&packet[1..]);
                    plugin = String::from_utf8_lossy(reader.null_terminated()).into_owned();
                    let data = strip_nul(reader.rest());
                    tracing::debug!(plugin = %plugin, "mysql auth switch");
                    let response = scramble_for(&plugin, &credentials.password, data)?;
                    self.write_packet(&response).await?;
                }
                Some(&AUTH_MORE_DATA) if plugin == CACHING_SHA2_PASSWORD => {
                    match packet.get(1) {
                        // An OK packet follows.
                        Some(&FAST_AUTH_SUCCESS) => continue,
                        Some(&PERFORM_FULL_AUTH) => {
                            return Err(ConnectError::Protocol(
                                "caching_sha2_password full authentication requires TLS".into(),
                            ));
                        }
                        _ => {
                            return Err(ConnectError::Protocol(
                                "unexpected caching_sha2_password auth data".into(),
                            ));
                        }
                    }
                }
                Some(other) => {
                    return Err(ConnectError::Protocol(format!(
                        "unexpected authentication packet 0x{other:02x}"
                    )));
                }
                None => {
                    return Err(ConnectError::Protocol("empty authentication packet".into()));
                }
            }
        }
    }

    // ── Packet I/O ───────────────────────────────────────────────────

    async fn read_packet(&mut self) -> Result<Vec<u8>, ConnectError> {
        let limit = self.io_timeout;
        match timeout(limit, read_frame(&mut self.stream)).await {
            Ok(Ok((payload, seq))) => {
                self.sequence_id = seq.wrapping_add(1);
                Ok(payload)
            }
            Ok(Err(e)) => {
                self.open = false;
                Err(e.into())
            }
            Err(_) => {
                self.open = false;
                Err(ConnectError::Timeout(limit))
            }
        }
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), ConnectError> {
        let limit = self.io_timeout;
        let seq = self.sequence_id;
        match timeout(limit, write_frame(self.stream.get_mut(), payload, seq)).await {
            Ok(Ok(next)) => {
                self.sequence_id = next;
                Ok(())
            }
            Ok(Err(e)) => {
                self.open = false;
                Err(e.into())
            }
            Err(_) => {
                self.open = false;
                Err(ConnectError::Timeout(limit))
            }
        }
    }

    async fn command(&mut self, command: u8, arg: &[u8]) -> Result<(), ConnectError> {
        if !self.open {
            return Err(ConnectError::Network("session is closed".into()));
        }
        self.sequence_id = 0;
        let mut payload = BytesMut::with_capacity(1 + arg.len());
        payload.put_u8(command);
        payload.put_slice(arg);
        self.write_packet(&payload).await
    }

    /// Consume a result set whose first packet (the column count) has
    /// already been read. Returns the row count and the terminating status
    /// flags.
    async fn drain_result_set(&mut self, first: &[u8]) -> Result<(u64, u16), ConnectError> {
        let columns = PacketReader::new(first).lenenc_int()?;
        for _ in 0..columns {
            self.read_packet().await?;
        }
        if !self.deprecate_eof() {
            let eof = self.read_packet().await?;
            if eof.first() != Some(&EOF_HEADER) {
                return Err(ConnectError::Protocol("missing column definition EOF".into()));
            }
        }

        let mut rows = 0u64;
        loop {
            let packet = self.read_packet().await?;
            match packet.first() {
                Some(&ERR_HEADER) => return Err(server_error(&packet)),
                Some(&EOF_HEADER) if self.deprecate_eof() && packet.len() < MAX_PACKET_SIZE => {
                    let ok = OkPacket::parse(&packet)?;
                    return Ok((rows, ok.status));
                }
                Some(&EOF_HEADER) if packet.len() < 9 => {
                    let mut reader = PacketReader::new(&packet[1..]);
                    let _warnings = reader.u16_le()?;
                    let status = reader.u16_le()?;
                    return Ok((rows, status));
                }
                Some(_) => rows += 1,
                None => return Err(ConnectError::Protocol("empty row packet".into())),
            }
        }
    }
}

#[async_trait]
impl Session for MysqlSession {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn ping(&mut self) -> Result<(), ConnectError> {
        self.command(COM_PING, &[]).await?;
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(&OK_HEADER) => Ok(()),
            Some(&ERR_HEADER) => Err(server_error(&packet)),
            _ => Err(ConnectError::Protocol("unexpected COM_PING response".into())),
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, ConnectError> {
        self.command(COM_QUERY, sql.as_bytes()).await?;

        let mut total = 0u64;
        loop {
            let packet = self.read_packet().await?;
            let status = match packet.first() {
                Some(&OK_HEADER) => {
                    let ok = OkPacket::parse(&packet)?;
                    total += ok.affected_rows;
                    ok.status
                }
                Some(&ERR_HEADER) => return Err(server_error(&packet)),
                Some(&LOCAL_INFILE_HEADER) => {
                    self.open = false;
                    return Err(ConnectError::Protocol(
                        "LOCAL INFILE requests are not supported".into(),
                    ));
                }
                Some(_) => {
                    let (rows, status) = self.drain_result_set(&packet).await?;
                    total += rows;
                    status
                }
                None => return Err(ConnectError::Protocol("empty query response".into())),
            };
            if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                return Ok(total);
            }
        }
    }

    async fn rollback(&mut self) -> Result<(), ConnectError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        if !self.open {
            return Ok(());
        }
        let quit = self.command(COM_QUIT, &[]).await;
        self.open = false;
        let shutdown = self.stream.get_mut().shutdown().await;
        quit?;
        shutdown.map_err(ConnectError::from)
    }
}

impl fmt::Debug for MysqlSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlSession")
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.server_version)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

// ── Framing ──────────────────────────────────────────────────────────

/// Read one logical packet, joining continuation frames of a payload of
/// `MAX_PACKET_SIZE` bytes or more. Returns the payload and the last
/// sequence id seen.
async fn read_frame(stream: &mut BufReader<TcpStream>) -> std::io::Result<(Vec<u8>, u8)> {
    let mut payload = Vec::new();
    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let len = usize::from(header[0])
            | (usize::from(header[1]) << 8)
            | (usize::from(header[2]) << 16);
        let seq = header[3];

        let start = payload.len();
        payload.resize(start + len, 0);
        stream.read_exact(&mut payload[start..]).await?;

        if len < MAX_PACKET_SIZE {
            return Ok((payload, seq));
        }
    }
}

/// Write `payload` as one or more frames starting at `seq`. Returns the next
/// sequence id.
async fn write_frame(stream: &mut TcpStream, payload: &[u8], mut seq: u8) -> std::io::Result<u8> {
    let mut buf = BytesMut::with_capacity(4 + payload.len().min(MAX_PACKET_SIZE));
    for chunk in payload.chunks(MAX_PACKET_SIZE) {
        buf.clear();
        buf.put_uint_le(chunk.len() as u64, 3);
        buf.put_u8(seq);
        buf.put_slice(chunk);
        stream.write_all(&buf).await?;
        seq = seq.wrapping_add(1);
    }
    // An empty trailing frame terminates payloads that fill their last frame.
    if payload.len() % MAX_PACKET_SIZE == 0 {
        stream.write_all(&[0, 0, 0, seq]).await?;
        seq = seq.wrapping_add(1);
    }
    stream.flush().await?;
    Ok(seq)
}

// ── Packet parsing ───────────────────────────────────────────────────

/// Bounds-checked cursor over a packet payload.
struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ConnectError> {
        if self.buf.len() < n {
            return Err(ConnectError::Protocol("truncated packet".into()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), ConnectError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ConnectError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, ConnectError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, ConnectError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Length-encoded integer.
    fn lenenc_int(&mut self) -> Result<u64, ConnectError> {
        let first = self.u8()?;
        let width = match first {
            0x00..=0xFA => return Ok(u64::from(first)),
            0xFC => 2,
            0xFD => 3,
            0xFE => 8,
            _ => {
                return Err(ConnectError::Protocol(format!(
                    "invalid length-encoded integer prefix 0x{first:02x}"
                )));
            }
        };
        let bytes = self.take(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Bytes up to the next NUL (consumed), or the rest if there is none.
    fn null_terminated(&mut self) -> &'a [u8] {
        match self.buf.iter().position(|&b| b == 0) {
            Some(end) => {
                let value = &self.buf[..end];
                self.buf = &self.buf[end + 1..];
                value
            }
            None => self.rest(),
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

fn strip_nul(data: &[u8]) -> &[u8] {
    data.strip_suffix(&[0u8]).unwrap_or(data)
}

/// Initial handshake packet (protocol v10).
#[derive(Debug)]
struct Handshake {
    server_version: String,
    connection_id: u32,
    capabilities: u32,
    scramble: Vec<u8>,
    auth_plugin: String,
}

impl Handshake {
    fn parse(payload: &[u8]) -> Result<Self, ConnectError> {
        let mut reader = PacketReader::new(payload);
        let protocol = reader.u8()?;
        if protocol != HANDSHAKE_V10 {
            return Err(ConnectError::Protocol(format!(
                "unsupported handshake protocol version {protocol}"
            )));
        }
        let server_version = String::from_utf8_lossy(reader.null_terminated()).into_owned();
        let connection_id = reader.u32_le()?;
        let mut scramble = reader.take(8)?.to_vec();
        reader.skip(1)?;
        let mut capabilities = u32::from(reader.u16_le()?);
        let mut auth_plugin = String::new();

        if reader.remaining() > 0 {
            let _charset = reader.u8()?;
            let _status = reader.u16_le()?;
            capabilities |= u32::from(reader.u16_le()?) << 16;
            let auth_data_len = usize::from(reader.u8()?);
            reader.skip(10)?;

            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let len = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
                scramble.extend_from_slice(strip_nul(reader.take(len)?));
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 {
                auth_plugin = String::from_utf8_lossy(reader.null_terminated()).into_owned();
            }
        }

        Ok(Self {
            server_version,
            connection_id,
            capabilities,
            scramble,
            auth_plugin,
        })
    }
}

/// The parts of an OK packet (or an OK-as-EOF terminator) this client reads.
struct OkPacket {
    affected_rows: u64,
    status: u16,
}

impl OkPacket {
    fn parse(payload: &[u8]) -> Result<Self, ConnectError> {
        let mut reader = PacketReader::new(payload);
        reader.skip(1)?;
        let affected_rows = reader.lenenc_int()?;
        let _last_insert_id = reader.lenenc_int()?;
        let status = if reader.remaining() >= 2 {
            reader.u16_le()?
        } else {
            0
        };
        Ok(Self {
            affected_rows,
            status,
        })
    }
}

/// Decode an ERR packet into a classified error.
fn server_error(payload: &[u8]) -> ConnectError {
    let code = match payload {
        [_, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    };
    let rest = payload.get(3..).unwrap_or_default();
    // Protocol 4.1 inserts '#' and a five-character SQL state.
    let message = match rest {
        [b'#', tail @ ..] if tail.len() >= 5 => &tail[5..],
        _ => rest,
    };
    classify(code, String::from_utf8_lossy(message).into_owned())
}

fn classify(code: u16, message: String) -> ConnectError {
    match code {
        ER_ACCESS_DENIED_ERROR | ER_ACCESS_DENIED_NO_PASSWORD_ERROR => {
            ConnectError::Authentication { code, message }
        }
        _ => ConnectError::Rejected { code, message },
    }
}

// ── Authentication scrambles ─────────────────────────────────────────

fn scramble_for(plugin: &str, password: &str, nonce: &[u8]) -> Result<Vec<u8>, ConnectError> {
    match plugin {
        NATIVE_PASSWORD => Ok(native_password(password, nonce)),
        CACHING_SHA2_PASSWORD => Ok(caching_sha2_password(password, nonce)),
        other => Err(ConnectError::Protocol(format!(
            "unsupported authentication plugin '{other}'"
        ))),
    }
}

/// `SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))`
pub fn native_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)`
pub fn caching_sha2_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(nonce);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONCE: &[u8; 20] = b"abcdefghijklmnopqrst";

    fn greeting(plugin: &str, capabilities: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(HANDSHAKE_V10);
        buf.put_slice(b"8.0.36\0");
        buf.put_u32_le(42);
        buf.put_slice(&NONCE[..8]);
        buf.put_u8(0);
        buf.put_u16_le(capabilities as u16);
        buf.put_u8(UTF8MB4);
        buf.put_u16_le(0x0002);
        buf.put_u16_le((capabilities >> 16) as u16);
        buf.put_u8(21);
        buf.put_slice(&[0u8; 10]);
        buf.put_slice(&NONCE[8..]);
        buf.put_u8(0);
        buf.put_slice(plugin.as_bytes());
        buf.put_u8(0);
        buf.to_vec()
    }

    fn err_packet(code: u16, state: &str, message: &str) -> Vec<u8> {
        let mut buf = vec![ERR_HEADER];
        buf.extend_from_slice(&code.to_le_bytes());
        buf.push(b'#');
        buf.extend_from_slice(state.as_bytes());
        buf.extend_from_slice(message.as_bytes());
        buf
    }

    // ── Handshake ───────────────────────────────────────────────────

    #[test]
    fn parses_v10_greeting() {
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_DEPRECATE_EOF;
        let handshake = Handshake::parse(&greeting(CACHING_SHA2_PASSWORD, caps)).unwrap();

        assert_eq!(handshake.server_version, "8.0.36");
        assert_eq!(handshake.connection_id, 42);
        assert_eq!(handshake.capabilities, caps);
        assert_eq!(handshake.scramble, NONCE.to_vec());
        assert_eq!(handshake.auth_plugin, CACHING_SHA2_PASSWORD);
    }

    #[test]
    fn rejects_old_handshake_protocol() {
        let mut packet = greeting(NATIVE_PASSWORD, CLIENT_PROTOCOL_41);
        packet[0] = 9;
        assert!(matches!(
            Handshake::parse(&packet),
            Err(ConnectError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_greeting_is_protocol_error() {
        let packet = greeting(NATIVE_PASSWORD, CLIENT_PROTOCOL_41);
        assert!(matches!(
            Handshake::parse(&packet[..12]),
            Err(ConnectError::Protocol(_))
        ));
    }

    // ── Error classification ────────────────────────────────────────

    #[test]
    fn access_denied_is_authentication() {
        let err = server_error(&err_packet(
            1045,
            "28000",
            "Access denied for user 'app'@'10.0.0.5' (using password: YES)",
        ));
        assert_eq!(
            err,
            ConnectError::Authentication {
                code: 1045,
                message: "Access denied for user 'app'@'10.0.0.5' (using password: YES)".into(),
            }
        );

        let err = server_error(&err_packet(1698, "28000", "Access denied for user 'root'"));
        assert!(err.is_authentication());
    }

    #[test]
    fn other_server_errors_are_rejected() {
        let err = server_error(&err_packet(1040, "08004", "Too many connections"));
        assert_eq!(
            err,
            ConnectError::Rejected {
                code: 1040,
                message: "Too many connections".into(),
            }
        );

        // An access-denied message with a different code is not a rotation.
        let err = server_error(&err_packet(1044, "42000", "Access denied for user to database"));
        assert!(!err.is_authentication());
    }

    #[test]
    fn error_without_sql_state() {
        let mut packet = vec![ERR_HEADER];
        packet.extend_from_slice(&1129u16.to_le_bytes());
        packet.extend_from_slice(b"Host is blocked");
        assert_eq!(
            server_error(&packet),
            ConnectError::Rejected {
                code: 1129,
                message: "Host is blocked".into(),
            }
        );
    }

    // ── Packet parsing ──────────────────────────────────────────────

    #[test]
    fn lenenc_integers() {
        let cases: [(&[u8], u64); 4] = [
            (&[0xFA], 250),
            (&[0xFC, 0x10, 0x27], 10_000),
            (&[0xFD, 0x40, 0x42, 0x0F], 1_000_000),
            (&[0xFE, 1, 0, 0, 0, 1, 0, 0, 0], 0x0000_0001_0000_0001),
        ];
        for (bytes, expected) in cases {
            assert_eq!(PacketReader::new(bytes).lenenc_int().unwrap(), expected);
        }
        assert!(PacketReader::new(&[0xFB]).lenenc_int().is_err());
        assert!(PacketReader::new(&[0xFC, 0x01]).lenenc_int().is_err());
    }

    #[test]
    fn ok_packet_reads_rows_and_status() {
        let ok = OkPacket::parse(&[0x00, 0x03, 0x00, 0x08, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.status, SERVER_MORE_RESULTS_EXISTS);
    }

    // ── Scrambles ───────────────────────────────────────────────────

    #[test]
    fn empty_password_sends_empty_scramble() {
        assert!(native_password("", NONCE).is_empty());
        assert!(caching_sha2_password("", NONCE).is_empty());
    }

    #[test]
    fn scrambles_depend_on_password_and_nonce() {
        let native = native_password("hunter2", NONCE);
        assert_eq!(native.len(), 20);
        assert_eq!(native, native_password("hunter2", NONCE));
        assert_ne!(native, native_password("hunter3", NONCE));
        assert_ne!(native, native_password("hunter2", b"tsrqponmlkjihgfedcba"));

        let sha2 = caching_sha2_password("hunter2", NONCE);
        assert_eq!(sha2.len(), 32);
        assert_ne!(sha2, caching_sha2_password("hunter3", NONCE));
    }

    #[test]
    fn native_scramble_verifies_against_stored_hash() {
        // The server stores SHA1(SHA1(password)) and recovers SHA1(password)
        // from the scramble; SHA1 of that must equal the stored hash.
        let scramble = native_password("hunter2", NONCE);
        let stored = Sha1::digest(Sha1::digest(b"hunter2"));
        let mut hasher = Sha1::new();
        hasher.update(NONCE);
        hasher.update(stored);
        let mask = hasher.finalize();
        let stage1: Vec<u8> = scramble.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
        assert_eq!(Sha1::digest(&stage1).to_vec(), stored.to_vec());
    }

    #[test]
    fn unknown_plugin_on_switch_is_protocol_error() {
        assert!(matches!(
            scramble_for("sha256_password", "pw", NONCE),
            Err(ConnectError::Protocol(_))
        ));
    }
}
