//! Encrypted peer sessions
//!
//! A PSK handshake over the datagram connection, then ChaCha20-Poly1305
//! sealed records. Handshake flights (epoch 0):
//!
//! ```text
//! client                                   server
//!   ClientHello(random_c, hint_c)   ->
//!                                   <-     ServerHello(random_s, hint_s, proof_s)
//!   Finished(proof_c)               ->
//! ```
//!
//! Each hint is the sender's inside IP address, so both ends learn the
//! other's inside address as part of establishment. Lost flights are
//! retransmitted until the handshake timeout. A server that sees sealed
//! epoch-1 data before Finished treats it as proof the client completed.

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use super::crypto::{PreSharedKey, RecordCipher, ReplayWindow, SessionKeys, MAC_LEN, RANDOM_LEN};
use super::mux::{DatagramConn, DatagramReceiver, DatagramSender};
use super::record::{build_record, parse_record, ContentType, RecordHeader, HEADER_LEN, MAX_SEQUENCE};
use crate::error::{Error, Result};

const EPOCH_HANDSHAKE: u16 = 0;
const EPOCH_DATA: u16 = 1;

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_FINISHED: u8 = 3;

const SERVER_PROOF_LABEL: &[u8] = b"wolfmesh server proof";
const CLIENT_PROOF_LABEL: &[u8] = b"wolfmesh client proof";

const ALERT_LEVEL_WARNING: u8 = 1;
const ALERT_CLOSE_NOTIFY: u8 = 0;

/// Poly1305 tag appended to every sealed record
const TAG_LEN: usize = 16;

/// Largest plaintext a single record can carry
pub const MAX_PLAINTEXT: usize = u16::MAX as usize - TAG_LEN;

/// Parameters shared by every session of one member
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub psk: PreSharedKey,
    /// Inside address sent to peers as our identity hint
    pub identity: IpAddr,
    pub handshake_timeout: Duration,
    pub retransmit_interval: Duration,
}

impl SessionConfig {
    pub fn new(psk: &[u8], identity: IpAddr) -> Self {
        Self {
            psk: PreSharedKey::new(psk),
            identity,
            handshake_timeout: Duration::from_secs(10),
            retransmit_interval: Duration::from_millis(500),
        }
    }

    pub fn with_timeouts(mut self, handshake_timeout: Duration, retransmit_interval: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self.retransmit_interval = retransmit_interval;
        self
    }
}

/// Which end of the handshake we were
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HandshakeMessage {
    ClientHello {
        random: [u8; RANDOM_LEN],
        hint: String,
    },
    ServerHello {
        random: [u8; RANDOM_LEN],
        hint: String,
        proof: [u8; MAC_LEN],
    },
    Finished {
        proof: [u8; MAC_LEN],
    },
}

impl HandshakeMessage {
    fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::ClientHello { .. } => "ClientHello",
            HandshakeMessage::ServerHello { .. } => "ServerHello",
            HandshakeMessage::Finished { .. } => "Finished",
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + RANDOM_LEN + 1 + 64 + MAC_LEN);
        match self {
            HandshakeMessage::ClientHello { random, hint } => {
                out.push(MSG_CLIENT_HELLO);
                out.extend_from_slice(random);
                push_hint(&mut out, hint);
            }
            HandshakeMessage::ServerHello { random, hint, proof } => {
                out.push(MSG_SERVER_HELLO);
                out.extend_from_slice(random);
                push_hint(&mut out, hint);
                out.extend_from_slice(proof);
            }
            HandshakeMessage::Finished { proof } => {
                out.push(MSG_FINISHED);
                out.extend_from_slice(proof);
            }
        }
        out
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let (&kind, rest) = data.split_first()?;
        match kind {
            MSG_CLIENT_HELLO => {
                let (random, rest) = take_array::<RANDOM_LEN>(rest)?;
                let (hint, rest) = take_hint(rest)?;
                rest.is_empty().then_some(HandshakeMessage::ClientHello { random, hint })
            }
            MSG_SERVER_HELLO => {
                let (random, rest) = take_array::<RANDOM_LEN>(rest)?;
                let (hint, rest) = take_hint(rest)?;
                let (proof, rest) = take_array::<MAC_LEN>(rest)?;
                rest.is_empty().then_some(HandshakeMessage::ServerHello { random, hint, proof })
            }
            MSG_FINISHED => {
                let (proof, rest) = take_array::<MAC_LEN>(rest)?;
                rest.is_empty().then_some(HandshakeMessage::Finished { proof })
            }
            _ => None,
        }
    }

    fn to_record(&self, sequence: u64) -> Result<Vec<u8>> {
        build_record(ContentType::Handshake, EPOCH_HANDSHAKE, sequence, &self.encode())
    }
}

fn push_hint(out: &mut Vec<u8>, hint: &str) {
    let bytes = &hint.as_bytes()[..hint.len().min(u8::MAX as usize)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn take_array<const N: usize>(data: &[u8]) -> Option<([u8; N], &[u8])> {
    if data.len() < N {
        return None;
    }
    let mut array = [0u8; N];
    array.copy_from_slice(&data[..N]);
    Some((array, &data[N..]))
}

fn take_hint(data: &[u8]) -> Option<(String, &[u8])> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let hint = String::from_utf8_lossy(&rest[..len]).into_owned();
    Some((hint, &rest[len..]))
}

/// Decode a datagram as a handshake message, if it is one
fn decode_handshake(datagram: &[u8]) -> Option<HandshakeMessage> {
    let record = parse_record(datagram).ok()?;
    if record.header.content_type != ContentType::Handshake {
        return None;
    }
    HandshakeMessage::decode(record.payload)
}

/// Does this datagram open a handshake?
pub(crate) fn is_client_hello(datagram: &[u8]) -> bool {
    matches!(decode_handshake(datagram), Some(HandshakeMessage::ClientHello { .. }))
}

/// The remote's identity hint must be an IP address
fn parse_hint(remote: SocketAddr, hint: &str) -> Result<IpAddr> {
    hint.parse().map_err(|_| Error::IdentityHint {
        address: remote,
        hint: hint.to_string(),
    })
}

/// Next datagram that parses as a record, or `None` once `until` passes
async fn next_record(receiver: &mut DatagramReceiver, until: Instant) -> Result<Option<Bytes>> {
    let remote = receiver.remote_addr();
    loop {
        let datagram = match timeout_at(until, receiver.recv()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(Error::ConnectionClosed(remote)),
            Ok(Some(datagram)) => datagram,
        };

        if parse_record(&datagram).is_ok() {
            return Ok(Some(datagram));
        }
        tracing::trace!("Ignoring {} byte non-record datagram from {} during handshake", datagram.len(), remote);
    }
}

/// An established, authenticated session with one peer
pub struct SecureSession {
    reader: SecureReader,
    writer: SecureWriter,
}

impl SecureSession {
    /// Run the client side of the handshake over `conn`
    pub async fn connect(conn: DatagramConn, config: &SessionConfig) -> Result<Self> {
        let remote = conn.remote_addr();
        let (sender, mut receiver) = conn.into_split();
        let deadline = Instant::now() + config.handshake_timeout;

        let client_random: [u8; RANDOM_LEN] = rand::random();
        let client_hint = config.identity.to_string();
        let mut sequence = 0u64;

        let hello = HandshakeMessage::ClientHello {
            random: client_random,
            hint: client_hint.clone(),
        };

        tracing::debug!("Starting handshake with {}", remote);

        let (server_random, server_hint, server_proof) = 'handshake: loop {
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout(remote));
            }

            sender.send(&hello.to_record(sequence)?).await?;
            sequence += 1;

            let resend_at = (Instant::now() + config.retransmit_interval).min(deadline);
            while let Some(datagram) = next_record(&mut receiver, resend_at).await? {
                match decode_handshake(&datagram) {
                    Some(HandshakeMessage::ServerHello { random, hint, proof }) => {
                        break 'handshake (random, hint, proof);
                    }
                    Some(other) => {
                        tracing::trace!("Ignoring {} from {} while awaiting ServerHello", other.name(), remote);
                    }
                    None => {
                        tracing::trace!("Ignoring non-handshake record from {} while awaiting ServerHello", remote);
                    }
                }
            }
        };

        let transcript: [&[u8]; 5] = [
            SERVER_PROOF_LABEL,
            &client_random,
            &server_random,
            client_hint.as_bytes(),
            server_hint.as_bytes(),
        ];
        if !config.psk.verify(&transcript, &server_proof) {
            return Err(Error::Authentication(remote));
        }

        let remote_identity = parse_hint(remote, &server_hint)?;

        let client_proof = config.psk.mac(&[
            CLIENT_PROOF_LABEL,
            &client_random,
            &server_random,
            client_hint.as_bytes(),
            server_hint.as_bytes(),
        ]);
        let finished = HandshakeMessage::Finished { proof: client_proof }.to_record(sequence)?;
        sender.send(&finished).await?;

        let keys = SessionKeys::derive(&config.psk, &client_random, &server_random);

        tracing::debug!("Handshake with {} complete (client, peer identity {})", remote, remote_identity);

        Ok(Self::assemble(
            Side::Client,
            sender,
            receiver,
            remote_identity,
            client_random,
            RecordCipher::new(&keys.server_write),
            RecordCipher::new(&keys.client_write),
            finished,
            ReplayWindow::new(),
            VecDeque::new(),
        ))
    }

    /// Run the server side of the handshake; the first ClientHello is
    /// expected to already be queued on `conn`
    pub async fn accept(conn: DatagramConn, config: &SessionConfig) -> Result<Self> {
        let remote = conn.remote_addr();
        let (sender, mut receiver) = conn.into_split();
        let deadline = Instant::now() + config.handshake_timeout;

        let (client_random, client_hint) = loop {
            let Some(datagram) = next_record(&mut receiver, deadline).await? else {
                return Err(Error::HandshakeTimeout(remote));
            };
            match decode_handshake(&datagram) {
                Some(HandshakeMessage::ClientHello { random, hint }) => break (random, hint),
                _ => tracing::trace!("Ignoring record from {} while awaiting ClientHello", remote),
            }
        };

        let remote_identity = parse_hint(remote, &client_hint)?;

        let server_random: [u8; RANDOM_LEN] = rand::random();
        let server_hint = config.identity.to_string();
        let server_proof = config.psk.mac(&[
            SERVER_PROOF_LABEL,
            &client_random,
            &server_random,
            client_hint.as_bytes(),
            server_hint.as_bytes(),
        ]);
        let server_hello = HandshakeMessage::ServerHello {
            random: server_random,
            hint: server_hint.clone(),
            proof: server_proof,
        }
        .to_record(0)?;

        let keys = SessionKeys::derive(&config.psk, &client_random, &server_random);
        let read_cipher = RecordCipher::new(&keys.client_write);
        let mut window = ReplayWindow::new();
        let mut pending = VecDeque::new();

        loop {
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout(remote));
            }

            sender.send(&server_hello).await?;

            let resend_at = (Instant::now() + config.retransmit_interval).min(deadline);
            let established = loop {
                let Some(datagram) = next_record(&mut receiver, resend_at).await? else {
                    break false;
                };
                let record = parse_record(&datagram)?;

                match record.header.content_type {
                    ContentType::Handshake => match HandshakeMessage::decode(record.payload) {
                        Some(HandshakeMessage::Finished { proof }) => {
                            let transcript: [&[u8]; 5] = [
                                CLIENT_PROOF_LABEL,
                                &client_random,
                                &server_random,
                                client_hint.as_bytes(),
                                server_hint.as_bytes(),
                            ];
                            if !config.psk.verify(&transcript, &proof) {
                                return Err(Error::Authentication(remote));
                            }
                            break true;
                        }
                        Some(HandshakeMessage::ClientHello { random, .. }) if random == client_random => {
                            tracing::trace!("Duplicate ClientHello from {}, resending ServerHello", remote);
                            break false;
                        }
                        Some(HandshakeMessage::ClientHello { .. }) => {
                            return Err(Error::Handshake {
                                address: remote,
                                reason: "client restarted the handshake".into(),
                            });
                        }
                        _ => {}
                    },
                    ContentType::ApplicationData if record.header.epoch == EPOCH_DATA => {
                        let sequence = record.header.sequence;
                        if let Ok(plaintext) = read_cipher.open(sequence, record.header_bytes, record.payload) {
                            // Finished was lost but the client is already sending
                            window.update(sequence);
                            pending.push_back(Bytes::from(plaintext));
                            break true;
                        }
                    }
                    _ => {}
                }
            };

            if established {
                break;
            }
        }

        tracing::debug!("Handshake with {} complete (server, peer identity {})", remote, remote_identity);

        Ok(Self::assemble(
            Side::Server,
            sender,
            receiver,
            remote_identity,
            client_random,
            read_cipher,
            RecordCipher::new(&keys.server_write),
            server_hello,
            window,
            pending,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        side: Side,
        sender: DatagramSender,
        receiver: DatagramReceiver,
        remote_identity: IpAddr,
        client_random: [u8; RANDOM_LEN],
        read_cipher: RecordCipher,
        write_cipher: RecordCipher,
        last_flight: Vec<u8>,
        window: ReplayWindow,
        pending: VecDeque<Bytes>,
    ) -> Self {
        let remote = sender.remote_addr();
        Self {
            reader: SecureReader {
                side,
                remote,
                remote_identity,
                receiver,
                sender: sender.clone(),
                cipher: read_cipher,
                window,
                client_random,
                last_flight,
                pending,
            },
            writer: SecureWriter {
                remote,
                sender,
                cipher: write_cipher,
                sequence: 0,
                closed: false,
            },
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.writer.remote
    }

    /// Inside address the peer announced during the handshake
    pub fn remote_identity(&self) -> IpAddr {
        self.reader.remote_identity
    }

    pub fn side(&self) -> Side {
        self.reader.side
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<usize> {
        self.writer.send(payload).await
    }

    pub async fn recv(&mut self) -> Result<Bytes> {
        self.reader.recv().await
    }

    /// Notify the peer and drop the session
    pub async fn close(mut self) -> Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a session
pub struct SecureReader {
    side: Side,
    remote: SocketAddr,
    remote_identity: IpAddr,
    receiver: DatagramReceiver,
    /// Used only to repeat our last handshake flight
    sender: DatagramSender,
    cipher: RecordCipher,
    window: ReplayWindow,
    client_random: [u8; RANDOM_LEN],
    /// ServerHello (server) or Finished (client)
    last_flight: Vec<u8>,
    pending: VecDeque<Bytes>,
}

impl SecureReader {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Next authenticated payload from the peer
    pub async fn recv(&mut self) -> Result<Bytes> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                return Ok(payload);
            }

            let datagram = self
                .receiver
                .recv()
                .await
                .ok_or(Error::ConnectionClosed(self.remote))?;

            let record = match parse_record(&datagram) {
                Ok(record) => record,
                Err(e) => {
                    tracing::trace!("Dropping datagram from {}: {}", self.remote, e);
                    continue;
                }
            };

            match record.header.content_type {
                ContentType::ApplicationData | ContentType::Alert => {
                    if record.header.epoch != EPOCH_DATA {
                        continue;
                    }
                    let sequence = record.header.sequence;
                    if !self.window.check(sequence) {
                        tracing::debug!("Replayed record {} from {} dropped", sequence, self.remote);
                        continue;
                    }
                    let plaintext = match self.cipher.open(sequence, record.header_bytes, record.payload) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            tracing::debug!("Record {} from {} rejected: {}", sequence, self.remote, e);
                            continue;
                        }
                    };
                    self.window.update(sequence);

                    if record.header.content_type == ContentType::Alert {
                        if plaintext != [ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY] {
                            tracing::debug!("Alert {:?} from {}", plaintext, self.remote);
                        }
                        return Err(Error::ConnectionClosed(self.remote));
                    }
                    return Ok(Bytes::from(plaintext));
                }
                ContentType::Handshake => self.handle_late_handshake(record.payload).await?,
            }
        }
    }

    /// Handshake records after establishment are retransmits or a restarted peer
    async fn handle_late_handshake(&mut self, payload: &[u8]) -> Result<()> {
        match (self.side, HandshakeMessage::decode(payload)) {
            (Side::Server, Some(HandshakeMessage::ClientHello { random, .. })) if random == self.client_random => {
                tracing::trace!("Repeating ServerHello to {}", self.remote);
                self.sender.send(&self.last_flight).await?;
            }
            (Side::Client, Some(HandshakeMessage::ServerHello { .. })) => {
                tracing::trace!("Repeating Finished to {}", self.remote);
                self.sender.send(&self.last_flight).await?;
            }
            (_, Some(HandshakeMessage::ClientHello { .. })) => {
                return Err(Error::SessionReset(self.remote));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Sending half of a session
pub struct SecureWriter {
    remote: SocketAddr,
    sender: DatagramSender,
    cipher: RecordCipher,
    sequence: u64,
    closed: bool,
}

impl SecureWriter {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Seal and send one payload as a single datagram.
    ///
    /// Returns the number of payload bytes that left in the datagram.
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::ConnectionClosed(self.remote));
        }
        let record = self.seal(ContentType::ApplicationData, payload)?;
        let sent = self.sender.send(&record).await?;
        Ok(sent.saturating_sub(HEADER_LEN + TAG_LEN))
    }

    /// Send close_notify; later sends fail
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let alert = self.seal(ContentType::Alert, &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY])?;
        self.sender.send(&alert).await?;
        Ok(())
    }

    fn seal(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(Error::Record(format!("payload of {} bytes too large", plaintext.len())));
        }
        if self.sequence > MAX_SEQUENCE {
            return Err(Error::Record("sequence numbers exhausted".into()));
        }

        let sequence = self.sequence;
        self.sequence += 1;

        let header = RecordHeader::new(content_type, EPOCH_DATA, sequence, plaintext.len() + TAG_LEN);
        let header_bytes = header.to_bytes();
        let ciphertext = self.cipher.seal(sequence, &header_bytes, plaintext)?;

        let mut record = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        record.extend_from_slice(&header_bytes);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::record::{classify, DatagramKind};

    #[test]
    fn test_handshake_message_encoding() {
        let hello = HandshakeMessage::ClientHello {
            random: [9u8; RANDOM_LEN],
            hint: "192.168.50.2".into(),
        };
        assert_eq!(HandshakeMessage::decode(&hello.encode()), Some(hello));

        let server = HandshakeMessage::ServerHello {
            random: [1u8; RANDOM_LEN],
            hint: "fd00::7".into(),
            proof: [2u8; MAC_LEN],
        };
        assert_eq!(HandshakeMessage::decode(&server.encode()), Some(server));

        // Trailing or missing bytes are rejected
        let mut bytes = HandshakeMessage::Finished { proof: [3u8; MAC_LEN] }.encode();
        bytes.push(0);
        assert_eq!(HandshakeMessage::decode(&bytes), None);
        assert_eq!(HandshakeMessage::decode(&bytes[..10]), None);
        assert_eq!(HandshakeMessage::decode(&[]), None);
    }

    #[test]
    fn test_parse_hint() {
        let remote: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(parse_hint(remote, "10.1.2.3").unwrap(), "10.1.2.3".parse::<IpAddr>().unwrap());
        assert!(matches!(
            parse_hint(remote, "not-an-ip"),
            Err(Error::IdentityHint { .. })
        ));
    }

    #[test]
    fn test_hello_record_is_handshake() {
        let hello = HandshakeMessage::ClientHello {
            random: [0u8; RANDOM_LEN],
            hint: "10.0.0.1".into(),
        };
        let record = hello.to_record(0).unwrap();
        assert_eq!(classify(&record), DatagramKind::Handshake);
        assert_eq!(decode_handshake(&record), Some(hello));
    }
}
