//! Record framing for peer datagrams
//!
//! Every session datagram carries exactly one record with a DTLS-style
//! header:
//! [1: content_type] [2: version] [2: epoch] [6: sequence] [2: length] [N: payload]
//!
//! The demultiplexer only needs `classify` to tell handshake openers apart
//! from everything else arriving on the shared socket.

use crate::error::{Error, Result};

/// Size of the record header in bytes
pub const HEADER_LEN: usize = 13;

/// Wire version (DTLS 1.2 framing)
pub const PROTOCOL_VERSION: [u8; 2] = [0xFE, 0xFD];

/// Largest sequence number that fits in the 48-bit field
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

/// Record content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

/// What an inbound datagram looks like to the demultiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    /// A well-formed handshake record
    Handshake,
    /// Anything else: probes, rendezvous traffic, data for unknown peers, noise
    Other,
}

/// Decide whether a datagram opens (or continues) a handshake
pub fn classify(datagram: &[u8]) -> DatagramKind {
    match RecordHeader::parse(datagram) {
        Some(header) if header.content_type == ContentType::Handshake => DatagramKind::Handshake,
        _ => DatagramKind::Other,
    }
}

/// Parsed record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub epoch: u16,
    pub sequence: u64,
    pub length: u16,
}

impl RecordHeader {
    pub fn new(content_type: ContentType, epoch: u16, sequence: u64, length: usize) -> Self {
        Self {
            content_type,
            epoch,
            sequence: sequence & MAX_SEQUENCE,
            length: length as u16,
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.content_type as u8;
        bytes[1..3].copy_from_slice(&PROTOCOL_VERSION);
        bytes[3..5].copy_from_slice(&self.epoch.to_be_bytes());
        bytes[5..11].copy_from_slice(&self.sequence.to_be_bytes()[2..]);
        bytes[11..13].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parse a header, requiring the length field to cover the rest of the datagram exactly
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < HEADER_LEN {
            return None;
        }

        let content_type = ContentType::from_byte(datagram[0])?;
        if datagram[1..3] != PROTOCOL_VERSION {
            return None;
        }

        let epoch = u16::from_be_bytes([datagram[3], datagram[4]]);

        let mut seq_bytes = [0u8; 8];
        seq_bytes[2..].copy_from_slice(&datagram[5..11]);
        let sequence = u64::from_be_bytes(seq_bytes);

        let length = u16::from_be_bytes([datagram[11], datagram[12]]);
        if length as usize != datagram.len() - HEADER_LEN {
            return None;
        }

        Some(Self {
            content_type,
            epoch,
            sequence,
            length,
        })
    }
}

/// A record borrowed from a datagram
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub header: RecordHeader,
    /// Raw header bytes (authenticated as AAD for sealed records)
    pub header_bytes: &'a [u8],
    pub payload: &'a [u8],
}

/// Parse the single record carried by a datagram
pub fn parse_record(datagram: &[u8]) -> Result<Record<'_>> {
    let header = RecordHeader::parse(datagram)
        .ok_or_else(|| Error::Record(format!("malformed record ({} bytes)", datagram.len())))?;

    Ok(Record {
        header,
        header_bytes: &datagram[..HEADER_LEN],
        payload: &datagram[HEADER_LEN..],
    })
}

/// Frame a payload as a record
pub fn build_record(content_type: ContentType, epoch: u16, sequence: u64, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::Record(format!("payload of {} bytes exceeds record limit", payload.len())));
    }

    let header = RecordHeader::new(content_type, epoch, sequence, payload.len());
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(payload);
    Ok(record)
}
