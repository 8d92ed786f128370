//! Datum wire format — every datagram exchanged with the rendezvous server
//! and with peers.
//!
//! ```text
//! 0..4            Id          opaque correlation token
//! 4..5            Type        u8 opcode
//! 5..7            Length      u16 big-endian, = len(Body)
//! 7..7+Length     Body
//! 7+Length..+64   Signature   r‖s, present only if signed
//! ```
//!
//! The header is a #[repr(C, packed)] zerocopy struct, so parsing it is a
//! bounds check and a copy. The signature covers the header and the body.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{CryptoError, Keypair, PublicKey, SIGNATURE_LEN};

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed datagram header.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Header {
    /// Correlation token. A reply carries the Id of the request it answers.
    pub id: [u8; 4],

    /// Opcode, see [`MessageType`].
    pub kind: u8,

    /// Body length in bytes, not including this header or the signature.
    pub length: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(Header, [u8; 7]);

pub const HEADER_LEN: usize = 7;

/// Largest body the 16-bit length field can describe.
pub const MAX_BODY: usize = u16::MAX as usize;

/// Largest datagram we ever expect to read.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_BODY + SIGNATURE_LEN;

// ── Message Id ────────────────────────────────────────────────────────────────

/// 4-byte correlation token, drawn fresh for every logical request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 4]);

impl MessageId {
    pub const ZERO: MessageId = MessageId([0u8; 4]);

    pub fn random() -> Self {
        let mut id = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 4]
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Datagram opcode. Requests are below 128, replies at 128 and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0,
    PublicKey = 1,
    Root = 2,
    GetDatum = 3,
    HelloReply = 128,
    PublicKeyReply = 129,
    RootReply = 130,
    Datum = 131,
    NatTraversalRequest = 133,
    Error = 254,
}

impl MessageType {
    /// True for opcodes that answer a request rather than start one.
    pub fn is_reply(self) -> bool {
        match self {
            MessageType::NatTraversalRequest => false,
            other => u8::from(other) >= 128,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(MessageType::Hello),
            1 => Ok(MessageType::PublicKey),
            2 => Ok(MessageType::Root),
            3 => Ok(MessageType::GetDatum),
            128 => Ok(MessageType::HelloReply),
            129 => Ok(MessageType::PublicKeyReply),
            130 => Ok(MessageType::RootReply),
            131 => Ok(MessageType::Datum),
            133 => Ok(MessageType::NatTraversalRequest),
            254 => Ok(MessageType::Error),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One datagram. Built fresh per request or reply; immutable once encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageType,
    pub body: Bytes,
    /// `r‖s` over header+body. `None` for unsigned datagrams.
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Message {
    pub fn new(id: MessageId, kind: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
            signature: None,
        }
    }

    /// An Error(254) reply carrying a human-readable reason.
    pub fn error(id: MessageId, reason: impl Into<String>) -> Self {
        Self::new(id, MessageType::Error, Bytes::from(reason.into().into_bytes()))
    }

    /// The reason string of an Error(254) message, lossily decoded.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn header(&self) -> Result<Header, WireError> {
        if self.body.len() > MAX_BODY {
            return Err(WireError::BodyTooLarge(self.body.len()));
        }
        Ok(Header {
            id: self.id.0,
            kind: self.kind.into(),
            length: U16::new(self.body.len() as u16),
        })
    }

    /// The bytes a signature covers: header followed by body.
    fn signed_region(&self) -> Result<BytesMut, WireError> {
        let header = self.header()?;
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len() + SIGNATURE_LEN);
        out.put_slice(header.as_bytes());
        out.put_slice(&self.body);
        Ok(out)
    }

    /// Attach a signature made with `keypair`, replacing any previous one.
    pub fn sign(mut self, keypair: &Keypair) -> Result<Self, WireError> {
        let region = self.signed_region()?;
        self.signature = Some(keypair.sign(&region));
        Ok(self)
    }

    /// Check the attached signature against `key`.
    pub fn verify(&self, key: &PublicKey) -> Result<(), WireError> {
        let signature = self.signature.ok_or(WireError::MissingSignature)?;
        let region = self.signed_region()?;
        key.verify(&region, &signature)?;
        Ok(())
    }

    /// `Id ‖ Type ‖ u16be(len(Body)) ‖ Body ‖ [Signature]`
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = self.signed_region()?;
        if let Some(signature) = &self.signature {
            out.put_slice(signature);
        }
        Ok(out.freeze())
    }

    /// Parse one datagram.
    ///
    /// With a verification key the datagram must be exactly
    /// `7 + Length + 64` bytes and the signature must verify. Without one,
    /// `7 + Length` is accepted, and so is `7 + Length + 64` with the
    /// signature kept unverified (peers sign before keys are exchanged).
    pub fn decode(bytes: &[u8], key: Option<&PublicKey>) -> Result<Self, WireError> {
        let header = Header::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;
        let length = header.length.get() as usize;
        let body_end = HEADER_LEN + length;
        if bytes.len() < body_end {
            return Err(WireError::LengthMismatch {
                declared: length,
                actual: bytes.len() - HEADER_LEN,
            });
        }

        let signature = match (bytes.len() - body_end, key) {
            (SIGNATURE_LEN, _) => {
                let mut sig = [0u8; SIGNATURE_LEN];
                sig.copy_from_slice(&bytes[body_end..]);
                Some(sig)
            }
            (0, None) => None,
            (0, Some(_)) => return Err(WireError::MissingSignature),
            (_, _) => {
                return Err(WireError::LengthMismatch {
                    declared: length,
                    actual: bytes.len() - HEADER_LEN,
                })
            }
        };

        let kind = MessageType::try_from(header.kind)?;
        let message = Self {
            id: MessageId(header.id),
            kind,
            body: Bytes::copy_from_slice(&bytes[HEADER_LEN..body_end]),
            signature,
        };

        if let (Some(key), Some(sig)) = (key, signature.as_ref()) {
            key.verify(&bytes[..body_end], sig)?;
        }
        Ok(message)
    }
}

/// Read the Id and raw type byte of a datagram that may not decode.
pub fn peek_header(bytes: &[u8]) -> Option<(MessageId, u8)> {
    let header = Header::read_from_prefix(bytes)?;
    Some((MessageId(header.id), header.kind))
}

// ── Hello body ────────────────────────────────────────────────────────────────

/// Body of Hello / HelloReply: 4 reserved extension bytes, then the ASCII
/// peer name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloBody {
    pub extensions: [u8; 4],
    pub name: String,
}

impl HelloBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            extensions: [0u8; 4],
            name: name.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.name.len());
        out.put_slice(&self.extensions);
        out.put_slice(self.name.as_bytes());
        out.freeze()
    }

    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 4 {
            return Err(WireError::Truncated(body.len()));
        }
        let mut extensions = [0u8; 4];
        extensions.copy_from_slice(&body[..4]);
        Ok(Self {
            extensions,
            name: String::from_utf8_lossy(&body[4..]).into_owned(),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated: {0} bytes")]
    Truncated(usize),

    #[error("length mismatch: header declares {declared} body bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("body of {0} bytes exceeds maximum {}", MAX_BODY)]
    BodyTooLarge(usize),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("signature missing")]
    MissingSignature,

    #[error(transparent)]
    Auth(#[from] CryptoError),
}

impl WireError {
    /// True if the datagram was well-framed but failed authentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, WireError::Auth(_))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
