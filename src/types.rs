//! Core protocol types: public keys, tree coordinates, watermarks, path
//! identifiers and signed root announcements.
//!
//! Varint encoding is big-endian base-128: 7-bit groups, most significant
//! group first, continuation bit in the MSB, at most 10 bytes. Note this is
//! *not* Go's `binary.Uvarint` — the group order is reversed.

use std::fmt;

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};

use crate::crypto::Identity;
use crate::error::WireError;

/// Size of an Ed25519 public key on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature on the wire.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a snake path identifier on the wire.
pub const PATH_ID_SIZE: usize = 8;

/// A node's public key — the identity and keyspace position of a node.
///
/// Ordered lexicographically by byte value; this order defines both root
/// election ("greatest key wins") and the circular SNEK keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// The all-zero key, used as a placeholder before a peer is identified.
    pub const ZERO: PublicKey = PublicKey([0u8; PUBLIC_KEY_SIZE]);

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Short hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; PUBLIC_KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

/// Returns true if `b` lies strictly between `a` and `c` walking upward
/// around the circular keyspace.
pub fn keyspace_ordered(a: &PublicKey, b: &PublicKey, c: &PublicKey) -> bool {
    if a < c {
        a < b && b < c
    } else {
        b > a || b < c
    }
}

/// A switch port index. Port 0 is the local node itself.
pub type Port = u64;

/// A path through the spanning tree: the sequence of ports from the root
/// down to a node.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Coordinates(Vec<Port>);

impl Coordinates {
    pub fn new(ports: Vec<Port>) -> Self {
        Self(ports)
    }

    pub fn ports(&self) -> &[Port] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of the longest common prefix — the depth of the common
    /// ancestor in the tree.
    pub fn common_prefix_len(&self, other: &Coordinates) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Tree distance: up to the common ancestor, then down.
    pub fn distance_to(&self, other: &Coordinates) -> usize {
        self.len() + other.len() - 2 * self.common_prefix_len(other)
    }

    /// Encode as a 2-byte big-endian byte count followed by varint ports.
    pub fn marshal_to(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(self.0.len() * 2);
        for &port in &self.0 {
            encode_varu64(port, &mut body);
        }
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
    }

    /// Decode a length-prefixed coordinate sequence. Returns the
    /// coordinates and the number of bytes consumed.
    pub fn unmarshal(data: &[u8]) -> Result<(Coordinates, usize), WireError> {
        if data.len() < 2 {
            return Err(WireError::Truncated);
        }
        let body_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() < 2 + body_len {
            return Err(WireError::Truncated);
        }
        let mut ports = Vec::new();
        let mut offset = 2;
        let end = 2 + body_len;
        while offset < end {
            let (port, n) = decode_varu64(&data[offset..end])?;
            ports.push(port);
            offset += n;
        }
        Ok((Coordinates(ports), end))
    }
}

impl From<Vec<Port>> for Coordinates {
    fn from(ports: Vec<Port>) -> Self {
        Self(ports)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, port) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{port}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Loop-avoidance tag carried by SNEK-routed frames.
///
/// The derived order is the protocol order: a higher key always wins, then
/// a higher sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Watermark {
    pub public_key: PublicKey,
    pub sequence: u64,
}

impl Watermark {
    pub fn marshal_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key.0);
        encode_varu64(self.sequence, out);
    }

    pub fn unmarshal(data: &[u8]) -> Result<(Watermark, usize), WireError> {
        if data.len() < PUBLIC_KEY_SIZE {
            return Err(WireError::Truncated);
        }
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);
        let (sequence, n) = decode_varu64(&data[PUBLIC_KEY_SIZE..])?;
        Ok((
            Watermark {
                public_key: PublicKey(key),
                sequence,
            },
            PUBLIC_KEY_SIZE + n,
        ))
    }
}

/// Identifier minted by a bootstrapping node for one snake path.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PathId(pub [u8; PATH_ID_SIZE]);

impl PathId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", hex::encode(self.0))
    }
}

/// One hop of the ancestor chain in a tree announcement.
///
/// `signing_port` is the egress port the signer sent the announcement out
/// of; the signature covers the announcement marshalled up to this entry
/// plus the varint-encoded port.
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureEntry {
    pub signing_port: Port,
    pub public_key: PublicKey,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl fmt::Debug for SignatureEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureEntry")
            .field("port", &self.signing_port)
            .field("key", &self.public_key)
            .finish()
    }
}

/// A root announcement: the current root's key and sequence plus the signed
/// ancestor chain from the root down to the announcer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RootAnnouncement {
    pub root_public_key: PublicKey,
    pub root_sequence: u64,
    pub signatures: Vec<SignatureEntry>,
}

impl RootAnnouncement {
    /// A root's own unsigned announcement of itself.
    pub fn for_root(root_public_key: PublicKey, root_sequence: u64) -> Self {
        Self {
            root_public_key,
            root_sequence,
            signatures: Vec::new(),
        }
    }

    /// The coordinates this announcement confers on its receiver: the
    /// sequence of egress ports down the chain.
    pub fn coords(&self) -> Coordinates {
        Coordinates(self.signatures.iter().map(|s| s.signing_port).collect())
    }

    /// The announcer's own coordinates — everything up to (but excluding)
    /// the final hop towards us.
    pub fn peer_coords(&self) -> Coordinates {
        let mut ports: Vec<Port> = self.signatures.iter().map(|s| s.signing_port).collect();
        ports.pop();
        Coordinates(ports)
    }

    /// The public key of the announcing peer: the final signer, or the root
    /// itself for an unsigned announcement.
    pub fn announcer(&self) -> PublicKey {
        self.signatures
            .last()
            .map(|s| s.public_key)
            .unwrap_or(self.root_public_key)
    }

    /// Whether the given key appears anywhere in the chain (including as
    /// the root). Receiving such an announcement would form a routing loop.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.root_public_key == *key || self.signatures.iter().any(|s| s.public_key == *key)
    }

    pub fn marshal_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root_public_key.0);
        encode_varu64(self.root_sequence, out);
        for entry in &self.signatures {
            encode_varu64(entry.signing_port, out);
            out.extend_from_slice(&entry.public_key.0);
            out.extend_from_slice(&entry.signature);
        }
    }

    /// Decode an announcement occupying exactly `data`.
    pub fn unmarshal(data: &[u8]) -> Result<RootAnnouncement, WireError> {
        if data.len() < PUBLIC_KEY_SIZE {
            return Err(WireError::Truncated);
        }
        let mut root_key = [0u8; PUBLIC_KEY_SIZE];
        root_key.copy_from_slice(&data[..PUBLIC_KEY_SIZE]);
        let mut offset = PUBLIC_KEY_SIZE;
        let (root_sequence, n) = decode_varu64(&data[offset..])?;
        offset += n;
        let mut signatures = Vec::new();
        while offset < data.len() {
            let (signing_port, n) = decode_varu64(&data[offset..])?;
            offset += n;
            if data.len() < offset + PUBLIC_KEY_SIZE + SIGNATURE_SIZE {
                return Err(WireError::Truncated);
            }
            let mut public_key = [0u8; PUBLIC_KEY_SIZE];
            public_key.copy_from_slice(&data[offset..offset + PUBLIC_KEY_SIZE]);
            offset += PUBLIC_KEY_SIZE;
            let mut signature = [0u8; SIGNATURE_SIZE];
            signature.copy_from_slice(&data[offset..offset + SIGNATURE_SIZE]);
            offset += SIGNATURE_SIZE;
            signatures.push(SignatureEntry {
                signing_port,
                public_key: PublicKey(public_key),
                signature,
            });
        }
        Ok(RootAnnouncement {
            root_public_key: PublicKey(root_key),
            root_sequence,
            signatures,
        })
    }

    /// Append our signature for the given egress port.
    ///
    /// The signature covers the announcement marshalled so far followed by
    /// the varint-encoded port number.
    pub fn sign(&mut self, identity: &Identity, egress_port: Port) {
        let mut message = Vec::with_capacity(128);
        self.marshal_to(&mut message);
        encode_varu64(egress_port, &mut message);
        let signature = identity.signing_key.sign(&message);
        self.signatures.push(SignatureEntry {
            signing_port: egress_port,
            public_key: identity.public_key,
            signature: signature.to_bytes(),
        });
    }

    /// Verify the whole ancestor chain.
    ///
    /// Checks that the chain starts at the root key, that every entry's
    /// signature covers the announcement up to that entry plus its port,
    /// that no egress port is the local port 0 and that no key appears
    /// twice (which would describe a loop).
    pub fn verify(&self) -> bool {
        if let Some(first) = self.signatures.first() {
            if first.public_key != self.root_public_key {
                return false;
            }
        }
        let mut message = Vec::with_capacity(128);
        message.extend_from_slice(&self.root_public_key.0);
        encode_varu64(self.root_sequence, &mut message);
        for (i, entry) in self.signatures.iter().enumerate() {
            if entry.signing_port == 0 {
                return false;
            }
            if self.signatures[..i]
                .iter()
                .any(|e| e.public_key == entry.public_key)
            {
                return false;
            }
            let mut signed = message.clone();
            encode_varu64(entry.signing_port, &mut signed);
            let Ok(verifying) = VerifyingKey::from_bytes(&entry.public_key.0) else {
                return false;
            };
            let signature = Signature::from_bytes(&entry.signature);
            if verifying.verify(&signed, &signature).is_err() {
                return false;
            }
            encode_varu64(entry.signing_port, &mut message);
            message.extend_from_slice(&entry.public_key.0);
            message.extend_from_slice(&entry.signature);
        }
        true
    }
}

// ── Varint codec ─────────────────────────────────────────────────────

/// Maximum encoded length of a varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Encode a u64 as big-endian 7-bit groups, most significant group first,
/// continuation bit in the MSB of every byte except the last.
pub fn encode_varu64(value: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; MAX_VARINT_LEN];
    let mut n = 0;
    let mut v = value;
    loop {
        groups[n] = (v & 0x7f) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (1..n).rev() {
        out.push(groups[i] | 0x80);
    }
    out.push(groups[0]);
}

/// Decode a big-endian varint. Returns the value and bytes consumed.
pub fn decode_varu64(data: &[u8]) -> Result<(u64, usize), WireError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(WireError::MalformedVarint);
        }
        if value.leading_zeros() < 7 {
            // Accumulating another group would overflow 64 bits.
            return Err(WireError::MalformedVarint);
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        Err(WireError::MalformedVarint)
    } else {
        Err(WireError::Truncated)
    }
}
