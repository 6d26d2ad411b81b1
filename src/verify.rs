//! Integrity checks of the staged image
//!
//! Unsigned updates are covered by an MD5 digest that is fed every chunk as it
//! is written. Signed updates carry a detached signature behind the payload,
//! followed by a little-endian `u32` holding the signature length:
//!
//! ```text
//! | payload ... | signature (len bytes) | len (4 bytes) |
//! ```
//!
//! The trailer must not be part of the hashed data, so signed images are
//! hashed by reading the payload back from flash once it is complete.

use std::fmt::Write as _;

use log::debug;
use md5::{Digest, Md5};
use sha2::Sha256;

use crate::{error::Error, flash::Flash};

/// Size of the signature length field at the end of a signed image
pub const SIG_LEN_SIZE: u32 = 4;
/// Chunk size used when hashing staged data
pub const HASH_CHUNK_SIZE: usize = 128;

/// A hash over the payload of a signed image
pub trait UpdateHash {
    fn begin(&mut self);
    fn add(&mut self, data: &[u8]);
    fn end(&mut self);
    /// Length of the digest in bytes
    fn len(&self) -> usize;
    /// The digest, valid after [UpdateHash::end]
    fn hash(&self) -> &[u8];
}

/// Checks a detached signature against a hashed payload
pub trait SignatureVerifier {
    /// Number of signature bytes expected behind the payload; zero if images
    /// carry neither a signature nor a length field
    fn expected_len(&self) -> u32;

    /// Whether `signature` matches the finished `hash`
    fn verify(&self, hash: &dyn UpdateHash, signature: &[u8]) -> bool;
}

/// SHA-256 [UpdateHash]
#[derive(Clone, Debug, Default)]
pub struct Sha256Hash {
    hasher: Sha256,
    digest: [u8; 32],
}

impl UpdateHash for Sha256Hash {
    fn begin(&mut self) {
        self.hasher = Sha256::new();
        self.digest = [0; 32];
    }

    fn add(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn end(&mut self) {
        self.digest = self.hasher.finalize_reset().into();
    }

    fn len(&self) -> usize {
        self.digest.len()
    }

    fn hash(&self) -> &[u8] {
        &self.digest
    }
}

/// Running MD5 digest over everything written to flash
#[derive(Clone, Debug, Default)]
pub struct Md5Checksum {
    hasher: Md5,
    digest: Option<[u8; 16]>,
}

impl Md5Checksum {
    pub fn begin(&mut self) {
        self.hasher = Md5::new();
        self.digest = None;
    }

    pub fn add(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish the digest; further data starts a new one
    pub fn calculate(&mut self) -> [u8; 16] {
        let digest: [u8; 16] = self.hasher.finalize_reset().into();
        self.digest = Some(digest);
        digest
    }

    /// The last calculated digest
    pub fn digest(&self) -> Option<[u8; 16]> {
        self.digest
    }

    /// The last calculated digest as lowercase hex, empty if none
    pub fn to_hex(&self) -> String {
        self.digest.map(|d| to_hex(&d)).unwrap_or_default()
    }
}

/// How a session makes sure it staged what was intended
pub enum Verification {
    /// Incremental MD5, optionally compared against an expected digest
    Checksum,
    /// Hash read back from flash and checked against a detached signature
    Signed {
        hash: Box<dyn UpdateHash>,
        verifier: Box<dyn SignatureVerifier>,
    },
}

impl Verification {
    pub fn is_signed(&self) -> bool {
        matches!(self, Verification::Signed { .. })
    }
}

impl std::fmt::Debug for Verification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verification::Checksum => f.write_str("Checksum"),
            Verification::Signed { verifier, .. } => f
                .debug_struct("Signed")
                .field("expected_len", &verifier.expected_len())
                .finish_non_exhaustive(),
        }
    }
}

/// Compare an expected MD5 hex string with a calculated one
pub fn md5_matches(expected: &str, calculated: &str) -> bool {
    expected.eq_ignore_ascii_case(calculated)
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Verify the signed image of `size` bytes staged at `start`
///
/// Returns the size of the payload without the signature trailer. `pause` is
/// called between chunks read back from flash.
pub fn verify_signed<F: Flash + ?Sized>(
    flash: &mut F,
    hash: &mut dyn UpdateHash,
    verifier: &dyn SignatureVerifier,
    start: u32,
    size: u32,
    pause: &mut dyn FnMut(),
) -> Result<u32, Error> {
    let expected_len = verifier.expected_len();
    debug!("[Updater] expected sigLen: {}", expected_len);

    let sig_len = if expected_len > 0 {
        let addr = size
            .checked_sub(SIG_LEN_SIZE)
            .and_then(|offset| start.checked_add(offset))
            .ok_or(Error::SignatureFailed)?;
        let mut raw = [0u8; SIG_LEN_SIZE as usize];
        flash.read(addr, &mut raw).map_err(|_| Error::ReadFailed)?;
        let sig_len = u32::from_le_bytes(raw);
        debug!("[Updater] sigLen from flash: {}", sig_len);
        sig_len
    } else {
        0
    };

    if sig_len != expected_len {
        return Err(Error::SignatureFailed);
    }

    let payload_size = if expected_len > 0 {
        let trailer = sig_len
            .checked_add(SIG_LEN_SIZE)
            .ok_or(Error::SignatureFailed)?;
        size.checked_sub(trailer).ok_or(Error::SignatureFailed)?
    } else {
        size
    };
    debug!("[Updater] Adjusted size (without the signature and sigLen): {}", payload_size);

    let mut chunk = [0u8; HASH_CHUNK_SIZE];
    let mut offset = 0u32;
    hash.begin();
    while offset < payload_size {
        let len = (payload_size - offset).min(HASH_CHUNK_SIZE as u32) as usize;
        flash
            .read(start + offset, &mut chunk[..len])
            .map_err(|_| Error::ReadFailed)?;
        hash.add(&chunk[..len]);
        offset += len as u32;
        pause();
    }
    hash.end();
    debug!("[Updater] Computed Hash: {}", to_hex(hash.hash()));

    let mut signature = Vec::new();
    signature
        .try_reserve_exact(sig_len as usize)
        .map_err(|_| Error::OutOfMemory)?;
    signature.resize(sig_len as usize, 0);
    if sig_len > 0 {
        flash
            .read(start + payload_size, &mut signature)
            .map_err(|_| Error::ReadFailed)?;
        debug!("[Updater] Received Signature: {}", to_hex(&signature));
    }

    if !verifier.verify(hash, &signature) {
        return Err(Error::SignatureFailed);
    }

    debug!("[Updater] Signature matches");
    Ok(payload_size)
}
