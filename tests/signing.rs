use std::{cell::Cell, rc::Rc};

use esp_updater::{
    verify::{Sha256Hash, SignatureVerifier, UpdateHash},
    Error,
    ErrorCode,
    StagingCommand,
    UpdateTarget,
};
use pretty_assertions::assert_eq;

mod common;

use common::*;

/// Accepts a signature that is the SHA-256 digest of the payload
struct DigestIsSignature;

impl SignatureVerifier for DigestIsSignature {
    fn expected_len(&self) -> u32 {
        32
    }

    fn verify(&self, hash: &dyn UpdateHash, signature: &[u8]) -> bool {
        hash.hash() == signature
    }
}

/// Images carry no trailer, any hash is accepted
struct Unsigned;

impl SignatureVerifier for Unsigned {
    fn expected_len(&self) -> u32 {
        0
    }

    fn verify(&self, _hash: &dyn UpdateHash, signature: &[u8]) -> bool {
        signature.is_empty()
    }
}

/// SHA-256 counting the chunks it is fed
#[derive(Default)]
struct CountingHash {
    inner: Sha256Hash,
    adds: Rc<Cell<usize>>,
}

impl UpdateHash for CountingHash {
    fn begin(&mut self) {
        self.inner.begin();
    }

    fn add(&mut self, data: &[u8]) {
        self.adds.set(self.adds.get() + 1);
        self.inner.add(data);
    }

    fn end(&mut self) {
        self.inner.end();
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn hash(&self) -> &[u8] {
        self.inner.hash()
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hash = Sha256Hash::default();
    hash.begin();
    hash.add(data);
    hash.end();
    hash.hash().to_vec()
}

fn signed(payload: &[u8], signature: &[u8], len_field: u32) -> Vec<u8> {
    let mut image = payload.to_vec();
    image.extend_from_slice(signature);
    image.extend_from_slice(&len_field.to_le_bytes());
    image
}

fn signed_updater() -> TestUpdater {
    let mut updater = updater();
    updater.install_signature(Box::<Sha256Hash>::default(), Box::new(DigestIsSignature));
    updater
}

#[test]
fn signed_image_is_staged_without_trailer() {
    let payload = app_image(0x1234);
    let image = signed(&payload, &sha256(&payload), 32);
    let mut updater = signed_updater();

    updater.begin(image.len() as u32, UpdateTarget::Application, None, false).unwrap();
    updater.write(&image).unwrap();
    let outcome = updater.end(false).unwrap();

    assert_eq!(outcome.size, 0x1234);
    assert_eq!(
        outcome.command,
        Some(StagingCommand::copy_raw(outcome.start, 0, 0x1234))
    );
    assert_eq!(staged(&updater, outcome.start, 0x1234), payload.as_slice());
}

#[test]
fn corrupted_signature_is_rejected() {
    let payload = app_image(0x800);
    let mut signature = sha256(&payload);
    signature[17] ^= 0x01;
    let image = signed(&payload, &signature, 32);
    let mut updater = signed_updater();

    updater.begin(image.len() as u32, UpdateTarget::Application, None, false).unwrap();
    updater.write(&image).unwrap();

    assert_eq!(updater.end(false), Err(Error::SignatureFailed));
    assert_eq!(updater.error_code(), ErrorCode::Sign);
    assert!(updater.commands().command().is_none());
}

#[test]
fn corrupted_payload_is_rejected() {
    let payload = app_image(0x800);
    let mut image = signed(&payload, &sha256(&payload), 32);
    image[0x400] ^= 0x80;
    let mut updater = signed_updater();

    updater.begin(image.len() as u32, UpdateTarget::Application, None, false).unwrap();
    updater.write(&image).unwrap();

    assert_eq!(updater.end(false), Err(Error::SignatureFailed));
}

#[test]
fn wrong_length_field_fails_before_hashing() {
    let payload = app_image(0x800);
    let image = signed(&payload, &sha256(&payload), 0x20_0000);
    let hash = CountingHash::default();
    let adds = hash.adds.clone();

    let mut updater = updater();
    updater.install_signature(Box::new(hash), Box::new(DigestIsSignature));
    updater.begin(image.len() as u32, UpdateTarget::Application, None, false).unwrap();
    updater.write(&image).unwrap();

    assert_eq!(updater.end(false), Err(Error::SignatureFailed));
    assert_eq!(adds.get(), 0);
}

#[test]
fn payload_is_hashed_in_chunks() {
    let payload = app_image(1000);
    let image = signed(&payload, &sha256(&payload), 32);
    let hash = CountingHash::default();
    let adds = hash.adds.clone();

    let mut updater = updater();
    updater.install_signature(Box::new(hash), Box::new(DigestIsSignature));
    updater.begin(image.len() as u32, UpdateTarget::Application, None, false).unwrap();
    updater.write(&image).unwrap();
    updater.end(false).unwrap();

    assert_eq!(adds.get(), 1000usize.div_ceil(128));
}

#[test]
fn zero_length_signature_covers_whole_image() {
    let image = app_image(0x900);
    let mut updater = updater();
    updater.install_signature(Box::<Sha256Hash>::default(), Box::new(Unsigned));

    updater.begin(0x900, UpdateTarget::Application, None, false).unwrap();
    updater.write(&image).unwrap();
    let outcome = updater.end(false).unwrap();

    assert_eq!(outcome.size, 0x900);
}

#[test]
fn md5_is_not_checked_on_signed_images() {
    let payload = app_image(0x300);
    let image = signed(&payload, &sha256(&payload), 32);
    let mut updater = signed_updater();

    updater.begin(image.len() as u32, UpdateTarget::Application, None, false).unwrap();
    updater.set_md5(&"0".repeat(32)).unwrap();
    updater.write(&image).unwrap();

    assert!(updater.end(false).is_ok());
    assert!(!updater.has_error());
}
