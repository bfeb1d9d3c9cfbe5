//! Frame encryption and decryption with the session key.
//!
//! [`Encryptor`] owns the [`KeyManager`] and produces the frame described in
//! [`crate::frame`]. The cipher is picked by the caller on encryption and
//! read back from the frame header on decryption.
//!
//! Supported algorithms:
//!
//! - **AES-256-GCM**: AEAD, 96-bit nonce (default)
//! - **ChaCha20-Poly1305**: AEAD, 96-bit nonce
//! - **AES-256-CBC**: legacy, PKCS#7 padding, no authentication tag
//!
//! A fresh random IV is drawn from `OsRng` on every call; there is no way to
//! pass one in.

use crate::error::{Result, VfsError};
use crate::frame::{self, Frame, FrameFlags};
use crate::key_manager::{KeyManager, KEY_LEN};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, warn};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AEAD_TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CipherAlgorithm {
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub const ALL: [CipherAlgorithm; 3] = [Self::Aes256Cbc, Self::Aes256Gcm, Self::ChaCha20Poly1305];

    /// Algorithm byte written at offset 7 of the frame.
    pub fn code(self) -> u8 {
        match self {
            Self::Aes256Cbc => 1,
            Self::Aes256Gcm => 2,
            Self::ChaCha20Poly1305 => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Aes256Cbc),
            2 => Ok(Self::Aes256Gcm),
            3 => Ok(Self::ChaCha20Poly1305),
            other => Err(VfsError::format(format!("unknown algorithm code {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes256Cbc => "AES-256-CBC",
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    pub fn key_len(self) -> usize {
        KEY_LEN
    }

    pub fn iv_len(self) -> usize {
        match self {
            Self::Aes256Cbc => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 12,
        }
    }

    pub fn tag_len(self) -> usize {
        if self.is_aead() {
            AEAD_TAG_LEN
        } else {
            0
        }
    }

    pub fn is_aead(self) -> bool {
        !matches!(self, Self::Aes256Cbc)
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "aes-256-cbc" | "cbc" => Ok(Self::Aes256Cbc),
            "aes-256-gcm" | "gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" | "chacha20" => Ok(Self::ChaCha20Poly1305),
            other => Err(VfsError::format(format!("unknown cipher '{other}'"))),
        }
    }
}

/// Result of [`Encryptor::decrypt_and_get_flags`].
#[derive(Debug)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub flags: FrameFlags,
    pub algorithm: CipherAlgorithm,
}

/// Encrypts and decrypts frames under the key held by its [`KeyManager`].
#[derive(Default)]
pub struct Encryptor {
    keys: KeyManager,
}

impl Encryptor {
    pub fn new(keys: KeyManager) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyManager {
        &mut self.keys
    }

    pub fn encrypt(&self, plaintext: &[u8], algorithm: CipherAlgorithm) -> Result<Vec<u8>> {
        self.seal(plaintext, algorithm, 0)
    }

    /// Encrypt and carry `flags` in the frame's flags byte.
    pub fn encrypt_with_flags(
        &self,
        plaintext: &[u8],
        algorithm: CipherAlgorithm,
        flags: FrameFlags,
    ) -> Result<Vec<u8>> {
        self.seal(plaintext, algorithm, flags.to_byte())
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let frame = Frame::parse(data)?;
        self.open(&frame)
    }

    /// Decrypt and return the flags the frame was sealed with.
    pub fn decrypt_and_get_flags(&self, data: &[u8]) -> Result<Decrypted> {
        let frame = Frame::parse(data)?;
        let plaintext = self.open(&frame)?;
        let flags = FrameFlags::from_byte(frame.flags)?;
        Ok(Decrypted {
            plaintext,
            flags,
            algorithm: frame.algorithm,
        })
    }

    /// Encrypt the local file at `input` into a frame at `output`; returns
    /// the frame length.
    pub async fn encrypt_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        algorithm: CipherAlgorithm,
    ) -> Result<u64> {
        let (input, output) = (input.as_ref(), output.as_ref());
        let data = fs::read(input).await?;
        let frame = self.encrypt(&data, algorithm)?;
        fs::write(output, &frame).await?;
        debug!(input = %input.display(), output = %output.display(), %algorithm, "encrypted file");
        Ok(frame.len() as u64)
    }

    /// Decrypt the frame stored at `input` into `output`. The algorithm comes
    /// from the frame header. Nothing is written unless decryption succeeds.
    pub async fn decrypt_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<u64> {
        let (input, output) = (input.as_ref(), output.as_ref());
        let data = fs::read(input).await?;
        let plaintext = self.decrypt(&data)?;
        fs::write(output, &plaintext).await?;
        debug!(input = %input.display(), output = %output.display(), "decrypted file");
        Ok(plaintext.len() as u64)
    }

    fn seal(&self, plaintext: &[u8], algorithm: CipherAlgorithm, flags: u8) -> Result<Vec<u8>> {
        let mut iv = vec![0u8; algorithm.iv_len()];
        OsRng.fill_bytes(&mut iv);
        self.seal_with_iv(plaintext, algorithm, flags, &iv)
    }

    fn seal_with_iv(
        &self,
        plaintext: &[u8],
        algorithm: CipherAlgorithm,
        flags: u8,
        iv: &[u8],
    ) -> Result<Vec<u8>> {
        let key = self.keys.key()?;

        let prefix = frame::header_prefix(algorithm, flags, iv.len() as u8);
        let key_bytes = &key.as_bytes()[..algorithm.key_len()];

        let (ciphertext, tag) = match algorithm {
            CipherAlgorithm::Aes256Cbc => {
                let cipher = Aes256CbcEnc::new_from_slices(key_bytes, iv)
                    .map_err(|e| VfsError::authentication(format!("cbc init: {e}")))?;
                (cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext), Vec::new())
            }
            CipherAlgorithm::Aes256Gcm => seal_aead::<Aes256Gcm>(key_bytes, iv, plaintext)?,
            CipherAlgorithm::ChaCha20Poly1305 => {
                seal_aead::<ChaCha20Poly1305>(key_bytes, iv, plaintext)?
            }
        };

        debug!(
            algorithm = %algorithm,
            flags,
            plaintext_len = plaintext.len(),
            ciphertext_len = ciphertext.len(),
            "sealed frame"
        );
        Ok(frame::encode(&prefix, iv, &tag, &ciphertext))
    }

    fn open(&self, frame: &Frame<'_>) -> Result<Vec<u8>> {
        let key = self.keys.key()?;
        let key_bytes = &key.as_bytes()[..frame.algorithm.key_len()];

        let result = match frame.algorithm {
            CipherAlgorithm::Aes256Cbc => Aes256CbcDec::new_from_slices(key_bytes, frame.iv)
                .map_err(|e| VfsError::format(format!("cbc init: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(frame.ciphertext)
                .map_err(|_| VfsError::integrity("cbc padding check failed")),
            CipherAlgorithm::Aes256Gcm => open_aead::<Aes256Gcm>(key_bytes, frame),
            CipherAlgorithm::ChaCha20Poly1305 => open_aead::<ChaCha20Poly1305>(key_bytes, frame),
        };

        if let Err(e) = &result {
            warn!(algorithm = %frame.algorithm, error = %e, "frame decryption failed");
        }
        result
    }
}

// Tags cover the ciphertext only; the header travels unauthenticated.
fn seal_aead<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>
where
    C: AeadInPlace + KeyInit,
{
    let cipher = C::new_from_slice(key)
        .map_err(|e| VfsError::authentication(format!("cipher init: {e}")))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<C>::from_slice(iv), b"", &mut buffer)
        .map_err(|e| VfsError::integrity(format!("encryption failed: {e}")))?;
    Ok((buffer, tag.to_vec()))
}

fn open_aead<C>(key: &[u8], frame: &Frame<'_>) -> Result<Vec<u8>>
where
    C: AeadInPlace + KeyInit,
{
    let cipher = C::new_from_slice(key)
        .map_err(|e| VfsError::authentication(format!("cipher init: {e}")))?;
    let mut buffer = frame.ciphertext.to_vec();
    // Frame::parse has already checked iv and tag lengths against the algorithm
    let nonce = Nonce::<C>::from_slice(frame.iv);
    let tag = Tag::<C>::from_slice(frame.tag);
    cipher
        .decrypt_in_place_detached(nonce, b"", &mut buffer, tag)
        .map_err(|_| VfsError::integrity("authentication tag mismatch"))?;
    Ok(buffer)
}

/// SHA-256 digest used as the plaintext checksum.
pub fn checksum(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn verify_checksum(data: &[u8], expected: &[u8]) -> bool {
    checksum(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionAlgorithm;
    use crate::error::ErrorKind;
    use crate::key_manager::DerivedKey;
    use proptest::prelude::*;

    fn make_encryptor(byte: u8) -> Encryptor {
        Encryptor::new(KeyManager::with_key(DerivedKey::from_bytes([byte; KEY_LEN])))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_frames_roundtrip(data in prop::collection::vec(any::<u8>(), 0..4096), flags in 0u8..12) {
            let enc = make_encryptor(0x42);
            let flags = FrameFlags::from_byte(flags).unwrap_or_default();
            for alg in CipherAlgorithm::ALL {
                let frame = enc.encrypt_with_flags(&data, alg, flags).unwrap();
                let out = enc.decrypt_and_get_flags(&frame).unwrap();
                prop_assert_eq!(&out.plaintext, &data);
                prop_assert_eq!(out.flags, flags);
                prop_assert_eq!(out.algorithm, alg);
            }
        }
    }

    #[test]
    fn header_describes_algorithm() {
        let enc = make_encryptor(1);
        for alg in CipherAlgorithm::ALL {
            let frame = enc.encrypt(b"hello", alg).unwrap();
            assert_eq!(&frame[..6], b"SVFENC");
            assert_eq!(frame[6], 1);
            assert_eq!(frame[7], alg.code());
            assert_eq!(frame[8], 0);
            assert_eq!(frame[9] as usize, alg.iv_len());
            assert_eq!(frame[10 + alg.iv_len()] as usize, alg.tag_len());
            assert_eq!(enc.decrypt(&frame).unwrap(), b"hello");
        }
    }

    #[test]
    fn iv_is_fresh_per_call() {
        let enc = make_encryptor(1);
        for alg in CipherAlgorithm::ALL {
            let a = enc.encrypt(b"same input", alg).unwrap();
            let b = enc.encrypt(b"same input", alg).unwrap();
            let iv_end = 10 + alg.iv_len();
            assert_ne!(&a[10..iv_end], &b[10..iv_end]);
            assert_ne!(a, b);
        }
    }

    #[test]
    fn flipping_any_tag_or_ciphertext_byte_fails() {
        let enc = make_encryptor(7);
        for alg in [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305] {
            let frame = enc.encrypt(b"authenticated payload", alg).unwrap();
            let tag_start = 10 + alg.iv_len() + 1;
            for i in tag_start..frame.len() {
                let mut tampered = frame.clone();
                tampered[i] ^= 0x01;
                let err = enc.decrypt(&tampered).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Integrity, "{alg} byte {i}");
            }
        }
    }

    #[test]
    fn known_answer_frames() {
        let enc = make_encryptor(0x11);
        let cases = [
            (
                CipherAlgorithm::Aes256Gcm,
                [0x22u8; 12].as_slice(),
                "535646454e430102000c222222222222222222222222107d2c12569d5205e9a85129b1a2a318357f926b25afefe8309753ba",
            ),
            (
                CipherAlgorithm::ChaCha20Poly1305,
                [0x22u8; 12].as_slice(),
                "535646454e430103000c222222222222222222222222104a9f1726d2fba4e171268fdfecf1eeeaed10b97252b0da18af0e95",
            ),
            (
                CipherAlgorithm::Aes256Cbc,
                [0x22u8; 16].as_slice(),
                "535646454e430101001022222222222222222222222222222222006857457897466b2a8048aaf830b7855d",
            ),
        ];
        for (alg, iv, expected) in cases {
            let frame = enc.seal_with_iv(b"hello world", alg, 0, iv).unwrap();
            assert_eq!(hex::encode(&frame), expected, "{alg}");
            let reference = hex::decode(expected).unwrap();
            assert_eq!(enc.decrypt(&reference).unwrap(), b"hello world");
        }
    }

    #[test]
    fn flags_are_outside_the_tag() {
        let enc = make_encryptor(7);
        for alg in [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305] {
            let flags = FrameFlags::compressed_with(CompressionAlgorithm::Lz4);
            let mut frame = enc.encrypt_with_flags(b"data", alg, flags).unwrap();
            frame[8] = FrameFlags::compressed_with(CompressionAlgorithm::Zstd).to_byte();
            let out = enc.decrypt_and_get_flags(&frame).unwrap();
            assert_eq!(out.plaintext, b"data");
            assert_eq!(out.flags.compression, CompressionAlgorithm::Zstd);
        }
    }

    #[test]
    fn key_from_wrong_password_never_yields_plaintext() {
        let salt = [9u8; 32];
        let mut right = KeyManager::new();
        right.load("pw1234", &salt).unwrap();
        let mut wrong = KeyManager::new();
        wrong.load("wrong", &salt).unwrap();
        let (right, wrong) = (Encryptor::new(right), Encryptor::new(wrong));

        for alg in [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305] {
            let frame = right.encrypt(b"top secret", alg).unwrap();
            let err = wrong.decrypt(&frame).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Integrity);
        }
    }

    #[test]
    fn operations_without_key_fail() {
        let enc = Encryptor::default();
        assert_eq!(
            enc.encrypt(b"x", CipherAlgorithm::Aes256Gcm).unwrap_err().kind(),
            ErrorKind::Authentication
        );

        let keyed = make_encryptor(3);
        let frame = keyed.encrypt(b"x", CipherAlgorithm::Aes256Gcm).unwrap();
        assert_eq!(enc.decrypt(&frame).unwrap_err().kind(), ErrorKind::Authentication);
    }

    #[test]
    fn cleared_key_stops_decryption() {
        let mut enc = make_encryptor(3);
        let frame = enc.encrypt(b"x", CipherAlgorithm::ChaCha20Poly1305).unwrap();
        enc.keys_mut().clear();
        assert_eq!(enc.decrypt(&frame).unwrap_err().kind(), ErrorKind::Authentication);
    }

    #[test]
    fn bad_magic_is_format_error() {
        let enc = make_encryptor(3);
        let mut frame = enc.encrypt(b"x", CipherAlgorithm::Aes256Gcm).unwrap();
        frame[0] = b'Z';
        assert_eq!(enc.decrypt(&frame).unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(enc.decrypt(b"SVF").unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let enc = make_encryptor(5);
        for alg in CipherAlgorithm::ALL {
            let frame = enc.encrypt(&[], alg).unwrap();
            assert!(enc.decrypt(&frame).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn file_helpers_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (src, sealed, out) = (
            dir.path().join("report.pdf"),
            dir.path().join("report.pdf.svf"),
            dir.path().join("report.out"),
        );
        tokio::fs::write(&src, b"quarterly numbers").await?;
        let enc = make_encryptor(0x42);

        for alg in CipherAlgorithm::ALL {
            let written = enc.encrypt_file(&src, &sealed, alg).await?;
            let frame = tokio::fs::read(&sealed).await?;
            assert_eq!(written, frame.len() as u64);
            assert_eq!(frame[7], alg.code());
            assert_eq!(enc.decrypt_file(&sealed, &out).await?, 17);
            assert_eq!(tokio::fs::read(&out).await?, b"quarterly numbers");
        }
        Ok(())
    }

    #[tokio::test]
    async fn decrypt_file_with_wrong_key_writes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (src, sealed, out) = (
            dir.path().join("a.txt"),
            dir.path().join("a.svf"),
            dir.path().join("a.out"),
        );
        tokio::fs::write(&src, b"secret").await?;
        make_encryptor(1)
            .encrypt_file(&src, &sealed, CipherAlgorithm::Aes256Gcm)
            .await?;

        let err = make_encryptor(2).decrypt_file(&sealed, &out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!out.exists());
        Ok(())
    }

    #[test]
    fn cipher_names_parse() {
        assert_eq!("AES-256-GCM".parse::<CipherAlgorithm>().unwrap(), CipherAlgorithm::Aes256Gcm);
        assert_eq!(
            "chacha20_poly1305".parse::<CipherAlgorithm>().unwrap(),
            CipherAlgorithm::ChaCha20Poly1305
        );
        assert!("rot13".parse::<CipherAlgorithm>().is_err());
    }

    #[test]
    fn checksum_is_sha256() {
        let digest = checksum(b"hello world");
        assert_eq!(
            hex::encode(&digest),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(verify_checksum(b"hello world", &digest));
        assert!(!verify_checksum(b"hello world!", &digest));
    }
}
