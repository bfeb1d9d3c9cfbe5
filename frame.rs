//! The self-describing encrypted frame.
//!
//! ## Layout (version 1)
//!
//! ```text
//! [magic:6 "SVFENC"][version:1][algorithm:1][flags:1][iv_len:1][iv:iv_len]
//! [tag_len:1][tag:tag_len][ciphertext...]
//! ```
//!
//! `tag_len` is 0 for the legacy CBC algorithm. AEAD tags cover the
//! ciphertext only, so the header (flags byte included) is not
//! authenticated; readers confirm it by decoding and checksumming the
//! payload.

use crate::compression::CompressionAlgorithm;
use crate::encryptor::CipherAlgorithm;
use crate::error::{Result, VfsError};

/// Literal tag at the start of every frame
pub const MAGIC: &[u8; 6] = b"SVFENC";

/// The only frame version this crate reads or writes
pub const VERSION: u8 = 1;

/// magic + version + algorithm + flags + iv_len
pub const HEADER_PREFIX_LEN: usize = 10;

const FLAG_COMPRESSED: u8 = 0x01;
const COMPRESSION_SHIFT: u8 = 2;
const COMPRESSION_MASK: u8 = 0x03;

/// Metadata carried in the frame's flags byte.
///
/// Bit 0 marks a pre-compressed payload; bits 2-3 hold the compression
/// algorithm code (0 = zlib family, 1 = LZ4, 2 = Zstd).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    pub compressed: bool,
    pub compression: CompressionAlgorithm,
}

impl FrameFlags {
    pub fn compressed_with(compression: CompressionAlgorithm) -> Self {
        Self {
            compressed: true,
            compression,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
            flags |= (self.compression.frame_code() & COMPRESSION_MASK) << COMPRESSION_SHIFT;
        }
        flags
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & FLAG_COMPRESSED == 0 {
            return Ok(Self::default());
        }
        let code = (byte >> COMPRESSION_SHIFT) & COMPRESSION_MASK;
        let compression = CompressionAlgorithm::from_frame_code(code)
            .ok_or_else(|| VfsError::format(format!("unknown compression code {code} in flags")))?;
        Ok(Self::compressed_with(compression))
    }
}

/// Build the fixed-size header prefix.
pub fn header_prefix(algorithm: CipherAlgorithm, flags: u8, iv_len: u8) -> [u8; HEADER_PREFIX_LEN] {
    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    prefix[..6].copy_from_slice(MAGIC);
    prefix[6] = VERSION;
    prefix[7] = algorithm.code();
    prefix[8] = flags;
    prefix[9] = iv_len;
    prefix
}

/// Serialize a complete frame.
pub fn encode(
    prefix: &[u8; HEADER_PREFIX_LEN],
    iv: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
) -> Vec<u8> {
    debug_assert_eq!(prefix[9] as usize, iv.len());
    let mut out = Vec::with_capacity(HEADER_PREFIX_LEN + iv.len() + 1 + tag.len() + ciphertext.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(iv);
    out.push(tag.len() as u8);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    out
}

/// A parsed, borrowed view of a frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub algorithm: CipherAlgorithm,
    pub flags: u8,
    pub iv: &'a [u8],
    pub tag: &'a [u8],
    pub ciphertext: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Parse and validate the header. The payload is not decrypted.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_PREFIX_LEN {
            return Err(VfsError::format(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        if &data[..6] != MAGIC {
            return Err(VfsError::format("bad frame magic"));
        }
        if data[6] != VERSION {
            return Err(VfsError::format(format!(
                "unsupported frame version {}",
                data[6]
            )));
        }
        let algorithm = CipherAlgorithm::from_code(data[7])?;
        let flags = data[8];
        let iv_len = data[9] as usize;
        if iv_len != algorithm.iv_len() {
            return Err(VfsError::format(format!(
                "{} expects a {}-byte iv, frame declares {}",
                algorithm,
                algorithm.iv_len(),
                iv_len
            )));
        }

        let mut offset = HEADER_PREFIX_LEN;
        let iv = data
            .get(offset..offset + iv_len)
            .ok_or_else(|| VfsError::format("frame truncated in iv"))?;
        offset += iv_len;

        let tag_len = *data
            .get(offset)
            .ok_or_else(|| VfsError::format("frame truncated before tag length"))?
            as usize;
        offset += 1;
        if tag_len != algorithm.tag_len() {
            return Err(VfsError::format(format!(
                "{} expects a {}-byte tag, frame declares {}",
                algorithm,
                algorithm.tag_len(),
                tag_len
            )));
        }
        let tag = data
            .get(offset..offset + tag_len)
            .ok_or_else(|| VfsError::format("frame truncated in tag"))?;
        offset += tag_len;

        Ok(Self {
            algorithm,
            flags,
            iv,
            tag,
            ciphertext: &data[offset..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn gcm_frame() -> Vec<u8> {
        let prefix = header_prefix(CipherAlgorithm::Aes256Gcm, 0x05, 12);
        encode(&prefix, &[1u8; 12], &[2u8; 16], b"payload")
    }

    #[test]
    fn layout_is_bit_exact() {
        let frame = gcm_frame();
        assert_eq!(&frame[..6], b"SVFENC");
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], 2);
        assert_eq!(frame[8], 0x05);
        assert_eq!(frame[9], 12);
        assert_eq!(&frame[10..22], &[1u8; 12]);
        assert_eq!(frame[22], 16);
        assert_eq!(&frame[23..39], &[2u8; 16]);
        assert_eq!(&frame[39..], b"payload");
    }

    #[test]
    fn parse_recovers_fields() {
        let data = gcm_frame();
        let frame = Frame::parse(&data).unwrap();
        assert_eq!(frame.algorithm, CipherAlgorithm::Aes256Gcm);
        assert_eq!(frame.flags, 0x05);
        assert_eq!(frame.iv, &[1u8; 12]);
        assert_eq!(frame.tag, &[2u8; 16]);
        assert_eq!(frame.ciphertext, b"payload");
    }

    #[test]
    fn cbc_frames_have_no_tag() {
        let prefix = header_prefix(CipherAlgorithm::Aes256Cbc, 0, 16);
        let data = encode(&prefix, &[9u8; 16], &[], &[0u8; 32]);
        assert_eq!(data[26], 0);
        let frame = Frame::parse(&data).unwrap();
        assert!(frame.tag.is_empty());
        assert_eq!(frame.ciphertext.len(), 32);
    }

    #[test]
    fn malformed_headers_are_format_errors() {
        let good = gcm_frame();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';

        let mut bad_version = good.clone();
        bad_version[6] = 2;

        let mut bad_alg = good.clone();
        bad_alg[7] = 9;

        let mut bad_iv_len = good.clone();
        bad_iv_len[9] = 16;

        let mut bad_tag_len = good.clone();
        bad_tag_len[22] = 8;

        let cases: Vec<&[u8]> = vec![
            &good[..5],
            &good[..15],
            &good[..22],
            &good[..30],
            &bad_magic[..],
            &bad_version[..],
            &bad_alg[..],
            &bad_iv_len[..],
            &bad_tag_len[..],
        ];
        for case in cases {
            let err = Frame::parse(case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Format, "{err}");
        }
    }

    #[test]
    fn flags_byte_layout() {
        assert_eq!(FrameFlags::default().to_byte(), 0);
        assert_eq!(FrameFlags::compressed_with(CompressionAlgorithm::Zlib).to_byte(), 0x01);
        assert_eq!(FrameFlags::compressed_with(CompressionAlgorithm::Lz4).to_byte(), 0x05);
        assert_eq!(FrameFlags::compressed_with(CompressionAlgorithm::Zstd).to_byte(), 0x09);

        let parsed = FrameFlags::from_byte(0x09).unwrap();
        assert!(parsed.compressed);
        assert_eq!(parsed.compression, CompressionAlgorithm::Zstd);

        // uncompressed payloads ignore the algorithm bits
        assert!(!FrameFlags::from_byte(0x08).unwrap().compressed);
    }

    #[test]
    fn unknown_compression_code_is_rejected() {
        let err = FrameFlags::from_byte(0x0d).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
