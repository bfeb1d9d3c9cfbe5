//! Byte-buffer compression under a selectable algorithm.
//!
//! Deflate (zlib or gzip framing) is the baseline every build carries. LZ4
//! and Zstd sit behind the `lz4` and `zstd` cargo features; when a feature
//! is disabled the algorithm routes through zlib on both the compress and
//! decompress paths, and [`CompressionAlgorithm::effective`] reports the
//! substitution so callers can record what was really applied.
//!
//! Empty input always maps to empty output.

use crate::error::{Result, VfsError};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::debug;

/// Refuse to inflate anything larger than this (1 GiB)
pub const MAX_DECOMPRESSED_SIZE: u64 = 1 << 30;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Zlib,
    Gzip,
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 4] = [Self::Zlib, Self::Gzip, Self::Lz4, Self::Zstd];

    pub fn name(self) -> &'static str {
        match self {
            Self::Zlib => "ZLIB",
            Self::Gzip => "GZIP",
            Self::Lz4 => "LZ4",
            Self::Zstd => "ZSTD",
        }
    }

    pub fn max_level(self) -> i32 {
        match self {
            Self::Zlib | Self::Gzip => 9,
            Self::Lz4 => 12,
            Self::Zstd => 22,
        }
    }

    pub fn default_level(self) -> i32 {
        match self {
            Self::Zlib | Self::Gzip => 6,
            Self::Lz4 => 1,
            Self::Zstd => 3,
        }
    }

    /// The algorithm that will actually run in this build.
    pub fn effective(self) -> Self {
        match self {
            Self::Lz4 if !cfg!(feature = "lz4") => Self::Zlib,
            Self::Zstd if !cfg!(feature = "zstd") => Self::Zlib,
            other => other,
        }
    }

    /// Two-bit code carried in the encrypted frame's flags byte.
    /// Zlib and gzip share code 0; the decoder tells them apart by magic.
    pub fn frame_code(self) -> u8 {
        match self {
            Self::Zlib | Self::Gzip => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }

    pub fn from_frame_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Zlib),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zlib" | "deflate" => Ok(Self::Zlib),
            "gzip" | "gz" => Ok(Self::Gzip),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(VfsError::codec(format!("unknown compression algorithm '{other}'"))),
        }
    }
}

/// Compress `data`. `level` is clamped to `1..=algorithm.max_level()`.
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let algorithm = algorithm.effective();
    let level = level.clamp(1, algorithm.max_level());
    let out = match algorithm {
        CompressionAlgorithm::Zlib => compress_zlib(data, level)?,
        CompressionAlgorithm::Gzip => compress_gzip(data, level)?,
        CompressionAlgorithm::Lz4 => compress_lz4(data, level)?,
        CompressionAlgorithm::Zstd => compress_zstd(data, level)?,
    };
    if out.is_empty() {
        return Err(VfsError::codec(format!(
            "{} produced no output for {} input bytes",
            algorithm,
            data.len()
        )));
    }
    Ok(out)
}

/// Decompress `data` that was produced by [`compress`] with `algorithm`.
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let algorithm = algorithm.effective();
    let out = match algorithm {
        CompressionAlgorithm::Zlib | CompressionAlgorithm::Gzip => decompress_deflate(data)?,
        CompressionAlgorithm::Lz4 => decompress_lz4(data)?,
        CompressionAlgorithm::Zstd => decompress_zstd(data)?,
    };
    if out.is_empty() {
        return Err(VfsError::codec(format!(
            "{} decoded {} bytes to nothing",
            algorithm,
            data.len()
        )));
    }
    Ok(out)
}

/// Sniff whether `data` starts with the signature of `algorithm`.
pub fn is_compressed(data: &[u8], algorithm: CompressionAlgorithm) -> bool {
    if data.len() < 2 {
        return false;
    }
    match algorithm.effective() {
        CompressionAlgorithm::Zlib => {
            data[0] == 0x78 && matches!(data[1], 0x01 | 0x5e | 0x9c | 0xda)
        }
        CompressionAlgorithm::Gzip => data[..2] == GZIP_MAGIC,
        CompressionAlgorithm::Lz4 => data.starts_with(&LZ4_FRAME_MAGIC),
        CompressionAlgorithm::Zstd => data.starts_with(&ZSTD_MAGIC),
    }
}

/// Compressed size as a fraction of the original (0.0 for empty input).
pub fn ratio(original: &[u8], compressed: &[u8]) -> f64 {
    if original.is_empty() {
        return 0.0;
    }
    compressed.len() as f64 / original.len() as f64
}

/// Compress the local file at `input` into `output`; returns the bytes written.
pub async fn compress_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    algorithm: CompressionAlgorithm,
    level: i32,
) -> Result<u64> {
    let (input, output) = (input.as_ref(), output.as_ref());
    let data = fs::read(input).await?;
    let packed = compress(&data, algorithm, level)?;
    fs::write(output, &packed).await?;
    debug!(
        input = %input.display(),
        output = %output.display(),
        algorithm = %algorithm.effective(),
        ratio = ratio(&data, &packed),
        "compressed file"
    );
    Ok(packed.len() as u64)
}

/// Reverse of [`compress_file`]; returns the bytes written.
pub async fn decompress_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    algorithm: CompressionAlgorithm,
) -> Result<u64> {
    let (input, output) = (input.as_ref(), output.as_ref());
    let data = fs::read(input).await?;
    let plain = decompress(&data, algorithm)?;
    fs::write(output, &plain).await?;
    debug!(
        input = %input.display(),
        output = %output.display(),
        size = plain.len(),
        "decompressed file"
    );
    Ok(plain.len() as u64)
}

fn codec_err(what: &str, e: impl fmt::Display) -> VfsError {
    VfsError::codec(format!("{what}: {e}"))
}

fn read_capped<R: Read>(reader: R, what: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| codec_err(what, e))?;
    if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(VfsError::codec(format!(
            "{what}: output exceeds {MAX_DECOMPRESSED_SIZE} bytes"
        )));
    }
    Ok(out)
}

fn compress_zlib(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(level as u32));
    enc.write_all(data).map_err(|e| codec_err("zlib encode", e))?;
    enc.finish().map_err(|e| codec_err("zlib encode", e))
}

fn compress_gzip(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::new(level as u32));
    enc.write_all(data).map_err(|e| codec_err("gzip encode", e))?;
    enc.finish().map_err(|e| codec_err("gzip encode", e))
}

fn decompress_deflate(data: &[u8]) -> Result<Vec<u8>> {
    if data.starts_with(&GZIP_MAGIC) {
        read_capped(GzDecoder::new(data), "gzip decode")
    } else {
        read_capped(ZlibDecoder::new(data), "zlib decode")
    }
}

// lz4_flex runs at a single speed, so the level only matters for the fallback.
#[cfg(feature = "lz4")]
fn compress_lz4(data: &[u8], _level: i32) -> Result<Vec<u8>> {
    use lz4_flex::frame::{FrameEncoder, FrameInfo};

    let mut info = FrameInfo::new();
    info.content_size = Some(data.len() as u64);
    info.content_checksum = true;
    let mut enc = FrameEncoder::with_frame_info(info, Vec::new());
    enc.write_all(data).map_err(|e| codec_err("lz4 encode", e))?;
    enc.finish().map_err(|e| codec_err("lz4 encode", e))
}

#[cfg(feature = "lz4")]
fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>> {
    read_capped(lz4_flex::frame::FrameDecoder::new(data), "lz4 decode")
}

#[cfg(not(feature = "lz4"))]
fn compress_lz4(data: &[u8], level: i32) -> Result<Vec<u8>> {
    compress_zlib(data, level.clamp(1, 9))
}

#[cfg(not(feature = "lz4"))]
fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>> {
    decompress_deflate(data)
}

#[cfg(feature = "zstd")]
fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    zstd::bulk::compress(data, level).map_err(|e| codec_err("zstd encode", e))
}

// The declared content size is never trusted for allocation; output grows
// through the capped reader instead.
#[cfg(feature = "zstd")]
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let decoder =
        zstd::stream::read::Decoder::new(data).map_err(|e| codec_err("zstd decode", e))?;
    read_capped(decoder, "zstd decode")
}

#[cfg(not(feature = "zstd"))]
fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    compress_zlib(data, level.clamp(1, 9))
}

#[cfg(not(feature = "zstd"))]
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    decompress_deflate(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. ".repeat(64)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_every_algorithm_roundtrips(data in prop::collection::vec(any::<u8>(), 0..8192), level in 1i32..=22) {
            for algo in CompressionAlgorithm::ALL {
                let c = compress(&data, algo, level).unwrap();
                let d = decompress(&c, algo).unwrap();
                prop_assert_eq!(&d, &data);
            }
        }
    }

    #[test]
    fn empty_input_maps_to_empty_output() {
        for algo in CompressionAlgorithm::ALL {
            assert!(compress(&[], algo, 6).unwrap().is_empty(), "{algo}");
            assert!(decompress(&[], algo).unwrap().is_empty(), "{algo}");
        }
    }

    #[test]
    fn repetitive_data_shrinks() {
        let data = sample();
        for algo in CompressionAlgorithm::ALL {
            let c = compress(&data, algo, algo.default_level()).unwrap();
            assert!(ratio(&data, &c) < 0.5, "{algo} ratio {}", ratio(&data, &c));
        }
    }

    #[test]
    fn signatures_are_sniffed() {
        let data = sample();
        let zlib = compress(&data, CompressionAlgorithm::Zlib, 6).unwrap();
        let gzip = compress(&data, CompressionAlgorithm::Gzip, 6).unwrap();
        assert!(is_compressed(&zlib, CompressionAlgorithm::Zlib));
        assert!(!is_compressed(&zlib, CompressionAlgorithm::Gzip));
        assert!(is_compressed(&gzip, CompressionAlgorithm::Gzip));
        assert!(!is_compressed(&data, CompressionAlgorithm::Zlib));
        assert!(!is_compressed(&[0x78], CompressionAlgorithm::Zlib));
    }

    #[cfg(all(feature = "lz4", feature = "zstd"))]
    #[test]
    fn framed_codecs_carry_their_magic() {
        let data = sample();
        let lz4 = compress(&data, CompressionAlgorithm::Lz4, 1).unwrap();
        let zstd = compress(&data, CompressionAlgorithm::Zstd, 3).unwrap();
        assert!(is_compressed(&lz4, CompressionAlgorithm::Lz4));
        assert!(is_compressed(&zstd, CompressionAlgorithm::Zstd));
    }

    #[test]
    fn gzip_output_decodes_through_zlib_family() {
        let data = sample();
        let gzip = compress(&data, CompressionAlgorithm::Gzip, 9).unwrap();
        assert_eq!(decompress(&gzip, CompressionAlgorithm::Zlib).unwrap(), data);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_stream_frames_without_content_size_decode() {
        let data = sample();
        let streamed = zstd::stream::encode_all(&data[..], 3).unwrap();
        assert_eq!(decompress(&streamed, CompressionAlgorithm::Zstd).unwrap(), data);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_declared_size_is_not_trusted() {
        // single-segment header declaring 512 MiB of content, then nothing
        let mut header = ZSTD_MAGIC.to_vec();
        header.push(0xe0);
        header.extend_from_slice(&(512u64 << 20).to_le_bytes());
        let err = decompress(&header, CompressionAlgorithm::Zstd).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }

    #[test]
    fn malformed_input_is_a_codec_error() {
        for algo in CompressionAlgorithm::ALL {
            let err = decompress(b"definitely not compressed", algo).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Codec, "{algo}");
        }
    }

    #[test]
    fn out_of_range_levels_are_clamped() {
        let data = sample();
        for algo in CompressionAlgorithm::ALL {
            for level in [-5, 0, 99] {
                let c = compress(&data, algo, level).unwrap();
                assert_eq!(decompress(&c, algo).unwrap(), data);
            }
        }
    }

    #[test]
    fn metadata_matches_algorithm() {
        assert_eq!(CompressionAlgorithm::Zlib.max_level(), 9);
        assert_eq!(CompressionAlgorithm::Gzip.max_level(), 9);
        assert_eq!(CompressionAlgorithm::Lz4.max_level(), 12);
        assert_eq!(CompressionAlgorithm::Zstd.max_level(), 22);
        assert_eq!(CompressionAlgorithm::Lz4.name(), "LZ4");
        assert_eq!("ZSTD".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Zstd);
        assert!("brotli".parse::<CompressionAlgorithm>().is_err());
    }

    #[test]
    fn frame_codes_are_stable() {
        assert_eq!(CompressionAlgorithm::Zlib.frame_code(), 0);
        assert_eq!(CompressionAlgorithm::Gzip.frame_code(), 0);
        assert_eq!(CompressionAlgorithm::Lz4.frame_code(), 1);
        assert_eq!(CompressionAlgorithm::Zstd.frame_code(), 2);
        assert_eq!(CompressionAlgorithm::from_frame_code(3), None);
    }

    #[tokio::test]
    async fn file_helpers_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (src, packed, out) = (
            dir.path().join("notes.txt"),
            dir.path().join("notes.txt.z"),
            dir.path().join("notes.out"),
        );
        tokio::fs::write(&src, sample()).await?;

        for algo in CompressionAlgorithm::ALL {
            let written = compress_file(&src, &packed, algo, 6).await?;
            assert_eq!(written, tokio::fs::metadata(&packed).await?.len());
            assert!(written < sample().len() as u64, "{algo}");
            decompress_file(&packed, &out, algo).await?;
            assert_eq!(tokio::fs::read(&out).await?, sample());
        }
        Ok(())
    }

    #[tokio::test]
    async fn file_helpers_report_missing_input() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let absent = dir.path().join("absent");
        let err = compress_file(&absent, dir.path().join("x"), CompressionAlgorithm::Zlib, 6)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let junk = dir.path().join("junk");
        tokio::fs::write(&junk, b"definitely not zlib").await?;
        let err = decompress_file(&junk, dir.path().join("y"), CompressionAlgorithm::Zlib)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
        assert!(!dir.path().join("y").exists());
        Ok(())
    }

    #[test]
    fn ratio_of_empty_original_is_zero() {
        assert_eq!(ratio(&[], &[1, 2, 3]), 0.0);
        assert_eq!(ratio(&[0; 10], &[0; 5]), 0.5);
    }
}
