//! Transparent payload compression.
//!
//! Most synthesized audio already arrives in a compressed container, and
//! deflating it again only burns CPU. Payloads whose leading bytes identify
//! such a format are stored as-is; everything else (WAV, raw PCM) is
//! deflated. Output that comes out larger than the input is discarded.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// DEFLATE level, 0-9.
    pub level: u32,
    /// Payloads smaller than this are never compressed.
    pub min_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
            min_bytes: 512,
        }
    }
}

impl CompressionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// A payload ready to hit disk.
#[derive(Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// True when `bytes` start with the signature of an already-compressed format.
pub fn is_precompressed(bytes: &[u8]) -> bool {
    match bytes {
        // ID3-tagged MP3
        [b'I', b'D', b'3', ..] => true,
        // MPEG audio / ADTS AAC frame sync
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => true,
        // Ogg (Opus, Vorbis)
        [b'O', b'g', b'g', b'S', ..] => true,
        [b'f', b'L', b'a', b'C', ..] => true,
        // gzip
        [0x1F, 0x8B, ..] => true,
        // zstd
        [0x28, 0xB5, 0x2F, 0xFD, ..] => true,
        // Matroska / WebM
        [0x1A, 0x45, 0xDF, 0xA3, ..] => true,
        // ISO base media (MP4, M4A)
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => true,
        _ => false,
    }
}

pub fn encode(bytes: Vec<u8>, config: &CompressionConfig) -> io::Result<Encoded> {
    if !config.enabled || bytes.len() < config.min_bytes || is_precompressed(&bytes) {
        return Ok(Encoded {
            bytes,
            compressed: false,
        });
    }

    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(bytes.len() / 2),
        Compression::new(config.level),
    );
    encoder.write_all(&bytes)?;
    let deflated = encoder.finish()?;

    if deflated.len() >= bytes.len() {
        Ok(Encoded {
            bytes,
            compressed: false,
        })
    } else {
        Ok(Encoded {
            bytes: deflated,
            compressed: true,
        })
    }
}

pub fn decode(bytes: Vec<u8>, compressed: bool) -> io::Result<Vec<u8>> {
    if !compressed {
        return Ok(bytes);
    }
    let mut out = Vec::with_capacity(bytes.len() * 2);
    DeflateDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wav_like(len: usize) -> Vec<u8> {
        let mut bytes = b"RIFF\0\0\0\0WAVEfmt ".to_vec();
        bytes.extend(std::iter::repeat(0u8).take(len));
        bytes
    }

    #[test]
    fn test_detects_compressed_containers() {
        assert!(is_precompressed(b"ID3\x04\x00"));
        assert!(is_precompressed(&[0xFF, 0xFB, 0x90, 0x00]));
        assert!(is_precompressed(b"OggS\x00\x02"));
        assert!(is_precompressed(b"fLaC\x00"));
        assert!(is_precompressed(&[0x1F, 0x8B, 0x08]));
        assert!(is_precompressed(&[0x28, 0xB5, 0x2F, 0xFD]));
        assert!(is_precompressed(&[0x1A, 0x45, 0xDF, 0xA3]));
        assert!(is_precompressed(b"\0\0\0\x20ftypM4A "));
        assert!(!is_precompressed(b"RIFF\0\0\0\0WAVE"));
        assert!(!is_precompressed(b""));
    }

    #[test]
    fn test_wav_is_compressed() -> io::Result<()> {
        let raw = wav_like(10_000);
        let encoded = encode(raw.clone(), &CompressionConfig::default())?;
        assert!(encoded.compressed);
        assert!(encoded.bytes.len() < raw.len());
        assert_eq!(decode(encoded.bytes, true)?, raw);
        Ok(())
    }

    #[test]
    fn test_mp3_is_stored_raw() -> io::Result<()> {
        let mut raw = b"ID3".to_vec();
        raw.extend(std::iter::repeat(7u8).take(4096));
        let encoded = encode(raw.clone(), &CompressionConfig::default())?;
        assert!(!encoded.compressed);
        assert_eq!(encoded.bytes, raw);
        Ok(())
    }

    #[test]
    fn test_small_and_disabled_skip() -> io::Result<()> {
        let raw = wav_like(10);
        assert!(!encode(raw.clone(), &CompressionConfig::default())?.compressed);
        assert!(!encode(wav_like(10_000), &CompressionConfig::disabled())?.compressed);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let encoded = encode(bytes.clone(), &CompressionConfig { min_bytes: 0, ..CompressionConfig::default() })
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert!(encoded.bytes.len() <= bytes.len());
            let decoded = decode(encoded.bytes, encoded.compressed)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(decoded, bytes);
        }
    }
}
