//! Content-addressed cache keys.
//!
//! A [`ContentKey`] is the SHA-256 of a canonical encoding of everything that
//! changes the synthesized audio: the block text, the model, the voice and the
//! synthesis params. Two requests that would produce the same audio always
//! map to the same key, so the second one is served from cache.
//!
//! Each field is length-prefixed before hashing, so `("ab", "c")` and
//! `("a", "bc")` can never collide.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::ValidationError;
use crate::SynthesisParams;

/// Domain tag mixed into every key. Bump when the encoding changes.
const KEY_DOMAIN: &[u8] = b"lectern/content-key/v1";

/// Hex length of a SHA-256 digest.
pub const CONTENT_KEY_LEN: usize = 64;

/// Deterministic cache key for a synthesized block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentKey(String);

impl ContentKey {
    /// Derive the key for a block of text rendered by `model`/`voice`.
    pub fn derive(text: &str, model_slug: &str, voice_slug: &str, params: &SynthesisParams) -> Self {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, KEY_DOMAIN);
        write_field(&mut hasher, normalize_text(text).as_bytes());
        write_field(&mut hasher, normalize_slug(model_slug).as_bytes());
        write_field(&mut hasher, normalize_slug(voice_slug).as_bytes());
        write_field(&mut hasher, params.speed_pct.to_string().as_bytes());
        write_field(
            &mut hasher,
            params.variant.as_deref().map(normalize_slug).unwrap_or_default().as_bytes(),
        );
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a key received from the outside (URL path, worker result).
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let valid = raw.len() == CONTENT_KEY_LEN
            && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(ValidationError::InvalidValue {
                field: "content_key".to_string(),
                reason: format!("expected {} lowercase hex characters", CONTENT_KEY_LEN),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two nested shard directories (`ab`, `cd`) for this key.
    pub fn shard_prefixes(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.0
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Collapse whitespace runs and trim, so reflowed text keeps its key.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-case and trim a model/voice/variant identifier.
pub fn normalize_slug(slug: &str) -> String {
    slug.trim().to_ascii_lowercase()
}
