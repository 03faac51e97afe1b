//! Model capability descriptors.
//!
//! Which voices a model supports, its default voice and its variants are
//! data, loaded from TOML and served to clients. Adding a model means adding
//! a `[[models]]` table, not a code path.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError};
use crate::key::normalize_slug;

/// Catalog shipped with the server when no catalog file is configured.
const BUILTIN_CATALOG: &str = r#"
[[models]]
slug = "kokoro"
display_name = "Kokoro 82M"
default_voice = "af_heart"
variants = ["v1.0"]
max_block_chars = 2000

[[models.voices]]
slug = "af_heart"
display_name = "Heart"
language = "en-US"

[[models.voices]]
slug = "am_adam"
display_name = "Adam"
language = "en-US"

[[models.voices]]
slug = "bf_emma"
display_name = "Emma"
language = "en-GB"

[[models]]
slug = "chatterbox"
display_name = "Chatterbox"
default_voice = "narrator"
variants = []
max_block_chars = 1200

[[models.voices]]
slug = "narrator"
display_name = "Narrator"
"#;

/// A voice offered by a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    pub slug: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Capabilities of a single synthesis model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub slug: String,
    pub display_name: String,
    pub default_voice: String,
    #[serde(default)]
    pub variants: Vec<String>,
    pub max_block_chars: usize,
    pub voices: Vec<VoiceDescriptor>,
}

impl ModelDescriptor {
    pub fn supports_voice(&self, voice_slug: &str) -> bool {
        let voice = normalize_slug(voice_slug);
        self.voices.iter().any(|v| v.slug == voice)
    }
}

/// The set of models a deployment serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut catalog: ModelCatalog = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        catalog.normalize();
        catalog.validate()?;
        Ok(catalog)
    }

    fn normalize(&mut self) {
        for model in &mut self.models {
            model.slug = normalize_slug(&model.slug);
            model.default_voice = normalize_slug(&model.default_voice);
            for voice in &mut model.voices {
                voice.slug = normalize_slug(&voice.slug);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for model in &self.models {
            if model.voices.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("models.{}.voices", model.slug),
                    value: "[]".to_string(),
                    reason: "a model needs at least one voice".to_string(),
                });
            }
            if !model.supports_voice(&model.default_voice) {
                return Err(ConfigError::InvalidValue {
                    field: format!("models.{}.default_voice", model.slug),
                    value: model.default_voice.clone(),
                    reason: "default voice must be one of the model's voices".to_string(),
                });
            }
            if model.max_block_chars == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("models.{}.max_block_chars", model.slug),
                    value: "0".to_string(),
                    reason: "must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, model_slug: &str) -> Option<&ModelDescriptor> {
        let slug = normalize_slug(model_slug);
        self.models.iter().find(|m| m.slug == slug)
    }

    /// Check that `voice_slug` is offered by `model_slug`.
    pub fn validate_pair(
        &self,
        model_slug: &str,
        voice_slug: &str,
    ) -> Result<&ModelDescriptor, ValidationError> {
        let model = self.get(model_slug).ok_or_else(|| ValidationError::UnknownModel {
            model: model_slug.to_string(),
        })?;
        if !model.supports_voice(voice_slug) {
            return Err(ValidationError::UnsupportedVoice {
                model: model.slug.clone(),
                voice: voice_slug.to_string(),
            });
        }
        Ok(model)
    }

    /// Pick the voice to use for `model_slug`: the requested one if supported,
    /// the model default when nothing was requested.
    pub fn resolve_voice(
        &self,
        model_slug: &str,
        requested: Option<&str>,
    ) -> Result<String, ValidationError> {
        match requested {
            Some(voice) => self
                .validate_pair(model_slug, voice)
                .map(|_| normalize_slug(voice)),
            None => self
                .get(model_slug)
                .map(|m| m.default_voice.clone())
                .ok_or_else(|| ValidationError::UnknownModel {
                    model: model_slug.to_string(),
                }),
        }
    }
}
