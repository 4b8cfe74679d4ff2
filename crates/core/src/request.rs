//! Request schema and validation.
//!
//! [`JobInput`] mirrors the handler's JSON input as sent by the caller.
//! [`GenerationRequest::from_input`] validates it, applies defaults, and
//! separates the media references (which the worker must still fetch)
//! from the numeric generation parameters.

use std::path::PathBuf;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::CoreError;
use crate::variant::EngineVariant;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_WIDTH: f64 = 640.0;
pub const DEFAULT_HEIGHT: f64 = 360.0;
pub const DEFAULT_LENGTH: u32 = 75;
pub const DEFAULT_STEPS: u32 = 10;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_CFG: f64 = 2.0;
pub const DEFAULT_CONTEXT_OVERLAP: u32 = 48;

/// Largest accepted width or height, before normalization.
pub const MAX_DIMENSION: f64 = 8192.0;

// ---------------------------------------------------------------------------
// Raw input
// ---------------------------------------------------------------------------

/// Handler input exactly as received.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub image_path: Option<String>,

    pub end_image_url: Option<String>,
    pub end_image_base64: Option<String>,
    pub end_image_path: Option<String>,

    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,

    pub width: Option<f64>,
    pub height: Option<f64>,
    #[serde(default, deserialize_with = "whole_number")]
    pub length: Option<u32>,
    #[serde(default, deserialize_with = "whole_number")]
    pub steps: Option<u32>,
    #[serde(default, deserialize_with = "whole_number")]
    pub seed: Option<u64>,
    pub cfg: Option<f64>,
    #[serde(default, deserialize_with = "whole_number")]
    pub context_frames: Option<u32>,
    #[serde(default, deserialize_with = "whole_number")]
    pub context_overlap: Option<u32>,

    pub engine: Option<String>,
}

/// Accept a count given as an integer or as a float (`81.0`), truncating
/// the fraction. Negative and out-of-range values are rejected.
fn whole_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let whole = match (number.as_u64(), number.as_f64()) {
        (Some(n), _) => n,
        (None, Some(f)) if f.is_finite() && f >= 0.0 && f < u64::MAX as f64 => f.trunc() as u64,
        _ => {
            return Err(D::Error::custom(format!(
                "expected a non-negative whole number, got {number}"
            )))
        }
    };
    T::try_from(whole)
        .map(Some)
        .map_err(|_| D::Error::custom(format!("{number} is out of range")))
}

// ---------------------------------------------------------------------------
// Validated request
// ---------------------------------------------------------------------------

/// Where an input image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Inline base64 payload, optionally with a `data:` URI prefix.
    Base64(String),
    /// Remote URL to download.
    Url(String),
    /// File already present on the worker.
    Path(PathBuf),
}

impl MediaSource {
    /// Short label for logs; never includes inline payload bytes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Base64(_) => "base64",
            Self::Url(_) => "url",
            Self::Path(_) => "path",
        }
    }
}

/// Numeric and text parameters injected into the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    /// Requested width before normalization.
    pub width: f64,
    /// Requested height before normalization.
    pub height: f64,
    pub length: u32,
    pub steps: u32,
    pub seed: u64,
    pub cfg: f64,
    pub context_frames: u32,
    pub context_overlap: u32,
}

/// A validated request whose media has not been fetched yet.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub image: MediaSource,
    pub end_image: Option<MediaSource>,
    pub engine: EngineVariant,
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Validate raw input and apply defaults.
    ///
    /// Fails with [`CoreError::Input`] when no image or no prompt is given,
    /// when more than one source is given for the same image, or when the
    /// engine name is unknown.
    pub fn from_input(input: JobInput) -> Result<Self, CoreError> {
        let image = media_source(
            "image",
            input.image_url,
            input.image_base64,
            input.image_path,
        )?
        .ok_or_else(|| {
            CoreError::Input("One of image_url, image_base64 or image_path is required".to_string())
        })?;

        let end_image = media_source(
            "end_image",
            input.end_image_url,
            input.end_image_base64,
            input.end_image_path,
        )?;

        let prompt = input
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| CoreError::Input("prompt is required".to_string()))?;

        let engine = match input.engine.as_deref() {
            Some(name) => EngineVariant::from_str(name)?,
            None => EngineVariant::default(),
        };

        let width = dimension("width", input.width, DEFAULT_WIDTH)?;
        let height = dimension("height", input.height, DEFAULT_HEIGHT)?;

        let length = input.length.unwrap_or(DEFAULT_LENGTH);
        if length == 0 {
            return Err(CoreError::Input("length must be at least 1".to_string()));
        }

        let params = GenerationParams {
            prompt,
            negative_prompt: input.negative_prompt.unwrap_or_default(),
            width,
            height,
            length,
            steps: input.steps.unwrap_or(DEFAULT_STEPS),
            seed: input.seed.unwrap_or(DEFAULT_SEED),
            cfg: input.cfg.unwrap_or(DEFAULT_CFG),
            context_frames: input.context_frames.unwrap_or(length),
            context_overlap: input.context_overlap.unwrap_or(DEFAULT_CONTEXT_OVERLAP),
        };

        Ok(Self {
            image,
            end_image,
            engine,
            params,
        })
    }
}

fn dimension(name: &str, value: Option<f64>, default: f64) -> Result<f64, CoreError> {
    match value {
        None => Ok(default),
        Some(v) if v.is_finite() && v <= MAX_DIMENSION => Ok(v),
        Some(v) => Err(CoreError::Input(format!(
            "{name} must be at most {MAX_DIMENSION}, got {v}"
        ))),
    }
}

/// Pick the single media source for one image role.
fn media_source(
    role: &str,
    url: Option<String>,
    base64: Option<String>,
    path: Option<String>,
) -> Result<Option<MediaSource>, CoreError> {
    let mut sources = Vec::with_capacity(1);
    if let Some(url) = url.filter(|v| !v.is_empty()) {
        sources.push(MediaSource::Url(url));
    }
    if let Some(data) = base64.filter(|v| !v.is_empty()) {
        sources.push(MediaSource::Base64(data));
    }
    if let Some(path) = path.filter(|v| !v.is_empty()) {
        sources.push(MediaSource::Path(PathBuf::from(path)));
    }

    match sources.len() {
        0 => Ok(None),
        1 => Ok(sources.pop()),
        _ => Err(CoreError::Input(format!(
            "Only one of {role}_url, {role}_base64 or {role}_path may be given"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Binding request
// ---------------------------------------------------------------------------

/// Everything the binder needs: local image paths plus parameters.
#[derive(Debug, Clone)]
pub struct BindingRequest {
    /// Path of the start image as the engine will see it.
    pub image: String,
    /// Path of the end image, if one was supplied.
    pub end_image: Option<String>,
    pub params: GenerationParams,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn input(json: serde_json::Value) -> JobInput {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn defaults_applied() {
        let req = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/in.jpg",
            "prompt": "a cat",
        })))
        .unwrap();

        assert_eq!(req.image, MediaSource::Path(PathBuf::from("/in.jpg")));
        assert!(req.end_image.is_none());
        assert_eq!(req.engine, EngineVariant::Fp8);
        assert_eq!(req.params.width, DEFAULT_WIDTH);
        assert_eq!(req.params.height, DEFAULT_HEIGHT);
        assert_eq!(req.params.length, 75);
        assert_eq!(req.params.context_frames, 75);
        assert_eq!(req.params.context_overlap, 48);
        assert_eq!(req.params.steps, 10);
        assert_eq!(req.params.seed, 42);
        assert_eq!(req.params.cfg, 2.0);
        assert_eq!(req.params.negative_prompt, "");
    }

    #[test]
    fn context_frames_follow_length_unless_given() {
        let req = GenerationRequest::from_input(input(serde_json::json!({
            "image_url": "http://x/a.png", "prompt": "p", "length": 81,
        })))
        .unwrap();
        assert_eq!(req.params.context_frames, 81);

        let req = GenerationRequest::from_input(input(serde_json::json!({
            "image_url": "http://x/a.png", "prompt": "p", "length": 81, "context_frames": 33,
        })))
        .unwrap();
        assert_eq!(req.params.context_frames, 33);
    }

    #[test]
    fn missing_image_rejected() {
        let err = GenerationRequest::from_input(input(serde_json::json!({"prompt": "p"})))
            .unwrap_err();
        assert_matches!(err, CoreError::Input(msg) if msg.contains("image_url"));
    }

    #[test]
    fn missing_or_blank_prompt_rejected() {
        let err = GenerationRequest::from_input(input(serde_json::json!({"image_path": "/a"})))
            .unwrap_err();
        assert_matches!(err, CoreError::Input(msg) if msg.contains("prompt"));

        let err = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "prompt": "   ",
        })))
        .unwrap_err();
        assert_matches!(err, CoreError::Input(_));
    }

    #[test]
    fn two_sources_for_one_image_rejected() {
        let err = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "image_url": "http://x/a.png", "prompt": "p",
        })))
        .unwrap_err();
        assert_matches!(err, CoreError::Input(msg) if msg.contains("Only one of image_url"));
    }

    #[test]
    fn end_image_parsed() {
        let req = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "end_image_base64": "aGVsbG8=", "prompt": "p", "engine": "flf2v",
        })))
        .unwrap();
        assert_matches!(req.end_image, Some(MediaSource::Base64(ref s)) if s == "aGVsbG8=");
        assert_eq!(req.engine, EngineVariant::Flf2v);
    }

    #[test]
    fn zero_length_rejected() {
        let err = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "prompt": "p", "length": 0,
        })))
        .unwrap_err();
        assert_matches!(err, CoreError::Input(_));
    }

    #[test]
    fn float_counts_are_truncated() {
        let req = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "prompt": "p", "length": 81.0, "steps": 12.7, "seed": 7.0,
            "context_overlap": 16.0,
        })))
        .unwrap();
        assert_eq!(req.params.length, 81);
        assert_eq!(req.params.steps, 12);
        assert_eq!(req.params.seed, 7);
        assert_eq!(req.params.context_overlap, 16);
    }

    #[test]
    fn negative_or_oversized_counts_do_not_parse() {
        let parsed = serde_json::from_value::<JobInput>(serde_json::json!({"length": -1}));
        assert!(parsed.is_err());
        let parsed = serde_json::from_value::<JobInput>(serde_json::json!({"steps": 5_000_000_000u64}));
        assert!(parsed.is_err());
        let parsed = serde_json::from_value::<JobInput>(serde_json::json!({"length": null}));
        assert!(parsed.unwrap().length.is_none());
    }

    #[test]
    fn oversized_dimension_rejected() {
        let err = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "prompt": "p", "width": 1e12,
        })))
        .unwrap_err();
        assert_matches!(err, CoreError::Input(msg) if msg.contains("width"));
    }

    #[test]
    fn unknown_engine_rejected() {
        let err = GenerationRequest::from_input(input(serde_json::json!({
            "image_path": "/a", "prompt": "p", "engine": "int4",
        })))
        .unwrap_err();
        assert_matches!(err, CoreError::Input(msg) if msg.contains("int4"));
    }
}
