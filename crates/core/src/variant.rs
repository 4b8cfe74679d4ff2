//! Engine variants and template selection.
//!
//! Each variant names one graph template shipped with the worker. The
//! request's `engine` field and the presence of an end image decide which
//! template a request runs against.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A named configuration of the generation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineVariant {
    /// Default single-image graph with fp8 weights.
    #[default]
    Fp8,
    /// Quantized GGUF weights, single image only.
    Gguf,
    /// First/last-frame graph taking a start and an end image.
    Flf2v,
}

impl EngineVariant {
    /// Every variant, in preload order.
    pub const ALL: [EngineVariant; 3] = [Self::Fp8, Self::Gguf, Self::Flf2v];

    /// Return the wire-format string for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp8 => "fp8",
            Self::Gguf => "gguf",
            Self::Flf2v => "flf2v",
        }
    }

    /// Parse from a wire-format string.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp8" => Ok(Self::Fp8),
            "gguf" => Ok(Self::Gguf),
            "flf2v" => Ok(Self::Flf2v),
            _ => Err(CoreError::Input(format!(
                "Invalid engine: '{s}'. Must be one of: fp8, gguf, flf2v"
            ))),
        }
    }

    /// Resolve the template variant a request actually runs against.
    ///
    /// `gguf` always keeps the GGUF template, even when an end image is
    /// supplied (that template has no end-image node, so the end image is
    /// dropped during binding). Otherwise an explicit `flf2v` or any end
    /// image selects the dual-image template.
    pub fn select(requested: EngineVariant, has_end_image: bool) -> EngineVariant {
        match requested {
            Self::Gguf => Self::Gguf,
            Self::Flf2v => Self::Flf2v,
            Self::Fp8 if has_end_image => Self::Flf2v,
            Self::Fp8 => Self::Fp8,
        }
    }
}

impl std::fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_variants_case_insensitively() {
        assert_eq!(EngineVariant::from_str("fp8").unwrap(), EngineVariant::Fp8);
        assert_eq!(EngineVariant::from_str("GGUF").unwrap(), EngineVariant::Gguf);
        assert_eq!(EngineVariant::from_str(" flf2v ").unwrap(), EngineVariant::Flf2v);
    }

    #[test]
    fn unknown_variant_is_input_error() {
        let err = EngineVariant::from_str("bf16").unwrap_err();
        assert!(matches!(err, CoreError::Input(_)));
        assert!(err.to_string().contains("fp8, gguf, flf2v"));
    }

    #[test]
    fn gguf_ignores_end_image() {
        assert_eq!(EngineVariant::select(EngineVariant::Gguf, true), EngineVariant::Gguf);
        assert_eq!(EngineVariant::select(EngineVariant::Gguf, false), EngineVariant::Gguf);
    }

    #[test]
    fn end_image_promotes_default_to_dual_image() {
        assert_eq!(EngineVariant::select(EngineVariant::Fp8, true), EngineVariant::Flf2v);
        assert_eq!(EngineVariant::select(EngineVariant::Fp8, false), EngineVariant::Fp8);
        assert_eq!(EngineVariant::select(EngineVariant::Flf2v, false), EngineVariant::Flf2v);
    }

    #[test]
    fn display_matches_wire_format() {
        for variant in EngineVariant::ALL {
            assert_eq!(variant.to_string(), variant.as_str());
        }
    }
}
