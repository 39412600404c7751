use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::FormatError;

/// Tensor naming and layout convention of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Convention {
    /// HuggingFace `LlamaForCausalLM` layout, one tensor per projection.
    Community,
    /// Meta release layout (`consolidated.NN.pth`), q/k rotary pairs
    /// interleaved, possibly split over tensor-parallel files.
    Reference,
    /// The pipeline model's own layout: fused q/k/v, `blocks.{i}` prefix.
    Native,
}

impl Convention {
    pub const ALL: [Convention; 3] = [Self::Community, Self::Reference, Self::Native];

    /// File extensions a checkpoint in this convention may be stored in.
    pub fn source_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Community => &["safetensors", "bin"],
            Self::Reference => &["pth", "safetensors"],
            Self::Native => &["safetensors"],
        }
    }
}

impl FromStr for Convention {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hf" | "huggingface" | "community" => Ok(Self::Community),
            "raw" | "meta" | "reference" => Ok(Self::Reference),
            "native" => Ok(Self::Native),
            other => Err(FormatError::UnknownToken {
                kind: "convention",
                token: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Community => "community",
            Self::Reference => "reference",
            Self::Native => "native",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("hf".parse::<Convention>().unwrap(), Convention::Community);
        assert_eq!("RAW".parse::<Convention>().unwrap(), Convention::Reference);
        assert_eq!("native".parse::<Convention>().unwrap(), Convention::Native);
    }

    #[test]
    fn display_round_trips() {
        for convention in Convention::ALL {
            assert_eq!(
                convention.to_string().parse::<Convention>().unwrap(),
                convention
            );
        }
    }

    #[test]
    fn unknown_convention_is_format_error() {
        let err = "gguf".parse::<Convention>().unwrap_err();
        assert!(matches!(
            err,
            FormatError::UnknownToken {
                kind: "convention",
                ..
            }
        ));
    }
}
