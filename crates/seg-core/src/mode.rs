//! The closed set of model presets served by the gateway.

use std::fmt;
use std::str::FromStr;

use crate::catalog::Vocabulary;

/// A named preset tying together a TorchScript export, its input geometry,
/// and the class vocabulary it predicts over.
///
/// Every output-decoding branch and profile lookup matches exhaustively on
/// this enum; adding a mode without wiring it up everywhere fails to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelMode {
    Fast,
    Balanced,
    Accurate,
    Sota,
}

/// Static description of one model preset.
///
/// `expected_fps` and `memory_mb` are display figures for clients; nothing in
/// the pipeline depends on them.
#[derive(Debug, Clone, Copy)]
pub struct ModelProfile {
    pub name: &'static str,
    pub file: &'static str,
    pub input_size: (i64, i64),
    pub vocabulary: Vocabulary,
    pub expected_fps: u32,
    pub memory_mb: u32,
}

const FAST_PROFILE: ModelProfile = ModelProfile {
    name: "deeplabv3_mobilenet_v3_large",
    file: "deeplabv3_mobilenet_v3_large.pt",
    input_size: (512, 512),
    vocabulary: Vocabulary::Coco21,
    expected_fps: 35,
    memory_mb: 1200,
};

const BALANCED_PROFILE: ModelProfile = ModelProfile {
    name: "deeplabv3_resnet50",
    file: "deeplabv3_resnet50.pt",
    input_size: (640, 640),
    vocabulary: Vocabulary::Coco21,
    expected_fps: 22,
    memory_mb: 2500,
};

const ACCURATE_PROFILE: ModelProfile = ModelProfile {
    name: "segformer-b3-ade20k",
    file: "segformer_b3_ade.pt",
    input_size: (768, 768),
    vocabulary: Vocabulary::Ade150,
    expected_fps: 12,
    memory_mb: 4500,
};

const SOTA_PROFILE: ModelProfile = ModelProfile {
    name: "mask2former-swin-tiny-ade20k",
    file: "mask2former_swin_tiny_ade.pt",
    input_size: (384, 384),
    vocabulary: Vocabulary::Ade150,
    expected_fps: 5,
    memory_mb: 6000,
};

impl ModelMode {
    /// Every mode, in the order advertised to clients.
    pub const ALL: [ModelMode; 4] = [
        ModelMode::Fast,
        ModelMode::Balanced,
        ModelMode::Accurate,
        ModelMode::Sota,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelMode::Fast => "fast",
            ModelMode::Balanced => "balanced",
            ModelMode::Accurate => "accurate",
            ModelMode::Sota => "sota",
        }
    }

    pub fn profile(self) -> &'static ModelProfile {
        match self {
            ModelMode::Fast => &FAST_PROFILE,
            ModelMode::Balanced => &BALANCED_PROFILE,
            ModelMode::Accurate => &ACCURATE_PROFILE,
            ModelMode::Sota => &SOTA_PROFILE,
        }
    }

    pub fn vocabulary(self) -> Vocabulary {
        self.profile().vocabulary
    }

    /// Model input size as `(height, width)`.
    pub fn input_size(self) -> (i64, i64) {
        self.profile().input_size
    }

    pub fn num_classes(self) -> usize {
        self.vocabulary().num_classes()
    }

    /// Dense index used for per-mode lock tables.
    pub(crate) fn index(self) -> usize {
        match self {
            ModelMode::Fast => 0,
            ModelMode::Balanced => 1,
            ModelMode::Accurate => 2,
            ModelMode::Sota => 3,
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a client names a mode outside the closed set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown model mode: {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for ModelMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(ModelMode::Fast),
            "balanced" => Ok(ModelMode::Balanced),
            "accurate" => Ok(ModelMode::Accurate),
            "sota" => Ok(ModelMode::Sota),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}
