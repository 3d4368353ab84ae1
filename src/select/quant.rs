// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Quantization levels and filename detection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Numeric precision scheme of a weights file.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantizationLevel {
    F32,
    F16,
    BF16,
    Q8_0,
    Q6_K,
    Q5_K_M,
    Q5_K_S,
    Q5_1,
    Q5_0,
    Q4_K_M,
    Q4_K_S,
    Q4_1,
    Q4_0,
    IQ4_XS,
    Q3_K_L,
    Q3_K_M,
    Q3_K_S,
    Q2_K,
}

/// Filename tokens, longest first so `Q4_K_M` is never shadowed by `Q4_K`.
const TOKENS: &[(&str, QuantizationLevel)] = &[
    ("Q5_K_M", QuantizationLevel::Q5_K_M),
    ("Q5_K_S", QuantizationLevel::Q5_K_S),
    ("Q4_K_M", QuantizationLevel::Q4_K_M),
    ("Q4_K_S", QuantizationLevel::Q4_K_S),
    ("IQ4_XS", QuantizationLevel::IQ4_XS),
    ("Q3_K_L", QuantizationLevel::Q3_K_L),
    ("Q3_K_M", QuantizationLevel::Q3_K_M),
    ("Q3_K_S", QuantizationLevel::Q3_K_S),
    ("BF16", QuantizationLevel::BF16),
    ("Q8_0", QuantizationLevel::Q8_0),
    ("Q6_K", QuantizationLevel::Q6_K),
    ("Q5_K", QuantizationLevel::Q5_K_M),
    ("Q5_1", QuantizationLevel::Q5_1),
    ("Q5_0", QuantizationLevel::Q5_0),
    ("Q4_K", QuantizationLevel::Q4_K_M),
    ("Q4_1", QuantizationLevel::Q4_1),
    ("Q4_0", QuantizationLevel::Q4_0),
    ("Q3_K", QuantizationLevel::Q3_K_M),
    ("Q2_K", QuantizationLevel::Q2_K),
    ("F32", QuantizationLevel::F32),
    ("F16", QuantizationLevel::F16),
];

impl QuantizationLevel {
    /// Bits per parameter in thousandths, so that sizing stays integral.
    pub fn milli_bits(&self) -> u64 {
        match self {
            QuantizationLevel::F32 => 32_000,
            QuantizationLevel::F16 | QuantizationLevel::BF16 => 16_000,
            QuantizationLevel::Q8_0 => 8_500,
            QuantizationLevel::Q6_K => 6_562,
            QuantizationLevel::Q5_K_M => 5_690,
            QuantizationLevel::Q5_K_S => 5_540,
            QuantizationLevel::Q5_1 => 6_000,
            QuantizationLevel::Q5_0 => 5_500,
            QuantizationLevel::Q4_K_M => 4_625,
            QuantizationLevel::Q4_K_S => 4_500,
            QuantizationLevel::Q4_1 => 5_000,
            QuantizationLevel::Q4_0 => 4_500,
            QuantizationLevel::IQ4_XS => 4_250,
            QuantizationLevel::Q3_K_L => 4_125,
            QuantizationLevel::Q3_K_M => 3_875,
            QuantizationLevel::Q3_K_S => 3_500,
            QuantizationLevel::Q2_K => 2_625,
        }
    }

    pub fn bits_per_parameter(&self) -> f64 {
        self.milli_bits() as f64 / 1000.0
    }

    /// Canonical token as it appears in filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationLevel::F32 => "F32",
            QuantizationLevel::F16 => "F16",
            QuantizationLevel::BF16 => "BF16",
            QuantizationLevel::Q8_0 => "Q8_0",
            QuantizationLevel::Q6_K => "Q6_K",
            QuantizationLevel::Q5_K_M => "Q5_K_M",
            QuantizationLevel::Q5_K_S => "Q5_K_S",
            QuantizationLevel::Q5_1 => "Q5_1",
            QuantizationLevel::Q5_0 => "Q5_0",
            QuantizationLevel::Q4_K_M => "Q4_K_M",
            QuantizationLevel::Q4_K_S => "Q4_K_S",
            QuantizationLevel::Q4_1 => "Q4_1",
            QuantizationLevel::Q4_0 => "Q4_0",
            QuantizationLevel::IQ4_XS => "IQ4_XS",
            QuantizationLevel::Q3_K_L => "Q3_K_L",
            QuantizationLevel::Q3_K_M => "Q3_K_M",
            QuantizationLevel::Q3_K_S => "Q3_K_S",
            QuantizationLevel::Q2_K => "Q2_K",
        }
    }
}

impl fmt::Display for QuantizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        TOKENS
            .iter()
            .find(|(token, _)| *token == upper)
            .map(|(_, level)| *level)
            .ok_or_else(|| format!("unknown quantization level '{}'", s))
    }
}

/// Detect the quantization level named in a file path.
///
/// A token only counts when it is not glued to a preceding letter or digit,
/// so `IQ4_XS` is not read as a `Q4` variant.
pub fn detect_quantization(path: &str) -> Option<QuantizationLevel> {
    let name = path.rsplit('/').next().unwrap_or(path).to_ascii_uppercase();
    TOKENS.iter().find_map(|(token, level)| {
        name.match_indices(token)
            .any(|(idx, _)| {
                name[..idx]
                    .chars()
                    .next_back()
                    .map_or(true, |c| !c.is_ascii_alphanumeric())
            })
            .then_some(*level)
    })
}
