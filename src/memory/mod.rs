// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Memory estimation and device fit.
//!
//! Sizes a model from its parameter count and quantization (or, when the
//! parameter count is unknown, from the weights file size) and classifies how
//! well it fits the memory of the current device.
//!
//! # Example
//!
//! ```rust,no_run
//! use modelfetch::memory::{calculate_memory_requirements, check_compatibility, DeviceMemoryInfo};
//! use modelfetch::select::QuantizationLevel;
//!
//! # fn example() -> anyhow::Result<()> {
//! let req = calculate_memory_requirements(7_000_000_000, QuantizationLevel::Q4_K_M, 0.25)?;
//! let device = DeviceMemoryInfo::current();
//! println!("{}", check_compatibility(&req, &device));
//! # Ok(())
//! # }
//! ```

use std::cmp::Ordering;
use std::fmt;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::select::QuantizationLevel;
use crate::utils::format_bytes;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Runtime overhead (KV cache, activations) as a fraction of weights.
pub const DEFAULT_OVERHEAD_FRACTION: f64 = 0.25;

/// File-size estimates add 5% for tensor metadata, in percent.
const FILE_METADATA_PERCENT: u128 = 105;

/// Fractions are applied in millionths to keep the arithmetic integral.
const FRACTION_SCALE: f64 = 1_000_000.0;

/// Usage ratio up to which an oversized model is merely slow.
const SLOW_RATIO_PERCENT: f64 = 85.0;

/// Usage ratio up to which an oversized model may still load.
const RISKY_RATIO_PERCENT: f64 = 95.0;

/// Computed memory need of a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryRequirements {
    pub base_bytes: u64,
    pub overhead_bytes: u64,
    pub total_bytes: u64,
    /// Size reduction against 32-bit weights, when the quantization is known.
    pub compression_ratio: Option<f64>,
}

/// Size a model from its parameter count.
///
/// `base = parameters × bits / 8`, computed over milli-bits in 128-bit
/// integers; a product of parameters and bits beyond `u64` is rejected.
pub fn calculate_memory_requirements(
    parameter_count: u64,
    quantization: QuantizationLevel,
    overhead_fraction: f64,
) -> Result<MemoryRequirements> {
    let milli_bits = u128::from(quantization.milli_bits());
    let overflow = || HubError::Overflow {
        parameters: parameter_count,
        bits_per_parameter: quantization.bits_per_parameter(),
    };

    let total_milli_bits = u128::from(parameter_count) * milli_bits;
    if total_milli_bits > u128::from(u64::MAX) * 1000 {
        tracing::error!(
            parameters = parameter_count,
            bits_per_parameter = quantization.bits_per_parameter(),
            "Memory requirement overflows 64 bits"
        );
        return Err(overflow().into());
    }

    let base = u64::try_from(total_milli_bits.div_ceil(8000)).map_err(|_| overflow())?;
    let mut req = with_overhead(base, overhead_fraction).map_err(|e| {
        if e.downcast_ref::<HubError>().is_some() {
            overflow().into()
        } else {
            e
        }
    })?;
    req.compression_ratio = Some(32.0 / quantization.bits_per_parameter());
    Ok(req)
}

/// Size a model from its weights file when the parameter count is unknown.
pub fn estimate_from_file_size(file_size: u64, overhead_fraction: f64) -> Result<MemoryRequirements> {
    let scaled = (u128::from(file_size) * FILE_METADATA_PERCENT).div_ceil(100);
    let base = u64::try_from(scaled).map_err(|_| {
        tracing::error!(file_size, "File-size estimate overflows 64 bits");
        HubError::Overflow {
            parameters: file_size,
            bits_per_parameter: 8.0,
        }
    })?;
    with_overhead(base, overhead_fraction)
}

fn with_overhead(base: u64, overhead_fraction: f64) -> Result<MemoryRequirements> {
    ensure!(
        overhead_fraction.is_finite() && overhead_fraction >= 0.0,
        "Overhead fraction must be a non-negative number, got {}",
        overhead_fraction
    );
    let scaled_fraction = (overhead_fraction * FRACTION_SCALE).round() as u128;
    let overhead = u64::try_from(u128::from(base) * scaled_fraction / FRACTION_SCALE as u128).map_err(|_| {
        HubError::Overflow {
            parameters: base,
            bits_per_parameter: 8.0,
        }
    })?;
    let total = base.checked_add(overhead).ok_or(HubError::Overflow {
        parameters: base,
        bits_per_parameter: 8.0,
    })?;
    Ok(MemoryRequirements {
        base_bytes: base,
        overhead_bytes: overhead,
        total_bytes: total,
        compression_ratio: None,
    })
}

/// Memory tiers that drive quantization preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    /// Under 16 GiB: maximum compression.
    Low,
    /// 16 to 32 GiB: balanced.
    Medium,
    /// 32 GiB and up: highest quality.
    High,
}

impl MemoryTier {
    pub fn from_total_bytes(total: u64) -> Self {
        if total >= 32 * GIB {
            MemoryTier::High
        } else if total >= 16 * GIB {
            MemoryTier::Medium
        } else {
            MemoryTier::Low
        }
    }

    /// Quantization levels in order of preference.
    pub fn preferences(&self) -> &'static [QuantizationLevel] {
        use QuantizationLevel::*;
        match self {
            MemoryTier::High => &[Q8_0, Q6_K, Q5_K_M, Q5_K_S, Q4_K_M],
            MemoryTier::Medium => &[Q4_K_M, Q5_K_M, Q4_K_S, Q4_0, Q6_K, Q8_0],
            MemoryTier::Low => &[Q3_K_M, Q3_K_S, Q2_K, Q4_K_S, Q4_0, Q4_K_M],
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::Low => write!(f, "low"),
            MemoryTier::Medium => write!(f, "medium"),
            MemoryTier::High => write!(f, "high"),
        }
    }
}

/// Device class, which decides how much memory stays reserved for the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Desktop,
    Phone,
    Tablet,
    Headset,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "ios") {
            Platform::Phone
        } else {
            Platform::Desktop
        }
    }

    pub fn reserve_fraction(&self) -> f64 {
        match self {
            Platform::Desktop => 0.05,
            Platform::Phone | Platform::Tablet => 0.10,
            Platform::Headset => 0.15,
        }
    }

    pub fn reserve_floor(&self) -> u64 {
        match self {
            Platform::Desktop => 512 * MIB,
            Platform::Phone | Platform::Tablet => 256 * MIB,
            Platform::Headset => 768 * MIB,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Desktop => write!(f, "desktop"),
            Platform::Phone => write!(f, "phone"),
            Platform::Tablet => write!(f, "tablet"),
            Platform::Headset => write!(f, "headset"),
        }
    }
}

/// Snapshot of host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub platform: Platform,
    /// CPU and GPU share one memory pool.
    pub unified_memory: bool,
}

impl DeviceMemoryInfo {
    /// Build a snapshot, clamping `available` to `total`.
    pub fn new(total_bytes: u64, available_bytes: u64, platform: Platform) -> Self {
        let available_bytes = available_bytes.min(total_bytes);
        Self {
            total_bytes,
            available_bytes,
            used_bytes: total_bytes - available_bytes,
            platform,
            unified_memory: false,
        }
    }

    pub fn with_unified_memory(mut self, unified: bool) -> Self {
        self.unified_memory = unified;
        self
    }

    /// Sample the current host.
    pub fn current() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let unified = cfg!(any(target_os = "macos", target_os = "ios"));
        Self::new(sys.total_memory(), sys.available_memory(), Platform::current()).with_unified_memory(unified)
    }

    pub fn tier(&self) -> MemoryTier {
        MemoryTier::from_total_bytes(self.total_bytes)
    }

    /// Bytes reserved for the OS: the larger of the platform share and floor.
    pub fn reserved_bytes(&self) -> u64 {
        let share = (self.total_bytes as f64 * self.platform.reserve_fraction()) as u64;
        share.max(self.platform.reserve_floor())
    }

    /// Memory a model may use.
    pub fn usable_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.reserved_bytes())
    }
}

/// How well a model fits a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceCompatibility {
    /// Everything fits in usable memory.
    FullOffload { available: u64 },
    /// Weights fit, runtime overhead does not.
    PartialOffload { percentage: f64, available: u64 },
    /// Fits physical memory but crowds the system.
    NotRecommended { reason: String },
    /// Cannot run on this device.
    Incompatible { minimum: u64, available: u64 },
}

impl DeviceCompatibility {
    fn rank(&self) -> u8 {
        match self {
            DeviceCompatibility::FullOffload { .. } => 3,
            DeviceCompatibility::PartialOffload { .. } => 2,
            DeviceCompatibility::NotRecommended { .. } => 1,
            DeviceCompatibility::Incompatible { .. } => 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.rank() > 0
    }
}

impl PartialOrd for DeviceCompatibility {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal if self == other => Some(Ordering::Equal),
            Ordering::Equal => None,
            ordering => Some(ordering),
        }
    }
}

impl fmt::Display for DeviceCompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCompatibility::FullOffload { available } => {
                write!(f, "Fits in memory ({} usable)", format_bytes(*available))
            }
            DeviceCompatibility::PartialOffload { percentage, available } => write!(
                f,
                "Partial fit: {:.0}% in memory ({} usable)",
                percentage,
                format_bytes(*available)
            ),
            DeviceCompatibility::NotRecommended { reason } => write!(f, "Not recommended: {}", reason),
            DeviceCompatibility::Incompatible { minimum, available } => write!(
                f,
                "Incompatible: needs at least {}, {} usable",
                format_bytes(*minimum),
                format_bytes(*available)
            ),
        }
    }
}

/// Classify `requirements` against `device`.
pub fn check_compatibility(requirements: &MemoryRequirements, device: &DeviceMemoryInfo) -> DeviceCompatibility {
    let usable = device.usable_bytes();
    let total = requirements.total_bytes;

    if total <= usable {
        return DeviceCompatibility::FullOffload { available: usable };
    }
    if requirements.base_bytes <= usable {
        let percentage = if total == 0 { 100.0 } else { usable as f64 / total as f64 * 100.0 };
        return DeviceCompatibility::PartialOffload {
            percentage,
            available: usable,
        };
    }
    if total <= device.total_bytes && device.total_bytes > 0 {
        let ratio = total as f64 / device.total_bytes as f64 * 100.0;
        if ratio <= SLOW_RATIO_PERCENT {
            return DeviceCompatibility::NotRecommended {
                reason: format!("will use {:.0}% of memory, expect slower performance", ratio),
            };
        }
        if ratio <= RISKY_RATIO_PERCENT {
            return DeviceCompatibility::NotRecommended {
                reason: format!(
                    "will use {:.0}% of memory, the system may swap heavily or stop the model",
                    ratio
                ),
            };
        }
    }
    DeviceCompatibility::Incompatible {
        minimum: requirements.base_bytes,
        available: usable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::hub_error;

    #[test]
    fn test_overflow_is_rejected() {
        let err = calculate_memory_requirements(1u64 << 63, QuantizationLevel::F32, 0.25).unwrap_err();
        assert_eq!(
            hub_error(&err),
            Some(&HubError::Overflow {
                parameters: 1u64 << 63,
                bits_per_parameter: 32.0
            })
        );
    }

    #[test]
    fn test_integral_bits_are_exact() {
        let req = calculate_memory_requirements(7_000_000_000, QuantizationLevel::F16, 0.25).unwrap();
        assert_eq!(req.base_bytes, 14_000_000_000);
        assert_eq!(req.overhead_bytes, 3_500_000_000);
        assert_eq!(req.total_bytes, 17_500_000_000);
        assert_eq!(req.compression_ratio, Some(2.0));
    }

    #[test]
    fn test_fractional_bits() {
        let req = calculate_memory_requirements(1_000_000_000, QuantizationLevel::Q4_K_M, 0.0).unwrap();
        assert_eq!(req.base_bytes, 578_125_000);
        assert_eq!(req.total_bytes, req.base_bytes);
        let ratio = req.compression_ratio.unwrap();
        assert!((ratio - 32.0 / 4.625).abs() < 1e-9);
    }

    #[test]
    fn test_largest_fitting_input() {
        let max_params = u64::MAX / 32;
        let req = calculate_memory_requirements(max_params, QuantizationLevel::F32, 0.0).unwrap();
        assert_eq!(req.base_bytes, max_params * 4);
    }

    #[test]
    fn test_estimate_from_file_size() {
        let req = estimate_from_file_size(1000, DEFAULT_OVERHEAD_FRACTION).unwrap();
        assert_eq!(req.base_bytes, 1050);
        assert_eq!(req.overhead_bytes, 262);
        assert_eq!(req.total_bytes, 1312);
        assert_eq!(req.compression_ratio, None);

        assert!(estimate_from_file_size(u64::MAX, 0.25).is_err());
        assert!(estimate_from_file_size(10, -1.0).is_err());
    }

    #[test]
    fn test_memory_tiers() {
        assert_eq!(MemoryTier::from_total_bytes(8 * GIB), MemoryTier::Low);
        assert_eq!(MemoryTier::from_total_bytes(16 * GIB), MemoryTier::Medium);
        assert_eq!(MemoryTier::from_total_bytes(32 * GIB - 1), MemoryTier::Medium);
        assert_eq!(MemoryTier::from_total_bytes(64 * GIB), MemoryTier::High);
        assert_eq!(MemoryTier::Medium.preferences()[0], QuantizationLevel::Q4_K_M);
    }

    #[test]
    fn test_reserves() {
        let desktop = DeviceMemoryInfo::new(16 * GIB, 10 * GIB, Platform::Desktop);
        assert_eq!(desktop.reserved_bytes(), (16 * GIB) / 20);
        assert_eq!(desktop.used_bytes, 6 * GIB);

        let small = DeviceMemoryInfo::new(2 * GIB, 3 * GIB, Platform::Desktop);
        assert_eq!(small.available_bytes, 2 * GIB);
        assert_eq!(small.reserved_bytes(), 512 * MIB);

        let headset = DeviceMemoryInfo::new(GIB, GIB, Platform::Headset);
        assert_eq!(headset.usable_bytes(), 256 * MIB);
    }

    fn req(base: u64, total: u64) -> MemoryRequirements {
        MemoryRequirements {
            base_bytes: base,
            overhead_bytes: total - base,
            total_bytes: total,
            compression_ratio: None,
        }
    }

    #[test]
    fn test_compatibility_classes() {
        let desktop = DeviceMemoryInfo::new(16 * GIB, 16 * GIB, Platform::Desktop);
        let usable = desktop.usable_bytes();

        assert_eq!(
            check_compatibility(&req(6 * GIB, 8 * GIB), &desktop),
            DeviceCompatibility::FullOffload { available: usable }
        );

        match check_compatibility(&req(14 * GIB, 18 * GIB), &desktop) {
            DeviceCompatibility::PartialOffload { percentage, available } => {
                assert_eq!(available, usable);
                assert!((percentage - usable as f64 / (18 * GIB) as f64 * 100.0).abs() < 1e-9);
            }
            other => panic!("expected partial offload, got {:?}", other),
        }

        assert_eq!(
            check_compatibility(&req(20 * GIB, 24 * GIB), &desktop),
            DeviceCompatibility::Incompatible { minimum: 20 * GIB, available: usable }
        );
    }

    #[test]
    fn test_not_recommended_bands() {
        // Reserve floor dominates on small devices.
        let small = DeviceMemoryInfo::new(2 * GIB, 2 * GIB, Platform::Desktop);
        match check_compatibility(&req(1600 * MIB, 1650 * MIB), &small) {
            DeviceCompatibility::NotRecommended { reason } => {
                assert!(reason.contains("expect slower performance"), "{}", reason)
            }
            other => panic!("expected not recommended, got {:?}", other),
        }

        let phone = DeviceMemoryInfo::new(8 * GIB, 8 * GIB, Platform::Phone);
        match check_compatibility(&req(7400 * MIB, 7600 * MIB), &phone) {
            DeviceCompatibility::NotRecommended { reason } => assert!(reason.contains("swap"), "{}", reason),
            other => panic!("expected not recommended, got {:?}", other),
        }

        assert!(matches!(
            check_compatibility(&req(7900 * MIB, 8100 * MIB), &phone),
            DeviceCompatibility::Incompatible { .. }
        ));
    }

    #[test]
    fn test_compatibility_ordering() {
        let full = DeviceCompatibility::FullOffload { available: 1 };
        let partial = DeviceCompatibility::PartialOffload { percentage: 50.0, available: 1 };
        let not_rec = DeviceCompatibility::NotRecommended { reason: "x".into() };
        let incompatible = DeviceCompatibility::Incompatible { minimum: 2, available: 1 };
        assert!(full > partial);
        assert!(partial > not_rec);
        assert!(not_rec > incompatible);
        assert!(!incompatible.is_runnable());
    }

    #[test]
    fn test_current_device_is_consistent() {
        let device = DeviceMemoryInfo::current();
        assert!(device.available_bytes <= device.total_bytes);
        assert!(device.used_bytes <= device.total_bytes);
    }
}
