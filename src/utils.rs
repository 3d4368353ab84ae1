// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for modelfetch.

/// Mask a sensitive string (like registry tokens) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use modelfetch::utils::mask_sensitive;
///
/// let token = "hf_abcdefghijklmnopqrstuvwxyz";
/// assert_eq!(mask_sensitive(token, 5), "hf_ab...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.len() <= visible_prefix {
        // Still masked so the length does not leak
        return format!("{}...", input);
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Human-readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Random lowercase hex identifier of `len` characters.
pub fn random_id(len: usize) -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len.div_ceil(2)).map(|_| rng.gen()).collect();
    let mut id = hex::encode(bytes);
    id.truncate(len);
    id
}
