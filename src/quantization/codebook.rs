//! Fixed codebook dtypes (NF4 and the FP4 variants).
//!
//! Each group is scaled so that its absolute maximum lands on the largest
//! table magnitude; every element is then replaced by the index of the
//! nearest table entry. Codebooks carry no zero point.
//!
//! Reference: QLoRA paper (https://arxiv.org/abs/2305.14314)

use crate::config::QuantDtype;

/// The 16 NF4 quantization levels (normalized to [-1, 1])
/// These are optimally spaced for normally distributed data
pub const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.6961928009986877,
    -0.5250730514526367,
    -0.39491748809814453,
    -0.28444138169288635,
    -0.18477343022823334,
    -0.09105003625154495,
    0.0,
    0.07958029955625534,
    0.16093020141124725,
    0.24611230194568634,
    0.33791524171829224,
    0.44070982933044434,
    0.5626170039176941,
    0.7229568362236023,
    1.0,
];

/// bitsandbytes flavor of FP4 (E2M1 with a shifted exponent)
pub const FP4_BNB_LEVELS: [f32; 15] = [
    -12.0, -8.0, -6.0, -4.0, -3.0, -2.0, -0.0625, 0.0, 0.0625, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0,
];

/// Plain E2M1 FP4 values
pub const FP4_E2M1_LEVELS: [f32; 15] = [
    -6.0, -4.0, -3.0, -2.0, -1.5, -1.0, -0.0625, 0.0, 0.0625, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0,
];

/// Width of a stored codebook index
pub const CODEBOOK_BITS: u8 = 4;

/// Lookup table backing a codebook dtype
pub fn table(dtype: QuantDtype) -> Option<&'static [f32]> {
    match dtype {
        QuantDtype::Nf4 => Some(&NF4_LEVELS),
        QuantDtype::Fp4E2m1Bnb => Some(&FP4_BNB_LEVELS),
        QuantDtype::Fp4E2m1 => Some(&FP4_E2M1_LEVELS),
        _ => None,
    }
}

/// Largest representable magnitude of a table
pub fn table_absmax(table: &[f32]) -> f32 {
    table.iter().map(|v| v.abs()).fold(0.0f32, f32::max)
}

/// Find the closest table index for a normalized value.
/// Ties resolve to the lower index.
pub fn nearest_index(table: &[f32], normalized: f32) -> u8 {
    let mut best_idx = 0u8;
    let mut best_dist = f32::MAX;

    for (i, &level) in table.iter().enumerate() {
        let dist = (normalized - level).abs();
        if dist < best_dist {
            best_dist = dist;
            best_idx = i as u8;
        }
    }

    best_idx
}

/// Group scale: `quantile * max|w| / max|table|`, 1.0 for an all-zero group
pub fn group_scale(group: &[f32], table: &[f32], quantile: f32) -> f32 {
    let absmax = group.iter().map(|x| x.abs()).fold(0.0f32, f32::max);
    if absmax == 0.0 {
        return 1.0;
    }
    quantile * absmax / table_absmax(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_ascending() {
        for table in [&NF4_LEVELS[..], &FP4_BNB_LEVELS[..], &FP4_E2M1_LEVELS[..]] {
            assert!(table.windows(2).all(|w| w[0] < w[1]));
            assert!(table.len() <= 1 << CODEBOOK_BITS);
        }
    }

    #[test]
    fn test_nearest_index() {
        assert_eq!(nearest_index(&NF4_LEVELS, 0.0), 7);
        assert_eq!(nearest_index(&NF4_LEVELS, 0.99), 15);
        assert_eq!(nearest_index(&NF4_LEVELS, -5.0), 0);
        assert_eq!(nearest_index(&FP4_E2M1_LEVELS, 1.2), 9);
        // exactly between 1.0 and 1.5
        assert_eq!(nearest_index(&FP4_E2M1_LEVELS, 1.25), 9);
    }

    #[test]
    fn test_group_scale() {
        let group = [0.5f32, -2.0, 1.0];
        assert!((group_scale(&group, &NF4_LEVELS, 1.0) - 2.0).abs() < 1e-6);
        assert!((group_scale(&group, &FP4_BNB_LEVELS, 1.0) - 2.0 / 12.0).abs() < 1e-6);
        assert!((group_scale(&group, &FP4_E2M1_LEVELS, 0.9) - 0.3).abs() < 1e-6);
        assert_eq!(group_scale(&[0.0; 4], &NF4_LEVELS, 1.0), 1.0);
    }
}
