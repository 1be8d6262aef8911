//! Memory accounting for dense and packed weights.

use std::fmt;

use candle_core::Tensor;

/// Bytes held by a tensor's elements
pub fn tensor_bytes(tensor: &Tensor) -> u64 {
    (tensor.elem_count() * tensor.dtype().size_in_bytes()) as u64
}

/// Dense vs. packed weight bytes across a rewrite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footprint {
    /// Bytes of the dense weights that were replaced
    pub dense: u64,
    /// Bytes of the packed codes, scales and zero points that replaced them
    pub packed: u64,
}

impl Footprint {
    pub fn add(&mut self, dense: u64, packed: u64) {
        self.dense += dense;
        self.packed += packed;
    }

    /// Packed size relative to the dense size (1.0 when nothing was packed)
    pub fn ratio(&self) -> f64 {
        if self.dense == 0 {
            1.0
        } else {
            self.packed as f64 / self.dense as f64
        }
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({:.1}%)",
            format_bytes(self.dense),
            format_bytes(self.packed),
            self.ratio() * 100.0
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
