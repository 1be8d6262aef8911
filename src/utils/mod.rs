//! Utility modules for device placement and memory accounting.

mod device;
mod memory;

pub use device::{Device, DType, dtype_name, get_device, parse_dtype};
pub use memory::{Footprint, format_bytes, tensor_bytes};
