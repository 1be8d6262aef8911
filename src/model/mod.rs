//! Model graph and its persistence.

mod graph;
mod save_load;

pub use graph::{LayerGraph, NamedLayer};
pub use save_load::{LayerRecord, QCONFIG_FILE, WEIGHTS_FILE, load, save};
