//! Feature and label generation over the rolling bar window.
//!
//! Generators are a closed, serde-tagged set ([`GeneratorSpec`]) applied in
//! declared order by the [`FeatureRegistry`]. Labels live in [`labels`] and are
//! only used when preparing training data offline.

pub mod frame;
pub mod generators;
pub mod labels;
pub mod registry;

pub use frame::{FeatureFrame, BASE_COLUMNS};
pub use generators::{GeneratorInputs, GeneratorSpec};
pub use labels::{generate_labels, LabelSpec};
pub use registry::FeatureRegistry;
