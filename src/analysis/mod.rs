pub mod model;
pub mod stats;
pub mod store;
pub mod window;

pub use model::{ModelArtifact, ModelError, Scorer, StaticThresholds};
pub use store::{ModelLookup, ModelStore};
pub use window::{FeatureVector, FeatureWindow, WindowSnapshot};
