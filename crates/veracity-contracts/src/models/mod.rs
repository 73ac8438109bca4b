mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CHAT, EDIT, VISION};
pub use selectors::{ModelSelection, ModelSelector};
