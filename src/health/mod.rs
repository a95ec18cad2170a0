pub mod registry;

pub use registry::{Registry, Selector, SharedRegistry};
