//! Records ray tracing dispatches from declarative [`Tracable`] descriptions.
//!
//! Pipelines, shader binding tables, descriptor set layouts and descriptor
//! sets are cached and reused across frames. Descriptor objects are kept per
//! frame in flight so a set still read by the GPU is never rewritten.

pub mod cache;
mod descriptor;
mod error;
mod frame;
mod limits;
mod pipeline;
mod sbt;
mod tracable;
mod tracer;

pub use descriptor::*;
pub use error::*;
pub use frame::*;
pub use limits::*;
pub use pipeline::*;
pub use sbt::*;
pub use tracable::*;
pub use tracer::*;

pub use vulkan::{RayTracingShaderGroup, ShaderGroupKind};
