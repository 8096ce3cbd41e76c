use std::path::PathBuf;

use ash::{prelude::VkResult, vk};
use thiserror::Error;

use crate::vulkan::acceleration_structure::BuildState;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("{context}: {result}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },

    #[error("No memory type matches filter {type_filter:#034b} with properties {requested:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        requested: vk::MemoryPropertyFlags,
    },

    #[error("Unsupported layout transition from {old:?} to {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Invalid shader binary {name}: {reason}")]
    InvalidShaderBinary { name: String, reason: String },

    #[error("Could not find a GPU with graphics and presentation support for every window")]
    NoSuitableDevice,

    #[error("Ray tracing is not supported by {device}, missing: {missing}")]
    RayTracingUnsupported { device: String, missing: String },

    #[error("Cannot copy {len} bytes to offset {offset} of a {size} byte buffer")]
    BufferOverflow {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("None of the depth formats is supported")]
    NoSupportedDepthFormat,

    #[error("Acceleration structure {name} cannot go from {from:?} to {to:?}")]
    AccelerationStructureOutOfOrder {
        name: &'static str,
        from: BuildState,
        to: BuildState,
    },

    #[error("The model {0} does not contain a triangle mesh")]
    MissingMesh(PathBuf),

    #[error("Could not load model: {0}")]
    Model(#[from] gltf::Error),

    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] crate::config_loader::ConfigError),

    #[error("Could not create window: {0}")]
    Window(#[from] winit::error::OsError),
}

pub type Result<T, E = RendererError> = std::result::Result<T, E>;

/// Attaches a message to a raw Vulkan result.
pub trait VkResultExt<T> {
    fn vk_context(self, context: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn vk_context(self, context: &'static str) -> Result<T> {
        self.map_err(|result| RendererError::Vulkan { context, result })
    }
}

impl<T> VkResultExt<T> for std::result::Result<T, (Vec<vk::Pipeline>, vk::Result)> {
    fn vk_context(self, context: &'static str) -> Result<T> {
        self.map_err(|(_, result)| RendererError::Vulkan { context, result })
    }
}
