// Error taxonomy for the render backend
//
// Capability and resource-creation failures are fatal and unwind to the
// init or frame boundary. Stale-surface conditions (out-of-date swapchain)
// are handled as rebuild triggers and never pass through this type.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("required layer {0} is not supported by this Vulkan installation")]
    MissingRequiredLayer(String),

    #[error("no physical device meets the extension, queue-family and swapchain requirements")]
    NoAdequateDevice,

    #[error("no memory type matches filter {type_filter:#x} with properties {flags:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("graphics queue rejected submission: {0}")]
    QueueSubmit(vk::Result),

    #[error("shader {0} has an undefined stage tag")]
    UndefinedStage(String),

    #[error("failed to read shader bytecode from {path:?}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load the Vulkan library: {0}")]
    EntryLoad(#[from] ash::LoadingError),

    #[error("vulkan call failed: {0}")]
    Vk(#[from] vk::Result),
}
