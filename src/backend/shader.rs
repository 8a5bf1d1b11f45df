// Shader module registry
//
// Loads pre-compiled SPIR-V blobs from disk and owns the resulting module
// handles. Modules live exactly as long as the pipeline that consumes them:
// they are registered during every pipeline build and released during every
// bundle teardown.

use ash::vk;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use super::error::{RenderError, RenderResult};

/// Shader stage tag. `Undefined` is the invalid sentinel: registering a
/// shader with it is a programmer error, not a recoverable condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShaderStage {
    #[default]
    Undefined,
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn to_flags(self) -> Option<vk::ShaderStageFlags> {
        match self {
            ShaderStage::Undefined => None,
            ShaderStage::Vertex => Some(vk::ShaderStageFlags::VERTEX),
            ShaderStage::Fragment => Some(vk::ShaderStageFlags::FRAGMENT),
        }
    }
}

/// Where a shader comes from: enough to (re)register it on every pipeline
/// build, since modules share the pipeline's lifetime.
#[derive(Clone, Debug)]
pub struct ShaderSource {
    pub label: String,
    pub path: PathBuf,
    pub entry_point: String,
    pub stage: ShaderStage,
}

pub struct ShaderEntry {
    pub stage: ShaderStage,
    entry_point: CString,
    pub bytecode: Vec<u8>,
    pub module: vk::ShaderModule,
}

/// Label-keyed shader registry. The device handle is bound once after
/// logical-device creation; the registry never owns or destroys the device.
/// Entries keep insertion order so stage-info generation is stable.
#[derive(Default)]
pub struct ShaderRegistry {
    device: Option<ash::Device>,
    entries: Vec<(String, ShaderEntry)>,
}

impl ShaderRegistry {
    pub fn set_device(&mut self, device: ash::Device) {
        self.device = Some(device);
    }

    /// Read a compiled SPIR-V blob and create its module. The blob is kept
    /// alongside the handle. Re-registering a label replaces the previous
    /// entry and destroys its module.
    pub fn register(
        &mut self,
        label: &str,
        path: &Path,
        entry_point: &str,
        stage: ShaderStage,
    ) -> RenderResult<()> {
        if stage.to_flags().is_none() {
            return Err(RenderError::UndefinedStage(label.to_owned()));
        }

        let bytecode = std::fs::read(path).map_err(|source| RenderError::ShaderIo {
            path: PathBuf::from(path),
            source,
        })?;

        let module = match &self.device {
            Some(device) => create_shader_module(device, &bytecode)?,
            None => vk::ShaderModule::null(),
        };

        let entry = ShaderEntry {
            stage,
            entry_point: CString::new(entry_point).unwrap_or_default(),
            bytecode,
            module,
        };

        if let Some(slot) = self.entries.iter_mut().find(|(l, _)| l == label) {
            if slot.1.module != vk::ShaderModule::null() {
                if let Some(device) = &self.device {
                    unsafe { device.destroy_shader_module(slot.1.module, None) };
                }
            }
            slot.1 = entry;
        } else {
            self.entries.push((label.to_owned(), entry));
        }

        log::debug!("registered shader {:?} from {}", label, path.display());
        Ok(())
    }

    /// Stage create-infos in registration order, for pipeline creation.
    /// Entry-point pointers stay valid until the next registry mutation.
    pub fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| {
                let stage = entry.stage.to_flags()?;
                Some(
                    vk::PipelineShaderStageCreateInfo::builder()
                        .stage(stage)
                        .module(entry.module)
                        .name(&entry.entry_point)
                        .build(),
                )
            })
            .collect()
    }

    /// Destroy every module and clear the map. Safe to call redundantly;
    /// must run before the bound device is destroyed.
    pub fn release_all(&mut self) {
        for (label, entry) in self.entries.drain(..) {
            if entry.module != vk::ShaderModule::null() {
                if let Some(device) = &self.device {
                    unsafe { device.destroy_shader_module(entry.module, None) };
                }
            }
            log::debug!("released shader {:?}", label);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn create_shader_module(device: &ash::Device, code: &[u8]) -> RenderResult<vk::ShaderModule> {
    // SPIR-V is a stream of 4-byte words; the compiler collaborator is
    // trusted to produce aligned output.
    let words =
        unsafe { std::slice::from_raw_parts(code.as_ptr() as *const u32, code.len() / 4) };

    let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

    let module = unsafe { device.create_shader_module(&create_info, None)? };
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_blob(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, [0x03u8, 0x02, 0x23, 0x07, 0, 0, 1, 0]).unwrap();
        path
    }

    #[test]
    fn undefined_stage_is_rejected() {
        let mut registry = ShaderRegistry::default();
        let err = registry
            .register("broken", Path::new("unused.spv"), "main", ShaderStage::Undefined)
            .unwrap_err();
        assert!(matches!(err, RenderError::UndefinedStage(label) if label == "broken"));
        assert!(registry.is_empty());
    }

    #[test]
    fn stage_conversion_covers_the_closed_enum() {
        assert_eq!(ShaderStage::Undefined.to_flags(), None);
        assert_eq!(ShaderStage::Vertex.to_flags(), Some(vk::ShaderStageFlags::VERTEX));
        assert_eq!(
            ShaderStage::Fragment.to_flags(),
            Some(vk::ShaderStageFlags::FRAGMENT)
        );
    }

    #[test]
    fn missing_bytecode_reports_the_path() {
        let mut registry = ShaderRegistry::default();
        let err = registry
            .register(
                "vert",
                Path::new("does/not/exist.spv"),
                "main",
                ShaderStage::Vertex,
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::ShaderIo { .. }));
    }

    #[test]
    fn release_all_is_idempotent() {
        let mut registry = ShaderRegistry::default();
        let path = temp_blob("orbit-renderer-release-test.spv");
        registry
            .register("vert", &path, "main", ShaderStage::Vertex)
            .unwrap();
        registry
            .register("frag", &path, "main", ShaderStage::Fragment)
            .unwrap();
        assert_eq!(registry.len(), 2);

        registry.release_all();
        assert!(registry.is_empty());
        registry.release_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistering_a_label_replaces_the_entry() {
        let mut registry = ShaderRegistry::default();
        let path = temp_blob("orbit-renderer-replace-test.spv");
        registry
            .register("vert", &path, "main", ShaderStage::Vertex)
            .unwrap();
        registry
            .register("vert", &path, "main", ShaderStage::Vertex)
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stage_infos_follow_insertion_order() {
        let mut registry = ShaderRegistry::default();
        let path = temp_blob("orbit-renderer-order-test.spv");
        registry
            .register("vert", &path, "main", ShaderStage::Vertex)
            .unwrap();
        registry
            .register("frag", &path, "main", ShaderStage::Fragment)
            .unwrap();

        let infos = registry.stage_infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(infos[1].stage, vk::ShaderStageFlags::FRAGMENT);
    }
}
