use std::{ffi::CStr, io::Cursor, path::Path, sync::Arc};

use ash::vk;

use crate::error::{RendererError, Result, VkResultExt};

use super::context::Context;

pub const SHADER_ENTRY_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

pub const SPIRV_MAGIC_NUMBER: u32 = 0x0723_0203;

/// Turns a SPIR-V binary into words. Rejects anything that cannot be SPIR-V before the driver
/// gets to see it.
pub fn read_spirv(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    let invalid = |reason: &str| RendererError::InvalidShaderBinary {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if bytes.is_empty() {
        return Err(invalid("the file is empty"));
    }
    if bytes.len() % 4 != 0 {
        return Err(invalid("the length is not a multiple of four"));
    }

    // Swaps byte order when the magic number is reversed
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| invalid(&e.to_string()))?;

    if words.first() != Some(&SPIRV_MAGIC_NUMBER) {
        return Err(invalid("wrong magic number"));
    }
    Ok(words)
}

pub struct ShaderModule {
    pub inner: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    context: Arc<Context>,
}

impl ShaderModule {
    pub fn new(
        context: Arc<Context>,
        name: &str,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let shader_code = read_spirv(name, bytes)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&shader_code);
        let shader_module = unsafe { context.device.create_shader_module(&create_info, None) }
            .vk_context("Could not create shader module")?;

        Ok(Self {
            inner: shader_module,
            stage,
            context,
        })
    }

    /// Loads `<directory>/<file_name>`.
    pub fn load(
        context: Arc<Context>,
        directory: &Path,
        file_name: &str,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let path = directory.join(file_name);
        let bytes = std::fs::read(&path).map_err(|source| RendererError::Io {
            path: path.clone(),
            source,
        })?;
        Self::new(context, file_name, &bytes, stage)
    }

    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .module(self.inner)
            .name(SHADER_ENTRY_NAME)
            .stage(self.stage)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_shader_module(self.inner, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(result: Result<Vec<u32>>) -> String {
        match result {
            Err(RendererError::InvalidShaderBinary { reason, .. }) => reason,
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("binary was accepted"),
        }
    }

    #[test]
    fn accepts_a_minimal_header() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC_NUMBER, 0x0001_0600, 0, 8, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let words = read_spirv("minimal", &bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC_NUMBER);
    }

    #[test]
    fn accepts_big_endian_binaries() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC_NUMBER, 0x0001_0600] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let words = read_spirv("big endian", &bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC_NUMBER, 0x0001_0600]);
    }

    #[test]
    fn rejects_empty_input() {
        assert!(reason(read_spirv("empty", &[])).contains("empty"));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = SPIRV_MAGIC_NUMBER.to_le_bytes();
        assert!(reason(read_spirv("short", &bytes[..3])).contains("multiple of four"));
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = [0u8, 1, 2, 3, 4, 5, 6, 7];
        assert!(reason(read_spirv("garbage", &bytes)).contains("magic"));
    }

    #[test]
    fn error_names_the_shader() {
        let error = read_spirv("raygen.rgen.spv", &[]).unwrap_err();
        assert!(error.to_string().contains("raygen.rgen.spv"));
    }
}
