use std::sync::Arc;

use crate::error::{RendererError, Result, VkResultExt};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;
use crate::vulkan::layout_transition::record_layout_transition;
use ash::vk::{
    self, Extent3D, Format, ImageCreateFlags, ImageLayout, ImageTiling, ImageType,
    ImageUsageFlags, SampleCountFlags, SharingMode,
};

use super::memory::allocate_memory;

/// An image bound at offset 0 to its own memory allocation.
pub struct Image {
    pub inner: vk::Image,
    pub memory: vk::DeviceMemory,

    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,

    context: Arc<Context>,
}

impl Image {
    pub fn new(
        context: Arc<Context>,
        create_info: &vk::ImageCreateInfo,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Image> {
        let device = &context.device;

        let format = create_info.format;
        let extent = create_info.extent;
        let mip_levels = create_info.mip_levels;

        let image =
            unsafe { device.create_image(create_info, None) }.vk_context("Could not create image")?;

        let memory_requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory =
            match allocate_memory(&context, &memory_requirements, memory_property_flags, false) {
                Ok(memory) => memory,
                Err(e) => {
                    unsafe { device.destroy_image(image, None) };
                    return Err(e);
                }
            };

        let image = Self {
            inner: image,
            memory,
            format,
            extent,
            mip_levels,
            context,
        };

        unsafe {
            image
                .context
                .device
                .bind_image_memory(image.inner, image.memory, 0)
        }
        .vk_context("Could not bind image memory")?;

        Ok(image)
    }

    /// A device local 2D image with a single mip level.
    pub fn new_2d(
        context: Arc<Context>,
        extent: vk::Extent2D,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
    ) -> Result<Image> {
        let create_info = vk::ImageCreateInfo {
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            tiling,
            usage,
            ..simple_image_create_info()
        };
        Image::new(context, &create_info, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    /// Records the transitions and the copy that fill mip level 0 from `buffer`,
    /// leaving the image ready for sampling in fragment shaders.
    pub fn copy_from_buffer_for_texture<T>(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: &Buffer<T>,
    ) -> Result<()> {
        let subresource_range = self.full_subresource_range(vk::ImageAspectFlags::COLOR);

        record_layout_transition(
            &self.context,
            command_buffer,
            self.inner,
            ImageLayout::UNDEFINED,
            ImageLayout::TRANSFER_DST_OPTIMAL,
            subresource_range,
        )?;

        let buffer_image_copy = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: self.extent,
        };

        unsafe {
            self.context.device.cmd_copy_buffer_to_image(
                command_buffer,
                buffer.inner,
                self.inner,
                ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&buffer_image_copy),
            )
        };

        record_layout_transition(
            &self.context,
            command_buffer,
            self.inner,
            ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            subresource_range,
        )
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    pub fn full_subresource_range(
        &self,
        aspect_mask: vk::ImageAspectFlags,
    ) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

pub fn simple_image_create_info() -> vk::ImageCreateInfo {
    vk::ImageCreateInfo {
        flags: ImageCreateFlags::empty(),
        image_type: ImageType::TYPE_2D,
        format: Format::UNDEFINED,
        extent: Extent3D {
            width: 0,
            height: 0,
            depth: 0,
        },
        mip_levels: 1,
        array_layers: 1,
        samples: SampleCountFlags::TYPE_1,
        tiling: ImageTiling::OPTIMAL,
        usage: ImageUsageFlags::empty(),
        sharing_mode: SharingMode::EXCLUSIVE,
        initial_layout: ImageLayout::UNDEFINED,
        ..Default::default()
    }
}

pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Returns the first candidate whose properties for `tiling` contain `features`.
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    format_properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let properties = format_properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => properties.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => properties.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

pub fn find_depth_format(context: &Context) -> Result<vk::Format> {
    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |format| unsafe {
            context
                .instance
                .get_physical_device_format_properties(context.physical_device, format)
        },
    )
    .ok_or(RendererError::NoSupportedDepthFormat)
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    format == vk::Format::D32_SFLOAT_S8_UINT || format == vk::Format::D24_UNORM_S8_UINT
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_image(self.inner, None) };
        unsafe { self.context.device.free_memory(self.memory, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimal(features: vk::FormatFeatureFlags) -> vk::FormatProperties {
        vk::FormatProperties {
            optimal_tiling_features: features,
            ..Default::default()
        }
    }

    #[test]
    fn depth_format_prefers_earlier_candidates() {
        let format = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT),
        );
        assert_eq!(format, Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn depth_format_skips_unsupported_candidates() {
        let format = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| match format {
                vk::Format::D24_UNORM_S8_UINT => {
                    optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
                }
                _ => optimal(vk::FormatFeatureFlags::SAMPLED_IMAGE),
            },
        );
        assert_eq!(format, Some(vk::Format::D24_UNORM_S8_UINT));
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
    }

    #[test]
    fn linear_tiling_looks_at_linear_features() {
        let format = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::LINEAR,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT),
        );
        assert_eq!(format, None);
    }
}
