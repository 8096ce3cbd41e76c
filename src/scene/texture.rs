use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::loader::LoadedTexture;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::context::Context;
use crate::vulkan::image::Image;
use crate::vulkan::image_view::ImageView;
use crate::vulkan::sampler::Sampler;

/// A sampled colour texture, ready for fragment shaders.
pub struct Texture {
    pub image_view: ImageView,
    pub sampler: Sampler,
}

impl Texture {
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

    pub fn new(
        context: Arc<Context>,
        command_pool: &CommandPool,
        texture: &LoadedTexture,
    ) -> Result<Self> {
        let staging_buffer: Buffer<u8> = Buffer::new_with_data(
            context.clone(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            &texture.rgba,
        )?;

        let image = Image::new_2d(
            context.clone(),
            vk::Extent2D {
                width: texture.width,
                height: texture.height,
            },
            Self::FORMAT,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        command_pool.submit_and_wait(|command_buffer| {
            image.copy_from_buffer_for_texture(command_buffer, &staging_buffer)
        })?;

        let image_view =
            ImageView::new_default(context.clone(), Arc::new(image), vk::ImageAspectFlags::COLOR)?;
        let sampler = Sampler::new_linear_repeat(context)?;

        Ok(Self {
            image_view,
            sampler,
        })
    }
}
