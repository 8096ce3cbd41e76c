pub mod pass;
pub mod shader_types;

use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;
use crate::vulkan::descriptor_set::{DescriptorPool, DescriptorSet, DescriptorSetLayout, WriteDescriptorSet};
use crate::vulkan::swapchain::SwapchainContainer;

/// What a surface draws each frame. The frame loop around it is shared by every surface.
pub trait SurfaceRenderer<S = SwapchainContainer> {
    /// Writes this frame's uniforms. The slot's previous frame has finished on the GPU.
    fn update_uniforms(&mut self, slot: usize, swapchain: &S) -> Result<()>;

    fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        slot: usize,
        image_index: u32,
        swapchain: &S,
    ) -> Result<()>;

    /// Runs after [`SurfaceRenderer::record`] and leaves the swapchain image ready for
    /// presentation. Renderers that draw straight into the swapchain image have nothing to do.
    fn record_present_copy(
        &self,
        _command_buffer: vk::CommandBuffer,
        _slot: usize,
        _image_index: u32,
        _swapchain: &S,
    ) -> Result<()> {
        Ok(())
    }

    /// Called while the device is idle, before the swapchain goes away.
    fn release_swapchain_resources(&mut self) {}

    /// Called once the swapchain has new images.
    fn resize(&mut self, swapchain: &S) -> Result<()>;
}

/// A uniform buffer with the descriptor set that points at it, one per frame slot.
pub struct FrameUniforms<T> {
    pub buffer: Buffer<T>,
    pub descriptor_set: DescriptorSet,
}

impl<T> FrameUniforms<T> {
    /// `uniform_binding` receives the buffer, `other_writes` are shared by every slot.
    pub fn new(
        context: Arc<Context>,
        descriptor_pool: &DescriptorPool,
        set_layout: &DescriptorSetLayout,
        size: vk::DeviceSize,
        uniform_binding: u32,
        other_writes: impl Fn() -> Vec<WriteDescriptorSet>,
    ) -> Result<Self> {
        let buffer: Buffer<T> = Buffer::new(
            context.clone(),
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let mut writes = other_writes();
        writes.push(WriteDescriptorSet::buffer(uniform_binding, &buffer));
        let descriptor_set = DescriptorSet::new(&context, descriptor_pool, set_layout, &writes)?;

        Ok(Self {
            buffer,
            descriptor_set,
        })
    }
}
