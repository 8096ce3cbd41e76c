use std::{ops::Deref, sync::Arc};

use ash::vk::{self};

use crate::error::{Result, VkResultExt};

use super::context::Context;

#[derive(Clone)]
pub struct CommandPool {
    inner: Arc<CommandPoolImpl>,
}

impl CommandPool {
    pub fn new(context: Arc<Context>) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );

        let command_pool = unsafe { context.device.create_command_pool(&create_info, None) }
            .vk_context("Could not create command pool")?;

        Ok(Self {
            inner: Arc::new(CommandPoolImpl {
                inner: command_pool,
                context,
            }),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(count)
            .command_pool(self.inner.inner)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe { self.context().device.allocate_command_buffers(&allocate_info) }
            .vk_context("Could not allocate command buffers")
    }

    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.context()
                .device
                .free_command_buffers(self.inner.inner, command_buffers)
        };
    }

    /// Records `record` into a fresh command buffer, submits it, and blocks until a dedicated
    /// fence signals. The command buffer and the fence are gone when this returns.
    pub fn submit_and_wait<T>(
        &self,
        record: impl FnOnce(vk::CommandBuffer) -> Result<T>,
    ) -> Result<T> {
        let command_buffer = self.allocate_command_buffers(1)?[0];
        let result = self.submit_and_wait_with(command_buffer, record);
        self.free_command_buffers(std::slice::from_ref(&command_buffer));
        result
    }

    fn submit_and_wait_with<T>(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer) -> Result<T>,
    ) -> Result<T> {
        let context = self.context();
        let device = &context.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .vk_context("Could not begin command buffer")?;

        let value = record(command_buffer)?;

        unsafe { device.end_command_buffer(command_buffer) }
            .vk_context("Could not end command buffer")?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .vk_context("Could not create fence")?;

        let submit_info =
            vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));

        let waited = unsafe {
            device
                .queue_submit(context.queue, std::slice::from_ref(&submit_info), fence)
                .and_then(|_| device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX))
        };
        unsafe { device.destroy_fence(fence, None) };
        waited.vk_context("Could not submit single use command buffer")?;

        Ok(value)
    }
}

struct CommandPoolImpl {
    pub inner: vk::CommandPool,
    pub context: Arc<Context>,
}

impl Drop for CommandPoolImpl {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_command_pool(self.inner, None) };
    }
}

impl Deref for CommandPool {
    type Target = vk::CommandPool;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}
