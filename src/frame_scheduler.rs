use std::sync::Arc;

use ash::vk;
use log::debug;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::error::{RendererError, Result, VkResultExt};
use crate::render::SurfaceRenderer;
use crate::vulkan::command_pool::CommandPool;
use crate::vulkan::context::Context;
use crate::vulkan::swapchain::{AcquireOutcome, PresentOutcome, SwapchainContainer};

/// How many frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing was drawn, the window has no area
    Skipped,
    /// The swapchain was rebuilt during this frame
    Recreated,
}

/// The steps of one frame on one surface. Every method gets the slot it acts on.
pub trait FrameBackend {
    /// Blocks until the GPU is done with the slot's previous frame.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome>;
    /// Resets the slot's fence and command buffer.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    /// Rebuilds the swapchain and everything that depends on its images.
    fn recreate(&mut self) -> Result<()>;

    fn is_minimized(&self) -> bool {
        false
    }
}

/// Drives the acquire, record, submit, present cycle of one surface.
pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    current_frame: usize,
    resize_requested: bool,
}

impl<B: FrameBackend> FrameScheduler<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            current_frame: 0,
            resize_requested: false,
        }
    }

    /// The swapchain is rebuilt after the next present.
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn draw_frame(&mut self) -> Result<FrameOutcome> {
        if self.backend.is_minimized() {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.current_frame;
        self.backend.wait_for_slot(slot)?;

        let image_index = match self.backend.acquire(slot)? {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => {
                debug!("Swapchain out of date while acquiring");
                return self.recreate_swapchain();
            }
        };

        self.backend.reset_slot(slot)?;
        self.backend.record(slot, image_index)?;
        self.backend.submit(slot)?;
        let presented = self.backend.present(slot, image_index)?;
        self.current_frame = (self.current_frame + 1) % FRAMES_IN_FLIGHT;

        if presented != PresentOutcome::Presented || self.resize_requested {
            debug!(
                "Recreating swapchain after present: {:?}, resize requested: {}",
                presented, self.resize_requested
            );
            return self.recreate_swapchain();
        }
        Ok(FrameOutcome::Presented)
    }

    /// A surface without area has no valid swapchain extent. The rebuild stays pending until
    /// the window is restored.
    fn recreate_swapchain(&mut self) -> Result<FrameOutcome> {
        if self.backend.is_minimized() {
            self.resize_requested = true;
            return Ok(FrameOutcome::Skipped);
        }
        self.resize_requested = false;
        self.backend.recreate()?;
        Ok(FrameOutcome::Recreated)
    }
}

/// A swapchain that can be rebuilt in place for a new window size.
pub trait SurfaceSwapchain {
    fn rebuild(&mut self, window_size: PhysicalSize<u32>) -> Result<()>;
}

impl SurfaceSwapchain for SwapchainContainer {
    fn rebuild(&mut self, window_size: PhysicalSize<u32>) -> Result<()> {
        self.recreate(window_size)
    }
}

/// Rebuilds a swapchain together with everything the renderer derived from its images.
/// The renderer lets go of the old image views before they are destroyed, and only sees the
/// new ones afterwards.
pub fn rebuild_surface<S, R>(
    renderer: &mut R,
    swapchain: &mut S,
    window_size: PhysicalSize<u32>,
) -> Result<()>
where
    S: SurfaceSwapchain,
    R: SurfaceRenderer<S>,
{
    renderer.release_swapchain_resources();
    swapchain.rebuild(window_size)?;
    renderer.resize(swapchain)
}

/// Command buffer and synchronisation objects of one frame in flight.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    context: Arc<Context>,
}

impl FrameSlot {
    pub fn new(context: Arc<Context>, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let device = &context.device;
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Signaled, so that the first wait does not block forever
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
            .vk_context("Could not create semaphore")?;
        let render_finished = match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(result) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                return Err(RendererError::Vulkan {
                    context: "Could not create semaphore",
                    result,
                });
            }
        };
        let in_flight = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(result) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                unsafe { device.destroy_semaphore(render_finished, None) };
                return Err(RendererError::Vulkan {
                    context: "Could not create fence",
                    result,
                });
            }
        };

        Ok(Self {
            command_buffer,
            image_available,
            render_finished,
            in_flight,
            context,
        })
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_semaphore(self.image_available, None) };
        unsafe { device.destroy_semaphore(self.render_finished, None) };
        unsafe { device.destroy_fence(self.in_flight, None) };
    }
}

/// The Vulkan side of a surface: its swapchain, its frame slots and the renderer that fills
/// the command buffers.
// Rust will drop these fields in the order they are declared
pub struct SurfaceFrames<R: SurfaceRenderer> {
    renderer: R,
    slots: Vec<FrameSlot>,
    swapchain: SwapchainContainer,
    command_pool: CommandPool,
    window: Arc<Window>,
    context: Arc<Context>,
}

impl<R: SurfaceRenderer> SurfaceFrames<R> {
    pub fn new(
        context: Arc<Context>,
        window: Arc<Window>,
        swapchain: SwapchainContainer,
        renderer: R,
    ) -> Result<Self> {
        let command_pool = CommandPool::new(context.clone())?;
        let command_buffers = command_pool.allocate_command_buffers(FRAMES_IN_FLIGHT as u32)?;
        let slots = command_buffers
            .into_iter()
            .map(|command_buffer| FrameSlot::new(context.clone(), command_buffer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            renderer,
            slots,
            swapchain,
            command_pool,
            window,
            context,
        })
    }
}

impl<R: SurfaceRenderer> FrameBackend for SurfaceFrames<R> {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.slots[slot].in_flight;
        unsafe {
            self.context
                .device
                .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        }
        .vk_context("Could not wait for fence")
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.swapchain
            .acquire_next_image(self.slots[slot].image_available)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let slot = &self.slots[slot];
        let device = &self.context.device;
        unsafe { device.reset_fences(std::slice::from_ref(&slot.in_flight)) }
            .vk_context("Could not reset fence")?;
        unsafe {
            device.reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .vk_context("Could not reset command buffer")
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        self.renderer.update_uniforms(slot, &self.swapchain)?;

        let command_buffer = self.slots[slot].command_buffer;
        let device = &self.context.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .vk_context("Could not begin command buffer")?;

        self.renderer
            .record(command_buffer, slot, image_index, &self.swapchain)?;
        self.renderer
            .record_present_copy(command_buffer, slot, image_index, &self.swapchain)?;

        unsafe { device.end_command_buffer(command_buffer) }
            .vk_context("Could not end command buffer")
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let slot = &self.slots[slot];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(std::slice::from_ref(&slot.image_available))
            .wait_dst_stage_mask(std::slice::from_ref(&wait_stage))
            .command_buffers(std::slice::from_ref(&slot.command_buffer))
            .signal_semaphores(std::slice::from_ref(&slot.render_finished));

        unsafe {
            self.context.device.queue_submit(
                self.context.queue,
                std::slice::from_ref(&submit_info),
                slot.in_flight,
            )
        }
        .vk_context("Could not submit command buffer")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.swapchain.present(
            self.context.queue,
            image_index,
            self.slots[slot].render_finished,
        )
    }

    fn recreate(&mut self) -> Result<()> {
        self.context.wait_idle()?;
        rebuild_surface(
            &mut self.renderer,
            &mut self.swapchain,
            self.window.inner_size(),
        )
    }

    fn is_minimized(&self) -> bool {
        let size = self.window.inner_size();
        size.width == 0 || size.height == 0
    }
}

impl<R: SurfaceRenderer> Drop for SurfaceFrames<R> {
    fn drop(&mut self) {
        let command_buffers: Vec<_> = self.slots.iter().map(|slot| slot.command_buffer).collect();
        self.command_pool.free_command_buffers(&command_buffers);
    }
}
