use std::sync::Arc;

use ash::vk::{self, SwapchainCreateInfoKHR};
use log::info;
use winit::dpi::PhysicalSize;

use crate::error::{RendererError, Result, VkResultExt};
use crate::vulkan::context::{Context, SurfaceIndex};

/// What the presentation engine said about the acquired image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

pub struct SwapchainContainer {
    pub loader: ash::extensions::khr::Swapchain,
    pub inner: vk::SwapchainKHR,

    pub images: Vec<vk::Image>,
    pub imageviews: Vec<vk::ImageView>,

    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,

    surface: vk::SurfaceKHR,
    present_mode: vk::PresentModeKHR,
    image_usage: vk::ImageUsageFlags,

    context: Arc<Context>,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .min_by_key(|fmt| match (fmt.format, fmt.color_space) {
            (vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 1,
            (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR) => 2,
            (_, _) => 3,
        })
}

/// FIFO is the only mode every surface has to support.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_size: PhysicalSize<u32>,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_size.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_size.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count.max(2);
    if capabilities.max_image_count == 0 {
        wanted
    } else {
        wanted.min(capabilities.max_image_count)
    }
}

impl SwapchainContainer {
    pub fn new(
        context: Arc<Context>,
        surface_index: SurfaceIndex,
        window_size: PhysicalSize<u32>,
        preferred_present_mode: vk::PresentModeKHR,
        image_usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let surface = context.surface(surface_index);

        let formats = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_formats(context.physical_device, surface)
        }
        .vk_context("Could not get surface formats from physical device")?;

        let present_modes = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_present_modes(context.physical_device, surface)
        }
        .vk_context("Could not get present modes from physical device")?;

        let surface_format = choose_surface_format(&formats)
            .ok_or(RendererError::Vulkan {
                context: "Surface reports no formats",
                result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            })?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);

        let loader = ash::extensions::khr::Swapchain::new(&context.instance, &context.device);

        let mut swapchain = Self {
            loader,
            inner: vk::SwapchainKHR::null(),
            images: Vec::new(),
            imageviews: Vec::new(),
            surface_format,
            extent: vk::Extent2D::default(),
            surface,
            present_mode,
            image_usage,
            context,
        };
        swapchain.create(window_size)?;
        Ok(swapchain)
    }

    /// Tears down the image views and the swapchain and builds new ones for `window_size`.
    /// Anything created from the old images has to be recreated by the caller.
    pub fn recreate(&mut self, window_size: PhysicalSize<u32>) -> Result<()> {
        self.context.wait_idle()?;
        self.create(window_size)
    }

    fn create(&mut self, window_size: PhysicalSize<u32>) -> Result<()> {
        let capabilities = unsafe {
            self.context
                .surface_loader
                .get_physical_device_surface_capabilities(self.context.physical_device, self.surface)
        }
        .vk_context("Could not get surface capabilities from physical device")?;

        let swapchain_extent = choose_extent(&capabilities, window_size);

        let create_info = SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(choose_image_count(&capabilities))
            .image_color_space(self.surface_format.color_space)
            .image_format(self.surface_format.format)
            .image_extent(swapchain_extent)
            .image_usage(self.image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(self.inner);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .vk_context("Could not create swapchain")?;

        self.destroy_views_and_swapchain();
        self.inner = swapchain;
        self.extent = swapchain_extent;

        self.images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .vk_context("Could not get swapchain images")?;

        for &image in self.images.iter() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(color_subresource_range())
                .image(image);

            let imageview = unsafe { self.context.device.create_image_view(&create_info, None) }
                .vk_context("Could not create image view")?;
            self.imageviews.push(imageview);
        }

        info!(
            "Swapchain {}x{} with {} images, {:?}, {:?}",
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.surface_format.format,
            self.present_mode
        );
        Ok(())
    }

    pub fn acquire_next_image(&self, image_available: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.inner,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(result) => Err(RendererError::Vulkan {
                context: "Could not acquire swapchain image",
                result,
            }),
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        render_finished: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(std::slice::from_ref(&render_finished))
            .swapchains(std::slice::from_ref(&self.inner))
            .image_indices(std::slice::from_ref(&image_index));

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(RendererError::Vulkan {
                context: "Could not present swapchain image",
                result,
            }),
        }
    }

    fn destroy_views_and_swapchain(&mut self) {
        for imageview in self.imageviews.drain(..) {
            unsafe { self.context.device.destroy_image_view(imageview, None) };
        }
        self.images.clear();
        if self.inner != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.inner, None) };
            self.inner = vk::SwapchainKHR::null();
        }
    }
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Drop for SwapchainContainer {
    fn drop(&mut self) {
        self.destroy_views_and_swapchain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 0,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    #[test]
    fn extent_follows_the_surface_when_it_knows_its_size() {
        let current = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let extent = choose_extent(&capabilities(current), PhysicalSize::new(1000, 1000));
        assert_eq!(extent, current);
    }

    #[test]
    fn extent_is_clamped_to_the_window() {
        let undefined = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        let extent = choose_extent(&capabilities(undefined), PhysicalSize::new(4000, 0));
        assert_eq!(
            extent,
            vk::Extent2D {
                width: 1920,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_is_at_least_two_and_respects_the_maximum() {
        let mut caps = capabilities(vk::Extent2D::default());
        assert_eq!(choose_image_count(&caps), 2);

        caps.min_image_count = 3;
        caps.max_image_count = 3;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn srgb_formats_are_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }
}
