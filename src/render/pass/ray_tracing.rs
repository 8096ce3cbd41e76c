use std::{ops::Range, path::Path, sync::Arc};

use ash::vk;
use crevice::std140::AsStd140;
use log::{debug, info};

use crate::{
    camera::Camera,
    error::{Result, VkResultExt},
    frame_scheduler::FRAMES_IN_FLIGHT,
    render::{shader_types, FrameUniforms, SurfaceRenderer},
    utility::{aligned_device_size, aligned_size},
    vulkan::{
        acceleration_structure::AccelerationStructure,
        buffer::Buffer,
        command_pool::CommandPool,
        context::Context,
        descriptor_set::{DescriptorPool, DescriptorSetLayout, WriteDescriptorSet},
        image::Image,
        image_view::ImageView,
        layout_transition::record_layout_transition,
        shader_module::ShaderModule,
        swapchain::SwapchainContainer,
    },
};

pub const STORAGE_IMAGE_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

const RAYGEN_GROUP: u32 = 0;
const MISS_GROUP: u32 = 1;
const HIT_GROUP: u32 = 2;
const GROUP_COUNT: u32 = 3;

/// Where each shader group's handle sits in the blob returned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTableLayout {
    pub handle_size: u32,
    pub handle_size_aligned: u32,
    pub group_count: u32,
}

impl ShaderBindingTableLayout {
    pub fn new(handle_size: u32, handle_alignment: u32, group_count: u32) -> Self {
        Self {
            handle_size,
            handle_size_aligned: aligned_size(handle_size, handle_alignment),
            group_count,
        }
    }

    pub fn from_properties(
        properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
        group_count: u32,
    ) -> Self {
        Self::new(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            group_count,
        )
    }

    /// Size of the buffer the group handles are fetched into.
    pub fn handle_storage_size(&self) -> usize {
        (self.group_count * self.handle_size_aligned) as usize
    }

    pub fn handle_range(&self, group_index: u32) -> Range<usize> {
        assert!(group_index < self.group_count);
        let start = (group_index * self.handle_size_aligned) as usize;
        start..start + self.handle_size as usize
    }
}

/// One region of the shader binding table, holding a single group handle.
pub struct ShaderBindingTable {
    _buffer: Buffer<u8>,
    region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    pub fn new(
        context: Arc<Context>,
        layout: &ShaderBindingTableLayout,
        handle: &[u8],
    ) -> Result<Self> {
        let base_alignment = context
            .context_raytracing
            .physical_device_ray_tracing_pipeline_properties_khr
            .shader_group_base_alignment as u64;
        let handle_size_aligned = layout.handle_size_aligned as u64;

        let buffer: Buffer<u8> = Buffer::new(
            context,
            handle_size_aligned + base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let buffer_address = buffer.get_device_address();
        let device_address = aligned_device_size(buffer_address, base_alignment);
        buffer.copy_data_at(device_address - buffer_address, handle)?;

        let region = vk::StridedDeviceAddressRegionKHR {
            device_address,
            stride: handle_size_aligned,
            size: handle_size_aligned,
        };

        Ok(ShaderBindingTable {
            _buffer: buffer,
            region,
        })
    }
}

pub struct ShaderBindingTables {
    raygen: ShaderBindingTable,
    miss: ShaderBindingTable,
    hit: ShaderBindingTable,
}

/// The part of the storage image that fits into the swapchain image.
pub fn copy_extent(storage: vk::Extent2D, swapchain: vk::Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: storage.width.min(swapchain.width),
        height: storage.height.min(swapchain.height),
    }
}

/// Traces the scene into a storage image and copies it into the swapchain image.
pub struct RayTracingPass {
    frame_uniforms: Vec<FrameUniforms<shader_types::Std140RayCamera>>,
    storage_image: ImageView,
    shader_binding_tables: ShaderBindingTables,

    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    _descriptor_pool: DescriptorPool,
    _set_layout: DescriptorSetLayout,

    _top_level: Arc<AccelerationStructure>,
    camera: Camera,
    context: Arc<Context>,
}

impl RayTracingPass {
    pub fn new(
        context: Arc<Context>,
        command_pool: &CommandPool,
        top_level: Arc<AccelerationStructure>,
        mut camera: Camera,
        storage_extent: vk::Extent2D,
        shader_directory: &Path,
    ) -> Result<Self> {
        let storage_image = create_storage_image(context.clone(), command_pool, storage_extent)?;
        camera.set_extent(storage_extent.width, storage_extent.height);

        let set_layout = DescriptorSetLayout::new(
            context.clone(),
            &[
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(2)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .stage_flags(
                        vk::ShaderStageFlags::RAYGEN_KHR
                            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                            | vk::ShaderStageFlags::MISS_KHR,
                    )
                    .build(),
            ],
        )?;

        let descriptor_pool = DescriptorPool::new(
            context.clone(),
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    descriptor_count: FRAMES_IN_FLIGHT as u32,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: FRAMES_IN_FLIGHT as u32,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: FRAMES_IN_FLIGHT as u32,
                },
            ],
            FRAMES_IN_FLIGHT as u32,
        )?;

        let frame_uniforms = (0..FRAMES_IN_FLIGHT)
            .map(|_| {
                FrameUniforms::new(
                    context.clone(),
                    &descriptor_pool,
                    &set_layout,
                    shader_types::RayCamera::std140_size_static() as u64,
                    2,
                    || {
                        vec![
                            WriteDescriptorSet::acceleration_structure(0, &top_level),
                            WriteDescriptorSet::storage_image_view_with_layout(
                                1,
                                &storage_image,
                                vk::ImageLayout::GENERAL,
                            ),
                        ]
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let (pipeline, pipeline_layout) = create_pipeline(&context, &set_layout, shader_directory)?;

        let shader_binding_tables = match create_shader_binding_tables(&context, pipeline) {
            Ok(tables) => tables,
            Err(e) => {
                unsafe { context.device.destroy_pipeline(pipeline, None) };
                unsafe { context.device.destroy_pipeline_layout(pipeline_layout, None) };
                return Err(e);
            }
        };
        info!(
            "Created ray tracing pipeline, storage image {}x{}",
            storage_extent.width, storage_extent.height
        );

        Ok(RayTracingPass {
            frame_uniforms,
            storage_image,
            shader_binding_tables,
            pipeline,
            pipeline_layout,
            _descriptor_pool: descriptor_pool,
            _set_layout: set_layout,
            _top_level: top_level,
            camera,
            context,
        })
    }

    fn storage_extent(&self) -> vk::Extent2D {
        self.storage_image.image.extent_2d()
    }
}

impl SurfaceRenderer for RayTracingPass {
    fn update_uniforms(&mut self, slot: usize, _swapchain: &SwapchainContainer) -> Result<()> {
        let ray_camera = shader_types::RayCamera {
            view_inverse: self.camera.view_matrix().inversed(),
            proj_inverse: self.camera.projection_matrix().inversed(),
        };

        self.frame_uniforms[slot]
            .buffer
            .copy_data(&ray_camera.as_std140())
    }

    fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        slot: usize,
        _image_index: u32,
        _swapchain: &SwapchainContainer,
    ) -> Result<()> {
        let device = &self.context.device;
        let extent = self.storage_extent();

        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                std::slice::from_ref(&self.frame_uniforms[slot].descriptor_set.inner),
                &[],
            );
        }

        let empty_sbt_entry = vk::StridedDeviceAddressRegionKHR::default();

        unsafe {
            self.context
                .context_raytracing
                .ray_tracing_pipeline
                .cmd_trace_rays(
                    command_buffer,
                    &self.shader_binding_tables.raygen.region,
                    &self.shader_binding_tables.miss.region,
                    &self.shader_binding_tables.hit.region,
                    &empty_sbt_entry,
                    extent.width,
                    extent.height,
                    1,
                )
        };
        Ok(())
    }

    fn record_present_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        _slot: usize,
        image_index: u32,
        swapchain: &SwapchainContainer,
    ) -> Result<()> {
        let context = &self.context;
        let swapchain_image = swapchain.images[image_index as usize];
        let storage_image = self.storage_image.image.inner;
        let subresource_range = self.storage_image.subresource_range();

        record_layout_transition(
            context,
            command_buffer,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            subresource_range,
        )?;
        record_layout_transition(
            context,
            command_buffer,
            storage_image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            subresource_range,
        )?;

        let extent = copy_extent(self.storage_extent(), swapchain.extent);
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let copy_region = vk::ImageCopy {
            src_subresource: subresource,
            src_offset: vk::Offset3D::default(),
            dst_subresource: subresource,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };

        unsafe {
            context.device.cmd_copy_image(
                command_buffer,
                storage_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&copy_region),
            )
        };

        record_layout_transition(
            context,
            command_buffer,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            subresource_range,
        )?;
        record_layout_transition(
            context,
            command_buffer,
            storage_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
            subresource_range,
        )
    }

    fn resize(&mut self, swapchain: &SwapchainContainer) -> Result<()> {
        // The storage image keeps its size, only the copied region changes
        let extent = copy_extent(self.storage_extent(), swapchain.extent);
        debug!(
            "Ray traced surface now copies {}x{}",
            extent.width, extent.height
        );
        Ok(())
    }
}

impl Drop for RayTracingPass {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_pipeline(self.pipeline, None) };
        unsafe { device.destroy_pipeline_layout(self.pipeline_layout, None) };
    }
}

fn create_storage_image(
    context: Arc<Context>,
    command_pool: &CommandPool,
    extent: vk::Extent2D,
) -> Result<ImageView> {
    let image = Image::new_2d(
        context.clone(),
        extent,
        STORAGE_IMAGE_FORMAT,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
    )?;
    let image_view =
        ImageView::new_default(context.clone(), Arc::new(image), vk::ImageAspectFlags::COLOR)?;

    command_pool.submit_and_wait(|command_buffer| {
        record_layout_transition(
            &context,
            command_buffer,
            image_view.image.inner,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            image_view.subresource_range(),
        )
    })?;

    Ok(image_view)
}

fn create_pipeline(
    context: &Arc<Context>,
    set_layout: &DescriptorSetLayout,
    shader_directory: &Path,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let device = &context.device;

    // Shader indices referenced by the groups below
    let shaders = [
        ShaderModule::load(
            context.clone(),
            shader_directory,
            "raygen.rgen.spv",
            vk::ShaderStageFlags::RAYGEN_KHR,
        )?,
        ShaderModule::load(
            context.clone(),
            shader_directory,
            "miss.rmiss.spv",
            vk::ShaderStageFlags::MISS_KHR,
        )?,
        ShaderModule::load(
            context.clone(),
            shader_directory,
            "closesthit.rchit.spv",
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        )?,
    ];
    let shader_stages: Vec<_> = shaders
        .iter()
        .map(|shader| shader.stage_create_info())
        .collect();

    let general_group = |shader_index: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader_index)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build()
    };

    // Indexed by RAYGEN_GROUP, MISS_GROUP and HIT_GROUP
    let shader_groups = [
        general_group(0),
        general_group(1),
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(2)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    ];

    let layout_create_info =
        vk::PipelineLayoutCreateInfo::builder().set_layouts(std::slice::from_ref(&set_layout.inner));

    let layout = unsafe { device.create_pipeline_layout(&layout_create_info, None) }
        .vk_context("Could not create ray tracing pipeline layout")?;

    let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .stages(&shader_stages)
        .groups(&shader_groups)
        .max_pipeline_ray_recursion_depth(1)
        .layout(layout);

    let pipelines = unsafe {
        context
            .context_raytracing
            .ray_tracing_pipeline
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
    }
    .vk_context("Could not create ray tracing pipeline");

    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], layout)),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(e)
        }
    }
}

// See https://github.com/SaschaWillems/Vulkan/blob/master/examples/raytracingbasic/raytracingbasic.cpp
fn create_shader_binding_tables(
    context: &Arc<Context>,
    pipeline: vk::Pipeline,
) -> Result<ShaderBindingTables> {
    let layout = ShaderBindingTableLayout::from_properties(
        &context
            .context_raytracing
            .physical_device_ray_tracing_pipeline_properties_khr,
        GROUP_COUNT,
    );

    let handles = unsafe {
        context
            .context_raytracing
            .ray_tracing_pipeline
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count,
                layout.handle_storage_size(),
            )
    }
    .vk_context("Could not get shader group handles")?;

    let table = |group_index: u32| {
        ShaderBindingTable::new(
            context.clone(),
            &layout,
            &handles[layout.handle_range(group_index)],
        )
    };

    Ok(ShaderBindingTables {
        raygen: table(RAYGEN_GROUP)?,
        miss: table(MISS_GROUP)?,
        hit: table(HIT_GROUP)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_sliced_at_aligned_offsets() {
        let layout = ShaderBindingTableLayout::new(32, 64, 3);
        assert_eq!(layout.handle_size_aligned, 64);
        assert_eq!(layout.handle_storage_size(), 192);
        assert_eq!(layout.handle_range(0), 0..32);
        assert_eq!(layout.handle_range(1), 64..96);
        assert_eq!(layout.handle_range(2), 128..160);
    }

    #[test]
    fn aligned_handles_are_packed_back_to_back() {
        let layout = ShaderBindingTableLayout::new(32, 32, 3);
        assert_eq!(layout.handle_range(1), 32..64);
        assert_eq!(layout.handle_range(2).end, layout.handle_storage_size());
    }

    #[test]
    #[should_panic]
    fn there_is_no_handle_past_the_last_group() {
        ShaderBindingTableLayout::new(32, 32, 3).handle_range(3);
    }

    #[test]
    fn copy_covers_the_overlap_of_both_images() {
        let storage = vk::Extent2D {
            width: 800,
            height: 800,
        };
        let smaller = vk::Extent2D {
            width: 640,
            height: 900,
        };
        assert_eq!(
            copy_extent(storage, smaller),
            vk::Extent2D {
                width: 640,
                height: 800
            }
        );
        assert_eq!(copy_extent(storage, storage), storage);
    }
}
