use std::{path::Path, sync::Arc};

use ash::vk;
use crevice::std140::AsStd140;
use log::info;
use ultraviolet::Mat4;

use crate::{
    camera::Camera,
    error::{Result, VkResultExt},
    frame_scheduler::FRAMES_IN_FLIGHT,
    render::{shader_types, FrameUniforms, SurfaceRenderer},
    scene::{Scene, Vertex},
    vulkan::{
        context::Context,
        descriptor_set::{DescriptorPool, DescriptorSetLayout, WriteDescriptorSet},
        image::{find_depth_format, has_stencil_component, Image},
        image_view::ImageView,
        shader_module::ShaderModule,
        swapchain::SwapchainContainer,
    },
};

/// Draws the textured mesh straight into the swapchain image.
pub struct RasterPass {
    framebuffers: Vec<vk::Framebuffer>,
    depth_buffer: Option<ImageView>,
    frame_uniforms: Vec<FrameUniforms<shader_types::Std140MeshTransforms>>,

    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    _descriptor_pool: DescriptorPool,
    _set_layout: DescriptorSetLayout,
    depth_format: vk::Format,

    camera: Camera,
    scene: Arc<Scene>,
    context: Arc<Context>,
}

impl RasterPass {
    pub fn new(
        context: Arc<Context>,
        swapchain: &SwapchainContainer,
        scene: Arc<Scene>,
        camera: Camera,
        shader_directory: &Path,
    ) -> Result<Self> {
        let depth_format = find_depth_format(&context)?;

        let set_layout = DescriptorSetLayout::new(
            context.clone(),
            &[
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .stage_flags(vk::ShaderStageFlags::VERTEX)
                    .build(),
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(1)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build(),
            ],
        )?;

        let descriptor_pool = DescriptorPool::new(
            context.clone(),
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: FRAMES_IN_FLIGHT as u32,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
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
                    shader_types::MeshTransforms::std140_size_static() as u64,
                    0,
                    || {
                        vec![WriteDescriptorSet::image_view_sampler_with_layout(
                            1,
                            &scene.texture.image_view,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            &scene.texture.sampler,
                        )]
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let render_pass = create_render_pass(&context, swapchain.surface_format.format, depth_format)?;

        let (pipeline, pipeline_layout) =
            match create_pipeline(&context, render_pass, &set_layout, shader_directory) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    unsafe { context.device.destroy_render_pass(render_pass, None) };
                    return Err(e);
                }
            };
        info!("Created raster pipeline, depth format {:?}", depth_format);

        let mut raster_pass = RasterPass {
            framebuffers: Vec::new(),
            depth_buffer: None,
            frame_uniforms,
            render_pass,
            pipeline,
            pipeline_layout,
            _descriptor_pool: descriptor_pool,
            _set_layout: set_layout,
            depth_format,
            camera,
            scene,
            context,
        };
        raster_pass.resize(swapchain)?;
        Ok(raster_pass)
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.context.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

impl SurfaceRenderer for RasterPass {
    fn update_uniforms(&mut self, slot: usize, swapchain: &SwapchainContainer) -> Result<()> {
        self.camera
            .set_extent(swapchain.extent.width, swapchain.extent.height);

        let transforms = shader_types::MeshTransforms {
            model: Mat4::identity(),
            view: self.camera.view_matrix(),
            proj: self.camera.projection_matrix(),
        };

        self.frame_uniforms[slot]
            .buffer
            .copy_data(&transforms.as_std140())
    }

    fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        slot: usize,
        image_index: u32,
        swapchain: &SwapchainContainer,
    ) -> Result<()> {
        let device = &self.context.device;
        let mesh = &self.scene.mesh;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: swapchain.extent,
        };

        let render_pass_begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index as usize])
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: swapchain.extent.width as f32,
            height: swapchain.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_begin_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            device.cmd_set_viewport(command_buffer, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(command_buffer, 0, std::slice::from_ref(&render_area));
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                std::slice::from_ref(&self.frame_uniforms[slot].descriptor_set.inner),
                &[],
            );
            device.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                std::slice::from_ref(&*mesh.vertex_buffer),
                &[0],
            );
            device.cmd_bind_index_buffer(command_buffer, *mesh.index_buffer, 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(command_buffer, mesh.num_indices, 1, 0, 0, 0);
            device.cmd_end_render_pass(command_buffer);
        }
        Ok(())
    }

    fn release_swapchain_resources(&mut self) {
        self.destroy_framebuffers();
        self.depth_buffer = None;
    }

    fn resize(&mut self, swapchain: &SwapchainContainer) -> Result<()> {
        self.release_swapchain_resources();

        let depth_image = Image::new_2d(
            self.context.clone(),
            swapchain.extent,
            self.depth_format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        let aspect_mask = if has_stencil_component(self.depth_format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        let depth_buffer =
            ImageView::new_default(self.context.clone(), Arc::new(depth_image), aspect_mask)?;

        for attachments in framebuffer_attachments(&swapchain.imageviews, depth_buffer.inner) {
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);

            let framebuffer = unsafe { self.context.device.create_framebuffer(&create_info, None) }
                .vk_context("Could not create framebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        self.depth_buffer = Some(depth_buffer);
        Ok(())
    }
}

impl Drop for RasterPass {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        let device = &self.context.device;
        unsafe { device.destroy_pipeline(self.pipeline, None) };
        unsafe { device.destroy_pipeline_layout(self.pipeline_layout, None) };
        unsafe { device.destroy_render_pass(self.render_pass, None) };
    }
}

/// One framebuffer per swapchain image view, each sharing the depth buffer.
fn framebuffer_attachments(
    swapchain_views: &[vk::ImageView],
    depth_view: vk::ImageView,
) -> Vec<[vk::ImageView; 2]> {
    swapchain_views
        .iter()
        .map(|&swapchain_view| [swapchain_view, depth_view])
        .collect()
}

fn create_pipeline(
    context: &Arc<Context>,
    render_pass: vk::RenderPass,
    set_layout: &DescriptorSetLayout,
    shader_directory: &Path,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let device = &context.device;

    let vertex_shader = ShaderModule::load(
        context.clone(),
        shader_directory,
        "mesh.vert.spv",
        vk::ShaderStageFlags::VERTEX,
    )?;
    let fragment_shader = ShaderModule::load(
        context.clone(),
        shader_directory,
        "mesh.frag.spv",
        vk::ShaderStageFlags::FRAGMENT,
    )?;

    let shader_stages = [
        vertex_shader.stage_create_info(),
        fragment_shader.stage_create_info(),
    ];

    let (vertex_input_binding_descriptions, vertex_input_attribute_descriptions) = (
        Vertex::binding_descriptions(),
        Vertex::attribute_descriptions(),
    );

    let vertex_input_state_create_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_input_binding_descriptions)
        .vertex_attribute_descriptions(&vertex_input_attribute_descriptions);

    let input_assembly_state_create_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewport_state_create_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state_create_info = vk::PipelineRasterizationStateCreateInfo::builder()
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0)
        .polygon_mode(vk::PolygonMode::FILL);

    let multisample_state_create_info = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state_create_info = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
        .max_depth_bounds(1.0)
        .min_depth_bounds(0.0);

    let color_blend_attachment_state = vk::PipelineColorBlendAttachmentState {
        blend_enable: 0,
        color_write_mask: vk::ColorComponentFlags::RGBA,
        ..Default::default()
    };

    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
        .attachments(std::slice::from_ref(&color_blend_attachment_state));

    let layout_create_info =
        vk::PipelineLayoutCreateInfo::builder().set_layouts(std::slice::from_ref(&set_layout.inner));

    let layout = unsafe { device.create_pipeline_layout(&layout_create_info, None) }
        .vk_context("Could not create pipeline layout")?;

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state_create_info)
        .input_assembly_state(&input_assembly_state_create_info)
        .viewport_state(&viewport_state_create_info)
        .rasterization_state(&rasterization_state_create_info)
        .multisample_state(&multisample_state_create_info)
        .depth_stencil_state(&depth_stencil_state_create_info)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass);

    let pipelines = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&create_info),
            None,
        )
    }
    .vk_context("Could not create graphics pipeline");

    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], layout)),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(e)
        }
    }
}

fn create_render_pass(
    context: &Context,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription {
        flags: vk::AttachmentDescriptionFlags::empty(),
        format: color_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    };

    let depth_stencil_attachment = vk::AttachmentDescription {
        flags: vk::AttachmentDescriptionFlags::empty(),
        format: depth_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let color_attachment_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };

    let depth_attachment_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_attachment_ref))
        .depth_stencil_attachment(&depth_attachment_ref);

    let attachments = [color_attachment, depth_stencil_attachment];

    // The depth buffer is shared by both frames in flight
    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);

    unsafe { context.device.create_render_pass(&create_info, None) }
        .vk_context("Could not create render pass")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn every_swapchain_view_gets_a_framebuffer() {
        let views: Vec<_> = (1..=3).map(vk::ImageView::from_raw).collect();
        let depth = vk::ImageView::from_raw(99);

        let attachments = framebuffer_attachments(&views, depth);
        assert_eq!(attachments.len(), views.len());
        for (attachment, view) in attachments.iter().zip(&views) {
            assert_eq!(attachment, &[*view, depth]);
        }
    }
}
