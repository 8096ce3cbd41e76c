use std::sync::Arc;

use crate::error::{Result, VkResultExt};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;
use crate::vulkan::image_view::ImageView;
use crate::vulkan::sampler::Sampler;
use ash::vk;

use super::acceleration_structure::AccelerationStructure;

pub struct DescriptorSetLayout {
    pub inner: vk::DescriptorSetLayout,
    context: Arc<Context>,
}

impl DescriptorSetLayout {
    pub fn new(
        context: Arc<Context>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let layout = unsafe {
            context
                .device
                .create_descriptor_set_layout(&create_info, None)
        }
        .vk_context("Could not create descriptor set layout")?;

        Ok(Self {
            inner: layout,
            context,
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_set_layout(self.inner, None)
        };
    }
}

/// Owns every set allocated from it.
pub struct DescriptorPool {
    pub inner: vk::DescriptorPool,
    context: Arc<Context>,
}

impl DescriptorPool {
    pub fn new(
        context: Arc<Context>,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(pool_sizes)
            .max_sets(max_sets);

        let pool = unsafe { context.device.create_descriptor_pool(&create_info, None) }
            .vk_context("Could not create descriptor pool")?;

        Ok(Self {
            inner: pool,
            context,
        })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_pool(self.inner, None)
        };
    }
}

pub struct DescriptorSet {
    pub inner: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn new(
        context: &Context,
        descriptor_pool: &DescriptorPool,
        set_layout: &DescriptorSetLayout,
        write_descriptor_sets: &[WriteDescriptorSet],
    ) -> Result<Self> {
        let device = &context.device;
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool.inner)
            .set_layouts(std::slice::from_ref(&set_layout.inner));

        let descriptor_set = unsafe { device.allocate_descriptor_sets(&allocate_info) }
            .vk_context("Could not allocate descriptor set")?[0];

        let mut acceleration_structure_infos: Vec<_> = write_descriptor_sets
            .iter()
            .map(|write| match &write.info {
                DescriptorInfo::AccelerationStructure(handle) => {
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(handle))
                        .build()
                }
                _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
            })
            .collect();

        let vk_write_descriptor_sets: Vec<vk::WriteDescriptorSet> = write_descriptor_sets
            .iter()
            .zip(acceleration_structure_infos.iter_mut())
            .map(|(write, acceleration_structure_info)| {
                let mut vk_write = vk::WriteDescriptorSet::builder()
                    .dst_binding(write.binding)
                    .descriptor_type(write.info.descriptor_type())
                    .dst_set(descriptor_set);

                match &write.info {
                    DescriptorInfo::Buffer(info) => {
                        vk_write = vk_write.buffer_info(std::slice::from_ref(info))
                    }
                    DescriptorInfo::SampledImage(info) | DescriptorInfo::StorageImage(info) => {
                        vk_write = vk_write.image_info(std::slice::from_ref(info))
                    }
                    DescriptorInfo::AccelerationStructure(_) => {
                        vk_write = vk_write.push_next(acceleration_structure_info);
                        vk_write.descriptor_count = 1;
                    }
                }
                vk_write.build()
            })
            .collect();

        unsafe { device.update_descriptor_sets(&vk_write_descriptor_sets, &[]) };

        Ok(Self {
            inner: descriptor_set,
        })
    }
}

pub struct WriteDescriptorSet {
    binding: u32,
    info: DescriptorInfo,
}

pub enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    SampledImage(vk::DescriptorImageInfo),
    StorageImage(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorInfo {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorInfo::Buffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorInfo::SampledImage(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorInfo::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorInfo::AccelerationStructure(_) => {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

impl WriteDescriptorSet {
    pub fn buffer<T>(binding: u32, buffer: &Buffer<T>) -> WriteDescriptorSet {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer.inner)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build();

        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::Buffer(info),
        }
    }

    pub fn image_view_sampler_with_layout(
        binding: u32,
        image_view: &ImageView,
        image_layout: vk::ImageLayout,
        sampler: &Sampler,
    ) -> WriteDescriptorSet {
        let info = vk::DescriptorImageInfo::builder()
            .sampler(sampler.inner)
            .image_view(image_view.inner)
            .image_layout(image_layout)
            .build();

        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::SampledImage(info),
        }
    }

    pub fn storage_image_view_with_layout(
        binding: u32,
        image_view: &ImageView,
        image_layout: vk::ImageLayout,
    ) -> WriteDescriptorSet {
        let info = vk::DescriptorImageInfo::builder()
            .image_view(image_view.inner)
            .image_layout(image_layout)
            .build();

        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::StorageImage(info),
        }
    }

    pub fn acceleration_structure(
        binding: u32,
        acceleration_structure: &AccelerationStructure,
    ) -> WriteDescriptorSet {
        WriteDescriptorSet {
            binding,
            info: DescriptorInfo::AccelerationStructure(acceleration_structure.inner),
        }
    }
}
