use std::sync::Arc;

use ash::vk;

use crate::error::Result;
use crate::loader::LoadedMesh;
use crate::vulkan::acceleration_structure::{TriangleGeometry, IDENTITY_TRANSFORM};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;

use super::Vertex;

/// Geometry shared by the raster draw and the bottom level acceleration structure.
pub struct Mesh {
    pub vertex_buffer: Buffer<Vertex>,
    pub index_buffer: Buffer<u32>,
    /// 3x4 transform the acceleration structure build reads
    pub transform_buffer: Buffer<vk::TransformMatrixKHR>,
    pub num_vertices: u32,
    pub num_indices: u32,
}

impl Mesh {
    pub fn new(context: Arc<Context>, mesh: &LoadedMesh) -> Result<Self> {
        let geometry_input = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let vertex_buffer: Buffer<Vertex> = Buffer::new_with_data(
            context.clone(),
            vk::BufferUsageFlags::VERTEX_BUFFER | geometry_input,
            &mesh.vertices,
        )?;
        let index_buffer: Buffer<u32> = Buffer::new_with_data(
            context.clone(),
            vk::BufferUsageFlags::INDEX_BUFFER | geometry_input,
            &mesh.indices,
        )?;
        let transform_buffer: Buffer<vk::TransformMatrixKHR> = Buffer::new_with_data(
            context,
            geometry_input,
            &vk::TransformMatrixKHR {
                matrix: IDENTITY_TRANSFORM,
            },
        )?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            transform_buffer,
            num_vertices: mesh.vertices.len() as u32,
            num_indices: mesh.indices.len() as u32,
        })
    }

    pub fn triangle_geometry(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: self.vertex_buffer.get_device_address(),
            vertex_stride: std::mem::size_of::<Vertex>() as vk::DeviceSize,
            vertex_count: self.num_vertices,
            index_address: self.index_buffer.get_device_address(),
            index_count: self.num_indices,
            transform_address: self.transform_buffer.get_device_address(),
        }
    }
}
