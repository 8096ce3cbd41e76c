use std::sync::Arc;

use ash::vk;
use log::{debug, info};

use crate::error::{RendererError, Result, VkResultExt};
use crate::utility::aligned_device_size;

use super::{buffer::Buffer, command_pool::CommandPool, context::Context};

/// Row-major 3x4 identity, the layout `vk::TransformMatrixKHR` expects.
pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    SizeQueried,
    BufferAllocated,
    Created,
    Building,
    Built,
}

type BuildSizes = vk::AccelerationStructureBuildSizesInfoKHR;

/// What the steps so far have produced. `B` is the backing buffer, `S` the structure.
enum Stage<B, S> {
    Unbuilt,
    SizeQueried(BuildSizes),
    BufferAllocated(BuildSizes, B),
    Created(BuildSizes, S),
    Building(S),
}

impl<B, S> Stage<B, S> {
    fn state(&self) -> BuildState {
        match self {
            Stage::Unbuilt => BuildState::Unbuilt,
            Stage::SizeQueried(_) => BuildState::SizeQueried,
            Stage::BufferAllocated(..) => BuildState::BufferAllocated,
            Stage::Created(..) => BuildState::Created,
            Stage::Building(_) => BuildState::Building,
        }
    }
}

/// Tracks one structure through the build steps. Every step is handed what the step before it
/// produced. A step taken out of order fails before it runs.
pub struct BuildProgress<B, S> {
    name: &'static str,
    stage: Stage<B, S>,
}

impl<B, S> BuildProgress<B, S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stage: Stage::Unbuilt,
        }
    }

    fn out_of_order(&self, to: BuildState) -> RendererError {
        RendererError::AccelerationStructureOutOfOrder {
            name: self.name,
            from: self.stage.state(),
            to,
        }
    }

    fn enter(&mut self, from: BuildState, stage: Stage<B, S>) {
        debug!("{}: {:?} -> {:?}", self.name, from, stage.state());
        self.stage = stage;
    }

    pub fn query_sizes(&mut self, query: impl FnOnce() -> BuildSizes) -> Result<BuildSizes> {
        if !matches!(self.stage, Stage::Unbuilt) {
            return Err(self.out_of_order(BuildState::SizeQueried));
        }
        let sizes = query();
        self.enter(BuildState::Unbuilt, Stage::SizeQueried(sizes));
        Ok(sizes)
    }

    pub fn allocate(&mut self, allocate: impl FnOnce(&BuildSizes) -> Result<B>) -> Result<()> {
        let sizes = match self.stage {
            Stage::SizeQueried(sizes) => sizes,
            _ => return Err(self.out_of_order(BuildState::BufferAllocated)),
        };
        let buffer = allocate(&sizes)?;
        self.enter(BuildState::SizeQueried, Stage::BufferAllocated(sizes, buffer));
        Ok(())
    }

    /// The structure takes ownership of its backing buffer.
    pub fn create(&mut self, create: impl FnOnce(&BuildSizes, B) -> Result<S>) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Unbuilt) {
            Stage::BufferAllocated(sizes, buffer) => {
                let structure = create(&sizes, buffer)?;
                self.enter(BuildState::BufferAllocated, Stage::Created(sizes, structure));
                Ok(())
            }
            other => {
                self.stage = other;
                Err(self.out_of_order(BuildState::Created))
            }
        }
    }

    /// `build` has to wait for the device, the structure counts as built once it returns.
    pub fn build(&mut self, build: impl FnOnce(&BuildSizes, &S) -> Result<()>) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Unbuilt) {
            Stage::Created(sizes, structure) => {
                build(&sizes, &structure)?;
                self.enter(BuildState::Created, Stage::Building(structure));
                Ok(())
            }
            other => {
                self.stage = other;
                Err(self.out_of_order(BuildState::Building))
            }
        }
    }

    pub fn finish(mut self, finish: impl FnOnce(&mut S)) -> Result<S> {
        match std::mem::replace(&mut self.stage, Stage::Unbuilt) {
            Stage::Building(mut structure) => {
                finish(&mut structure);
                debug!("{}: {:?} -> {:?}", self.name, BuildState::Building, BuildState::Built);
                Ok(structure)
            }
            other => {
                self.stage = other;
                Err(self.out_of_order(BuildState::Built))
            }
        }
    }
}

/// A fully built acceleration structure and the buffer that backs it.
pub struct AccelerationStructure {
    pub inner: vk::AccelerationStructureKHR,
    pub context: Arc<Context>,
    _buffer: Buffer<u8>,
    pub device_address: vk::DeviceAddress,
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.context
                .context_raytracing
                .acceleration_structure
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}

/// Device addresses and counts of one indexed triangle mesh. Positions are three f32s at the
/// start of every vertex.
#[derive(Debug, Clone, Copy)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
    pub transform_address: vk::DeviceAddress,
}

impl TriangleGeometry {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// One instance per bottom level structure, all placed at the origin and visible to every ray.
pub fn instance_records(
    bottom_level_addresses: &[vk::DeviceAddress],
) -> Vec<vk::AccelerationStructureInstanceKHR> {
    bottom_level_addresses
        .iter()
        .map(|&device_handle| vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: IDENTITY_TRANSFORM,
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xff),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle,
            },
        })
        .collect()
}

/// Scratch size for one build. The slack lets the device address be rounded up to `alignment`
/// without leaving the buffer.
pub fn scratch_size(
    size_info: &vk::AccelerationStructureBuildSizesInfoKHR,
    alignment: vk::DeviceSize,
) -> vk::DeviceSize {
    let required = size_info
        .build_scratch_size
        .max(size_info.update_scratch_size);
    aligned_device_size(required, alignment) + alignment
}

/// Builds acceleration structures one at a time. Every build waits on its own fence before
/// returning, so the scratch buffer can be released right away.
pub struct AccelerationStructureBuilder {
    context: Arc<Context>,
    command_pool: CommandPool,
}

impl AccelerationStructureBuilder {
    pub fn new(context: Arc<Context>, command_pool: CommandPool) -> Self {
        Self {
            context,
            command_pool,
        }
    }

    pub fn build_bottom_level(&self, mesh: &TriangleGeometry) -> Result<AccelerationStructure> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.vertex_address,
            })
            .vertex_stride(mesh.vertex_stride)
            .max_vertex(mesh.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.index_address,
            })
            .transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.transform_address,
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build();

        self.build(
            "bottom level",
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            mesh.triangle_count(),
        )
    }

    /// Takes finished bottom level structures only, so their device addresses are final.
    pub fn build_top_level(
        &self,
        bottom_level: &[&AccelerationStructure],
    ) -> Result<AccelerationStructure> {
        let addresses: Vec<_> = bottom_level
            .iter()
            .map(|structure| structure.device_address)
            .collect();
        let instances = instance_records(&addresses);

        let instance_buffer: Buffer<vk::AccelerationStructureInstanceKHR> = Buffer::new_with_data(
            self.context.clone(),
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            &instances,
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.get_device_address(),
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        // The build has finished once this returns, the instances are no longer read
        self.build(
            "top level",
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry,
            instances.len() as u32,
        )
    }

    // See https://github.com/SaschaWillems/Vulkan/blob/a467d941599a2cef5bd0eff696999bca8d75ee23/base/VulkanRaytracingSample.cpp#L149
    fn build(
        &self,
        name: &'static str,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> Result<AccelerationStructure> {
        let context = &self.context;
        let loader = &context.context_raytracing.acceleration_structure;
        let mut progress: BuildProgress<Buffer<u8>, AccelerationStructure> =
            BuildProgress::new(name);

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .build();

        let size_info = progress.query_sizes(|| unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
            )
        })?;

        progress.allocate(|size_info| {
            Buffer::new(
                context.clone(),
                size_info.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
        })?;

        progress.create(|size_info, buffer| {
            let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
                .buffer(buffer.inner)
                .size(size_info.acceleration_structure_size)
                .ty(ty);

            let inner = unsafe { loader.create_acceleration_structure(&create_info, None) }
                .vk_context("Could not create acceleration structure")?;

            Ok(AccelerationStructure {
                inner,
                context: context.clone(),
                _buffer: buffer,
                device_address: 0,
            })
        })?;

        let alignment = context
            .context_raytracing
            .physical_device_acceleration_structure_properties_khr
            .min_acceleration_structure_scratch_offset_alignment
            as vk::DeviceSize;

        progress.build(|size_info, structure| {
            let scratch_buffer: Buffer<u8> = Buffer::new(
                context.clone(),
                scratch_size(size_info, alignment),
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;

            build_info.dst_acceleration_structure = structure.inner;
            build_info.scratch_data = vk::DeviceOrHostAddressKHR {
                device_address: aligned_device_size(scratch_buffer.get_device_address(), alignment),
            };

            let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR::builder()
                .primitive_count(primitive_count)
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0)
                .build();

            // Waits for the build, the scratch buffer is released when this returns
            self.command_pool.submit_and_wait(|command_buffer| {
                let build_range_infos: &[&[_]] = &[std::slice::from_ref(&build_range_info)];
                unsafe {
                    loader.cmd_build_acceleration_structures(
                        command_buffer,
                        std::slice::from_ref(&build_info),
                        build_range_infos,
                    )
                };
                Ok(())
            })
        })?;

        let structure = progress.finish(|structure| {
            let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                .acceleration_structure(structure.inner);
            structure.device_address =
                unsafe { loader.get_acceleration_structure_device_address(&address_info) };
        })?;

        info!(
            "Built {} acceleration structure: {} primitives, {} bytes, address {:#x}",
            name, primitive_count, size_info.acceleration_structure_size, structure.device_address
        );

        Ok(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestProgress = BuildProgress<u64, String>;

    fn sizes(structure_size: u64) -> BuildSizes {
        BuildSizes {
            acceleration_structure_size: structure_size,
            ..Default::default()
        }
    }

    #[test]
    fn every_step_receives_what_the_previous_one_made() {
        let mut progress = TestProgress::new("test");
        progress.query_sizes(|| sizes(4096)).unwrap();
        progress
            .allocate(|sizes| Ok(sizes.acceleration_structure_size))
            .unwrap();
        progress
            .create(|_, buffer| Ok(format!("structure on {}", buffer)))
            .unwrap();
        progress
            .build(|_, structure| {
                assert_eq!(structure, "structure on 4096");
                Ok(())
            })
            .unwrap();
        assert_eq!(progress.stage.state(), BuildState::Building);

        let structure = progress.finish(|structure| structure.push_str(", built")).unwrap();
        assert_eq!(structure, "structure on 4096, built");
    }

    #[test]
    fn skipping_a_step_is_rejected() {
        let mut progress = TestProgress::new("test");
        progress.query_sizes(|| sizes(64)).unwrap();

        let mut ran = false;
        let result = progress.create(|_, _| {
            ran = true;
            Ok(String::new())
        });
        assert!(matches!(
            result,
            Err(RendererError::AccelerationStructureOutOfOrder {
                from: BuildState::SizeQueried,
                to: BuildState::Created,
                ..
            })
        ));
        assert!(!ran);
        assert_eq!(progress.stage.state(), BuildState::SizeQueried);

        // The rejected step left the progress usable
        progress.allocate(|_| Ok(1)).unwrap();
        assert_eq!(progress.stage.state(), BuildState::BufferAllocated);
    }

    #[test]
    fn sizes_are_only_queried_once() {
        let mut progress = TestProgress::new("test");
        progress.query_sizes(|| sizes(64)).unwrap();
        assert!(matches!(
            progress.query_sizes(|| sizes(128)),
            Err(RendererError::AccelerationStructureOutOfOrder {
                from: BuildState::SizeQueried,
                to: BuildState::SizeQueried,
                ..
            })
        ));
    }

    #[test]
    fn an_unbuilt_structure_cannot_finish() {
        let progress = TestProgress::new("test");
        assert!(matches!(
            progress.finish(|_| {}),
            Err(RendererError::AccelerationStructureOutOfOrder {
                from: BuildState::Unbuilt,
                to: BuildState::Built,
                ..
            })
        ));
    }

    #[test]
    fn a_failed_build_does_not_advance() {
        let mut progress = TestProgress::new("test");
        progress.query_sizes(|| sizes(64)).unwrap();
        progress.allocate(|_| Ok(1)).unwrap();
        progress.create(|_, _| Ok(String::new())).unwrap();

        let result = progress.build(|_, _| {
            Err(RendererError::Vulkan {
                context: "Could not submit command buffer",
                result: vk::Result::ERROR_DEVICE_LOST,
            })
        });
        assert!(matches!(result, Err(RendererError::Vulkan { .. })));
        // The structure is gone, a new build starts over
        assert_eq!(progress.stage.state(), BuildState::Unbuilt);
    }

    #[test]
    fn one_instance_references_the_bottom_level_address() {
        let instances = instance_records(&[0xdead_b000]);
        assert_eq!(instances.len(), 1);

        let instance = &instances[0];
        assert_eq!(
            unsafe { instance.acceleration_structure_reference.device_handle },
            0xdead_b000
        );
        assert_eq!(instance.instance_custom_index_and_mask.low_24(), 0);
        assert_eq!(instance.instance_custom_index_and_mask.high_8(), 0xff);
        assert_eq!(
            instance
                .instance_shader_binding_table_record_offset_and_flags
                .high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(instance.transform.matrix, IDENTITY_TRANSFORM);
    }

    #[test]
    fn instance_records_are_stable_across_rebuilds() {
        let first = instance_records(&[0x1000, 0x2000]);
        let second = instance_records(&[0x1000, 0x2000]);
        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(
                unsafe { a.acceleration_structure_reference.device_handle },
                unsafe { b.acceleration_structure_reference.device_handle }
            );
            assert_eq!(a.transform.matrix, b.transform.matrix);
            assert_eq!(
                a.instance_custom_index_and_mask.low_24(),
                b.instance_custom_index_and_mask.low_24()
            );
        }
    }

    #[test]
    fn scratch_uses_the_larger_requirement() {
        let size_info = vk::AccelerationStructureBuildSizesInfoKHR {
            acceleration_structure_size: 4096,
            build_scratch_size: 1000,
            update_scratch_size: 1500,
            ..Default::default()
        };
        let size = scratch_size(&size_info, 128);
        assert_eq!(size, 1536 + 128);
        assert_eq!(size % 128, 0);
    }

    #[test]
    fn triangle_count_follows_indices() {
        let mesh = TriangleGeometry {
            vertex_address: 0,
            vertex_stride: 20,
            vertex_count: 4,
            index_address: 0,
            index_count: 6,
            transform_address: 0,
        };
        assert_eq!(mesh.triangle_count(), 2);
    }
}
