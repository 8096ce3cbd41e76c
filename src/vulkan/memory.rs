use ash::vk;

use crate::error::{RendererError, Result, VkResultExt};

use super::context::Context;

/// Picks the first memory type that is allowed by the resource's type filter and has every
/// requested property flag.
pub fn find_memorytype_index(
    memory_req: &vk::MemoryRequirements,
    memory_prop: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_prop.memory_types[..memory_prop.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (memory_req.memory_type_bits & (1 << index)) != 0
                && memory_type.property_flags & flags == flags
        })
        .map(|(index, _memory_type)| index as u32)
        .ok_or(RendererError::NoSuitableMemoryType {
            type_filter: memory_req.memory_type_bits,
            requested: flags,
        })
}

/// Allocates a dedicated block for one buffer or image. `device_address` has to be set for
/// buffers that are created with `SHADER_DEVICE_ADDRESS`.
pub fn allocate_memory(
    context: &Context,
    memory_requirements: &vk::MemoryRequirements,
    memory_property_flags: vk::MemoryPropertyFlags,
    device_address: bool,
) -> Result<vk::DeviceMemory> {
    let memorytype_index = find_memorytype_index(
        memory_requirements,
        &context.device_memory_properties,
        memory_property_flags,
    )?;

    let mut allocate_flags_info =
        vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

    let mut allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(memory_requirements.size)
        .memory_type_index(memorytype_index);
    if device_address {
        allocate_info = allocate_info.push_next(&mut allocate_flags_info);
    }

    unsafe { context.device.allocate_memory(&allocate_info, None) }
        .vk_context("Could not allocate device memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (memory_type, &flags) in properties.memory_types.iter_mut().zip(types) {
            memory_type.property_flags = flags;
        }
        properties
    }

    fn requirements(memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 256,
            alignment: 16,
            memory_type_bits,
        }
    }

    #[test]
    fn picks_first_type_with_all_flags() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        let index = find_memorytype_index(
            &requirements(0b1111),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 2);

        let index = find_memorytype_index(
            &requirements(0b1111),
            &properties,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn respects_the_type_filter() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memorytype_index(
            &requirements(0b10),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn fails_when_no_type_matches() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let result = find_memorytype_index(
            &requirements(0b01),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        assert!(matches!(
            result,
            Err(RendererError::NoSuitableMemoryType {
                type_filter: 0b01,
                ..
            })
        ));
    }

    #[test]
    fn ignores_types_past_the_reported_count() {
        let mut properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        properties.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;

        let result = find_memorytype_index(
            &requirements(u32::MAX),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        assert!(result.is_err());
    }
}
