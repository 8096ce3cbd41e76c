use std::ffi::{CStr, CString};

use ash::{
    extensions::khr::{
        AccelerationStructure, BufferDeviceAddress, DeferredHostOperations, RayTracingPipeline,
        Surface, Swapchain, Synchronization2,
    },
    vk::{self, ApplicationInfo, DeviceCreateInfo, DeviceQueueCreateInfo, InstanceCreateInfo},
};
use log::{debug, info};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::{event_loop::EventLoop, window::Window};

use crate::error::{RendererError, Result, VkResultExt};

/// Instance, device and queue shared by every surface.
/// The surfaces are owned here as well, since they have to outlive every swapchain and have to
/// be destroyed before the instance.
pub struct Context {
    _entry: ash::Entry,
    pub instance: ash::Instance,

    pub surface_loader: Surface,
    surfaces: Vec<vk::SurfaceKHR>,

    pub context_raytracing: ContextRaytracing,
    pub synchronisation2_loader: Synchronization2,

    pub physical_device: vk::PhysicalDevice,
    pub physical_device_name: String,
    pub queue_family_index: u32,

    pub device: ash::Device,
    pub queue: vk::Queue,

    pub buffer_device_address: BufferDeviceAddress,
    pub device_memory_properties: vk::PhysicalDeviceMemoryProperties,
}

pub struct ContextRaytracing {
    pub ray_tracing_pipeline: RayTracingPipeline,
    pub physical_device_ray_tracing_pipeline_properties_khr:
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,

    pub acceleration_structure: AccelerationStructure,
    pub physical_device_acceleration_structure_properties_khr:
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
}

/// Index of a window's surface, in the order the windows were handed to [`Context::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceIndex(pub usize);

impl Context {
    pub fn new(event_loop: &EventLoop<()>, windows: &[&Window]) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|_| RendererError::Vulkan {
            context: "Could not load vulkan library",
            result: vk::Result::ERROR_INITIALIZATION_FAILED,
        })?;

        let instance = {
            let surface_extension =
                ash_window::enumerate_required_extensions(event_loop.raw_display_handle())
                    .vk_context("Could not enumerate surface extensions")?;

            let app_name = CString::new("Mirage Pathtracer").unwrap_or_default();
            let app_info = ApplicationInfo::builder()
                .application_name(&app_name)
                .api_version(vk::API_VERSION_1_3);
            let create_info = InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_extension_names(surface_extension);
            unsafe { entry.create_instance(&create_info, None) }
                .vk_context("Could not create instance")?
        };

        let surface_loader = Surface::new(&entry, &instance);
        let surfaces = windows
            .iter()
            .map(|window| {
                unsafe {
                    ash_window::create_surface(
                        &entry,
                        &instance,
                        window.raw_display_handle(),
                        window.raw_window_handle(),
                        None,
                    )
                }
                .vk_context("Could not create surface")
            })
            .collect::<Result<Vec<_>>>()?;

        let selected = find_physical_device(&instance, &surfaces, &surface_loader)?;
        info!(
            "Using {} (queue family {})",
            selected.name, selected.queue_family_index
        );

        let device =
            create_logical_device(&instance, selected.physical_device, selected.queue_family_index)?;

        let queue = unsafe { device.get_device_queue(selected.queue_family_index, 0) };

        let synchronisation2_loader = Synchronization2::new(&instance, &device);

        let ray_tracing_pipeline = RayTracingPipeline::new(&instance, &device);
        let physical_device_ray_tracing_pipeline_properties_khr =
            unsafe { RayTracingPipeline::get_properties(&instance, selected.physical_device) };

        let acceleration_structure = AccelerationStructure::new(&instance, &device);
        let physical_device_acceleration_structure_properties_khr =
            unsafe { AccelerationStructure::get_properties(&instance, selected.physical_device) };

        debug!(
            "Shader group handle size {}, alignment {}, base alignment {}",
            physical_device_ray_tracing_pipeline_properties_khr.shader_group_handle_size,
            physical_device_ray_tracing_pipeline_properties_khr.shader_group_handle_alignment,
            physical_device_ray_tracing_pipeline_properties_khr.shader_group_base_alignment
        );

        let buffer_device_address = BufferDeviceAddress::new(&instance, &device);

        let context_raytracing = ContextRaytracing {
            ray_tracing_pipeline,
            physical_device_ray_tracing_pipeline_properties_khr,
            acceleration_structure,
            physical_device_acceleration_structure_properties_khr,
        };

        let device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(selected.physical_device) };

        Ok(Self {
            _entry: entry,
            instance,

            surface_loader,
            surfaces,

            context_raytracing,
            synchronisation2_loader,

            physical_device: selected.physical_device,
            physical_device_name: selected.name,
            queue_family_index: selected.queue_family_index,

            device,
            queue,
            buffer_device_address,
            device_memory_properties,
        })
    }

    pub fn surface(&self, index: SurfaceIndex) -> vk::SurfaceKHR {
        self.surfaces[index.0]
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk_context("Could not wait for device idle")
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };

        for &surface in self.surfaces.iter() {
            unsafe { self.surface_loader.destroy_surface(surface, None) };
        }

        unsafe { self.instance.destroy_instance(None) };
    }
}

struct SelectedDevice {
    physical_device: vk::PhysicalDevice,
    name: String,
    queue_family_index: u32,
}

fn base_extensions() -> [&'static CStr; 2] {
    [Swapchain::name(), Synchronization2::name()]
}

fn ray_tracing_extensions() -> [&'static CStr; 4] {
    [
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
        BufferDeviceAddress::name(),
    ]
}

/// Returns the extensions of `required` that are not in `available`.
pub fn missing_extensions<'a>(
    required: &[&'a CStr],
    available: &[vk::ExtensionProperties],
) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|&name| {
            !available
                .iter()
                .any(|property| unsafe { CStr::from_ptr(property.extension_name.as_ptr()) } == name)
        })
        .collect()
}

pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        vk::PhysicalDeviceType::OTHER => 4,
        _ => 5,
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// What a device reports about the features the renderer turns on.
#[derive(Debug, Clone, Copy, Default)]
struct DeviceSupport {
    api_version: u32,
    synchronization2: bool,
    acceleration_structure: bool,
    ray_tracing_pipeline: bool,
    buffer_device_address: bool,
}

fn missing_features(support: &DeviceSupport) -> Vec<String> {
    let mut missing = vec![];
    if support.api_version < vk::API_VERSION_1_3 {
        missing.push(format!(
            "Vulkan 1.3 (device has {}.{})",
            vk::api_version_major(support.api_version),
            vk::api_version_minor(support.api_version)
        ));
    }
    let features = [
        (support.synchronization2, "synchronization2"),
        (support.acceleration_structure, "accelerationStructure"),
        (support.ray_tracing_pipeline, "rayTracingPipeline"),
        (support.buffer_device_address, "bufferDeviceAddress"),
    ];
    for (supported, name) in features {
        if !supported {
            missing.push(format!("{} feature", name));
        }
    }
    missing
}

/// Lists what keeps a device from tracing rays, empty if nothing does.
fn missing_ray_tracing_support(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    properties: &vk::PhysicalDeviceProperties,
    available: &[vk::ExtensionProperties],
) -> Vec<String> {
    let missing: Vec<String> = missing_extensions(&ray_tracing_extensions(), available)
        .into_iter()
        .map(|name| name.to_string_lossy().into_owned())
        .collect();
    if !missing.is_empty() {
        return missing;
    }

    let mut synchronization2_features = vk::PhysicalDeviceSynchronization2Features::default();
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut buffer_device_address_features =
        vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    {
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut synchronization2_features)
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_pipeline_features)
            .push_next(&mut buffer_device_address_features);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    }

    missing_features(&DeviceSupport {
        api_version: properties.api_version,
        synchronization2: synchronization2_features.synchronization2 == vk::TRUE,
        acceleration_structure: acceleration_structure_features.acceleration_structure == vk::TRUE,
        ray_tracing_pipeline: ray_tracing_pipeline_features.ray_tracing_pipeline == vk::TRUE,
        buffer_device_address: buffer_device_address_features.buffer_device_address == vk::TRUE,
    })
}

fn find_physical_device(
    instance: &ash::Instance,
    surfaces: &[vk::SurfaceKHR],
    surface_loader: &Surface,
) -> Result<SelectedDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .vk_context("Could not enumerate physical devices")?;

    let mut presentable = vec![];
    for physical_device in physical_devices {
        let extension_properties =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .vk_context("Could not enumerate device extension properties")?;

        if !missing_extensions(&base_extensions(), &extension_properties).is_empty() {
            continue;
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut queue_family_index = None;
        for (index, info) in queue_families.iter().enumerate() {
            if !info.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let mut supports_all_surfaces = true;
            for &surface in surfaces {
                let supported = unsafe {
                    surface_loader.get_physical_device_surface_support(
                        physical_device,
                        index as u32,
                        surface,
                    )
                }
                .vk_context("Could not query surface support")?;
                supports_all_surfaces &= supported;
            }
            if supports_all_surfaces {
                queue_family_index = Some(index as u32);
                break;
            }
        }

        if let Some(queue_family_index) = queue_family_index {
            let properties = unsafe { instance.get_physical_device_properties(physical_device) };
            let missing = missing_ray_tracing_support(
                instance,
                physical_device,
                &properties,
                &extension_properties,
            );
            presentable.push((
                device_type_rank(properties.device_type),
                SelectedDevice {
                    physical_device,
                    name: device_name(&properties),
                    queue_family_index,
                },
                missing,
            ));
        }
    }

    presentable.sort_by_key(|(rank, _, _)| *rank);

    // Ray tracing is a hard requirement, a presentable device without it is reported by name
    match presentable.iter().position(|(_, _, missing)| missing.is_empty()) {
        Some(index) => Ok(presentable.swap_remove(index).1),
        None => match presentable.into_iter().next() {
            Some((_, device, missing)) => Err(RendererError::RayTracingUnsupported {
                device: device.name,
                missing: missing.join(", "),
            }),
            None => Err(RendererError::NoSuitableDevice),
        },
    }
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device> {
    let device_extensions = base_extensions()
        .into_iter()
        .chain(ray_tracing_extensions())
        .map(|name| name.as_ptr())
        .collect::<Vec<_>>();

    let queue_priorities = [1.0];
    let queue_create_info = DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    let mut physical_device_vulkan13_features = vk::PhysicalDeviceVulkan13Features {
        synchronization2: vk::TRUE,
        ..vk::PhysicalDeviceVulkan13Features::default()
    };

    let mut enabled_buffer_device_address_features =
        vk::PhysicalDeviceBufferDeviceAddressFeatures {
            buffer_device_address: vk::TRUE,
            ..vk::PhysicalDeviceBufferDeviceAddressFeatures::default()
        };

    let mut enabled_ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR {
            ray_tracing_pipeline: vk::TRUE,
            ..vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
        };

    let mut enabled_acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            ..vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        };

    let create_info = DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&device_extensions)
        .push_next(&mut physical_device_vulkan13_features)
        .push_next(&mut enabled_buffer_device_address_features)
        .push_next(&mut enabled_ray_tracing_pipeline_features)
        .push_next(&mut enabled_acceleration_structure_features);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .vk_context("Could not create logical device")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut property = vk::ExtensionProperties::default();
        for (dst, &src) in property
            .extension_name
            .iter_mut()
            .zip(name.to_bytes_with_nul())
        {
            *dst = src as std::os::raw::c_char;
        }
        property
    }

    #[test]
    fn missing_extensions_reports_only_absent_ones() {
        let available = [extension(Swapchain::name()), extension(RayTracingPipeline::name())];

        let missing = missing_extensions(&ray_tracing_extensions(), &available);

        assert_eq!(
            missing,
            vec![
                AccelerationStructure::name(),
                DeferredHostOperations::name(),
                BufferDeviceAddress::name()
            ]
        );
        assert!(missing_extensions(&[Swapchain::name()], &available).is_empty());
    }

    fn full_support() -> DeviceSupport {
        DeviceSupport {
            api_version: vk::API_VERSION_1_3,
            synchronization2: true,
            acceleration_structure: true,
            ray_tracing_pipeline: true,
            buffer_device_address: true,
        }
    }

    #[test]
    fn a_complete_device_misses_nothing() {
        assert!(missing_features(&full_support()).is_empty());
        let newer = DeviceSupport {
            api_version: vk::make_api_version(0, 1, 3, 250),
            ..full_support()
        };
        assert!(missing_features(&newer).is_empty());
    }

    #[test]
    fn old_api_versions_and_missing_synchronization2_are_reported() {
        let support = DeviceSupport {
            api_version: vk::API_VERSION_1_2,
            synchronization2: false,
            ..full_support()
        };
        assert_eq!(
            missing_features(&support),
            vec![
                "Vulkan 1.3 (device has 1.2)".to_string(),
                "synchronization2 feature".to_string()
            ]
        );
    }

    #[test]
    fn missing_ray_tracing_features_are_named() {
        let support = DeviceSupport {
            ray_tracing_pipeline: false,
            buffer_device_address: false,
            ..full_support()
        };
        assert_eq!(
            missing_features(&support),
            vec![
                "rayTracingPipeline feature".to_string(),
                "bufferDeviceAddress feature".to_string()
            ]
        );
    }

    #[test]
    fn discrete_gpus_rank_first() {
        let mut types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        types.sort_by_key(|&device_type| device_type_rank(device_type));
        assert_eq!(types[0], vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(types[2], vk::PhysicalDeviceType::CPU);
    }
}
