use std::sync::Arc;
use std::{marker::PhantomData, ops::Deref};

use ash::{self, vk};

use crate::error::{RendererError, Result, VkResultExt};
use crate::vulkan::context::Context;

use super::memory::allocate_memory;

pub trait IntoSlice<T> {
    fn as_sliced(&self) -> &[T];
}

impl<T> IntoSlice<T> for T {
    fn as_sliced(&self) -> &[T] {
        std::slice::from_ref(self)
    }
}

impl<T> IntoSlice<T> for [T] {
    fn as_sliced(&self) -> &[T] {
        self
    }
}

impl<T> IntoSlice<T> for Vec<T> {
    fn as_sliced(&self) -> &[T] {
        self
    }
}

/// A buffer bound at offset 0 to its own memory allocation. Both are released together on drop,
/// so a buffer must outlive the GPU work that reads it.
pub struct Buffer<T> {
    pub inner: vk::Buffer,
    pub memory: vk::DeviceMemory,
    /// Size of the allocation, which can be larger than the requested size
    pub size: vk::DeviceSize,
    context: Arc<Context>,
    _marker: PhantomData<T>,
}

impl<T> Buffer<T> {
    pub fn new(
        context: Arc<Context>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Buffer<T>> {
        let device = &context.device;

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { device.create_buffer(&create_info, None) }.vk_context("Could not create buffer")?;

        let buffer_memory_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(
            &context,
            &buffer_memory_requirements,
            memory_property_flags,
            usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let buffer = Buffer {
            inner: buffer,
            memory,
            size: buffer_memory_requirements.size,
            context,
            _marker: PhantomData,
        };

        unsafe { buffer.device().bind_buffer_memory(buffer.inner, buffer.memory, 0) }
            .vk_context("Could not bind buffer memory")?;

        Ok(buffer)
    }

    /// Creates a host visible buffer that holds `data`.
    pub fn new_with_data<U: IntoSlice<T> + ?Sized>(
        context: Arc<Context>,
        usage: vk::BufferUsageFlags,
        data: &U,
    ) -> Result<Buffer<T>> {
        let data = data.as_sliced();
        let buffer = Buffer::new(
            context,
            std::mem::size_of_val(data) as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.copy_data(data)?;
        Ok(buffer)
    }

    fn device(&self) -> &ash::Device {
        &self.context.device
    }

    pub fn get_device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe {
            self.context
                .buffer_device_address
                .get_buffer_device_address(&info)
        }
    }

    /// Copies `data` to the start of the buffer. Only valid for host visible and coherent memory.
    pub fn copy_data<U: IntoSlice<T> + ?Sized>(&self, data: &U) -> Result<()> {
        self.copy_data_at(0, data)
    }

    /// Copies `data` to `offset` bytes into the buffer.
    pub fn copy_data_at<U: IntoSlice<T> + ?Sized>(
        &self,
        offset: vk::DeviceSize,
        data: &U,
    ) -> Result<()> {
        let data = data.as_sliced();
        check_copy_bounds(offset, std::mem::size_of_val(data) as vk::DeviceSize, self.size)?;

        let buffer_ptr = unsafe {
            self.device().map_memory(
                self.memory,
                offset,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .vk_context("Could not map memory")? as *mut T;

        unsafe { buffer_ptr.copy_from_nonoverlapping(data.as_ptr(), data.len()) };

        unsafe { self.device().unmap_memory(self.memory) };
        Ok(())
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_buffer(self.inner, None) };
        unsafe { device.free_memory(self.memory, None) };
    }
}

impl<T> Deref for Buffer<T> {
    type Target = vk::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A copy of `len` bytes to `offset` has to end inside the buffer.
fn check_copy_bounds(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RendererError::BufferOverflow { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_that_fit_are_accepted() {
        assert!(check_copy_bounds(0, 64, 64).is_ok());
        assert!(check_copy_bounds(32, 32, 64).is_ok());
        assert!(check_copy_bounds(64, 0, 64).is_ok());
    }

    #[test]
    fn copies_past_the_end_are_rejected() {
        assert!(matches!(
            check_copy_bounds(32, 64, 64),
            Err(RendererError::BufferOverflow {
                offset: 32,
                len: 64,
                size: 64
            })
        ));
        assert!(check_copy_bounds(u64::MAX, 1, 64).is_err());
    }
}
