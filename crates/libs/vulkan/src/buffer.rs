use std::{
    mem::{align_of, size_of_val},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, Allocator},
    MemoryLocation,
};

use crate::{device::Device, Context};

pub struct Buffer {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl Buffer {
    pub(crate) fn new(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        name: &str,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let inner = unsafe { device.inner.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.inner.get_buffer_memory_requirements(inner) };

        // From here on every early return drops `buffer`, which destroys the
        // handle and frees whatever memory is already allocated
        let mut buffer = Self {
            device,
            allocator,
            inner,
            allocation: None,
            size,
        };

        let allocation = buffer
            .allocator
            .lock()
            .map_err(|_| anyhow::anyhow!("Allocator mutex poisoned"))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;
        let allocation = buffer.allocation.insert(allocation);

        unsafe {
            buffer.device.inner.bind_buffer_memory(
                buffer.inner,
                allocation.memory(),
                allocation.offset(),
            )?
        };

        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.inner
    }

    fn mapped_ptr(&self) -> Result<*mut std::ffi::c_void> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|ptr| ptr.as_ptr())
            .ok_or_else(|| anyhow::anyhow!("Buffer memory is not host visible"))
    }

    pub fn copy_data_to_buffer<T: Copy>(&self, data: &[T]) -> Result<()> {
        anyhow::ensure!(
            size_of_val(data) as vk::DeviceSize <= self.size,
            "Copying {} bytes into a buffer of {} bytes",
            size_of_val(data),
            self.size
        );

        let data_ptr = self.mapped_ptr()?;
        unsafe {
            let mut align =
                ash::util::Align::new(data_ptr, align_of::<T>() as _, size_of_val(data) as _);
            align.copy_from_slice(data);
        };

        Ok(())
    }

    /// Copies the first `dst.len()` bytes out of a host visible buffer.
    pub fn read_data_from_buffer(&self, dst: &mut [u8]) -> Result<()> {
        anyhow::ensure!(
            dst.len() as vk::DeviceSize <= self.size,
            "Reading {} bytes from a buffer of {} bytes",
            dst.len(),
            self.size
        );

        let data_ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data_ptr as *const u8, dst.as_mut_ptr(), dst.len());
        }

        Ok(())
    }

    pub fn get_device_address(&self) -> u64 {
        let addr_info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe { self.device.inner.get_buffer_device_address(&addr_info) }
    }
}

impl Context {
    pub fn create_buffer(
        &self,
        name: &str,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> Result<Buffer> {
        Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            name,
            usage,
            memory_location,
            size,
        )
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_buffer(self.inner, None) };

        let Some(allocation) = self.allocation.take() else {
            return;
        };
        match self.allocator.lock() {
            Ok(mut allocator) => {
                if let Err(err) = allocator.free(allocation) {
                    log::error!("Failed to free buffer memory: {err}");
                }
            }
            Err(_) => log::error!("Allocator mutex poisoned, leaking buffer memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContextBuilder;

    #[test]
    #[ignore = "needs a Vulkan device"]
    fn failed_creation_releases_what_it_took() {
        let context = ContextBuilder::new().app_name("buffer test").build().unwrap();

        for _ in 0..16 {
            let oversized = context.create_buffer(
                "oversized",
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuToCpu,
                1 << 62,
            );
            assert!(oversized.is_err());
        }

        let buffer = context
            .create_buffer(
                "small",
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuToCpu,
                256,
            )
            .unwrap();
        buffer.copy_data_to_buffer(&[7u32; 64]).unwrap();
        let mut data = [0u8; 4];
        buffer.read_data_from_buffer(&mut data).unwrap();
        assert_eq!(u32::from_ne_bytes(data), 7);
    }
}
