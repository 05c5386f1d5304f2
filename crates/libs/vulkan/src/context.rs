use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::{vk, Entry};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocatorDebugSettings,
};

use crate::{
    device::{Device, DeviceFeatures},
    instance::Instance,
    physical_device::PhysicalDevice,
    queue::{Queue, QueueFamily},
    CommandPool, RayTracingContext, Version, VERSION_1_3,
};

/// Headless Vulkan context: one compute capable queue, no surface.
pub struct Context {
    pub allocator: Arc<Mutex<Allocator>>,
    pub command_pool: CommandPool,
    pub ray_tracing: Option<Arc<RayTracingContext>>,
    pub queue: Queue,
    pub device: Arc<Device>,
    pub queue_family: QueueFamily,
    pub physical_device: PhysicalDevice,
    pub instance: Instance,
    _entry: Entry,
}

pub struct ContextBuilder<'a> {
    vulkan_version: Version,
    app_name: &'a str,
    required_extensions: &'a [&'a str],
    required_device_features: DeviceFeatures,
    with_raytracing_context: bool,
}

impl<'a> Default for ContextBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ContextBuilder<'a> {
    pub fn new() -> Self {
        Self {
            vulkan_version: VERSION_1_3,
            app_name: "",
            required_extensions: &[],
            required_device_features: Default::default(),
            with_raytracing_context: false,
        }
    }

    pub fn vulkan_version(self, vulkan_version: Version) -> Self {
        Self {
            vulkan_version,
            ..self
        }
    }

    pub fn app_name(self, app_name: &'a str) -> Self {
        Self { app_name, ..self }
    }

    pub fn required_extensions(self, required_extensions: &'a [&str]) -> Self {
        Self {
            required_extensions,
            ..self
        }
    }

    pub fn required_device_features(self, required_device_features: DeviceFeatures) -> Self {
        Self {
            required_device_features,
            ..self
        }
    }

    pub fn with_raytracing_context(self, with_raytracing_context: bool) -> Self {
        Self {
            with_raytracing_context,
            ..self
        }
    }

    pub fn build(self) -> Result<Context> {
        Context::new(self)
    }
}

impl Context {
    fn new(
        ContextBuilder {
            vulkan_version,
            app_name,
            required_extensions,
            required_device_features,
            with_raytracing_context,
        }: ContextBuilder,
    ) -> Result<Self> {
        let entry = Entry::linked();
        let instance = Instance::new(&entry, vulkan_version, app_name)?;

        let physical_devices = instance.physical_devices()?;
        let (physical_device, queue_family) = select_suitable_physical_device(
            &physical_devices,
            required_extensions,
            &required_device_features,
        )?;
        log::info!("Selected physical device: {:?}", physical_device.name);

        let device = Arc::new(Device::new(
            &instance,
            &physical_device,
            queue_family,
            required_extensions,
            &required_device_features,
        )?);
        let queue = device.get_queue(queue_family, 0);

        let ray_tracing = with_raytracing_context.then(|| {
            let ray_tracing = Arc::new(RayTracingContext::new(&instance, &physical_device, &device));
            log::debug!(
                "Ray tracing pipeline properties {:#?}",
                ray_tracing.pipeline_properties
            );
            ray_tracing
        });

        let command_pool = CommandPool::new(
            device.clone(),
            ray_tracing.clone(),
            queue_family,
            Some(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
        )?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.inner.clone(),
            device: device.inner.clone(),
            physical_device: physical_device.inner,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: required_device_features.buffer_device_address,
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            command_pool,
            ray_tracing,
            queue,
            device,
            queue_family,
            physical_device,
            instance,
            _entry: entry,
        })
    }
}

fn select_suitable_physical_device(
    devices: &[PhysicalDevice],
    required_extensions: &[&str],
    required_device_features: &DeviceFeatures,
) -> Result<(PhysicalDevice, QueueFamily)> {
    log::debug!("Choosing Vulkan physical device");

    devices
        .iter()
        .find_map(|device| {
            let family = device
                .queue_families
                .iter()
                .find(|f| f.has_queues() && f.supports_compute())?;

            let missing = device.missing_extensions(required_extensions);
            if !missing.is_empty() {
                log::debug!("Skipping {:?}: missing extensions {:?}", device.name, missing);
                return None;
            }
            let missing = device
                .supported_device_features
                .missing(required_device_features);
            if !missing.is_empty() {
                log::debug!("Skipping {:?}: missing features {:?}", device.name, missing);
                return None;
            }

            Some((device.clone(), *family))
        })
        .ok_or_else(|| anyhow::anyhow!("Could not find a suitable device"))
}

impl Context {
    pub fn device_wait_idle(&self) -> Result<()> {
        unsafe { self.device.inner.device_wait_idle()? };

        Ok(())
    }
}
