use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, CommandBuffer, Fence};

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub(crate) inner: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub(crate) fn new(index: u32, inner: vk::QueueFamilyProperties) -> Self {
        Self { index, inner }
    }

    pub fn supports_compute(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn has_queues(&self) -> bool {
        self.inner.queue_count > 0
    }
}

pub struct Queue {
    device: Arc<Device>,
    pub inner: vk::Queue,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>, inner: vk::Queue) -> Self {
        Self { device, inner }
    }

    /// Submits the recorded buffers in order. Waiting is left to the caller
    /// through `fence`.
    pub fn submit(&self, command_buffers: &[&CommandBuffer], fence: Option<&Fence>) -> Result<()> {
        let cmd_buffer_submit_infos = command_buffers
            .iter()
            .map(|b| {
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(b.inner)
                    .build()
            })
            .collect::<Vec<_>>();

        let submit_info = vk::SubmitInfo2::builder().command_buffer_infos(&cmd_buffer_submit_infos);
        let fence = fence.map_or_else(vk::Fence::null, |f| f.inner);

        unsafe {
            self.device.inner.queue_submit2(
                self.inner,
                std::slice::from_ref(&submit_info),
                fence,
            )?
        };

        Ok(())
    }
}
