use std::{sync::Arc, time::Duration};

use anyhow::Result;
use ash::vk;

use crate::{device::Device, Context};

/// Host side completion signal of a submission. The tracer never waits on
/// its own, the owner of submission does.
pub struct Fence {
    device: Arc<Device>,
    pub(crate) inner: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: Arc<Device>, signaled: bool) -> Result<Self> {
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty(),
        };
        let inner = unsafe {
            device
                .inner
                .create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)?
        };

        Ok(Self { device, inner })
    }

    /// Blocks until the fence is signaled. Returns `false` if `timeout`
    /// elapsed first, `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let result = unsafe {
            self.device
                .inner
                .wait_for_fences(&[self.inner], true, timeout_nanos(timeout))
        };

        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_signaled(&self) -> Result<bool> {
        Ok(unsafe { self.device.inner.get_fence_status(self.inner)? })
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.inner.reset_fences(&[self.inner])? };

        Ok(())
    }
}

fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |timeout| {
        u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
    })
}

impl Context {
    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        Fence::new(self.device.clone(), signaled)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_fence(self.inner, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_convert_to_nanoseconds() {
        assert_eq!(timeout_nanos(None), u64::MAX);
        assert_eq!(timeout_nanos(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_nanos(Some(Duration::from_millis(16))), 16_000_000);
        assert_eq!(timeout_nanos(Some(Duration::MAX)), u64::MAX);
    }
}
