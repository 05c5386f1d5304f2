use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, Context};

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<Self> {
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let inner = unsafe { device.inner.create_descriptor_set_layout(&dsl_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.inner
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .inner
                .destroy_descriptor_set_layout(self.inner, None);
        }
    }
}

/// Bounded pool. Sets allocated from it keep it alive and are returned to it
/// individually when dropped.
pub struct DescriptorPool {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorPool,
}

impl DescriptorPool {
    pub(crate) fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let inner = unsafe { device.inner.create_descriptor_pool(&pool_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn allocate_sets(
        self: &Arc<Self>,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<DescriptorSet>> {
        let layouts = (0..count).map(|_| layout.inner).collect::<Vec<_>>();
        let sets_alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.inner)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .inner
                .allocate_descriptor_sets(&sets_alloc_info)?
        };
        let sets = sets
            .into_iter()
            .map(|inner| DescriptorSet {
                pool: self.clone(),
                inner,
            })
            .collect::<Vec<_>>();

        Ok(sets)
    }

    pub fn allocate_set(self: &Arc<Self>, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        self.allocate_sets(layout, 1)?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Descriptor pool returned no set"))
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_descriptor_pool(self.inner, None) };
    }
}

pub struct DescriptorSet {
    pool: Arc<DescriptorPool>,
    pub(crate) inner: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.inner
    }

    pub fn update(&self, writes: &[WriteDescriptorSet]) {
        use WriteDescriptorSetKind::*;

        // these Vec are here to keep structure internal to WriteDescriptorSet (DescriptorImageInfo, DescriptorBufferInfo, ...) alive
        let mut img_infos = Vec::with_capacity(writes.len());
        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut as_handles = Vec::with_capacity(writes.len());
        let mut as_infos = Vec::with_capacity(writes.len());

        // Fill the info arrays first so the pointers taken below stay valid
        for write in writes {
            match write.kind {
                StorageImage { view, layout } | InputAttachment { view, layout } => img_infos
                    .push(
                        vk::DescriptorImageInfo::builder()
                            .image_view(view)
                            .image_layout(layout)
                            .build(),
                    ),
                CombinedImageSampler {
                    view,
                    sampler,
                    layout,
                } => img_infos.push(
                    vk::DescriptorImageInfo::builder()
                        .image_view(view)
                        .sampler(sampler)
                        .image_layout(layout)
                        .build(),
                ),
                UniformBuffer {
                    buffer,
                    offset,
                    range,
                }
                | StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => buffer_infos.push(
                    vk::DescriptorBufferInfo::builder()
                        .buffer(buffer)
                        .offset(offset)
                        .range(range)
                        .build(),
                ),
                AccelerationStructure {
                    acceleration_structure,
                } => as_handles.push(acceleration_structure),
            }
        }
        for handle in &as_handles {
            as_infos.push(
                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(std::slice::from_ref(handle))
                    .build(),
            );
        }

        let (mut img_index, mut buffer_index, mut as_index) = (0, 0, 0);
        let descriptor_writes = writes
            .iter()
            .map(|write| {
                let builder = vk::WriteDescriptorSet::builder()
                    .descriptor_type(write.kind.descriptor_type())
                    .dst_binding(write.binding)
                    .dst_set(self.inner);

                match write.kind {
                    StorageImage { .. } | InputAttachment { .. } | CombinedImageSampler { .. } => {
                        img_index += 1;
                        builder
                            .image_info(std::slice::from_ref(&img_infos[img_index - 1]))
                            .build()
                    }
                    UniformBuffer { .. } | StorageBuffer { .. } => {
                        buffer_index += 1;
                        builder
                            .buffer_info(std::slice::from_ref(&buffer_infos[buffer_index - 1]))
                            .build()
                    }
                    AccelerationStructure { .. } => {
                        as_index += 1;
                        let mut write = builder.build();
                        write.p_next = &as_infos[as_index - 1] as *const _ as *const _;
                        write.descriptor_count = 1;
                        write
                    }
                }
            })
            .collect::<Vec<_>>();

        unsafe {
            self.pool
                .device
                .inner
                .update_descriptor_sets(&descriptor_writes, &[])
        };
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        let result = unsafe {
            self.pool
                .device
                .inner
                .free_descriptor_sets(self.pool.inner, &[self.inner])
        };
        if let Err(err) = result {
            log::error!("Failed to free descriptor set: {err}");
        }
    }
}

impl Context {
    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(self.device.clone(), bindings)
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Arc<DescriptorPool>> {
        Ok(Arc::new(DescriptorPool::new(
            self.device.clone(),
            max_sets,
            pool_sizes,
        )?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteDescriptorSet {
    pub binding: u32,
    pub kind: WriteDescriptorSetKind,
}

#[derive(Debug, Clone, Copy)]
pub enum WriteDescriptorSetKind {
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    InputAttachment {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    AccelerationStructure {
        acceleration_structure: vk::AccelerationStructureKHR,
    },
    UniformBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl WriteDescriptorSetKind {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            Self::InputAttachment { .. } => vk::DescriptorType::INPUT_ATTACHMENT,
            Self::AccelerationStructure { .. } => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            Self::CombinedImageSampler { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}
