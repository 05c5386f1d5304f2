use std::{collections::BTreeMap, fmt::Debug, hash::Hash, sync::Arc};

use ash::vk;
use vulkan::{
    Context, DescriptorPool, DescriptorSet, DescriptorSetLayout, WriteDescriptorSet,
    WriteDescriptorSetKind,
};

use crate::{cache::ObjectCache, Error, Result};

pub const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw()
        | vk::ShaderStageFlags::CALLABLE_KHR.as_raw(),
);

/// A resource bound to one descriptor slot, by raw handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
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
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    SampledImage {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    AccelerationStructure(vk::AccelerationStructureKHR),
    InputAttachment {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
}

impl DescriptorResource {
    pub fn whole_uniform_buffer(buffer: vk::Buffer) -> Self {
        Self::UniformBuffer {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    pub fn whole_storage_buffer(buffer: vk::Buffer) -> Self {
        Self::StorageBuffer {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.write_kind().descriptor_type()
    }

    fn write_kind(&self) -> WriteDescriptorSetKind {
        match *self {
            Self::UniformBuffer {
                buffer,
                offset,
                range,
            } => WriteDescriptorSetKind::UniformBuffer {
                buffer,
                offset,
                range,
            },
            Self::StorageBuffer {
                buffer,
                offset,
                range,
            } => WriteDescriptorSetKind::StorageBuffer {
                buffer,
                offset,
                range,
            },
            Self::StorageImage { view, layout } => {
                WriteDescriptorSetKind::StorageImage { view, layout }
            }
            Self::SampledImage {
                view,
                sampler,
                layout,
            } => WriteDescriptorSetKind::CombinedImageSampler {
                view,
                sampler,
                layout,
            },
            Self::AccelerationStructure(acceleration_structure) => {
                WriteDescriptorSetKind::AccelerationStructure {
                    acceleration_structure,
                }
            }
            Self::InputAttachment { view, layout } => {
                WriteDescriptorSetKind::InputAttachment { view, layout }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub resource: DescriptorResource,
    pub stages: vk::ShaderStageFlags,
}

/// Resources bound per `(set, binding)`. Equality is by value so maps rebuilt
/// every frame still hit the caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorMap {
    bindings: BTreeMap<(u32, u32), DescriptorBinding>,
}

impl DescriptorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `resource` at `(set, binding)`. Rebinding a slot replaces the
    /// resource as long as the descriptor type stays the same.
    pub fn bind(
        &mut self,
        set: u32,
        binding: u32,
        resource: DescriptorResource,
        stages: vk::ShaderStageFlags,
    ) -> Result<&mut Self> {
        if let Some(existing) = self.bindings.get(&(set, binding)) {
            let existing = existing.resource.descriptor_type();
            let requested = resource.descriptor_type();
            if existing != requested {
                return Err(Error::BindingConflict {
                    set,
                    binding,
                    existing,
                    requested,
                });
            }
        }

        self.bindings
            .insert((set, binding), DescriptorBinding { resource, stages });

        Ok(self)
    }

    pub fn get(&self, set: u32, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.get(&(set, binding))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Number of sets a pipeline using this map binds: the highest bound set
    /// index plus one.
    pub fn set_count(&self) -> u64 {
        self.bindings
            .keys()
            .last()
            .map_or(0, |(set, _)| *set as u64 + 1)
    }

    /// One description per set index from 0 to the highest bound set.
    /// Unused indices in between get an empty set. The set count must have
    /// been checked against the device first.
    pub fn sets(&self) -> Vec<DescriptorSetDesc> {
        let mut sets = vec![DescriptorSetDesc::default(); self.set_count() as usize];
        for (&(set, binding), desc) in &self.bindings {
            sets[set as usize].bindings.push((binding, *desc));
        }

        sets
    }

    pub fn validate(&self) -> Result<()> {
        self.bindings
            .values()
            .try_for_each(|binding| check_binding(binding.resource.descriptor_type(), binding.stages))
    }
}

fn check_binding(ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Result<()> {
    match ty {
        vk::DescriptorType::UNIFORM_BUFFER
        | vk::DescriptorType::STORAGE_BUFFER
        | vk::DescriptorType::STORAGE_IMAGE
        | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        | vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {}
        _ => return Err(Error::UnsupportedDescriptor(ty)),
    }
    if stages.is_empty() || !RAY_TRACING_STAGES.contains(stages) {
        return Err(Error::UnsupportedStages(stages));
    }

    Ok(())
}

/// Bindings of a single descriptor set, sorted by binding index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetDesc {
    pub bindings: Vec<(u32, DescriptorBinding)>,
}

impl DescriptorSetDesc {
    /// The layout this set needs. Independent of the bound resource instances.
    pub fn schema(&self) -> SetSchema {
        SetSchema {
            bindings: self
                .bindings
                .iter()
                .map(|(binding, desc)| SchemaBinding {
                    binding: *binding,
                    descriptor_type: desc.resource.descriptor_type(),
                    stages: desc.stages,
                })
                .collect(),
        }
    }

    fn writes(&self) -> Vec<WriteDescriptorSet> {
        self.bindings
            .iter()
            .map(|(binding, desc)| WriteDescriptorSet {
                binding: *binding,
                kind: desc.resource.write_kind(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// Binding schema of a descriptor set: the cache key of its layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SetSchema {
    pub bindings: Vec<SchemaBinding>,
}

impl SetSchema {
    pub fn layout_bindings(&self) -> Result<Vec<vk::DescriptorSetLayoutBinding>> {
        self.bindings
            .iter()
            .map(|b| {
                check_binding(b.descriptor_type, b.stages)?;
                Ok(vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build())
            })
            .collect()
    }

    pub fn create_layout(&self, context: &Context) -> Result<DescriptorSetLayout> {
        let bindings = self.layout_bindings()?;
        Ok(context.create_descriptor_set_layout(&bindings)?)
    }
}

/// Sizes of the descriptor pool each frame slot allocates from.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sets: u32,
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let size = |ty, descriptor_count| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        };

        Self {
            max_sets: 64,
            pool_sizes: vec![
                size(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 64),
                size(vk::DescriptorType::STORAGE_IMAGE, 128),
                size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 128),
                size(vk::DescriptorType::UNIFORM_BUFFER, 128),
                size(vk::DescriptorType::STORAGE_BUFFER, 256),
            ],
        }
    }
}

/// Per frame slot layout and set caches, backed by the slot's own pool.
pub struct DescriptorBinder {
    pool: Arc<DescriptorPool>,
    layouts: ObjectCache<SetSchema, DescriptorSetLayout>,
    sets: ObjectCache<(u32, DescriptorSetDesc), DescriptorSet>,
}

impl DescriptorBinder {
    pub fn new(
        context: &Context,
        pool_config: &PoolConfig,
        layout_capacity: usize,
        set_capacity: usize,
        retire_after: u64,
    ) -> Result<Self> {
        let pool = context.create_descriptor_pool(pool_config.max_sets, &pool_config.pool_sizes)?;

        Ok(Self {
            pool,
            layouts: ObjectCache::new(layout_capacity, retire_after),
            sets: ObjectCache::new(set_capacity, retire_after),
        })
    }

    /// Opens a call in `frame`. Until [`Self::commit`] nothing is evicted and
    /// [`Self::rollback`] restores both caches.
    pub fn begin(&mut self, frame: u64) {
        self.layouts.begin();
        self.sets.begin();
        self.layouts.set_frame(frame);
        self.sets.set_frame(frame);
    }

    /// Evicted objects are retired, so they are released right away.
    pub fn commit(&mut self) {
        drop(self.sets.commit());
        drop(self.layouts.commit());
    }

    pub fn rollback(&mut self) {
        self.sets.rollback();
        self.layouts.rollback();
    }

    /// Resolves the populated descriptor set for every set index of `map`,
    /// creating layouts and sets on a miss.
    pub fn resolve(&mut self, context: &Context, map: &DescriptorMap) -> Result<Vec<vk::DescriptorSet>> {
        let Self {
            pool,
            layouts,
            sets,
        } = self;

        map.sets()
            .into_iter()
            .enumerate()
            .map(|(index, desc)| {
                let schema = desc.schema();
                let layout = layouts.get_or_create(schema, || {
                    desc.schema().create_layout(context)
                })?;

                let writes = desc.writes();
                let set = get_or_allocate(sets, (index as u32, desc), || {
                    let set = pool.allocate_set(layout)?;
                    set.update(&writes);
                    Ok(set)
                })?;

                Ok(set.handle())
            })
            .collect()
    }

    pub fn layouts(&self) -> &ObjectCache<SetSchema, DescriptorSetLayout> {
        &self.layouts
    }

    pub fn sets(&self) -> &ObjectCache<(u32, DescriptorSetDesc), DescriptorSet> {
        &self.sets
    }
}

/// Looks a pooled object up, allocating it on a miss. An exhausted pool is
/// retried once after the cache's retired entries are released back to it.
fn get_or_allocate<K, V, F>(cache: &mut ObjectCache<K, V>, key: K, mut allocate: F) -> Result<&V>
where
    K: Hash + Eq + Clone + Debug,
    F: FnMut() -> Result<V>,
{
    let mut allocated = None;
    if !cache.contains(&key) {
        allocated = Some(match allocate() {
            Err(Error::PoolExhausted) => {
                let released = cache.evict_retired();
                if released.is_empty() {
                    return Err(Error::PoolExhausted);
                }
                log::debug!(
                    "Descriptor pool exhausted, released {} retired entries",
                    released.len()
                );
                drop(released);
                allocate()?
            }
            result => result?,
        });
    }

    cache.get_or_create(key, || allocated.map_or_else(allocate, Ok))
}
