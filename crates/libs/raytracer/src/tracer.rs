use ash::vk;
use vulkan::{CommandBuffer, Context};

use crate::{
    cache::ObjectCache,
    descriptor::{DescriptorBinder, PoolConfig},
    frame::{FrameAssets, FrameRing},
    pipeline::{PipelineKey, TracePipeline},
    sbt::ShaderBindingTable,
    Error, RayTracingLimits, Result, Tracable, RAY_TRACING_STAGES,
};

pub struct RayTracerBuilder {
    frames_in_flight: usize,
    pipeline_capacity: usize,
    layout_capacity: usize,
    descriptor_set_capacity: usize,
    pool: PoolConfig,
}

impl RayTracerBuilder {
    pub fn new() -> Self {
        Self {
            frames_in_flight: 2,
            pipeline_capacity: 16,
            layout_capacity: 32,
            descriptor_set_capacity: 64,
            pool: PoolConfig::default(),
        }
    }

    pub fn frames_in_flight(self, frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight,
            ..self
        }
    }

    pub fn pipeline_capacity(self, pipeline_capacity: usize) -> Self {
        Self {
            pipeline_capacity,
            ..self
        }
    }

    pub fn layout_capacity(self, layout_capacity: usize) -> Self {
        Self {
            layout_capacity,
            ..self
        }
    }

    pub fn descriptor_set_capacity(self, descriptor_set_capacity: usize) -> Self {
        Self {
            descriptor_set_capacity,
            ..self
        }
    }

    pub fn max_sets_per_pool(self, max_sets: u32) -> Self {
        Self {
            pool: PoolConfig {
                max_sets,
                ..self.pool
            },
            ..self
        }
    }

    pub fn pool_sizes(self, pool_sizes: &[vk::DescriptorPoolSize]) -> Self {
        Self {
            pool: PoolConfig {
                pool_sizes: pool_sizes.to_vec(),
                ..self.pool
            },
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("frames_in_flight", self.frames_in_flight),
            ("pipeline_capacity", self.pipeline_capacity),
            ("layout_capacity", self.layout_capacity),
            ("descriptor_set_capacity", self.descriptor_set_capacity),
            ("max_sets_per_pool", self.pool.max_sets as usize),
            ("pool_sizes", self.pool.pool_sizes.len()),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, count)| *count == 0) {
            return Err(Error::InvalidConfig(format!("{name} must not be zero")));
        }
        if let Some(size) = self.pool.pool_sizes.iter().find(|s| s.descriptor_count == 0) {
            return Err(Error::InvalidConfig(format!(
                "pool size for {:?} must not be zero",
                size.ty
            )));
        }

        Ok(())
    }

    pub fn build(self, context: &Context) -> Result<RayTracer> {
        self.validate()?;

        let limits = RayTracingLimits::from_context(context)?;
        limits.validate()?;
        log::debug!("Ray tracing limits: {:?}", limits);

        let retire_after = self.frames_in_flight as u64;
        let slots = (0..self.frames_in_flight)
            .map(|_| {
                DescriptorBinder::new(
                    context,
                    &self.pool,
                    self.layout_capacity,
                    self.descriptor_set_capacity,
                    retire_after,
                )
                .map(FrameAssets::new)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RayTracer {
            limits,
            pipelines: ObjectCache::new(self.pipeline_capacity, retire_after),
            binding_tables: ObjectCache::new(self.pipeline_capacity, retire_after),
            frames: FrameRing::new(slots),
            frame_count: 0,
        })
    }
}

impl Default for RayTracerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Records ray dispatches, reusing pipelines, binding tables and descriptor
/// sets across frames.
///
/// The device must be idle before the tracer is dropped.
pub struct RayTracer {
    limits: RayTracingLimits,
    binding_tables: ObjectCache<vk::Pipeline, ShaderBindingTable>,
    pipelines: ObjectCache<PipelineKey, TracePipeline>,
    frames: FrameRing<FrameAssets>,
    frame_count: u64,
}

impl RayTracer {
    pub fn builder() -> RayTracerBuilder {
        RayTracerBuilder::new()
    }

    /// Records the dispatch described by `tracable` into `cmd` and moves to
    /// the next frame slot. Nothing is submitted or waited on.
    ///
    /// On error nothing is recorded, the current slot is kept and the caches
    /// are left as they were. The one exception is retired descriptor sets
    /// released to refill an exhausted pool.
    pub fn trace_rays(
        &mut self,
        context: &Context,
        cmd: &CommandBuffer,
        tracable: &Tracable,
    ) -> Result<()> {
        if !cmd.supports_ray_tracing() {
            return Err(Error::RayTracingDisabled);
        }
        tracable.validate(&self.limits)?;

        let frame = self.frame_count;
        self.pipelines.begin();
        self.binding_tables.begin();
        self.frames.current_mut().binder.begin(frame);
        self.pipelines.set_frame(frame);
        self.binding_tables.set_frame(frame);

        if let Err(err) = self.record(context, cmd, tracable) {
            self.pipelines.rollback();
            self.binding_tables.rollback();
            self.frames.current_mut().binder.rollback();
            log::debug!("Dispatch in frame {} failed: {}", frame, err);
            return Err(err);
        }

        let evicted_pipelines = self.pipelines.commit();
        drop(self.binding_tables.commit());
        invalidate_binding_tables(&mut self.binding_tables, evicted_pipelines, |pipeline| {
            pipeline.pipeline.handle()
        });

        let slot = self.frames.current_mut();
        slot.binder.commit();
        slot.tracable = Some(tracable.clone());
        self.frame_count += 1;
        self.frames.advance();

        Ok(())
    }

    /// Resolves every cached object the dispatch needs, then records it.
    /// Commands are only written once nothing can fail anymore.
    fn record(&mut self, context: &Context, cmd: &CommandBuffer, tracable: &Tracable) -> Result<()> {
        let set_descs = tracable.descriptors.sets();
        let key = PipelineKey {
            desc: tracable.pipeline.clone(),
            set_schemas: set_descs.iter().map(|desc| desc.schema()).collect(),
            push_constant_size: tracable.push_constants.len() as u32,
        };
        let pipeline = self
            .pipelines
            .get_or_create(key.clone(), || TracePipeline::new(context, &key))?;

        let descriptor_sets = self
            .frames
            .current_mut()
            .binder
            .resolve(context, &tracable.descriptors)?;

        let limits = &self.limits;
        let sbt = self
            .binding_tables
            .get_or_create(pipeline.pipeline.handle(), || {
                ShaderBindingTable::new(context, limits, &pipeline.pipeline)
            })?;

        cmd.bind_rt_pipeline(&pipeline.pipeline);
        if !descriptor_sets.is_empty() {
            cmd.bind_descriptor_sets(
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                &pipeline.layout,
                0,
                &descriptor_sets,
            );
        }
        if !tracable.push_constants.is_empty() {
            cmd.push_constants(
                &pipeline.layout,
                RAY_TRACING_STAGES,
                0,
                &tracable.push_constants,
            );
        }
        let [width, height, depth] = tracable.extent;
        cmd.trace_rays(sbt.regions(), width, height, depth)?;
        log::trace!(
            "Recorded dispatch {}x{}x{} in frame {} (slot {})",
            width,
            height,
            depth,
            self.frame_count,
            self.frames.current_index()
        );

        Ok(())
    }

    /// Slot the next call records with.
    pub fn current_index(&self) -> usize {
        self.frames.current_index()
    }

    pub fn num_concurrent_frames(&self) -> usize {
        self.frames.len()
    }

    /// Number of dispatches recorded so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn last_tracable(&self) -> Option<&Tracable> {
        self.frames.previous().tracable()
    }

    pub fn limits(&self) -> &RayTracingLimits {
        &self.limits
    }

    pub fn pipelines(&self) -> &ObjectCache<PipelineKey, TracePipeline> {
        &self.pipelines
    }

    pub fn binding_tables(&self) -> &ObjectCache<vk::Pipeline, ShaderBindingTable> {
        &self.binding_tables
    }

    pub fn frames(&self) -> impl Iterator<Item = &FrameAssets> {
        self.frames.iter()
    }
}

/// Drops the binding tables of evicted pipelines before the pipelines
/// themselves, so a recycled pipeline handle never finds a stale table.
fn invalidate_binding_tables<K, P, T>(
    binding_tables: &mut ObjectCache<vk::Pipeline, T>,
    evicted_pipelines: Vec<(K, P)>,
    handle: impl Fn(&P) -> vk::Pipeline,
) {
    for (_, pipeline) in evicted_pipelines {
        if binding_tables.remove(&handle(&pipeline)).is_some() {
            log::debug!("Dropped binding table of evicted pipeline {:?}", handle(&pipeline));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use ash::vk::Handle;
    use vulkan::{ContextBuilder, DeviceFeatures};

    use super::*;
    use crate::{pipeline::tests::test_pipeline, required_device_extensions};

    #[test]
    fn default_config_is_valid() {
        let builder = RayTracerBuilder::default();

        assert!(builder.validate().is_ok());
        assert_eq!(builder.frames_in_flight, 2);
        assert_eq!(builder.pipeline_capacity, 16);
        assert_eq!(builder.layout_capacity, 32);
        assert_eq!(builder.descriptor_set_capacity, 64);
        assert_eq!(builder.pool.max_sets, 64);
    }

    #[test]
    fn zero_values_are_rejected() {
        let invalid = |builder: RayTracerBuilder| {
            matches!(builder.validate(), Err(Error::InvalidConfig(_)))
        };

        assert!(invalid(RayTracer::builder().frames_in_flight(0)));
        assert!(invalid(RayTracer::builder().pipeline_capacity(0)));
        assert!(invalid(RayTracer::builder().max_sets_per_pool(0)));
        assert!(invalid(RayTracer::builder().pool_sizes(&[])));
        assert!(invalid(RayTracer::builder().pool_sizes(&[vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 0,
        }])));
        assert!(RayTracer::builder().frames_in_flight(1).validate().is_ok());
    }

    #[test]
    fn binding_table_is_built_once_per_pipeline() {
        let mut tables = ObjectCache::new(4, 2);
        let built = Cell::new(0);
        let pipeline = vk::Pipeline::from_raw(0xbeef);

        for frame in 0..5 {
            tables.set_frame(frame);
            tables
                .get_or_create(pipeline, || {
                    built.set(built.get() + 1);
                    Ok::<_, Error>(frame)
                })
                .unwrap();
        }

        assert_eq!(built.get(), 1);
    }

    #[test]
    fn evicted_pipelines_drop_their_binding_tables() {
        let mut pipelines = ObjectCache::new(1, 1);
        let mut tables = ObjectCache::new(4, 1);

        pipelines
            .get_or_create("a", || Ok::<_, ()>(vk::Pipeline::from_raw(1)))
            .unwrap();
        tables
            .get_or_create(vk::Pipeline::from_raw(1), || Ok::<_, ()>("table a"))
            .unwrap();

        pipelines.begin();
        tables.begin();
        pipelines.set_frame(1);
        tables.set_frame(1);
        pipelines
            .get_or_create("b", || Ok::<_, ()>(vk::Pipeline::from_raw(2)))
            .unwrap();
        tables
            .get_or_create(vk::Pipeline::from_raw(2), || Ok::<_, ()>("table b"))
            .unwrap();

        // The evicted pipeline is still alive until the call commits
        assert!(tables.contains(&vk::Pipeline::from_raw(1)));

        let evicted = pipelines.commit();
        drop(tables.commit());
        invalidate_binding_tables(&mut tables, evicted, |p| *p);

        assert!(!tables.contains(&vk::Pipeline::from_raw(1)));
        assert!(tables.contains(&vk::Pipeline::from_raw(2)));
        assert!(pipelines.take_evicted().is_empty());
    }

    #[test]
    fn failed_binding_table_keeps_pipeline_cache_unchanged() {
        let mut pipelines = ObjectCache::new(1, 1);
        let mut tables = ObjectCache::<vk::Pipeline, &str>::new(4, 1);
        pipelines
            .get_or_create("a", || Ok::<_, ()>(vk::Pipeline::from_raw(1)))
            .unwrap();
        let generation = pipelines.generation();

        pipelines.begin();
        tables.begin();
        pipelines.set_frame(1);
        tables.set_frame(1);
        let pipeline = *pipelines
            .get_or_create("b", || Ok::<_, Error>(vk::Pipeline::from_raw(2)))
            .unwrap();
        let built = tables.get_or_create(pipeline, || Err(Error::OutOfDeviceMemory));
        assert!(matches!(built, Err(Error::OutOfDeviceMemory)));
        pipelines.rollback();
        tables.rollback();

        assert!(pipelines.contains(&"a"));
        assert!(!pipelines.contains(&"b"));
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines.frame(), 0);
        assert_eq!(pipelines.generation(), generation);
        assert!(pipelines.take_evicted().is_empty());
        assert!(tables.is_empty());
    }

    #[test]
    #[ignore = "needs a ray tracing capable Vulkan device"]
    fn command_buffer_without_ray_tracing_is_rejected_before_recording() {
        let context = ContextBuilder::new()
            .app_name("tracer test")
            .required_extensions(required_device_extensions())
            .required_device_features(DeviceFeatures::ray_tracing())
            .with_raytracing_context(true)
            .build()
            .unwrap();
        let mut tracer = RayTracer::builder().build(&context).unwrap();

        let pool = context.create_command_pool(None, false).unwrap();
        let cmd = pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        assert!(!cmd.supports_ray_tracing());

        cmd.begin(None).unwrap();
        let tracable = Tracable::new(test_pipeline(), 16, 16);
        assert!(matches!(
            tracer.trace_rays(&context, &cmd, &tracable),
            Err(Error::RayTracingDisabled)
        ));
        cmd.end().unwrap();

        assert_eq!(tracer.frame_count(), 0);
        assert_eq!(tracer.current_index(), 0);
        assert!(tracer.pipelines().is_empty());
        assert!(tracer.binding_tables().is_empty());
    }
}
