use std::{path::Path, time::Duration};

use anyhow::{Context as _, Result};
use clap::Parser;
use raytracer::{
    required_device_extensions, DescriptorMap, DescriptorResource, PipelineDesc,
    RayTracer, RayTracingShaderGroup, ShaderStage, Tracable,
};
use vulkan::ash::vk;
use vulkan::gpu_allocator::MemoryLocation;
use vulkan::{Buffer, BufferBarrier, Context, ContextBuilder, DeviceFeatures, Fence};

mod args;

use args::Args;

const APP_NAME: &str = "Headless trace";
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let context = ContextBuilder::new()
        .app_name(APP_NAME)
        .required_extensions(required_device_extensions())
        .required_device_features(DeviceFeatures::ray_tracing())
        .with_raytracing_context(true)
        .build()?;
    log::info!("Selected device {}", context.physical_device.name);

    let mut tracer = RayTracer::builder()
        .frames_in_flight(args.frames_in_flight)
        .build(&context)?;

    let pipeline = load_pipeline(&args)?;
    let output_size = args.width as u64 * args.height as u64 * 4;
    let frames = (0..tracer.num_concurrent_frames())
        .map(|index| Frame::new(&context, index, output_size))
        .collect::<Result<Vec<_>>>()?;

    // Everything recorded must be done before the tracer and frames go away
    let result = record_frames(&context, &args, &pipeline, &mut tracer, &frames);
    context.device_wait_idle()?;
    result?;

    report(&tracer, &frames, output_size)
}

fn record_frames(
    context: &Context,
    args: &Args,
    pipeline: &PipelineDesc,
    tracer: &mut RayTracer,
    frames: &[Frame],
) -> Result<()> {
    for frame_index in 0..args.frames {
        let slot = tracer.current_index();
        let frame = &frames[slot];

        if !frame.fence.is_signaled()? {
            log::trace!("Slot {} still in flight, waiting", slot);
        }
        if !frame.fence.wait(Some(FRAME_TIMEOUT))? {
            anyhow::bail!("Slot {} did not complete within {:?}", slot, FRAME_TIMEOUT);
        }
        frame.fence.reset()?;

        let mut descriptors = DescriptorMap::new();
        descriptors.bind(
            0,
            0,
            DescriptorResource::whole_storage_buffer(frame.output.handle()),
            vk::ShaderStageFlags::RAYGEN_KHR,
        )?;

        let push_constants = [args.width, args.height, frame_index, 0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect::<Vec<_>>();

        let tracable = Tracable::new(pipeline.clone(), args.width, args.height)
            .descriptors(descriptors)
            .push_constants(&push_constants);

        let cmd = &frame.command_buffer;
        cmd.reset()?;
        cmd.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;
        tracer.trace_rays(context, cmd, &tracable)?;
        cmd.pipeline_buffer_barriers(&[BufferBarrier {
            buffer: &frame.output,
            src_access_mask: vk::AccessFlags2::SHADER_WRITE,
            dst_access_mask: vk::AccessFlags2::HOST_READ,
            src_stage_mask: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            dst_stage_mask: vk::PipelineStageFlags2::HOST,
        }]);
        cmd.end()?;

        context.queue.submit(&[cmd], Some(&frame.fence))?;
        log::debug!("Submitted frame {} on slot {}", frame_index, slot);
    }

    Ok(())
}

fn report(tracer: &RayTracer, frames: &[Frame], output_size: u64) -> Result<()> {
    log::info!(
        "Recorded {} dispatches, {} pipeline(s), {} binding table(s) cached",
        tracer.frame_count(),
        tracer.pipelines().len(),
        tracer.binding_tables().len()
    );

    let Some(last) = tracer.last_tracable() else {
        return Ok(());
    };

    let slot = (tracer.current_index() + frames.len() - 1) % frames.len();
    let mut pixels = vec![0u8; output_size as usize];
    frames[slot].output.read_data_from_buffer(&mut pixels)?;

    let written = pixels
        .chunks_exact(4)
        .filter(|p| p.iter().any(|&b| b != 0))
        .count();
    log::info!(
        "Last dispatch {:?} wrote {} of {} pixels",
        last.extent,
        written,
        pixels.len() / 4
    );

    Ok(())
}

struct Frame {
    command_buffer: vulkan::CommandBuffer,
    fence: Fence,
    output: Buffer,
}

impl Frame {
    fn new(context: &Context, index: usize, output_size: u64) -> Result<Self> {
        let command_buffer = context
            .command_pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
        let fence = context.create_fence(true)?;
        let output = context.create_buffer(
            &format!("trace output {index}"),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuToCpu,
            output_size,
        )?;

        Ok(Self {
            command_buffer,
            fence,
            output,
        })
    }
}

fn load_pipeline(args: &Args) -> Result<PipelineDesc> {
    let mut stages = vec![
        ShaderStage::new(vk::ShaderStageFlags::RAYGEN_KHR, read_spv(&args.rgen)?),
        ShaderStage::new(vk::ShaderStageFlags::MISS_KHR, read_spv(&args.rmiss)?),
    ];
    let mut groups = vec![
        RayTracingShaderGroup::RayGen { general: 0 },
        RayTracingShaderGroup::Miss { general: 1 },
    ];

    if let Some(rchit) = &args.rchit {
        stages.push(ShaderStage::new(
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            read_spv(rchit)?,
        ));
        groups.push(RayTracingShaderGroup::TrianglesHit {
            closest_hit: Some(2),
            any_hit: None,
        });
    }

    Ok(PipelineDesc {
        stages,
        groups,
        max_recursion_depth: args.max_recursion_depth,
    })
}

fn read_spv(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read shader {}", path.display()))
}
