use ash::vk;
use gpu_allocator::MemoryLocation;
use vulkan::{
    utils::compute_aligned_size, Buffer, Context, RayTracingPipeline, ShaderGroupKind,
    TraceRegions,
};

use crate::{Error, RayTracingLimits, Result};

/// Buckets in the order their regions are laid out in the buffer.
const REGION_ORDER: [ShaderGroupKind; 4] = [
    ShaderGroupKind::RayGen,
    ShaderGroupKind::Hit,
    ShaderGroupKind::Miss,
    ShaderGroupKind::Callable,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtRegion {
    /// Indices of the groups in this region, in declaration order.
    pub groups: Vec<u32>,
    pub offset: u64,
    pub size: u64,
}

/// Byte layout of a shader binding table.
///
/// Regions are raygen, hit, miss, callable. Records are `stride` bytes apart,
/// with `stride = round_up(handle_size, handle_alignment)`, and every region
/// starts on a `base_alignment` boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub stride: u64,
    pub group_count: usize,
    pub raygen: SbtRegion,
    pub hit: SbtRegion,
    pub miss: SbtRegion,
    pub callable: SbtRegion,
    pub size: u64,
}

impl SbtLayout {
    pub fn new(limits: &RayTracingLimits, group_kinds: &[ShaderGroupKind]) -> Result<Self> {
        limits.validate()?;

        let handle_size = limits.handle_size as u64;
        let stride = compute_aligned_size(handle_size, limits.handle_alignment as u64);
        let base_alignment = limits.base_alignment as u64;

        let mut offset = 0;
        let mut regions = REGION_ORDER.map(|kind| {
            let groups = group_kinds
                .iter()
                .enumerate()
                .filter(|(_, k)| **k == kind)
                .map(|(index, _)| index as u32)
                .collect::<Vec<_>>();
            let size = compute_aligned_size(stride * groups.len() as u64, base_alignment);
            let region = SbtRegion {
                groups,
                offset,
                size,
            };
            offset += size;
            region
        });

        if regions[0].groups.len() != 1 {
            return Err(Error::RaygenCount(regions[0].groups.len()));
        }

        let take = |region: &mut SbtRegion| std::mem::replace(region, SbtRegion::empty());
        Ok(Self {
            handle_size,
            stride,
            group_count: group_kinds.len(),
            raygen: take(&mut regions[0]),
            hit: take(&mut regions[1]),
            miss: take(&mut regions[2]),
            callable: take(&mut regions[3]),
            size: offset,
        })
    }

    pub fn regions(&self) -> [&SbtRegion; 4] {
        [&self.raygen, &self.hit, &self.miss, &self.callable]
    }

    /// Lays the group handles out into a zeroed image of the table.
    /// `handles` holds `handle_size` bytes per group in declaration order.
    pub fn write(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = handle_size * self.group_count;
        if handles.len() < expected {
            return Err(Error::HandleDataTooShort {
                expected,
                actual: handles.len(),
            });
        }

        let mut data = vec![0u8; self.size as usize];
        for region in self.regions() {
            for (record, &group) in region.groups.iter().enumerate() {
                let src = group as usize * handle_size;
                let dst = (region.offset + record as u64 * self.stride) as usize;
                data[dst..dst + handle_size].copy_from_slice(&handles[src..src + handle_size]);
            }
        }

        Ok(data)
    }

    /// Strided regions for `vkCmdTraceRaysKHR` once the table lives at `address`.
    pub fn trace_regions(&self, address: vk::DeviceAddress) -> TraceRegions {
        let region = |region: &SbtRegion, stride: u64| {
            if region.groups.is_empty() {
                return vk::StridedDeviceAddressRegionKHR::default();
            }
            vk::StridedDeviceAddressRegionKHR::builder()
                .device_address(address + region.offset)
                .stride(stride)
                .size(region.size)
                .build()
        };

        TraceRegions {
            // The raygen region's stride must equal its size
            raygen: region(&self.raygen, self.raygen.size),
            miss: region(&self.miss, self.stride),
            hit: region(&self.hit, self.stride),
            callable: region(&self.callable, self.stride),
        }
    }
}

impl SbtRegion {
    fn empty() -> Self {
        Self {
            groups: vec![],
            offset: 0,
            size: 0,
        }
    }
}

pub struct ShaderBindingTable {
    _buffer: Buffer,
    layout: SbtLayout,
    regions: TraceRegions,
}

impl ShaderBindingTable {
    pub fn new(
        context: &Context,
        limits: &RayTracingLimits,
        pipeline: &RayTracingPipeline,
    ) -> Result<Self> {
        let layout = SbtLayout::new(limits, pipeline.group_kinds())?;
        log::debug!("Shader binding table layout {:?}", layout);

        let handles = pipeline.get_shader_group_handles()?;
        let data = layout.write(&handles)?;

        let buffer_usage = vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        // Over-allocate so the table can start on a base alignment boundary
        // whatever alignment the allocator hands back
        let base_alignment = limits.base_alignment as u64;
        let buffer = context.create_buffer(
            "shader binding table",
            buffer_usage,
            MemoryLocation::CpuToGpu,
            layout.size + base_alignment,
        )?;

        let address = buffer.get_device_address();
        let aligned_address = compute_aligned_size(address, base_alignment);
        let mut padded = vec![0u8; (aligned_address - address) as usize];
        padded.extend_from_slice(&data);
        buffer.copy_data_to_buffer(&padded)?;

        Ok(Self {
            _buffer: buffer,
            regions: layout.trace_regions(aligned_address),
            layout,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn regions(&self) -> &TraceRegions {
        &self.regions
    }
}
