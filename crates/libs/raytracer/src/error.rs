use ash::vk;
use gpu_allocator::AllocationError;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Pipeline declares no shader groups")]
    NoShaderGroups,
    #[error("Pipeline must declare exactly one raygen group, found {0}")]
    RaygenCount(usize),
    #[error("Shader group {group} is invalid: {reason}")]
    InvalidGroup { group: usize, reason: String },
    #[error("Shader stage {stage} has flags {flags:?}, expected a single ray tracing stage")]
    InvalidStage {
        stage: usize,
        flags: vk::ShaderStageFlags,
    },
    #[error("Binding (set {set}, binding {binding}) already holds a {existing:?}, cannot rebind it as {requested:?}")]
    BindingConflict {
        set: u32,
        binding: u32,
        existing: vk::DescriptorType,
        requested: vk::DescriptorType,
    },
    #[error("Push constant size {0} is not a multiple of 4")]
    PushConstantAlignment(usize),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Descriptor pool exhausted")]
    PoolExhausted,
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("Dispatch extent {requested:?} exceeds device limits (max {max:?}, max invocations {max_invocations})")]
    ExtentTooLarge {
        requested: [u32; 3],
        max: [u32; 3],
        max_invocations: u32,
    },
    #[error("Recursion depth {requested} exceeds device maximum {max}")]
    RecursionTooDeep { requested: u32, max: u32 },
    #[error("Push constant size {requested} exceeds device maximum {max}")]
    PushConstantsTooLarge { requested: usize, max: u32 },
    #[error("Descriptor set index {set} exceeds device maximum of {max} bound sets")]
    TooManyDescriptorSets { set: u64, max: u32 },
    #[error("Descriptor type {0:?} is not supported by ray tracing stages")]
    UnsupportedDescriptor(vk::DescriptorType),
    #[error("Stage mask {0:?} is not a non-empty set of ray tracing stages")]
    UnsupportedStages(vk::ShaderStageFlags),
    #[error("Ray tracing is not enabled on this context")]
    RayTracingDisabled,
    #[error("Invalid device limits: {0}")]
    InvalidDeviceLimits(String),
    #[error("Device returned {actual} bytes of group handles, expected {expected}")]
    HandleDataTooShort { expected: usize, actual: usize },

    #[error("Device error: {0:#}")]
    Device(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed pipeline or descriptor description. Fatal to the call.
    Configuration,
    /// Pool or memory exhaustion. The caller may retry after releasing resources.
    ResourceExhausted,
    /// The request exceeds what the device can do.
    Capability,
    Device,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            NoShaderGroups
            | RaygenCount(_)
            | InvalidGroup { .. }
            | InvalidStage { .. }
            | BindingConflict { .. }
            | PushConstantAlignment(_)
            | InvalidConfig(_) => ErrorKind::Configuration,
            PoolExhausted | OutOfDeviceMemory => ErrorKind::ResourceExhausted,
            ExtentTooLarge { .. }
            | RecursionTooDeep { .. }
            | PushConstantsTooLarge { .. }
            | TooManyDescriptorSets { .. }
            | UnsupportedDescriptor(_)
            | UnsupportedStages(_)
            | RayTracingDisabled
            | InvalidDeviceLimits(_)
            | HandleDataTooShort { .. } => ErrorKind::Capability,
            Device(_) => ErrorKind::Device,
        }
    }
}

impl From<anyhow::Error> for Error {
    /// Classifies a failure of the device layer.
    fn from(err: anyhow::Error) -> Self {
        if let Some(result) = err.downcast_ref::<vk::Result>() {
            match *result {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    return Error::PoolExhausted
                }
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    return Error::OutOfDeviceMemory
                }
                _ => {}
            }
        }
        if let Some(AllocationError::OutOfMemory) = err.downcast_ref::<AllocationError>() {
            return Error::OutOfDeviceMemory;
        }

        Error::Device(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_exhaustion() {
        let err = Error::from(anyhow::Error::new(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        assert!(matches!(err, Error::PoolExhausted));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = Error::from(anyhow::Error::new(vk::Result::ERROR_FRAGMENTED_POOL));
        assert!(matches!(err, Error::PoolExhausted));
    }

    #[test]
    fn allocator_out_of_memory_is_exhaustion() {
        let err = Error::from(anyhow::Error::new(AllocationError::OutOfMemory));
        assert!(matches!(err, Error::OutOfDeviceMemory));
    }

    #[test]
    fn other_device_errors_are_wrapped() {
        let err = Error::from(anyhow::Error::new(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(err.kind(), ErrorKind::Device);

        let err = Error::from(anyhow::anyhow!("shader compilation failed"));
        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(err.to_string().contains("shader compilation failed"));
    }

    #[test]
    fn validation_errors_are_configuration() {
        assert_eq!(Error::RaygenCount(2).kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::UnsupportedDescriptor(vk::DescriptorType::INPUT_ATTACHMENT).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            Error::TooManyDescriptorSets { set: 8, max: 8 }.kind(),
            ErrorKind::Capability
        );
    }
}
