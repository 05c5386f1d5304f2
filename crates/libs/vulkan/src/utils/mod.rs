use anyhow::{Context as _, Result};

/// Rounds `size` up to the next multiple of `alignment`, which must be a
/// power of two.
pub fn compute_aligned_size(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (size + (alignment - 1)) & !(alignment - 1)
}

pub fn read_shader_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = std::io::Cursor::new(bytes);
    ash::util::read_spv(&mut cursor).context("Invalid SPIR-V module")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up() {
        assert_eq!(compute_aligned_size(0, 64), 0);
        assert_eq!(compute_aligned_size(1, 64), 64);
        assert_eq!(compute_aligned_size(32, 32), 32);
        assert_eq!(compute_aligned_size(33, 32), 64);
    }

    #[test]
    fn rejects_truncated_spirv() {
        assert!(read_shader_from_bytes(&[0x03, 0x02, 0x23]).is_err());
    }
}
