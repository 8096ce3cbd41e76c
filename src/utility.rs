// See: https://github.com/ash-rs/ash/blob/master/examples/src/lib.rs#L30C1-L40C2
// Simple offset_of macro akin to C++ offsetof
#[macro_export]
macro_rules! offset_of {
    ($base:path, $field:ident) => {{
        #[allow(unused_unsafe)]
        unsafe {
            let b: $base = std::mem::zeroed();
            std::ptr::addr_of!(b.$field) as isize - std::ptr::addr_of!(b) as isize
        }
    }};
}

/// Rounds `value` up to the next multiple of `alignment`, which has to be a power of two.
pub fn aligned_size(value: u32, alignment: u32) -> u32 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// [`aligned_size`] for device sizes and addresses.
pub fn aligned_device_size(value: u64, alignment: u64) -> u64 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up_to_alignment() {
        assert_eq!(aligned_size(59, 64), 64);
        assert_eq!(aligned_size(64, 64), 64);
        assert_eq!(aligned_size(65, 64), 128);
        assert_eq!(aligned_size(0, 32), 0);
        assert_eq!(aligned_size(32, 1), 32);
    }

    #[test]
    fn aligned_size_properties_hold_for_power_of_two_alignments() {
        for shift in 0..8 {
            let alignment = 1u32 << shift;
            for value in 0..300 {
                let result = aligned_size(value, alignment);
                assert!(result >= value);
                assert_eq!(result % alignment, 0);
                assert!(result - value < alignment);
            }
        }
    }

    #[test]
    #[should_panic]
    fn aligned_size_rejects_non_power_of_two() {
        aligned_size(10, 48);
    }

    #[test]
    fn aligned_device_size_matches_u32_version() {
        assert_eq!(aligned_device_size(1000, 256), 1024);
        assert_eq!(aligned_device_size(4096, 128), 4096);
        assert_eq!(
            aligned_device_size(59, 64),
            aligned_size(59, 64) as u64
        );
    }
}
