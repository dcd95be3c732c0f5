//! Stack-bottom address calculation for `Isolate::set_stack_limit`.
//!
//! The stack grows downwards: the limit is `size` bytes below the address of
//! a local in the caller's frame, rounded down to whole `u32` slots.

/// Lowest address ever returned, used when the subtraction would wrap.
pub const MIN_STACK_ADDRESS: usize = size_of::<u32>();

/// Compute the stack limit `size` bytes below `frame_address`.
///
/// If `size` is larger than the distance to the bottom of the address space
/// the subtraction wraps to an address above the frame; in that case
/// [`MIN_STACK_ADDRESS`] is returned instead.
pub fn stack_limit_from(frame_address: usize, size: u32) -> usize {
    let slots = size as usize / size_of::<u32>();
    let answer = frame_address.wrapping_sub(slots.wrapping_mul(size_of::<u32>()));

    if answer > frame_address {
        return MIN_STACK_ADDRESS;
    }

    answer
}

/// Compute the stack limit relative to the current frame.
#[inline(never)]
pub fn calc_stack_limit(size: u32) -> usize {
    let marker = size;
    let frame_address = std::hint::black_box(&marker) as *const u32 as usize;

    stack_limit_from(frame_address, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_below_frame() {
        let frame = 0x7fff_0000_usize;
        assert_eq!(stack_limit_from(frame, 0x1000), frame - 0x1000);
    }

    #[test]
    fn test_size_rounded_down_to_slots() {
        let frame = 0x1000_usize;
        assert_eq!(stack_limit_from(frame, 7), frame - 4);
        assert_eq!(stack_limit_from(frame, 3), frame);
    }

    #[test]
    fn test_wrap_is_clamped() {
        // Stack near the bottom of memory with a huge requested size
        let frame = 0x100_usize;
        assert_eq!(stack_limit_from(frame, u32::MAX), MIN_STACK_ADDRESS);
        assert_eq!(stack_limit_from(frame, 0x1000), MIN_STACK_ADDRESS);
    }

    #[test]
    fn test_exact_bottom_is_not_clamped() {
        assert_eq!(stack_limit_from(0x100, 0x100), 0);
    }

    #[test]
    fn test_current_frame() {
        let limit = calc_stack_limit(64 * 1024);
        let local = 0u8;
        let here = &local as *const u8 as usize;

        assert!(limit < here);
        assert!(limit >= MIN_STACK_ADDRESS);
    }
}
