/// Minimum capacity for growable entry arrays.
pub const MIN_CAPACITY: usize = 8;

/// Live-byte threshold the first collection triggers at.
pub const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

/// Multiplier applied to the surviving byte count to pick the next trigger.
pub const GC_HEAP_GROW_FACTOR: usize = 2;

macro_rules! grow_capacity {
    ($capacity:expr) => {{
        if $capacity < crate::memory::MIN_CAPACITY {
            crate::memory::MIN_CAPACITY
        } else {
            $capacity * 2
        }
    }};
}

pub(crate) use grow_capacity;
