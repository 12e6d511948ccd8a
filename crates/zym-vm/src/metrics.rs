/// Execution counters, updated only when collection is enabled on the VM.
///
/// Counters are monotonic except for `frames_peak`, which tracks the
/// high-water mark of the frame stack. `reset` zeroes everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmMetrics {
    pub instructions: u64,
    pub calls: u64,
    pub tail_calls: u64,
    pub frames_peak: usize,
    pub global_cache_hits: u64,
    pub global_cache_misses: u64,
    pub continuations_captured: u64,
    pub continuations_resumed: u64,
    pub gc_cycles: u64,
    pub yields: u64,
}

impl VmMetrics {
    pub fn reset(&mut self) {
        *self = VmMetrics::default();
    }
}
