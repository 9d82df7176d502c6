use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// -----------------------------------------------------------------------------
// StatisticsSink

/// Where the engine publishes its counters.
///
/// Implementations must be non-blocking; every hook runs on the hot path
/// of an operation. Timings arrive as elapsed wall time only when the
/// sink said it was enabled when the operation started, and are recorded
/// in opaque 100 ns ticks.
pub trait StatisticsSink: Send + Sync {
    /// Whether operations should bother timing themselves.
    fn is_enabled(&self) -> bool {
        false
    }

    fn record_copy(&self, elapsed: Option<Duration>);
    fn record_serialization(&self, elapsed: Option<Duration>);
    fn record_deserialization(&self, elapsed: Option<Duration>);

    fn record_fallback_copy(&self, elapsed: Option<Duration>);
    fn record_fallback_serialization(&self, elapsed: Option<Duration>);
    fn record_fallback_deserialization(&self, elapsed: Option<Duration>);

    /// A single allocation crossed the large-object threshold. Advisory
    /// only; the operation proceeds unchanged.
    fn record_large_allocation(&self, bytes: usize);
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatisticsSink for NullSink {
    fn record_copy(&self, _: Option<Duration>) {}
    fn record_serialization(&self, _: Option<Duration>) {}
    fn record_deserialization(&self, _: Option<Duration>) {}
    fn record_fallback_copy(&self, _: Option<Duration>) {}
    fn record_fallback_serialization(&self, _: Option<Duration>) {}
    fn record_fallback_deserialization(&self, _: Option<Duration>) {}
    fn record_large_allocation(&self, _: usize) {}
}

// -----------------------------------------------------------------------------
// SerializationStatistics

fn ticks(elapsed: Option<Duration>) -> u64 {
    elapsed.map_or(0, |d| (d.as_nanos() / 100) as u64)
}

/// The default sink: relaxed atomic counters, gated by a construction
/// time flag.
#[derive(Debug, Default)]
pub struct SerializationStatistics {
    enabled: bool,

    copies: AtomicU64,
    serializations: AtomicU64,
    deserializations: AtomicU64,
    fallback_copies: AtomicU64,
    fallback_serializations: AtomicU64,
    fallback_deserializations: AtomicU64,

    copy_ticks: AtomicU64,
    ser_ticks: AtomicU64,
    deser_ticks: AtomicU64,
    fallback_copy_ticks: AtomicU64,
    fallback_ser_ticks: AtomicU64,
    fallback_deser_ticks: AtomicU64,

    large_allocations: AtomicU64,
}

impl SerializationStatistics {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// A sink that keeps its gate closed: hooks are called but record
    /// nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn copies(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    pub fn serializations(&self) -> u64 {
        self.serializations.load(Ordering::Relaxed)
    }

    pub fn deserializations(&self) -> u64 {
        self.deserializations.load(Ordering::Relaxed)
    }

    pub fn fallback_copies(&self) -> u64 {
        self.fallback_copies.load(Ordering::Relaxed)
    }

    pub fn fallback_serializations(&self) -> u64 {
        self.fallback_serializations.load(Ordering::Relaxed)
    }

    pub fn fallback_deserializations(&self) -> u64 {
        self.fallback_deserializations.load(Ordering::Relaxed)
    }

    pub fn copy_ticks(&self) -> u64 {
        self.copy_ticks.load(Ordering::Relaxed)
    }

    pub fn ser_ticks(&self) -> u64 {
        self.ser_ticks.load(Ordering::Relaxed)
    }

    pub fn deser_ticks(&self) -> u64 {
        self.deser_ticks.load(Ordering::Relaxed)
    }

    pub fn large_allocations(&self) -> u64 {
        self.large_allocations.load(Ordering::Relaxed)
    }

    fn bump(&self, counter: &AtomicU64, timer: &AtomicU64, elapsed: Option<Duration>) {
        if !self.enabled {
            return;
        }
        counter.fetch_add(1, Ordering::Relaxed);
        timer.fetch_add(ticks(elapsed), Ordering::Relaxed);
    }
}

impl StatisticsSink for SerializationStatistics {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn record_copy(&self, elapsed: Option<Duration>) {
        self.bump(&self.copies, &self.copy_ticks, elapsed);
    }

    fn record_serialization(&self, elapsed: Option<Duration>) {
        self.bump(&self.serializations, &self.ser_ticks, elapsed);
    }

    fn record_deserialization(&self, elapsed: Option<Duration>) {
        self.bump(&self.deserializations, &self.deser_ticks, elapsed);
    }

    fn record_fallback_copy(&self, elapsed: Option<Duration>) {
        self.bump(&self.fallback_copies, &self.fallback_copy_ticks, elapsed);
    }

    fn record_fallback_serialization(&self, elapsed: Option<Duration>) {
        self.bump(&self.fallback_serializations, &self.fallback_ser_ticks, elapsed);
    }

    fn record_fallback_deserialization(&self, elapsed: Option<Duration>) {
        self.bump(
            &self.fallback_deserializations,
            &self.fallback_deser_ticks,
            elapsed,
        );
    }

    fn record_large_allocation(&self, _bytes: usize) {
        if self.enabled {
            self.large_allocations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SerializationStatistics, StatisticsSink};

    #[test]
    fn counters_accumulate_when_enabled() {
        let stats = SerializationStatistics::new();
        stats.record_serialization(Some(Duration::from_micros(5)));
        stats.record_serialization(None);
        stats.record_copy(None);

        assert_eq!(stats.serializations(), 2);
        assert_eq!(stats.copies(), 1);
        assert_eq!(stats.deserializations(), 0);
        // 5 µs is 50 ticks of 100 ns.
        assert_eq!(stats.ser_ticks(), 50);
    }

    #[test]
    fn disabled_gate_drops_everything() {
        let stats = SerializationStatistics::disabled();
        stats.record_serialization(Some(Duration::from_secs(1)));
        stats.record_large_allocation(1 << 20);

        assert!(!stats.is_enabled());
        assert_eq!(stats.serializations(), 0);
        assert_eq!(stats.large_allocations(), 0);
    }
}
