//! Per-worker latency/utilization telemetry in fixed-length arrays: each
//! worker only ever writes its own slot, so contention is per-slot rather
//! than pool-wide.

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerSlot {
    pub latency_ms: f64,
    pub utilization: f64,
}

pub struct PipelineTelemetry {
    slots: Vec<RwLock<WorkerSlot>>,
}

impl PipelineTelemetry {
    pub fn new(worker_count: usize) -> Self {
        Self {
            slots: (0..worker_count).map(|_| RwLock::new(WorkerSlot::default())).collect(),
        }
    }

    pub fn record(&self, worker_id: usize, latency_ms: f64, utilization: f64) {
        if let Some(slot) = self.slots.get(worker_id) {
            let mut guard = slot.write();
            guard.latency_ms = latency_ms;
            guard.utilization = utilization;
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSlot> {
        self.slots.iter().map(|s| *s.read()).collect()
    }

    /// Mean over slots that have recorded at least one sample.
    pub fn mean_latency_ms(&self) -> f64 {
        mean_nonzero(self.slots.iter().map(|s| s.read().latency_ms))
    }

    pub fn mean_utilization(&self) -> f64 {
        mean_nonzero(self.slots.iter().map(|s| s.read().utilization))
    }
}

fn mean_nonzero(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.filter(|v| *v > 0.0).fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_ignores_slots_with_no_samples_yet() {
        let telemetry = PipelineTelemetry::new(4);
        telemetry.record(0, 10.0, 0.5);
        telemetry.record(1, 20.0, 0.8);
        assert_eq!(telemetry.mean_latency_ms(), 15.0);
    }

    #[test]
    fn record_only_touches_the_named_slot() {
        let telemetry = PipelineTelemetry::new(2);
        telemetry.record(0, 5.0, 0.1);
        let snap = telemetry.snapshot();
        assert_eq!(snap[0].latency_ms, 5.0);
        assert_eq!(snap[1].latency_ms, 0.0);
    }
}
