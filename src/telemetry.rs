use tokio::sync::mpsc;

/// Progress events sent from chain runners to the batch coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// A chain began executing its first step
    ChainStarted,
    /// One step finished and its outcome was recorded
    StepCompleted { duration_ms: u64, success: bool },
    /// A chain stopped, either after its last step or at a failure
    ChainFinished { succeeded: bool },
}

pub type TelemetrySender = mpsc::UnboundedSender<TelemetryEvent>;

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub chains_started: usize,
    pub chains_succeeded: usize,
    pub chains_failed: usize,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    /// Kept sorted on insert so percentiles are a single lookup
    step_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::ChainStarted => {
                self.chains_started += 1;
            }
            TelemetryEvent::StepCompleted {
                duration_ms,
                success,
            } => {
                if *success {
                    self.steps_succeeded += 1;
                } else {
                    self.steps_failed += 1;
                }
                let at = self.step_durations_ms.partition_point(|d| d <= duration_ms);
                self.step_durations_ms.insert(at, *duration_ms);
            }
            TelemetryEvent::ChainFinished { succeeded } => {
                if *succeeded {
                    self.chains_succeeded += 1;
                } else {
                    self.chains_failed += 1;
                }
            }
        }
    }

    pub fn chains_finished(&self) -> usize {
        self.chains_succeeded + self.chains_failed
    }

    /// Calculate percentile from step durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.step_durations_ms.is_empty() {
            return None;
        }

        let sorted = &self.step_durations_ms;
        let index = (((p / 100.0) * sorted.len() as f64).ceil() as usize).saturating_sub(1);
        let index = index.min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
