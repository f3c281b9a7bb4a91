use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_OBSERVATION_DELAY_MS: u64 = 7_000;
pub const DEFAULT_SETTLE_WINDOW_MS: u64 = 500;
pub const DEFAULT_RESOLUTION_DEADLINE_MS: u64 = 30_000;
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_EVENT_ARCHIVE_CAPACITY: usize = 100;

/// Tunables for a [`Monitor`](crate::Monitor).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between two polls of the target.
    pub poll_interval: Duration,
    /// How long a freshly detected cycle is left alone before automatic
    /// resolution starts, so operators can see the "before" state.
    pub observation_delay: Duration,
    /// Pause after an interrupt before the attempt is judged.
    pub settle_window: Duration,
    /// Upper bound on one whole resolution run, observation delay excluded.
    pub resolution_deadline: Duration,
    pub history_capacity: usize,
    pub event_archive_capacity: usize,
    /// Initial value of the auto-resolution switch.
    pub auto_resolution: bool,
    /// Re-arm automatic resolution for FAILED events whose cycle persists.
    /// `None` means a failed event is never retried automatically.
    pub retry_failed_after: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            observation_delay: Duration::from_millis(DEFAULT_OBSERVATION_DELAY_MS),
            settle_window: Duration::from_millis(DEFAULT_SETTLE_WINDOW_MS),
            resolution_deadline: Duration::from_millis(DEFAULT_RESOLUTION_DEADLINE_MS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            event_archive_capacity: DEFAULT_EVENT_ARCHIVE_CAPACITY,
            auto_resolution: true,
            retry_failed_after: None,
        }
    }
}
