//! Progress reporting for long runs.

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage starts.
    fn stage(&self, name: &str);
    /// Called each time an item of a fan-out finishes, successfully or not.
    fn item_finished(&self, stage: &str, finished: usize, total: usize);
    /// Called when the run is over.
    fn done(&self, summary: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _name: &str) {}
    fn item_finished(&self, _stage: &str, _finished: usize, _total: usize) {}
    fn done(&self, _summary: &str) {}
}
