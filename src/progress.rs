//! The line-granular handshake between the decoding side and the reducer,
//! and the frame-counting monitor that paces progress reports.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};


/// Sentinel value of the processor line that ends the run.
pub const RUN_COMPLETE: i64 = -1;


/// Shared between every worker of a run. The decoder publishes how many
/// scan lines are fully parsed; the reducer publishes how many lines it has
/// consumed. Setting the processor line to `RUN_COMPLETE` is the single
/// cancellation signal every busy-wait observes.
#[derive(Debug, Default)]
pub struct Progress {

    /// Highest scan line (within the whole run) whose events are all
    /// visible in the output buffers.
    preprocessor_line: AtomicI64,

    /// Highest scan line the reducer has consumed, or `RUN_COMPLETE`.
    processor_line: AtomicI64,

    /// Host-requested cancellation, honoured at the next poll.
    quit: AtomicBool,
}

impl Progress {

    pub fn new() -> Self {
        Self::default()
    }

    /// The decoder advances this after finishing a chunk. Never decreases.
    pub fn publish_preprocessor_line(&self, line: i64) {
        self.preprocessor_line.fetch_max(line, Ordering::Release);
    }

    pub fn preprocessor_line(&self) -> i64 {
        self.preprocessor_line.load(Ordering::Acquire)
    }

    pub fn set_processor_line(&self, line: i64) {
        self.processor_line.store(line, Ordering::Release);
    }

    pub fn processor_line(&self) -> i64 {
        self.processor_line.load(Ordering::Acquire)
    }

    /// Ask the run to stop at the next poll. Idempotent.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// True once the reducer has signalled the end of the run
    /// or the host has asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.processor_line() == RUN_COMPLETE || self.quit_requested()
    }

    /// Terminate every worker loop.
    pub fn complete(&self) {
        self.set_processor_line(RUN_COMPLETE);
    }

    /// Prepare for a fresh run: both lines back to zero, quit bit cleared.
    pub fn reset(&self) {
        self.preprocessor_line.store(0, Ordering::Release);
        self.processor_line.store(0, Ordering::Release);
        self.quit.store(false, Ordering::Release);
    }
}


/// Counts reduced frames and decides when a progress report is due.
/// Owned by the reducer driver; none of this is shared between threads.
#[derive(Debug)]
pub struct ProgressMonitor {

    /// Frames consumed by the reducer so far.
    pub frames_counted: u64,

    /// Total frames expected; grows in continuous mode.
    pub frames_total: u64,

    /// Frames per second measured over the last report interval.
    pub frame_rate: f32,

    /// Set when a report interval has elapsed; reset by the driver
    /// after it has acted on the report.
    pub report_set: bool,

    report_interval: Duration,
    interval_start: Instant,
    frames_at_interval_start: u64,
    started: Instant,
}

impl ProgressMonitor {

    pub fn new(frames_total: u64, report_interval: Duration) -> Self {
        let now = Instant::now();

        Self {
            frames_counted: 0,
            frames_total,
            frame_rate: 0.0,
            report_set: false,
            report_interval,
            interval_start: now,
            frames_at_interval_start: 0,
            started: now,
        }
    }

    /// Account for `count` newly reduced frames.
    pub fn advance(&mut self, count: u64) {
        self.frames_counted += count;

        let elapsed = self.interval_start.elapsed();
        if elapsed >= self.report_interval {
            let frames = self.frames_counted - self.frames_at_interval_start;
            self.frame_rate = frames as f32 / elapsed.as_secs_f32();
            self.report_set = true;

            log::debug!(
                "progress {:.1}% ({:.0} frames/s)",
                self.percent(), self.frame_rate
            );
        }
    }

    /// Clear the report flag and start the next measuring interval.
    pub fn reset_report(&mut self) {
        self.report_set = false;
        self.interval_start = Instant::now();
        self.frames_at_interval_start = self.frames_counted;
    }

    pub fn percent(&self) -> f64 {
        if self.frames_total == 0 { return 100.0 }
        100.0 * self.frames_counted as f64 / self.frames_total as f64
    }

    /// Seconds since the monitor was created.
    pub fn elapsed_seconds(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }
}
