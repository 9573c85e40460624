//! The streaming merge pipeline: load, merge, flatten, write.
//!
//! Rows move through three stages. One loader thread reads each scanline from
//! every source into a sliding window of row buffers; a pool of merger threads
//! claims loaded rows and combines them into merged rows; one writer thread
//! consumes the merged rows in order and assembles the final image. The window
//! holds a fixed number of scanline slots, so peak memory is proportional to
//! the window size, not the image height.
//!
//! Each row carries an atomic status that only ever advances:
//!
//! ```text
//! EMPTY -> LOADED -> MERGED -> FLATTENED
//! ```
//!
//! A stage publishes a slot's data by storing the next status with release
//! ordering, and the consuming stage observes it with an acquire load. Slot
//! `y % window_slots` is reused once row `y - window_slots` has been written,
//! which is what bounds the memory. Waiting is a cooperative yield loop that
//! also watches a shared abort flag: the first thread to fail publishes its
//! error and every stage winds down promptly.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use smallvec::SmallVec;

use crate::error::{Error, Result, UnitResult};
use crate::flatten::flatten_row;
use crate::image::{DeepImage, FlatImage};
use crate::math::Vec2;
use crate::merge::{merge_pixel_into_row, MergeScratch};
use crate::row::DeepRow;
use crate::sample::DeepSample;
use crate::source::DeepSource;

// the row states, in the order they are passed through
const EMPTY: u8 = 0;
const LOADED: u8 = 1;
const MERGED: u8 = 2;
const FLATTENED: u8 = 3;

/// How many input sources to expect without allocating per-pixel lists.
type InputsPerPixel<T> = SmallVec<[T; 8]>;


/// Options for merging deep images. The set is closed; construct with
/// `MergeOptions::default()` and adjust the fields you care about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeOptions {

    /// Samples whose intervals coincide within this tolerance are blended
    /// into one sample.
    pub merge_epsilon: f32,

    /// When disabled, coincident samples are kept as duplicates
    /// (`merge_epsilon` is treated as zero).
    pub enable_merging: bool,

    /// The number of scanline slots in the sliding window. Bounds peak
    /// memory. Should be at least the number of merger threads plus one;
    /// the thread count is clamped to guarantee this.
    pub window_slots: usize,

    /// Total worker thread budget. Zero selects the hardware concurrency.
    /// One thread loads, one writes, and the rest merge, so the number of
    /// merger threads is this minus two, floored at one.
    pub threads: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            merge_epsilon: 1e-3,
            enable_merging: true,
            window_slots: 48,
            threads: 0,
        }
    }
}

impl MergeOptions {
    fn effective_epsilon(&self) -> f32 {
        if self.enable_merging { self.merge_epsilon } else { 0.0 }
    }

    fn merger_thread_count(&self) -> usize {
        let total = if self.threads > 0 { self.threads }
            else {
                std::thread::available_parallelism()
                    .map(std::num::NonZeroUsize::get)
                    .unwrap_or(4)
            };

        // one thread loads and one writes; the window must stay
        // one slot ahead of the mergers
        total.saturating_sub(2)
            .min(self.window_slots.saturating_sub(1))
            .max(1)
    }
}


/// Statistics of one merge run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MergeStats {

    /// How many deep images were merged.
    pub input_image_count: usize,

    /// The number of samples read from all sources combined.
    pub total_input_samples: u64,

    /// The number of samples in the merged image.
    pub total_output_samples: u64,

    /// How many input samples were discarded for non-finite
    /// or inverted depths.
    pub dropped_samples: u64,

    /// The smallest `z_front` over all input samples. Zero if no samples.
    pub min_depth: f32,

    /// The largest `z_back` over all input samples. Zero if no samples.
    pub max_depth: f32,

    /// Wall-clock duration of the load and merge pipeline, in milliseconds.
    pub merge_time_ms: f64,

    /// Accumulated time spent flattening merged rows, in milliseconds.
    /// Zero when only a deep result was requested.
    pub flatten_time_ms: f64,
}


/// A sink for human-readable messages from the pipeline. The pipeline works
/// the same with or without one; pass [`ConsoleLogger`] to see them.
pub trait Logger: Sync {

    /// Called with detailed progress messages.
    fn verbose(&self, _message: &str) {}

    /// Called once with a description of the failure when a run fails.
    fn error(&self, _message: &str) {}
}

/// The default logger: ignores all messages.
impl Logger for () {}

/// Logs verbose messages to standard output and errors to standard error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn verbose(&self, message: &str) { println!("{}", message); }
    fn error(&self, message: &str) { eprintln!("error: {}", message); }
}


/// Merges deep images. Couples a set of [`MergeOptions`] with an optional
/// logging sink and an optional progress callback; the compositor itself
/// holds no other state, and no global state exists anywhere in this crate.
pub struct Compositor<'r> {
    options: MergeOptions,
    logger: &'r dyn Logger,
    on_progress: Option<Box<dyn FnMut(usize) + 'r>>,
}

impl<'r> Compositor<'r> {

    /// A compositor with the given options, no logger, and no progress
    /// callback.
    pub fn new(options: MergeOptions) -> Self {
        Self { options, logger: &(), on_progress: None }
    }

    /// Send verbose and error messages to the given sink.
    pub fn with_logger(mut self, logger: &'r dyn Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Call back with the merge progress as an integer percentage.
    /// Invoked from the writer stage, at most once per percent.
    pub fn on_progress(mut self, callback: impl FnMut(usize) + 'r) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Merge all sources into a single deep image.
    ///
    /// All sources must agree on their resolution. The merged image contains,
    /// for every pixel, the depth-sorted, non-overlapping union of all input
    /// samples, with coincident samples blended (see
    /// [`merge_pixels`](crate::merge::merge_pixels) for the per-pixel rules).
    pub fn merge_deep(
        &mut self,
        sources: &mut [&mut dyn DeepSource],
    ) -> Result<(DeepImage, MergeStats)> {
        let start = Instant::now();

        let resolution = match self.validated_resolution(sources)? {
            Some(resolution) => resolution,
            None => return Ok((DeepImage::empty(Vec2(0, 0)), MergeStats::default())),
        };

        let mut sample_counts = Vec::new();
        sample_counts.try_reserve_exact(resolution.area())?;
        let mut samples: Vec<DeepSample> = Vec::new();

        let run = run_pipeline(sources, resolution, &self.options, |_y, row| {
            sample_counts.extend_from_slice(row.sample_counts());

            let row_samples = row.samples();
            if row_samples.len() > samples.capacity() - samples.len() {
                samples.try_reserve(row_samples.len())?;
            }

            samples.extend_from_slice(row_samples);
            Ok(())
        }, &mut self.on_progress);

        let run = self.check(run)?;
        let image = DeepImage::new(resolution, sample_counts, samples)?;

        let stats = self.finish_stats(sources.len(), run, start, 0.0);
        self.log_summary(&stats);
        Ok((image, stats))
    }

    /// Merge all sources and flatten the result into a premultiplied RGBA
    /// raster, streaming row by row: no merged deep image is kept in memory.
    pub fn merge_and_flatten(
        &mut self,
        sources: &mut [&mut dyn DeepSource],
    ) -> Result<(FlatImage, MergeStats)> {
        let start = Instant::now();

        let resolution = match self.validated_resolution(sources)? {
            Some(resolution) => resolution,
            None => {
                let empty = FlatImage { resolution: Vec2(0, 0), data: Vec::new() };
                return Ok((empty, MergeStats::default()));
            }
        };

        let mut data = Vec::new();
        data.try_reserve_exact(resolution.area() * 4)?;
        data.resize(resolution.area() * 4, 0.0_f32);

        let row_stride = resolution.x() * 4;
        let mut flatten_seconds = 0.0_f64;

        let run = run_pipeline(sources, resolution, &self.options, |y, row| {
            let flatten_start = Instant::now();
            flatten_row(row, &mut data[y * row_stride .. (y + 1) * row_stride]);
            flatten_seconds += flatten_start.elapsed().as_secs_f64();
            Ok(())
        }, &mut self.on_progress);

        let run = self.check(run)?;
        let flat = FlatImage { resolution, data };

        let stats = self.finish_stats(sources.len(), run, start, flatten_seconds * 1000.0);
        self.log_summary(&stats);
        Ok((flat, stats))
    }

    /// Check that all sources agree on one resolution.
    /// Returns `None` when there are no sources at all.
    fn validated_resolution(
        &self,
        sources: &[&mut dyn DeepSource],
    ) -> Result<Option<Vec2<usize>>> {
        let first = match sources.first() {
            Some(source) => source.resolution(),
            None => return Ok(None),
        };

        for source in sources.iter().skip(1) {
            if source.resolution() != first {
                let error = Error::MismatchedDimensions { expected: first, found: source.resolution() };
                self.logger.error(&error.to_string());
                return Err(error);
            }
        }

        self.logger.verbose(&format!(
            "merging {} deep images at {}x{}",
            sources.len(), first.x(), first.y()
        ));

        Ok(Some(first))
    }

    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.logger.error(&error.to_string());
        }

        result
    }

    fn finish_stats(
        &self, source_count: usize,
        run: PipelineTotals, start: Instant, flatten_time_ms: f64,
    ) -> MergeStats {
        let merge_time_ms = start.elapsed().as_secs_f64() * 1000.0 - flatten_time_ms;

        MergeStats {
            input_image_count: source_count,
            total_input_samples: run.input_samples,
            total_output_samples: run.output_samples,
            dropped_samples: run.dropped_samples,
            min_depth: if run.input_samples > 0 { run.min_depth } else { 0.0 },
            max_depth: if run.input_samples > 0 { run.max_depth } else { 0.0 },
            merge_time_ms,
            flatten_time_ms,
        }
    }

    fn log_summary(&self, stats: &MergeStats) {
        self.logger.verbose(&format!("  input samples: {}", format_number(stats.total_input_samples)));
        self.logger.verbose(&format!("  output samples: {}", format_number(stats.total_output_samples)));

        if stats.dropped_samples > 0 {
            self.logger.verbose(&format!("  dropped samples: {}", format_number(stats.dropped_samples)));
        }

        self.logger.verbose(&format!("  depth range: {} to {}", stats.min_depth, stats.max_depth));
        self.logger.verbose(&format!("  merge time: {:.0} ms", stats.merge_time_ms));
    }
}

impl std::fmt::Debug for Compositor<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Compositor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}


/// Merge all sources into a single deep image, with default reporting.
/// See [`Compositor::merge_deep`].
pub fn merge_deep(
    sources: &mut [&mut dyn DeepSource],
    options: &MergeOptions,
) -> Result<(DeepImage, MergeStats)> {
    Compositor::new(*options).merge_deep(sources)
}

/// Merge all sources and flatten the result into a premultiplied RGBA raster,
/// with default reporting. See [`Compositor::merge_and_flatten`].
pub fn merge_and_flatten(
    sources: &mut [&mut dyn DeepSource],
    options: &MergeOptions,
) -> Result<(FlatImage, MergeStats)> {
    Compositor::new(*options).merge_and_flatten(sources)
}


/// What the pipeline measured while it ran.
#[derive(Debug, Clone, Copy, Default)]
struct PipelineTotals {
    input_samples: u64,
    output_samples: u64,
    dropped_samples: u64,
    min_depth: f32,
    max_depth: f32,
}

/// What the loader thread measured. Folded into [`PipelineTotals`].
#[derive(Debug, Clone, Copy)]
struct LoaderTotals {
    samples: u64,
    min_depth: f32,
    max_depth: f32,
}

/// Coordination state shared by all pipeline threads.
struct SharedState {

    /// One status per scanline of the image, not per window slot.
    status: Vec<AtomicU8>,

    /// The next row a merger should claim, advanced with `fetch_add`
    /// so every row is merged exactly once.
    next_merge_row: AtomicUsize,

    /// Raised by the first failing thread; every wait loop observes it.
    abort: AtomicBool,

    /// The first error wins; later ones are discarded.
    first_error: Mutex<Option<Error>>,

    dropped_samples: AtomicU64,
}

impl SharedState {
    fn publish_error(&self, error: Error) {
        let mut slot = lock(&self.first_error);
        if slot.is_none() { *slot = Some(error); }

        self.abort.store(true, Ordering::Relaxed);
    }
}


/// Runs the three-stage pipeline over all scanlines, handing each merged row
/// to `consume_row` in strictly increasing y order on the calling thread.
/// The consumed row is cleared afterwards and its slot reused.
fn run_pipeline(
    sources: &mut [&mut dyn DeepSource],
    resolution: Vec2<usize>,
    options: &MergeOptions,
    mut consume_row: impl FnMut(usize, &DeepRow) -> UnitResult,
    on_progress: &mut Option<Box<dyn FnMut(usize) + '_>>,
) -> Result<PipelineTotals> {
    let Vec2(width, height) = resolution;
    let source_count = sources.len();
    let window_slots = options.window_slots.max(1);
    let merger_threads = options.merger_thread_count();
    let epsilon = options.effective_epsilon();

    let shared = SharedState {
        status: (0 .. height).map(|_| AtomicU8::new(EMPTY)).collect(),
        next_merge_row: AtomicUsize::new(0),
        abort: AtomicBool::new(false),
        first_error: Mutex::new(None),
        dropped_samples: AtomicU64::new(0),
    };

    // one row buffer per window slot, for each source and for the merged output
    let input_slots: Vec<Vec<Mutex<DeepRow>>> = (0 .. source_count)
        .map(|_| (0 .. window_slots).map(|_| Mutex::new(DeepRow::new())).collect())
        .collect();

    let merged_slots: Vec<Mutex<DeepRow>> = (0 .. window_slots)
        .map(|_| Mutex::new(DeepRow::new()))
        .collect();

    let mut loader_totals = None;
    let mut output_samples = 0_u64;

    std::thread::scope(|scope| {
        let shared = &shared;
        let input_slots = &input_slots;
        let merged_slots = &merged_slots;

        let loader = scope.spawn(move || run_loader(
            sources, width, height, window_slots, shared, input_slots,
        ));

        for _ in 0 .. merger_threads {
            scope.spawn(move || run_merger(
                width, height, window_slots, epsilon,
                shared, input_slots, merged_slots,
            ));
        }

        // this thread is the writer: consume merged rows in y order
        let mut percent_reported = usize::MAX;
        for y in 0 .. height {
            if !wait_for_status(&shared.status[y], MERGED, &shared.abort) { break; }

            let mut row = lock(&merged_slots[y % window_slots]);
            output_samples += row.total_samples() as u64;

            if let Err(error) = consume_row(y, &row) {
                shared.publish_error(error);
                break;
            }

            row.clear();
            drop(row); // release the slot before publishing it as free
            shared.status[y].store(FLATTENED, Ordering::Release);

            if let Some(callback) = on_progress.as_mut() {
                let percent = (y + 1) * 100 / height;
                if percent != percent_reported {
                    callback(percent);
                    percent_reported = percent;
                }
            }
        }

        loader_totals = Some(loader.join().expect("loader thread panicked"));
    });

    if let Some(error) = lock(&shared.first_error).take() {
        return Err(error);
    }

    let loader_totals = loader_totals
        .ok_or_else(|| Error::internal("loader thread produced no result"))?;

    Ok(PipelineTotals {
        input_samples: loader_totals.samples,
        output_samples,
        dropped_samples: shared.dropped_samples.load(Ordering::Relaxed),
        min_depth: loader_totals.min_depth,
        max_depth: loader_totals.max_depth,
    })
}


/// The loader stage: reads every scanline of every source into its window
/// slot, strictly sequential in y, and publishes each row as `LOADED`.
/// Before reusing a slot, waits until the row that previously occupied it
/// has been written out.
fn run_loader(
    sources: &mut [&mut dyn DeepSource],
    width: usize, height: usize, window_slots: usize,
    shared: &SharedState,
    input_slots: &[Vec<Mutex<DeepRow>>],
) -> LoaderTotals {
    let mut totals = LoaderTotals {
        samples: 0,
        min_depth: f32::INFINITY,
        max_depth: f32::NEG_INFINITY,
    };

    let mut counts = vec![0_u32; width];

    for y in 0 .. height {
        if shared.abort.load(Ordering::Relaxed) { break; }

        // the slot is free once the row that last used it has been consumed
        if y >= window_slots
            && !wait_for_status(&shared.status[y - window_slots], FLATTENED, &shared.abort)
        { break; }

        let slot = y % window_slots;

        let mut row_result = Ok(());
        for (source_index, source) in sources.iter_mut().enumerate() {
            let mut row = lock(&input_slots[source_index][slot]);

            row_result = source.sample_counts(y, &mut counts)
                .and_then(|_| row.allocate(width, &counts))
                .and_then(|_| source.read_row(y, &counts, row.samples_mut()));

            if row_result.is_err() { break; }

            totals.samples += row.total_samples() as u64;
            for sample in row.samples() {
                totals.min_depth = totals.min_depth.min(sample.z_front);
                totals.max_depth = totals.max_depth.max(sample.z_back);
            }
        }

        if let Err(error) = row_result {
            shared.publish_error(error);
            break;
        }

        shared.status[y].store(LOADED, Ordering::Release);
    }

    totals
}


/// One merger worker: claims rows atomically, merges the input slots of each
/// claimed row into the merged slot, and publishes the row as `MERGED`.
/// Exits once all rows are claimed or the pipeline aborts.
fn run_merger(
    width: usize, height: usize, window_slots: usize, epsilon: f32,
    shared: &SharedState,
    input_slots: &[Vec<Mutex<DeepRow>>],
    merged_slots: &[Mutex<DeepRow>],
) {
    let mut scratch = MergeScratch::new();

    loop {
        let y = shared.next_merge_row.fetch_add(1, Ordering::Relaxed);
        if y >= height { break; }

        if !wait_for_status(&shared.status[y], LOADED, &shared.abort) { break; }
        let slot = y % window_slots;

        // the status protocol guarantees these locks are uncontended:
        // the loader is done with this slot and no other merger claimed this row
        let input_rows: InputsPerPixel<MutexGuard<'_, DeepRow>> = input_slots.iter()
            .map(|rows| lock(&rows[slot]))
            .collect();

        let mut output_row = lock(&merged_slots[slot]);

        let estimated_samples: usize = input_rows.iter()
            .map(|row| row.total_samples())
            .sum();

        let merged = merge_row(
            &input_rows, width, epsilon, estimated_samples,
            &mut scratch, &mut output_row, shared,
        );

        // release the slot locks before publishing the new status
        drop(input_rows);
        drop(output_row);

        match merged {
            Err(error) => {
                shared.publish_error(error);
                break;
            }

            Ok(()) => shared.status[y].store(MERGED, Ordering::Release),
        }
    }
}

fn merge_row(
    input_rows: &[MutexGuard<'_, DeepRow>],
    width: usize, epsilon: f32, estimated_samples: usize,
    scratch: &mut MergeScratch,
    output_row: &mut DeepRow,
    shared: &SharedState,
) -> UnitResult {
    output_row.allocate_capacity(width, estimated_samples)?;

    let mut dropped = 0_u64;
    let mut pixel_inputs: InputsPerPixel<&[DeepSample]> = SmallVec::with_capacity(input_rows.len());

    for x in 0 .. width {
        pixel_inputs.clear();
        pixel_inputs.extend(input_rows.iter().map(|row| row.pixel_data(x)));

        dropped += merge_pixel_into_row(&pixel_inputs, epsilon, scratch, x, output_row)? as u64;
    }

    if dropped > 0 {
        shared.dropped_samples.fetch_add(dropped, Ordering::Relaxed);
    }

    Ok(())
}


/// Waits until the row status reaches at least the given state.
/// Returns false if the pipeline aborted instead.
fn wait_for_status(status: &AtomicU8, at_least: u8, abort: &AtomicBool) -> bool {
    loop {
        if status.load(Ordering::Acquire) >= at_least { return true; }
        if abort.load(Ordering::Relaxed) { return false; }
        std::thread::yield_now();
    }
}

/// The pipeline never holds a lock while panicking, so poisoning only occurs
/// after a bug already aborted another thread.
fn lock<'m, T>(mutex: &'m Mutex<T>) -> MutexGuard<'m, T> {
    mutex.lock().expect("pipeline mutex poisoned")
}

/// Formats 1234567 as "1,234,567" for log messages.
fn format_number(number: u64) -> String {
    let digits = number.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);

    for (index, digit) in digits.chars().enumerate() {
        if index != 0 && (digits.len() - index) % 3 == 0 { result.push(','); }
        result.push(digit);
    }

    result
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{GeneratorSource, ImageSource};

    fn constant_source(resolution: Vec2<usize>, depth: f32, alpha: f32) -> GeneratorSource<impl FnMut(usize, usize) -> Vec<DeepSample> + Send> {
        GeneratorSource::new(resolution, move |_x, _y| {
            vec![DeepSample::point(depth, [alpha * 0.5, 0.0, 0.0], alpha)]
        })
    }

    #[test]
    fn default_options_follow_the_documented_values() {
        let options = MergeOptions::default();
        assert_eq!(options.merge_epsilon, 1e-3);
        assert!(options.enable_merging);
        assert_eq!(options.window_slots, 48);
        assert_eq!(options.threads, 0);
    }

    #[test]
    fn merger_thread_count_is_bounded() {
        let mut options = MergeOptions { threads: 8, .. MergeOptions::default() };
        assert_eq!(options.merger_thread_count(), 6);

        options.threads = 1;
        assert_eq!(options.merger_thread_count(), 1);

        options.threads = 200;
        assert_eq!(options.merger_thread_count(), 47, "window must stay ahead of the mergers");
    }

    #[test]
    fn no_sources_give_an_empty_result() {
        let (image, stats) = merge_deep(&mut [], &MergeOptions::default()).unwrap();
        assert_eq!(image.resolution(), Vec2(0, 0));
        assert_eq!(stats, MergeStats::default());
    }

    #[test]
    fn mismatched_resolutions_are_rejected_before_running() {
        let mut small = constant_source(Vec2(2, 2), 1.0, 0.5);
        let mut large = constant_source(Vec2(3, 2), 1.0, 0.5);

        let result = merge_deep(
            &mut [&mut small, &mut large],
            &MergeOptions::default(),
        );

        assert!(matches!(result, Err(Error::MismatchedDimensions { .. })));
    }

    #[test]
    fn image_taller_than_the_window_is_processed() {
        let resolution = Vec2(4, 200);
        let mut near = constant_source(resolution, 1.0, 0.5);
        let mut far = constant_source(resolution, 2.0, 0.5);

        let options = MergeOptions { window_slots: 3, threads: 3, .. MergeOptions::default() };
        let (image, stats) = merge_deep(&mut [&mut near, &mut far], &options).unwrap();

        assert_eq!(image.resolution(), resolution);
        assert_eq!(stats.total_input_samples, 2 * 4 * 200);
        assert_eq!(stats.total_output_samples, 2 * 4 * 200);
        assert_eq!(image.pixel(3, 199).len(), 2);
        assert!(image.is_sorted_by_depth());
    }

    #[test]
    fn source_errors_stop_the_pipeline() {
        /// Behaves like a normal source until the given row, then
        /// fails like a truncated file would.
        struct FailAfter<S> { inner: S, fail_at: usize }

        impl<S: DeepSource> DeepSource for FailAfter<S> {
            fn resolution(&self) -> Vec2<usize> { self.inner.resolution() }

            fn sample_counts(&mut self, y: usize, counts: &mut [u32]) -> UnitResult {
                if y >= self.fail_at { return Err(Error::source_io("simulated truncated file")); }
                self.inner.sample_counts(y, counts)
            }

            fn read_row(&mut self, y: usize, counts: &[u32], samples: &mut [DeepSample]) -> UnitResult {
                self.inner.read_row(y, counts, samples)
            }
        }

        let resolution = Vec2(2, 64);
        let mut good = constant_source(resolution, 1.0, 0.5);
        let mut failing = FailAfter { inner: constant_source(resolution, 2.0, 0.5), fail_at: 5 };

        let result = merge_deep(
            &mut [&mut good, &mut failing],
            &MergeOptions::default(),
        );

        assert!(matches!(result, Err(Error::SourceIo(_))));
    }

    #[test]
    fn progress_is_reported_in_increasing_percentages() {
        let resolution = Vec2(2, 50);
        let mut source = constant_source(resolution, 1.0, 0.5);

        let mut reported = Vec::new();
        let mut compositor = Compositor::new(MergeOptions::default())
            .on_progress(|percent| reported.push(percent));

        compositor.merge_deep(&mut [&mut source]).unwrap();
        drop(compositor);

        assert_eq!(*reported.last().unwrap(), 100);
        assert!(reported.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn merged_rows_match_the_pure_pixel_merger() {
        let resolution = Vec2(3, 5);

        let mut varied = GeneratorSource::new(resolution, |x, y| vec![
            DeepSample::point((x + y) as f32 + 1.0, [0.2, 0.0, 0.0], 0.4),
            DeepSample::new((x + y) as f32 + 2.0, (x + y) as f32 + 3.0, [0.0, 0.2, 0.0], 0.5),
        ]);

        let mut constant = constant_source(resolution, 2.5, 0.25);

        let (image, _) = merge_deep(
            &mut [&mut varied, &mut constant],
            &MergeOptions::default(),
        ).unwrap();

        // spot-check one pixel against the pure merger
        let x = 1; let y = 3;
        let first: Vec<DeepSample> = vec![
            DeepSample::point((x + y) as f32 + 1.0, [0.2, 0.0, 0.0], 0.4),
            DeepSample::new((x + y) as f32 + 2.0, (x + y) as f32 + 3.0, [0.0, 0.2, 0.0], 0.5),
        ];
        let second = vec![DeepSample::point(2.5, [0.125, 0.0, 0.0], 0.25)];

        let expected = crate::merge::merge_pixels(&[first.as_slice(), second.as_slice()], 1e-3);
        assert_eq!(image.pixel(x, y), &expected[..]);
    }

    #[test]
    fn dropped_samples_are_counted_in_stats() {
        let resolution = Vec2(2, 2);
        let mut source = GeneratorSource::new(resolution, |x, _y| vec![
            DeepSample::point(1.0, [0.1; 3], 0.5),
            DeepSample::new(if x == 0 { f32::NAN } else { 3.0 }, 1.0, [0.1; 3], 0.5),
        ]);

        let (image, stats) = merge_deep(&mut [&mut source], &MergeOptions::default()).unwrap();
        assert_eq!(stats.dropped_samples, 4);
        assert_eq!(stats.total_input_samples, 8);
        assert_eq!(image.total_sample_count(), 4);
    }

    #[test]
    fn flatten_stream_equals_flattening_the_merged_image() {
        let resolution = Vec2(4, 6);

        let make_sources = || (
            GeneratorSource::new(resolution, |x, y| vec![
                DeepSample::point((x + 1) as f32, [0.3, 0.0, 0.0], 0.6),
                DeepSample::new(1.5, 4.0, [0.0, 0.1, 0.0], (y as f32 / 10.0).min(1.0)),
            ]),
            constant_source(resolution, 2.0, 0.8),
        );

        let (mut first_a, mut first_b) = make_sources();
        let (flat, stats) = merge_and_flatten(
            &mut [&mut first_a, &mut first_b],
            &MergeOptions::default(),
        ).unwrap();

        let (mut second_a, mut second_b) = make_sources();
        let (deep, _) = merge_deep(
            &mut [&mut second_a, &mut second_b],
            &MergeOptions::default(),
        ).unwrap();

        let reference = crate::flatten::flatten_image(&deep);
        assert_eq!(flat.resolution, reference.resolution);

        for (streamed, whole) in flat.data.iter().zip(&reference.data) {
            assert!((streamed - whole).abs() < 1e-6);
        }

        assert!(stats.flatten_time_ms >= 0.0);
    }

    #[test]
    fn stats_report_the_input_depth_range() {
        let resolution = Vec2(2, 2);
        let mut near = constant_source(resolution, 0.5, 0.5);
        let mut far = GeneratorSource::new(resolution, |_x, _y| {
            vec![DeepSample::new(3.0, 7.5, [0.1; 3], 0.5)]
        });

        let (_, stats) = merge_deep(&mut [&mut near, &mut far], &MergeOptions::default()).unwrap();
        assert_eq!(stats.min_depth, 0.5);
        assert_eq!(stats.max_depth, 7.5);
        assert_eq!(stats.input_image_count, 2);
    }

    #[test]
    fn single_source_survives_the_pipeline_unchanged() {
        let resolution = Vec2(3, 3);

        let pixels = |x: usize, y: usize| vec![
            DeepSample::point((x * 3 + y) as f32 + 1.0, [0.1, 0.2, 0.3], 0.5),
        ];

        let mut source = GeneratorSource::new(resolution, move |x, y| pixels(x, y));
        let (image, _) = merge_deep(&mut [&mut source], &MergeOptions::default()).unwrap();

        for y in 0 .. 3 {
            for x in 0 .. 3 {
                assert_eq!(image.pixel(x, y), &pixels(x, y)[..]);
            }
        }
    }

    #[test]
    fn formatting_groups_digits_by_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn disabled_merging_keeps_coincident_duplicates() {
        let resolution = Vec2(1, 1);
        let mut first = constant_source(resolution, 5.0, 0.5);
        let mut second = constant_source(resolution, 5.0, 0.5);

        let options = MergeOptions { enable_merging: false, .. MergeOptions::default() };
        let (image, _) = merge_deep(&mut [&mut first, &mut second], &options).unwrap();
        assert_eq!(image.pixel(0, 0).len(), 2);

        let options = MergeOptions::default();
        let mut first = constant_source(resolution, 5.0, 0.5);
        let mut second = constant_source(resolution, 5.0, 0.5);
        let (image, _) = merge_deep(&mut [&mut first, &mut second], &options).unwrap();
        assert_eq!(image.pixel(0, 0).len(), 1);
    }

    #[test]
    fn image_source_feeds_the_pipeline() {
        let deep = DeepImage::new(
            Vec2(2, 1),
            vec![1, 1],
            vec![
                DeepSample::point(1.0, [0.5, 0.0, 0.0], 0.5),
                DeepSample::point(2.0, [0.0, 0.5, 0.0], 0.5),
            ],
        ).unwrap();

        let mut offset = ImageSource::new(deep.clone()).with_z_offset(1.0);
        let mut plain = ImageSource::new(deep);

        let (merged, _) = merge_deep(
            &mut [&mut plain, &mut offset],
            &MergeOptions::default(),
        ).unwrap();

        // pixel 0 holds the plain sample at z=1 and the offset one at z=2
        assert_eq!(merged.pixel(0, 0).len(), 2);
        assert_eq!(merged.pixel(0, 0)[1].z_front, 2.0);
    }
}
