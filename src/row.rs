//! Contiguous storage for one scanline of deep samples.

use crate::error::UnitResult;
use crate::sample::DeepSample;

/// One scanline of deep data: a per-pixel sample count plus a single
/// contiguous block holding every sample of the row, concatenated in x order.
///
/// Keeping the whole row in one allocation avoids fragmentation and keeps the
/// merger cache-friendly. Prefix offsets are cached alongside the counts, so
/// looking up a pixel's samples is O(1) at any row width.
///
/// A row is either filled all at once by a loader that knows the sample count
/// of every pixel up front ([`allocate`](Self::allocate)), or built
/// monotonically pixel by pixel by the merger
/// ([`allocate_capacity`](Self::allocate_capacity) followed by
/// [`push_pixel_samples`](Self::push_pixel_samples)). Pixels are never resized
/// in place; the row is reset as a whole.
#[derive(Debug, Clone, Default)]
pub struct DeepRow {
    sample_counts: Vec<u32>,

    /// Cached prefix sums of `sample_counts`, length `width + 1`.
    /// `offsets[x]` is the index of pixel x's first sample.
    offsets: Vec<usize>,

    /// All samples of the row, pixel runs concatenated in x order.
    samples: Vec<DeepSample>,
}

impl DeepRow {

    /// Create a row with zero width. Use `allocate` or `allocate_capacity`
    /// before storing samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve exactly the storage described by the per-pixel sample counts
    /// and set those counts. Any prior contents are discarded, but the backing
    /// allocation is reused where possible. The sample storage is zero-filled;
    /// the caller overwrites it through [`samples_mut`](Self::samples_mut).
    ///
    /// Fails with `Error::OutOfMemory` if the storage cannot be reserved,
    /// leaving the row empty.
    pub fn allocate(&mut self, width: usize, counts: &[u32]) -> UnitResult {
        debug_assert_eq!(counts.len(), width, "one sample count per pixel");

        self.reset_counts(width);
        self.sample_counts.extend_from_slice(counts);

        let mut total = 0_usize;
        for &count in counts {
            total += count as usize;
            self.offsets.push(total);
        }

        self.samples.clear();
        if total > self.samples.capacity() {
            self.samples.try_reserve_exact(total)?;
        }

        self.samples.resize(total, DeepSample::default());
        Ok(())
    }

    /// Reserve storage for up to `max_samples` samples and set every pixel's
    /// count to zero. Intended for the merger, which appends each pixel's run
    /// in x order as it is produced. The reservation is an estimate; pushing
    /// more samples grows the storage rather than truncating the row.
    pub fn allocate_capacity(&mut self, width: usize, max_samples: usize) -> UnitResult {
        self.reset_counts(width);
        self.sample_counts.resize(width, 0);

        self.samples.clear();
        if max_samples > self.samples.capacity() {
            self.samples.try_reserve(max_samples)?;
        }

        Ok(())
    }

    /// Append the merged samples of pixel `x` and set its count.
    /// Pixels must be pushed in strictly increasing x order,
    /// starting at zero, after `allocate_capacity`.
    pub fn push_pixel_samples(&mut self, x: usize, samples: &[DeepSample]) -> UnitResult {
        debug_assert_eq!(
            self.offsets.len(), x + 1,
            "merged pixels must be pushed in x order"
        );

        if samples.len() > self.samples.capacity() - self.samples.len() {
            self.samples.try_reserve(samples.len())?;
        }

        self.samples.extend_from_slice(samples);
        self.sample_counts[x] = samples.len() as u32;
        self.offsets.push(self.samples.len());
        Ok(())
    }

    /// The samples of pixel `x`, as a contiguous slice. Empty for pixels that
    /// have no samples, or that the merger has not pushed yet.
    ///
    /// Panics if `x` is not less than the allocated width.
    #[inline]
    pub fn pixel_data(&self, x: usize) -> &[DeepSample] {
        assert!(x < self.width(), "pixel index {} out of bounds (width: {})", x, self.width());

        match self.offsets.get(x + 1) {
            Some(&end) => &self.samples[self.offsets[x] .. end],
            None => &[], // not pushed yet
        }
    }

    /// The number of samples stored for pixel `x`.
    ///
    /// Panics if `x` is not less than the allocated width.
    #[inline]
    pub fn sample_count(&self, x: usize) -> u32 {
        self.sample_counts[x]
    }

    /// The width this row was allocated for.
    #[inline]
    pub fn width(&self) -> usize {
        self.sample_counts.len()
    }

    /// The number of samples currently stored across all pixels of the row.
    #[inline]
    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    /// The per-pixel sample counts, one per x.
    #[inline]
    pub fn sample_counts(&self) -> &[u32] {
        &self.sample_counts
    }

    /// All samples of the row as one contiguous slice, for bulk writes by a
    /// loader. The slice length matches the counts passed to `allocate`.
    #[inline]
    pub fn samples_mut(&mut self) -> &mut [DeepSample] {
        &mut self.samples
    }

    /// All samples of the row as one contiguous slice.
    #[inline]
    pub fn samples(&self) -> &[DeepSample] {
        &self.samples
    }

    /// Release the sample storage and reset all counts to a zero-width row.
    pub fn clear(&mut self) {
        self.sample_counts = Vec::new();
        self.offsets = Vec::new();
        self.samples = Vec::new();
    }

    fn reset_counts(&mut self, width: usize) {
        self.sample_counts.clear();
        self.sample_counts.reserve(width);

        self.offsets.clear();
        self.offsets.reserve(width + 1);
        self.offsets.push(0);
    }
}
