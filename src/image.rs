//! Whole-image storage for merged deep data and flattened rasters.

use crate::error::{Error, Result, UnitResult};
use crate::math::Vec2;
use crate::sample::DeepSample;

/// A merged deep image: a rectangular grid of pixels where each pixel holds a
/// variable number of depth-ordered samples.
///
/// # Memory Layout
///
/// All samples live in one flat array, with the per-pixel runs concatenated in
/// row-major pixel order. A separate array stores how many samples each pixel
/// has, and cached cumulative offsets give O(1) access to any pixel's run:
///
/// ```text
/// Pixel (0,0): 3 samples  -> indices 0..3
/// Pixel (1,0): 0 samples  -> (empty)
/// Pixel (2,0): 5 samples  -> indices 3..8
/// ...
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DeepImage {

    /// Image dimensions (width, height) for indexing.
    resolution: Vec2<usize>,

    /// Number of samples for each pixel (row-major: width × height).
    sample_counts: Vec<u32>,

    /// All samples of the image, pixel runs concatenated in row-major order.
    samples: Vec<DeepSample>,

    /// Cached cumulative offsets for O(1) pixel access.
    /// Length is `sample_counts.len() + 1`, the last element being the total.
    cumulative_offsets: Vec<usize>,
}

impl DeepImage {

    /// Creates a deep image from per-pixel sample counts and the flat sample
    /// array. The counts must have one entry per pixel, and their sum must
    /// equal the sample array length.
    pub fn new(
        resolution: Vec2<usize>,
        sample_counts: Vec<u32>,
        samples: Vec<DeepSample>,
    ) -> Result<Self> {
        let pixel_count = resolution.area();

        if sample_counts.len() != pixel_count {
            return Err(Error::internal(format!(
                "sample count array length {} does not match resolution {} = {} pixels",
                sample_counts.len(), resolution, pixel_count
            )));
        }

        let mut cumulative_offsets = Vec::new();
        cumulative_offsets.try_reserve_exact(pixel_count + 1)?;
        cumulative_offsets.push(0);

        let mut offset = 0_usize;
        for &count in &sample_counts {
            offset += count as usize;
            cumulative_offsets.push(offset);
        }

        if samples.len() != offset {
            return Err(Error::internal(format!(
                "sample array length {} does not match the sum of sample counts {}",
                samples.len(), offset
            )));
        }

        Ok(Self { resolution, sample_counts, samples, cumulative_offsets })
    }

    /// Creates an image of the given resolution where every pixel is empty.
    pub fn empty(resolution: Vec2<usize>) -> Self {
        let pixel_count = resolution.area();

        Self {
            resolution,
            sample_counts: vec![0; pixel_count],
            samples: Vec::new(),
            cumulative_offsets: vec![0; pixel_count + 1],
        }
    }

    /// Returns the image resolution (width, height).
    #[inline]
    pub fn resolution(&self) -> Vec2<usize> {
        self.resolution
    }

    /// Returns the width of the image.
    #[inline]
    pub fn width(&self) -> usize {
        self.resolution.x()
    }

    /// Returns the height of the image.
    #[inline]
    pub fn height(&self) -> usize {
        self.resolution.y()
    }

    /// The depth-ordered samples of the pixel at (x, y).
    ///
    /// # Panics
    ///
    /// Panics if the pixel coordinates are out of bounds.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[DeepSample] {
        let index = self.pixel_index(x, y);
        &self.samples[self.cumulative_offsets[index] .. self.cumulative_offsets[index + 1]]
    }

    /// Returns the number of samples of the pixel at (x, y).
    #[inline]
    pub fn sample_count(&self, x: usize, y: usize) -> u32 {
        let index = self.pixel_index(x, y);
        self.sample_counts[index]
    }

    /// Returns a reference to the per-pixel sample counts, row-major.
    #[inline]
    pub fn sample_counts(&self) -> &[u32] {
        &self.sample_counts
    }

    /// Returns all samples of the image as one flat slice,
    /// pixel runs concatenated in row-major order.
    #[inline]
    pub fn samples(&self) -> &[DeepSample] {
        &self.samples
    }

    /// Returns the total number of samples across all pixels.
    #[inline]
    pub fn total_sample_count(&self) -> usize {
        self.samples.len()
    }

    /// The mean number of samples per pixel, zero for an empty image.
    pub fn average_samples_per_pixel(&self) -> f32 {
        let pixels = self.sample_counts.len();
        if pixels == 0 { 0.0 }
        else { self.total_sample_count() as f32 / pixels as f32 }
    }

    /// The number of pixels holding at least one sample.
    pub fn non_empty_pixel_count(&self) -> usize {
        self.sample_counts.iter().filter(|&&count| count > 0).count()
    }

    /// The minimum `z_front` and maximum `z_back` over all samples,
    /// or `None` if the image has no samples at all.
    pub fn depth_range(&self) -> Option<(f32, f32)> {
        if self.samples.is_empty() { return None; }

        let mut min_depth = f32::INFINITY;
        let mut max_depth = f32::NEG_INFINITY;

        for sample in &self.samples {
            min_depth = min_depth.min(sample.z_front);
            max_depth = max_depth.max(sample.z_back);
        }

        Some((min_depth, max_depth))
    }

    /// Whether every pixel's samples are ordered by `z_front`,
    /// ties broken by `z_back`.
    pub fn is_sorted_by_depth(&self) -> bool {
        self.sample_counts.iter().scan(0_usize, |offset, &count| {
            let start = *offset;
            *offset += count as usize;
            Some(&self.samples[start .. *offset])
        }).all(|pixel| {
            pixel.windows(2).all(|pair|
                pair[0].depth_order(&pair[1]) != std::cmp::Ordering::Greater
            )
        })
    }

    /// Estimate of the heap memory held by this image, in bytes.
    pub fn estimated_memory_bytes(&self) -> usize {
        self.samples.capacity() * std::mem::size_of::<DeepSample>()
            + self.sample_counts.capacity() * std::mem::size_of::<u32>()
            + self.cumulative_offsets.capacity() * std::mem::size_of::<usize>()
    }

    /// Validates internal consistency of counts, offsets and sample storage.
    pub fn validate(&self) -> UnitResult {
        if self.sample_counts.len() != self.resolution.area() {
            return Err(Error::internal("sample count array does not match resolution"));
        }

        if self.cumulative_offsets.len() != self.sample_counts.len() + 1 {
            return Err(Error::internal("cumulative offset array has the wrong length"));
        }

        let mut expected_offset = 0_usize;
        for (index, &count) in self.sample_counts.iter().enumerate() {
            if self.cumulative_offsets[index] != expected_offset {
                return Err(Error::internal(format!(
                    "cumulative offset {} is {} but expected {}",
                    index, self.cumulative_offsets[index], expected_offset
                )));
            }

            expected_offset += count as usize;
        }

        if self.samples.len() != expected_offset {
            return Err(Error::internal("sample storage does not match the sample counts"));
        }

        Ok(())
    }

    #[inline]
    fn pixel_index(&self, x: usize, y: usize) -> usize {
        assert!(x < self.resolution.x(), "x coordinate {} out of bounds (width: {})", x, self.resolution.x());
        assert!(y < self.resolution.y(), "y coordinate {} out of bounds (height: {})", y, self.resolution.y());
        y * self.resolution.x() + x
    }
}


/// A flattened image: premultiplied linear RGBA, one `f32` per channel,
/// row-major and channel-interleaved (`width * height * 4` values).
#[derive(Debug, Clone, PartialEq)]
pub struct FlatImage {

    /// Image dimensions (width, height).
    pub resolution: Vec2<usize>,

    /// The interleaved RGBA values.
    pub data: Vec<f32>,
}

impl FlatImage {

    /// The RGBA value of the pixel at (x, y).
    ///
    /// # Panics
    ///
    /// Panics if the pixel coordinates are out of bounds.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [f32; 4] {
        assert!(x < self.resolution.x() && y < self.resolution.y(), "pixel coordinates out of bounds");

        let offset = (y * self.resolution.x() + x) * 4;
        [self.data[offset], self.data[offset + 1], self.data[offset + 2], self.data[offset + 3]]
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(z_front: f32, z_back: f32) -> DeepSample {
        DeepSample::new(z_front, z_back, [0.1, 0.1, 0.1], 0.5)
    }

    #[test]
    fn empty_image_has_no_samples() {
        let image = DeepImage::empty(Vec2(4, 3));
        assert_eq!(image.total_sample_count(), 0);
        assert_eq!(image.non_empty_pixel_count(), 0);
        assert_eq!(image.depth_range(), None);
        assert_eq!(image.average_samples_per_pixel(), 0.0);
        assert!(image.pixel(3, 2).is_empty());
        image.validate().unwrap();
    }

    #[test]
    fn pixel_runs_follow_the_counts() {
        let image = DeepImage::new(
            Vec2(2, 2),
            vec![1, 0, 2, 1],
            vec![sample_at(1.0, 1.0), sample_at(2.0, 2.0), sample_at(3.0, 3.0), sample_at(4.0, 4.0)],
        ).unwrap();

        assert_eq!(image.pixel(0, 0).len(), 1);
        assert_eq!(image.pixel(1, 0).len(), 0);
        assert_eq!(image.pixel(0, 1).len(), 2);
        assert_eq!(image.pixel(1, 1).len(), 1);
        assert_eq!(image.pixel(1, 1)[0].z_front, 4.0);

        assert_eq!(image.total_sample_count(), 4);
        assert_eq!(image.non_empty_pixel_count(), 3);
        assert_eq!(image.average_samples_per_pixel(), 1.0);
        image.validate().unwrap();
    }

    #[test]
    fn mismatched_storage_is_rejected() {
        assert!(DeepImage::new(Vec2(2, 2), vec![1, 0, 2], Vec::new()).is_err());
        assert!(DeepImage::new(Vec2(2, 2), vec![1, 0, 2, 1], vec![sample_at(1.0, 1.0)]).is_err());
    }

    #[test]
    fn depth_range_spans_all_samples() {
        let image = DeepImage::new(
            Vec2(2, 1),
            vec![1, 1],
            vec![sample_at(1.0, 6.0), sample_at(0.5, 2.0)],
        ).unwrap();

        assert_eq!(image.depth_range(), Some((0.5, 6.0)));
    }

    #[test]
    fn sort_validation_notices_disorder() {
        let sorted = DeepImage::new(
            Vec2(1, 1), vec![2],
            vec![sample_at(1.0, 1.0), sample_at(2.0, 2.0)],
        ).unwrap();
        assert!(sorted.is_sorted_by_depth());

        let unsorted = DeepImage::new(
            Vec2(1, 1), vec![2],
            vec![sample_at(2.0, 2.0), sample_at(1.0, 1.0)],
        ).unwrap();
        assert!(!unsorted.is_sorted_by_depth());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn pixel_access_out_of_bounds_panics() {
        let image = DeepImage::empty(Vec2(2, 2));
        let _ = image.pixel(2, 0);
    }
}
