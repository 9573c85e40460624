//! Producers of deep scanlines for the merge pipeline.
//!
//! A [`DeepSource`] hands the pipeline one scanline at a time, in two phases:
//! first the per-pixel sample counts (so the row buffer can be allocated in
//! one block), then the samples themselves. A source may be backed by a deep
//! image file, an in-memory image, a synthetic generator, or anything else;
//! the pipeline only requires that all sources of one run agree on the
//! resolution, and that reading the same row twice produces identical samples.

use crate::error::{Error, Result, UnitResult};
use crate::image::DeepImage;
use crate::math::Vec2;
use crate::sample::DeepSample;

/// A producer of deep scanlines. Implemented by the built-in
/// [`ImageSource`] and [`GeneratorSource`]; implement it yourself to feed the
/// pipeline from a file format of your choice.
pub trait DeepSource: Send {

    /// The resolution of the deep image this source produces.
    fn resolution(&self) -> Vec2<usize>;

    /// Write the sample count of each pixel of row `y` into `counts`,
    /// whose length is the image width.
    fn sample_counts(&mut self, y: usize, counts: &mut [u32]) -> UnitResult;

    /// Fill `samples` with the samples of row `y`, concatenated in x order.
    /// The counts are the ones this source returned for the same row, and the
    /// slice length is exactly their sum.
    fn read_row(&mut self, y: usize, counts: &[u32], samples: &mut [DeepSample]) -> UnitResult;
}


/// A deep source backed by an in-memory [`DeepImage`].
///
/// Optionally shifts all samples by a constant depth offset at read time,
/// which restages a render pass closer or farther without re-rendering it.
#[derive(Debug, Clone)]
pub struct ImageSource {
    image: DeepImage,
    z_offset: f32,
}

impl ImageSource {

    /// Create a source that yields the rows of the given image.
    pub fn new(image: DeepImage) -> Self {
        Self { image, z_offset: 0.0 }
    }

    /// Shift every sample of this source by a constant depth when it is read.
    pub fn with_z_offset(mut self, z_offset: f32) -> Self {
        self.z_offset = z_offset;
        self
    }

    /// Build an in-memory source from six separate channel arrays, the way
    /// deep scanline files store them: per-pixel counts plus one flat array
    /// per channel, all of the same length.
    ///
    /// The color channels accept anything convertible to `f32`, so both `f32`
    /// and [`half::f16`] planes work. Depths are always `f32`. When no
    /// back-depth channel is present, every sample becomes a point
    /// (`z_back = z_front`).
    pub fn from_channels<C: Copy + Into<f32>>(
        resolution: Vec2<usize>,
        sample_counts: Vec<u32>,
        color: [&[C]; 4],
        z_front: &[f32],
        z_back: Option<&[f32]>,
    ) -> Result<Self> {
        let total: usize = sample_counts.iter().map(|&count| count as usize).sum();

        let channel_lengths_match = color.iter().all(|channel| channel.len() == total)
            && z_front.len() == total
            && z_back.map_or(true, |channel| channel.len() == total);

        if !channel_lengths_match {
            return Err(Error::internal(format!(
                "channel arrays must all hold {} samples", total
            )));
        }

        let [red, green, blue, alpha] = color;

        let samples = (0 .. total).map(|index| DeepSample {
            z_front: z_front[index],
            z_back: z_back.map_or(z_front[index], |channel| channel[index]),
            r: red[index].into(),
            g: green[index].into(),
            b: blue[index].into(),
            a: alpha[index].into(),
        }).collect();

        Ok(Self::new(DeepImage::new(resolution, sample_counts, samples)?))
    }

    /// The image this source reads from.
    pub fn image(&self) -> &DeepImage {
        &self.image
    }
}

impl DeepSource for ImageSource {

    fn resolution(&self) -> Vec2<usize> {
        self.image.resolution()
    }

    fn sample_counts(&mut self, y: usize, counts: &mut [u32]) -> UnitResult {
        let width = self.image.width();
        check_row_request(self.resolution(), y, counts.len())?;

        counts.copy_from_slice(&self.image.sample_counts()[y * width .. (y + 1) * width]);
        Ok(())
    }

    fn read_row(&mut self, y: usize, counts: &[u32], samples: &mut [DeepSample]) -> UnitResult {
        check_row_request(self.resolution(), y, counts.len())?;

        let mut offset = 0;
        for x in 0 .. self.image.width() {
            let pixel = self.image.pixel(x, y);
            samples[offset .. offset + pixel.len()].copy_from_slice(pixel);
            offset += pixel.len();
        }

        if self.z_offset != 0.0 {
            for sample in samples.iter_mut() {
                sample.z_front += self.z_offset;
                sample.z_back += self.z_offset;
            }
        }

        Ok(())
    }
}


/// A deep source that computes each pixel's samples on demand with a closure,
/// for synthetic inputs and tests. The closure must be deterministic: the
/// pipeline may read a row more than once and expects identical samples.
pub struct GeneratorSource<F> {
    resolution: Vec2<usize>,
    generate_pixel: F,
    z_offset: f32,

    /// The most recently generated row, kept so the fill phase
    /// does not run the generator a second time.
    pending_row: Vec<DeepSample>,
    pending_y: Option<usize>,
}

impl<F> GeneratorSource<F> where F: FnMut(usize, usize) -> Vec<DeepSample> + Send {

    /// Create a source that calls `generate_pixel(x, y)` for every pixel.
    pub fn new(resolution: Vec2<usize>, generate_pixel: F) -> Self {
        Self {
            resolution, generate_pixel,
            z_offset: 0.0,
            pending_row: Vec::new(),
            pending_y: None,
        }
    }

    /// Shift every generated sample by a constant depth.
    pub fn with_z_offset(mut self, z_offset: f32) -> Self {
        self.z_offset = z_offset;
        self
    }

    fn generate_row(&mut self, y: usize, counts: &mut [u32]) {
        self.pending_row.clear();

        for x in 0 .. self.resolution.x() {
            let pixel = (self.generate_pixel)(x, y);
            counts[x] = pixel.len() as u32;
            self.pending_row.extend(pixel);
        }

        for sample in self.pending_row.iter_mut() {
            sample.z_front += self.z_offset;
            sample.z_back += self.z_offset;
        }

        self.pending_y = Some(y);
    }
}

impl<F> DeepSource for GeneratorSource<F> where F: FnMut(usize, usize) -> Vec<DeepSample> + Send {

    fn resolution(&self) -> Vec2<usize> {
        self.resolution
    }

    fn sample_counts(&mut self, y: usize, counts: &mut [u32]) -> UnitResult {
        check_row_request(self.resolution, y, counts.len())?;
        self.generate_row(y, counts);
        Ok(())
    }

    fn read_row(&mut self, y: usize, counts: &[u32], samples: &mut [DeepSample]) -> UnitResult {
        check_row_request(self.resolution, y, counts.len())?;

        if self.pending_y != Some(y) {
            // counts were requested for a different row in between; regenerate
            let mut scratch_counts = vec![0_u32; self.resolution.x()];
            self.generate_row(y, &mut scratch_counts);
        }

        if samples.len() != self.pending_row.len() {
            return Err(Error::source_io(format!(
                "generator produced {} samples for row {} but {} were requested",
                self.pending_row.len(), y, samples.len()
            )));
        }

        samples.copy_from_slice(&self.pending_row);
        Ok(())
    }
}

impl<F> std::fmt::Debug for GeneratorSource<F> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("GeneratorSource")
            .field("resolution", &self.resolution)
            .field("z_offset", &self.z_offset)
            .finish_non_exhaustive()
    }
}


fn check_row_request(resolution: Vec2<usize>, y: usize, counts_length: usize) -> UnitResult {
    if y >= resolution.y() {
        return Err(Error::source_io(format!(
            "row {} requested from a source of height {}", y, resolution.y()
        )));
    }

    if counts_length != resolution.x() {
        return Err(Error::source_io(format!(
            "count buffer of length {} does not match image width {}",
            counts_length, resolution.x()
        )));
    }

    Ok(())
}
