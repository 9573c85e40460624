//! Merging the deep samples of multiple images into a single pixel.
//!
//! The merger combines N depth-ordered sample runs into one run of
//! non-overlapping intervals. Volumetric samples are split at every depth
//! boundary that falls inside them (Beer-Lambert attenuation, see
//! [`DeepSample::split`]), the resulting fragments are sorted front to back,
//! and fragments that occupy the same interval are folded into one
//! ([`DeepSample::blended_with`]). The output is ready for front-to-back
//! over compositing.

use crate::error::Result;
use crate::row::DeepRow;
use crate::sample::{DeepSample, SPLIT_EPSILON};

/// Reusable scratch buffers for the merger.
///
/// Merging one pixel needs a staging copy of all input samples, the set of
/// distinct depth boundaries, and two fragment lists. Reusing one scratch per
/// worker thread across all pixels of a row amortizes those allocations,
/// instead of allocating per pixel.
#[derive(Debug, Clone, Default)]
pub struct MergeScratch {
    staging: Vec<DeepSample>,
    split_depths: Vec<f32>,
    fragments: Vec<DeepSample>,
    merged: Vec<DeepSample>,
}

impl MergeScratch {

    /// Create empty scratch buffers. They grow while merging and
    /// keep their capacity for the next pixel.
    pub fn new() -> Self {
        Self::default()
    }

    /// The merged samples of the most recently processed pixel.
    pub fn merged(&self) -> &[DeepSample] {
        &self.merged
    }
}


/// Merge the deep samples of one pixel from multiple images.
///
/// Each element of `inputs` is the sample run of the same pixel in one input
/// image. Samples coinciding within `epsilon` on both interval ends are
/// blended into a single sample; pass an epsilon of zero to keep coincident
/// samples as duplicates. The result is sorted by `z_front`, ties broken by
/// `z_back`, and consecutive intervals never overlap partially.
///
/// Samples with non-finite or inverted depths are silently dropped; use
/// [`merge_pixel_into_row`] to observe how many. Inputs that are not sorted
/// are handled, since the merger re-sorts after splitting.
///
/// This is the pure building block behind [`merge_deep`](crate::pipeline::merge_deep);
/// prefer the pipeline entry points for whole images.
pub fn merge_pixels(inputs: &[&[DeepSample]], epsilon: f32) -> Vec<DeepSample> {
    let mut scratch = MergeScratch::new();
    merge_into_scratch(inputs, epsilon, &mut scratch);
    scratch.merged
}

/// Merge the deep samples of one pixel and append the result to pixel `x` of
/// the output row (which must be built in x order, see
/// [`DeepRow::push_pixel_samples`]). Returns how many malformed input samples
/// were dropped.
pub fn merge_pixel_into_row(
    inputs: &[&[DeepSample]],
    epsilon: f32,
    scratch: &mut MergeScratch,
    x: usize,
    output: &mut DeepRow,
) -> Result<usize> {
    let dropped = merge_into_scratch(inputs, epsilon, scratch);
    output.push_pixel_samples(x, &scratch.merged)?;
    Ok(dropped)
}


/// Runs the full merge for one pixel, leaving the result in `scratch.merged`.
/// Returns the number of dropped malformed samples.
///
/// Worst case O(K log K + K * S) for K input samples and S distinct depths;
/// S is usually far smaller than K, so this behaves like O(K log K).
fn merge_into_scratch(inputs: &[&[DeepSample]], epsilon: f32, scratch: &mut MergeScratch) -> usize {
    let MergeScratch { staging, split_depths, fragments, merged } = scratch;

    staging.clear();
    merged.clear();

    // collect all raw samples, dropping any with unusable depths
    let mut dropped = 0_usize;
    for &input in inputs {
        for sample in input {
            if sample.is_well_formed() { staging.push(*sample); }
            else { dropped += 1; }
        }
    }

    if staging.is_empty() {
        return dropped;
    }

    // every distinct boundary depth is a potential cut.
    // exact equality here; near-duplicates collapse in the blend step below.
    split_depths.clear();
    for sample in staging.iter() {
        split_depths.push(sample.z_front);
        split_depths.push(sample.z_back);
    }

    split_depths.sort_unstable_by(f32::total_cmp);
    split_depths.dedup();

    // split each volume at every boundary strictly inside it
    fragments.clear();
    for sample in staging.iter() {
        if !sample.is_volume() {
            fragments.push(*sample);
            continue;
        }

        let first_cut = split_depths
            .partition_point(|&depth| depth <= sample.z_front);

        let mut remainder = *sample;
        for &cut in &split_depths[first_cut ..] {
            if cut >= sample.z_back - SPLIT_EPSILON { break; }

            if let Some((front, back)) = remainder.split(cut) {
                fragments.push(front);
                remainder = back;
            }
        }

        fragments.push(remainder);
    }

    fragments.sort_unstable_by(DeepSample::depth_order);

    // fold runs of coincident fragments into one sample, front to back
    let mut index = 0;
    while index < fragments.len() {
        let mut current = fragments[index];
        index += 1;

        while index < fragments.len() && current.is_coincident_with(&fragments[index], epsilon) {
            current = current.blended_with(&fragments[index]);
            index += 1;
        }

        merged.push(current);
    }

    dropped
}
