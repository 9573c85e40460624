
//! Merge multiple deep images into one, and optionally flatten the result
//! into an ordinary RGBA raster.
//!
//! A deep image stores a list of depth samples per pixel instead of a single
//! color, so render passes (characters, backdrops, volumetric effects) can be
//! combined after the fact with correct occlusion and volume overlap,
//! without re-rendering anything.
//!
//! The merge runs as a streaming pipeline over a sliding window of scanlines:
//! one thread loads rows from all sources, a pool of threads merges them, and
//! one thread writes the result, so peak memory does not depend on the image
//! height. See [`pipeline::merge_deep`] and [`pipeline::merge_and_flatten`]
//! for the entry points, or [`merge::merge_pixels`] and
//! [`flatten::flatten_pixel`] for the per-pixel building blocks.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    dead_code,
    unused_must_use,
    trivial_numeric_casts,
)]

#![forbid(unsafe_code)]

pub mod error;
pub mod math;
pub mod sample;
pub mod row;
pub mod merge;
pub mod flatten;
pub mod image;
pub mod source;
pub mod pipeline;

/// Re-exports of all modules types commonly required
/// for simple merging and flattening of deep images.
pub mod prelude {

    // main exports
    pub use crate::pipeline::{
        merge_deep, merge_and_flatten,
        Compositor, MergeOptions, MergeStats,
        Logger, ConsoleLogger,
    };

    pub use crate::merge::merge_pixels;
    pub use crate::flatten::{flatten_pixel, flatten_image};

    // secondary data types
    pub use crate::sample::DeepSample;
    pub use crate::row::DeepRow;
    pub use crate::image::{DeepImage, FlatImage};
    pub use crate::source::{DeepSource, ImageSource, GeneratorSource};

    // re-export external stuff
    pub use half::f16;

    pub use crate::math::Vec2;
    pub use crate::error::{Result, UnitResult, Error};
}
