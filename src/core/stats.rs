//! Robust statistics used by every calibration stage.
//!
//! All functions ignore non-finite samples and are deterministic: medians
//! use the lower middle element, sums use a fixed chunked tree reduction.

use crate::types::{CalError, CalResult, FrameImage};
use std::cmp::Ordering;

/// Normal-distribution conversion from MAD to standard deviation
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Samples per partial sum in [`deterministic_sum`]
const SUM_CHUNK: usize = 4096;

/// Upper bound on histogram bins used by [`mode`]
const MAX_HISTOGRAM_BINS: usize = 1 << 20;

/// Default sigma-clipping parameters
#[derive(Debug, Clone, Copy)]
pub struct ClipParams {
    /// Rejection threshold in standard deviations
    pub k: f64,
    /// Maximum number of rejection passes
    pub max_iter: usize,
}

impl Default for ClipParams {
    fn default() -> Self {
        Self { k: 3.0, max_iter: 5 }
    }
}

/// Copy the finite samples of an image into a flat buffer
pub fn finite_values(image: &FrameImage) -> Vec<f32> {
    image.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Median of a scratch buffer, reordering it; lower middle element on even length
pub fn median_in_place(buf: &mut [f32]) -> Option<f32> {
    if buf.is_empty() {
        return None;
    }
    let k = (buf.len() - 1) / 2;
    let (_, m, _) = buf.select_nth_unstable_by(k, |a, b| a.total_cmp(b));
    Some(*m)
}

/// Exact median of the finite samples
pub fn median(values: &[f32]) -> CalResult<f32> {
    let mut buf: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    median_in_place(&mut buf).ok_or_else(|| CalError::EmptyRegion("median of empty region".to_string()))
}

/// Median absolute deviation about `center`
pub fn mad(values: &[f32], center: f32) -> CalResult<f32> {
    let mut deviations: Vec<f32> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - center).abs())
        .collect();
    median_in_place(&mut deviations)
        .ok_or_else(|| CalError::EmptyRegion("MAD of empty region".to_string()))
}

/// Robust standard deviation, 1.4826 * MAD about the median
pub fn sigma_from_mad(values: &[f32]) -> CalResult<f64> {
    let m = median(values)?;
    let d = mad(values, m)?;
    Ok(MAD_TO_SIGMA * d as f64)
}

/// Median and robust sigma in one pass over the data
pub fn median_and_sigma(values: &[f32]) -> CalResult<(f32, f64)> {
    let m = median(values)?;
    let d = mad(values, m)?;
    Ok((m, MAD_TO_SIGMA * d as f64))
}

/// Histogram peak with bin width sigma/4.
///
/// The returned value is the median of the samples inside the peak bin, so a
/// strongly populated level is reported exactly. Ties go to the lowest bin.
/// Falls back to the median when the robust sigma is zero.
pub fn mode(values: &[f32]) -> CalResult<f32> {
    let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let (m, sigma) = median_and_sigma(&finite)?;
    if sigma <= 0.0 {
        return Ok(m);
    }

    let (min, max) = finite
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v as f64), hi.max(v as f64))
        });
    let mut width = sigma / 4.0;
    let span = max - min;
    if span / width >= MAX_HISTOGRAM_BINS as f64 {
        width = span / (MAX_HISTOGRAM_BINS - 1) as f64;
    }
    let nbins = (span / width).floor() as usize + 1;

    let bin_of = |v: f32| (((v as f64 - min) / width).floor() as usize).min(nbins - 1);
    let mut counts = vec![0usize; nbins];
    for &v in &finite {
        counts[bin_of(v)] += 1;
    }

    let mut peak = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[peak] {
            peak = i;
        }
    }

    let mut in_peak: Vec<f32> = finite.into_iter().filter(|&v| bin_of(v) == peak).collect();
    median_in_place(&mut in_peak).ok_or_else(|| CalError::EmptyRegion("empty histogram peak".to_string()))
}

/// Sum with a fixed chunk/tree shape so the result is independent of threading
pub fn deterministic_sum(values: &[f32]) -> f64 {
    deterministic_sum_by(values, |v| v as f64)
}

/// Sum of `f(v)` over finite samples with the same fixed reduction shape
pub fn deterministic_sum_by<F>(values: &[f32], f: F) -> f64
where
    F: Fn(f32) -> f64 + Send + Sync,
{
    let chunk_sum = |chunk: &[f32]| -> f64 {
        chunk.iter().filter(|v| v.is_finite()).map(|&v| f(v)).sum::<f64>()
    };

    #[cfg(feature = "parallel")]
    let partials: Vec<f64> = {
        use rayon::prelude::*;
        values.par_chunks(SUM_CHUNK).map(chunk_sum).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let partials: Vec<f64> = values.chunks(SUM_CHUNK).map(chunk_sum).collect();

    pairwise_sum(&partials)
}

fn pairwise_sum(values: &[f64]) -> f64 {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        n => {
            let mid = n / 2;
            pairwise_sum(&values[..mid]) + pairwise_sum(&values[mid..])
        }
    }
}

/// Mean and population standard deviation of the finite samples
pub fn mean_std(values: &[f32]) -> CalResult<(f64, f64)> {
    let n = values.iter().filter(|v| v.is_finite()).count();
    if n == 0 {
        return Err(CalError::EmptyRegion("mean of empty region".to_string()));
    }
    let mean = deterministic_sum(values) / n as f64;
    let var = deterministic_sum_by(values, |v| {
        let d = v as f64 - mean;
        d * d
    }) / n as f64;
    Ok((mean, var.max(0.0).sqrt()))
}

pub fn mean(values: &[f32]) -> CalResult<f64> {
    mean_std(values).map(|(m, _)| m)
}

/// Iterative k-sigma clipped mean.
///
/// Stops when a pass rejects nothing new, the spread collapses to zero,
/// or `max_iter` passes have run.
pub fn sigma_clipped_mean(values: &[f32], k: f64, max_iter: usize) -> CalResult<f64> {
    let mut kept: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if kept.is_empty() {
        return Err(CalError::EmptyRegion("sigma-clipped mean of empty region".to_string()));
    }

    for iter in 0..max_iter {
        let (mean, std) = mean_std(&kept)?;
        if std <= 0.0 {
            break;
        }
        let lo = mean - k * std;
        let hi = mean + k * std;
        let before = kept.len();
        kept.retain(|&v| (v as f64) >= lo && (v as f64) <= hi);
        log::trace!("sigma clip pass {}: kept {}/{}", iter + 1, kept.len(), before);
        if kept.len() == before || kept.is_empty() {
            break;
        }
    }

    if kept.is_empty() {
        return Err(CalError::NumericDegenerate("sigma clipping rejected every sample".to_string()));
    }
    mean(&kept)
}

/// Linear-interpolated percentile, `p` in [0, 100]
pub fn percentile(values: &[f32], p: f64) -> CalResult<f32> {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Err(CalError::EmptyRegion("percentile of empty region".to_string()));
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let p = p.clamp(0.0, 100.0) / 100.0;
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    Ok(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Minimum and maximum of the finite samples
pub fn min_max(values: &[f32]) -> CalResult<(f32, f32)> {
    values
        .iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<(f32, f32)>, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .ok_or_else(|| CalError::EmptyRegion("min/max of empty region".to_string()))
}
