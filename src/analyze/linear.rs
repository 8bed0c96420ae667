//! RANSAC dominant-slope extraction
//!
//! Fits the longest linear region of a noisy profile by sampling random
//! two-point hypotheses, counting inliers under a relative error bound, and
//! refining the winning consensus set with least squares.

use super::Point;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

const RANSAC_ITERATIONS: usize = 500;

/// Dominant linear region of a point series
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Fraction of all points inside the region (0.0 - 1.0)
    pub coverage: f64,
    pub start_x: f64,
    pub end_x: f64,
    pub inlier_count: usize,
}

/// Find the line covering the most points within `tolerance` relative error
///
/// Points with |y| below 1e-9 are judged by absolute error instead. Fewer
/// than two points, or no consensus of at least two, yields the zero fit.
pub fn find_dominant_slope(points: &[Point], tolerance: f64) -> LinearFit {
    let n = points.len();
    if n < 2 {
        return LinearFit::default();
    }

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x9E37_79B9_7F4A_7C15);
    let mut best_inliers: Vec<Point> = Vec::new();

    for _ in 0..RANSAC_ITERATIONS {
        let i = rng.gen_range(0..n);
        let j = rng.gen_range(0..n);
        if i == j {
            continue;
        }
        let p1 = points[i];
        let p2 = points[j];

        // Vertical hypotheses carry no slope information.
        if (p2.x - p1.x).abs() < 1e-9 {
            continue;
        }
        let m = (p2.y - p1.y) / (p2.x - p1.x);
        let c = p1.y - m * p1.x;

        let mut inliers = Vec::with_capacity(n);
        for p in points {
            let predicted = m * p.x + c;
            let err = if p.y.abs() < 1e-9 {
                (predicted - p.y).abs()
            } else {
                (predicted - p.y).abs() / p.y.abs()
            };
            if err <= tolerance {
                inliers.push(*p);
            }
        }

        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
    }

    if best_inliers.len() < 2 {
        return LinearFit::default();
    }

    let (slope, intercept) = least_squares(&best_inliers);
    let (start_x, end_x) = best_inliers.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| {
        (lo.min(p.x), hi.max(p.x))
    });

    LinearFit {
        slope,
        intercept,
        coverage: best_inliers.len() as f64 / n as f64,
        start_x,
        end_x,
        inlier_count: best_inliers.len(),
    }
}

/// Simple linear regression over a consensus set
fn least_squares(points: &[Point]) -> (f64, f64) {
    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for p in points {
        sum_x += p.x;
        sum_y += p.y;
        sum_xy += p.x * p.y;
        sum_xx += p.x * p.x;
    }
    let m = (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x);
    let c = (sum_y - m * sum_x) / n;
    (m, c)
}
