// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::error::{Result, SpotError};

/// Counts of u8 sample values. Rank queries on the histogram give the same
/// answers as indexing into the sorted list of samples, without sorting.
#[derive(Clone, Debug)]
pub struct Histogram {
    bins: [u64; 256],
    count: u64,
}

impl Histogram {
    pub fn new() -> Histogram {
        Histogram{bins: [0; 256], count: 0}
    }

    pub fn from_values<I: IntoIterator<Item = u8>>(values: I) -> Histogram {
        let mut histogram = Histogram::new();
        for v in values {
            histogram.add(v);
        }
        histogram
    }

    pub fn add(&mut self, value: u8) {
        self.bins[value as usize] += 1;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn bins(&self) -> &[u64; 256] {
        &self.bins
    }

    /// The value that would sit at index `rank` of the ascending sorted
    /// samples. None if `rank` is past the end.
    pub fn value_at_rank(&self, rank: u64) -> Option<u8> {
        if rank >= self.count {
            return None;
        }
        let mut seen = 0;
        for h in 0..256 {
            seen += self.bins[h];
            if seen > rank {
                return Some(h as u8);
            }
        }
        unreachable!()  // rank < count guarantees a hit.
    }

    /// Nearest-rank quantile: the sorted sample at index `floor(q * count)`.
    /// This is deliberately not an interpolating quantile. At `q == 1.0` the
    /// index equals `count`; it is clamped to the last sample.
    pub fn quantile(&self, q: f64) -> Result<u8> {
        check_quantile(q)?;
        if self.count == 0 {
            return Err(SpotError::EmptySpot);
        }
        let rank = ((q * self.count as f64).floor() as u64).min(self.count - 1);
        Ok(self.value_at_rank(rank).unwrap_or(u8::MAX))
    }

    /// Linear-interpolation percentile over the samples, `p` in [0, 100].
    pub fn percentile(&self, p: f64) -> Result<f64> {
        check_percentile(p)?;
        if self.count == 0 {
            return Err(SpotError::EmptySpot);
        }
        let position = p / 100.0 * (self.count - 1) as f64;
        let lower_rank = position.floor() as u64;
        let upper_rank = position.ceil() as u64;
        let lower = self.value_at_rank(lower_rank).unwrap_or(u8::MAX) as f64;
        let upper = self.value_at_rank(upper_rank).unwrap_or(u8::MAX) as f64;
        Ok(lower + (upper - lower) * (position - lower_rank as f64))
    }

    /// Value of the `n`-th largest sample (1-based); None if there are fewer
    /// than `n` samples or `n` is zero.
    pub fn nth_largest(&self, n: u64) -> Option<u8> {
        if n == 0 || n > self.count {
            return None;
        }
        self.value_at_rank(self.count - n)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram::new()
    }
}

pub fn check_quantile(q: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&q) {
        return Err(SpotError::InvalidQuantile(q));
    }
    Ok(())
}

pub fn check_percentile(p: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&p) {
        return Err(SpotError::InvalidPercentile(p));
    }
    Ok(())
}

/// Linear-interpolation percentile of arbitrary float samples, `p` in
/// [0, 100].
pub fn percentile_of(values: &[f64], p: f64) -> Result<f64> {
    check_percentile(p)?;
    if values.is_empty() {
        return Err(SpotError::EmptySpot);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64))
}

// mod tests.
