//! Lightweight statistics over sampled chunks.
//!
//! The selector never looks at more than the sampling window, so everything
//! here is a single pass over a byte histogram.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Data distribution buckets used as cost-model keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionClass {
    /// Constant or near-constant bytes
    Constant,
    /// Small alphabet, repetitive content
    LowEntropy,
    /// Values clustered around a mean (e.g. narrow normal distributions)
    Clustered,
    /// Wide spread of values with some structure left
    Spread,
    /// Indistinguishable from random noise
    Random,
}

impl DistributionClass {
    /// Entropy upper bounds (bits per byte, exclusive) for each class but Random.
    const BOUNDS: [(f64, DistributionClass); 4] = [
        (0.5, DistributionClass::Constant),
        (3.0, DistributionClass::LowEntropy),
        (5.5, DistributionClass::Clustered),
        (7.5, DistributionClass::Spread),
    ];

    /// Classify by Shannon entropy in bits per byte.
    pub fn classify(entropy: f64) -> DistributionClass {
        Self::BOUNDS
            .iter()
            .find(|(bound, _)| entropy < *bound)
            .map(|(_, class)| *class)
            .unwrap_or(DistributionClass::Random)
    }

    /// All classes in ascending entropy order.
    pub fn all() -> &'static [DistributionClass] {
        &[
            DistributionClass::Constant,
            DistributionClass::LowEntropy,
            DistributionClass::Clustered,
            DistributionClass::Spread,
            DistributionClass::Random,
        ]
    }
}

impl fmt::Display for DistributionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DistributionClass::Constant => "constant",
            DistributionClass::LowEntropy => "low_entropy",
            DistributionClass::Clustered => "clustered",
            DistributionClass::Spread => "spread",
            DistributionClass::Random => "random",
        };
        f.write_str(s)
    }
}

fn histogram(data: &[u8]) -> [u64; 256] {
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    counts
}

fn entropy_of(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Shannon entropy of `data` in bits per byte (0.0 ..= 8.0).
pub fn byte_entropy(data: &[u8]) -> f64 {
    entropy_of(&histogram(data), data.len() as u64)
}

/// Statistics over a sample of chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    /// Total sampled bytes
    pub bytes: u64,
    /// Number of sampled chunks
    pub chunks: usize,
    /// Entropy of the combined histogram, bits per byte
    pub entropy: f64,
    /// Mean byte value
    pub mean: f64,
    /// Standard deviation of byte values
    pub std_dev: f64,
    /// Number of distinct byte values seen
    pub distinct: usize,
    /// Entropy of each sampled chunk
    pub chunk_entropies: Vec<f64>,
}

impl SampleStats {
    /// Compute statistics over the given chunks.
    pub fn from_chunks<'a, I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut counts = [0u64; 256];
        let mut chunk_entropies = Vec::new();
        let mut total = 0u64;

        for chunk in chunks {
            let local = histogram(chunk);
            for (acc, c) in counts.iter_mut().zip(local.iter()) {
                *acc += c;
            }
            total += chunk.len() as u64;
            chunk_entropies.push(entropy_of(&local, chunk.len() as u64));
        }

        let (mean, std_dev) = if total > 0 {
            let n = total as f64;
            let mean = counts
                .iter()
                .enumerate()
                .map(|(v, &c)| v as f64 * c as f64)
                .sum::<f64>()
                / n;
            let var = counts
                .iter()
                .enumerate()
                .map(|(v, &c)| {
                    let d = v as f64 - mean;
                    d * d * c as f64
                })
                .sum::<f64>()
                / n;
            (mean, var.sqrt())
        } else {
            (0.0, 0.0)
        };

        Self {
            bytes: total,
            chunks: chunk_entropies.len(),
            entropy: entropy_of(&counts, total),
            mean,
            std_dev,
            distinct: counts.iter().filter(|&&c| c > 0).count(),
            chunk_entropies,
        }
    }

    /// Statistics over a single buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_chunks(std::iter::once(data))
    }

    /// Variance of per-chunk entropy; high values mean the stream changes character.
    pub fn entropy_variance(&self) -> f64 {
        if self.chunk_entropies.len() < 2 {
            return 0.0;
        }
        let n = self.chunk_entropies.len() as f64;
        let mean = self.chunk_entropies.iter().sum::<f64>() / n;
        self.chunk_entropies
            .iter()
            .map(|e| (e - mean) * (e - mean))
            .sum::<f64>()
            / n
    }

    /// Distribution class of the combined sample.
    pub fn class(&self) -> DistributionClass {
        DistributionClass::classify(self.entropy)
    }

    /// True when nothing was sampled.
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}
