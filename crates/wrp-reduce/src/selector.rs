//! Compression parameter selection from a sample of the chunk stream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compression::compress;
use crate::cost_model::{CostEntry, CostModel};
use crate::error::ReduceError;
use crate::profile::{ChunkSizeClass, CompressionProfile};
use crate::stats::{byte_entropy, DistributionClass, SampleStats};

/// Configuration for the compression selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Number of leading chunks sampled before choosing a profile
    pub sample_chunks: usize,
    /// Ratios within this fraction of the best are considered tied (0.05 = 5%)
    pub tie_epsilon: f64,
    /// Per-chunk entropy variance above which selection becomes per-chunk
    pub variance_threshold: f64,
    /// Allow per-chunk re-evaluation at all
    pub adaptive: bool,
    /// Profile used when the cost model has no answer
    pub fallback: CompressionProfile,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            sample_chunks: 4,
            tie_epsilon: 0.05,
            variance_threshold: 4.0,
            adaptive: true,
            fallback: CompressionProfile::safe_default(),
        }
    }
}

/// Outcome of a selection over one job's sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    /// Profile fixed for the job (its chunk size drives ingestion)
    pub profile: CompressionProfile,
    /// Class of the combined sample, None for an empty sample
    pub class: Option<DistributionClass>,
    /// Sample statistics
    pub stats: SampleStats,
    /// Codec is re-evaluated at every chunk boundary
    pub adaptive: bool,
    /// The cost model had no entry and the fallback profile was used
    pub fell_back: bool,
    /// The trial compression did not beat raw size, so pass-through was chosen
    pub passthrough_by_trial: bool,
}

/// Chooses a [`CompressionProfile`] from sample statistics and a cost model.
pub struct CompressionSelector {
    config: SelectorConfig,
    model: Arc<CostModel>,
}

impl CompressionSelector {
    /// Create a selector over the given model.
    pub fn new(config: SelectorConfig, model: Arc<CostModel>) -> Self {
        Self { config, model }
    }

    /// Selector configuration.
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Cost model in use.
    pub fn model(&self) -> &CostModel {
        &self.model
    }

    /// Best profile for a class: maximum ratio, then among the rows whose ratio
    /// is within epsilon of it, the lowest compress time; remaining ties keep
    /// table order.
    pub fn lookup(&self, class: DistributionClass) -> Result<CompressionProfile, ReduceError> {
        let best_ratio = self
            .model
            .candidates(class)
            .map(|e| e.cost.ratio)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))))
            .ok_or(ReduceError::SelectorModelUnavailable { class })?;

        let floor = best_ratio * (1.0 - self.config.tie_epsilon);
        let mut winner: Option<&CostEntry> = None;
        for entry in self.model.candidates(class).filter(|e| e.cost.ratio >= floor) {
            match winner {
                Some(w) if w.cost.compress_ms_per_mib <= entry.cost.compress_ms_per_mib => {}
                _ => winner = Some(entry),
            }
        }
        winner
            .map(|e| e.profile)
            .ok_or(ReduceError::SelectorModelUnavailable { class })
    }

    fn lookup_or_fallback(&self, class: DistributionClass) -> (CompressionProfile, bool) {
        match self.lookup(class) {
            Ok(profile) => (profile, false),
            Err(e) => {
                warn!(error = %e, fallback = %self.config.fallback, "using fallback compression profile");
                (self.config.fallback, true)
            }
        }
    }

    /// Select a profile from the first `sample_chunks` chunks of the stream.
    pub fn select<'a, I>(&self, sample: I) -> SelectionReport
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let chunks: Vec<&[u8]> = sample
            .into_iter()
            .take(self.config.sample_chunks.max(1))
            .collect();
        let stats = SampleStats::from_chunks(chunks.iter().copied());

        if stats.is_empty() {
            return SelectionReport {
                profile: self.config.fallback,
                class: None,
                stats,
                adaptive: false,
                fell_back: false,
                passthrough_by_trial: false,
            };
        }

        let class = stats.class();
        let (mut profile, fell_back) = self.lookup_or_fallback(class);

        let mut passthrough_by_trial = false;
        if !profile.is_passthrough() && !self.trial_beats_raw(&chunks, profile, stats.bytes) {
            profile = CompressionProfile::no_compression(profile.chunk_size);
            passthrough_by_trial = true;
        }

        let adaptive = self.config.adaptive
            && stats.chunks > 1
            && stats.entropy_variance() > self.config.variance_threshold;

        debug!(
            %class,
            entropy = stats.entropy,
            std_dev = stats.std_dev,
            variance = stats.entropy_variance(),
            %profile,
            adaptive,
            "compression profile selected"
        );

        SelectionReport {
            profile,
            class: Some(class),
            stats,
            adaptive,
            fell_back,
            passthrough_by_trial,
        }
    }

    fn trial_beats_raw(&self, chunks: &[&[u8]], profile: CompressionProfile, raw: u64) -> bool {
        let mut compressed = 0u64;
        for chunk in chunks {
            match compress(chunk, profile.codec, profile.level) {
                Ok(c) => compressed += c.len() as u64,
                Err(e) => {
                    warn!(error = %e, %profile, "trial compression failed");
                    return false;
                }
            }
        }
        compressed < raw
    }

    /// Re-evaluate the codec for one chunk (adaptive mode). Chunk boundaries
    /// are already fixed, so the job's chunk size class is kept.
    pub fn profile_for_chunk(&self, chunk: &[u8], chunk_size: ChunkSizeClass) -> CompressionProfile {
        let class = DistributionClass::classify(byte_entropy(chunk));
        let (profile, _) = self.lookup_or_fallback(class);
        CompressionProfile { chunk_size, ..profile }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CodecId;
    use crate::cost_model::CostVector;
    use rand::{RngCore, SeedableRng};

    fn selector() -> CompressionSelector {
        CompressionSelector::new(SelectorConfig::default(), Arc::new(CostModel::empirical()))
    }

    fn random_bytes(n: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut buf = vec![0u8; n];
        rng.fill_bytes(&mut buf);
        buf
    }

    fn low_entropy(n: usize) -> Vec<u8> {
        (0..n).map(|i| b"ACGT"[(i * 7 / 3) % 4]).collect()
    }

    #[test]
    fn random_sample_selects_no_compression() {
        let data = random_bytes(64 * 1024, 11);
        let report = selector().select([data.as_slice()]);
        assert_eq!(report.class, Some(DistributionClass::Random));
        assert!(report.profile.is_passthrough());
        assert!(!report.fell_back);
    }

    #[test]
    fn tie_break_prefers_faster_profile() {
        // LowEntropy: zstd:9 has ratio 4.6, zstd:3 has 4.4 (within 5%) and is 4x faster.
        let profile = selector().lookup(DistributionClass::LowEntropy).unwrap();
        assert_eq!(profile.codec, CodecId::Zstd);
        assert_eq!(profile.level, 3);
        assert_eq!(profile.chunk_size, ChunkSizeClass::Medium);
    }

    #[test]
    fn clear_winner_ignores_speed() {
        // Constant: 180 vs 150 is outside epsilon, so the slow high-ratio profile wins.
        let profile = selector().lookup(DistributionClass::Constant).unwrap();
        assert_eq!(profile.level, 19);
    }

    #[test]
    fn equal_rows_keep_table_order() {
        let cost = CostVector {
            ratio: 2.0,
            compress_ms_per_mib: 1.0,
            decompress_ms_per_mib: 1.0,
            cpu_percent: 90.0,
        };
        let first = CompressionProfile::new(CodecId::Lz4, 0, ChunkSizeClass::Small);
        let second = CompressionProfile::new(CodecId::Zstd, 1, ChunkSizeClass::Small);
        let model = CostModel::new(vec![
            CostEntry { class: DistributionClass::Spread, profile: first, cost },
            CostEntry { class: DistributionClass::Spread, profile: second, cost },
        ]);
        let s = CompressionSelector::new(SelectorConfig::default(), Arc::new(model));
        assert_eq!(s.lookup(DistributionClass::Spread).unwrap(), first);
    }

    #[test]
    fn missing_class_is_model_unavailable() {
        let s = CompressionSelector::new(SelectorConfig::default(), Arc::new(CostModel::new(vec![])));
        assert!(matches!(
            s.lookup(DistributionClass::Clustered),
            Err(ReduceError::SelectorModelUnavailable { .. })
        ));
    }

    #[test]
    fn missing_class_falls_back_to_default() {
        let s = CompressionSelector::new(SelectorConfig::default(), Arc::new(CostModel::new(vec![])));
        let data = low_entropy(16 * 1024);
        let report = s.select([data.as_slice()]);
        assert!(report.fell_back);
        assert_eq!(report.profile, CompressionProfile::safe_default());
    }

    #[test]
    fn selection_is_deterministic() {
        let a = low_entropy(32 * 1024);
        let b = random_bytes(32 * 1024, 5);
        let s = selector();
        let first = s.select([a.as_slice(), b.as_slice()]);
        for _ in 0..5 {
            assert_eq!(s.select([a.as_slice(), b.as_slice()]), first);
        }
    }

    #[test]
    fn mixed_sample_becomes_adaptive() {
        let constant = vec![0u8; 8192];
        let noisy = random_bytes(8192, 9);
        let report = selector().select([constant.as_slice(), noisy.as_slice()]);
        assert!(report.adaptive);
    }

    #[test]
    fn homogeneous_sample_is_fixed() {
        let a = low_entropy(8192);
        let report = selector().select([a.as_slice(), a.as_slice(), a.as_slice()]);
        assert!(!report.adaptive);
        assert_eq!(report.profile.codec, CodecId::Zstd);
    }

    #[test]
    fn sample_window_is_bounded() {
        let config = SelectorConfig {
            sample_chunks: 2,
            ..Default::default()
        };
        let s = CompressionSelector::new(config, Arc::new(CostModel::empirical()));
        let a = low_entropy(1024);
        let report = s.select([a.as_slice(), a.as_slice(), a.as_slice(), a.as_slice()]);
        assert_eq!(report.stats.chunks, 2);
        assert_eq!(report.stats.bytes, 2048);
    }

    #[test]
    fn empty_sample_uses_fallback() {
        let report = selector().select(Vec::<&[u8]>::new());
        assert_eq!(report.class, None);
        assert_eq!(report.profile, CompressionProfile::safe_default());
    }

    #[test]
    fn trial_rejects_incompressible_winner() {
        // A model that insists on LZ4 for random data; the trial must override it.
        let model = CostModel::new(vec![CostEntry {
            class: DistributionClass::Random,
            profile: CompressionProfile::new(CodecId::Lz4, 0, ChunkSizeClass::Medium),
            cost: CostVector {
                ratio: 1.5,
                compress_ms_per_mib: 1.0,
                decompress_ms_per_mib: 1.0,
                cpu_percent: 90.0,
            },
        }]);
        let s = CompressionSelector::new(SelectorConfig::default(), Arc::new(model));
        let data = random_bytes(64 * 1024, 1);
        let report = s.select([data.as_slice()]);
        assert!(report.passthrough_by_trial);
        assert_eq!(report.profile, CompressionProfile::no_compression(ChunkSizeClass::Medium));
    }

    #[test]
    fn per_chunk_profile_keeps_chunk_size() {
        let s = selector();
        let noisy = random_bytes(4096, 2);
        let p = s.profile_for_chunk(&noisy, ChunkSizeClass::Small);
        assert!(p.is_passthrough());
        assert_eq!(p.chunk_size, ChunkSizeClass::Small);
        let p = s.profile_for_chunk(&[1u8; 4096], ChunkSizeClass::Small);
        assert_eq!(p.codec, CodecId::Zstd);
        assert_eq!(p.chunk_size, ChunkSizeClass::Small);
    }
}
