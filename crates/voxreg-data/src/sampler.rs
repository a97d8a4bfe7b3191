// Index samplers — which backend units make up each sample of a pass
//
// A sampler turns a seed into a finite stream of index tuples. Each tuple
// names the moving unit, the fixed unit and the integers that identify the
// sample downstream. Samplers hold no per-pass state: everything random
// lives in the iterator returned for that pass.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use voxreg_core::{Error, Result};

use crate::file_loader::DataIndex;

/// One sampled pair of backend units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTuple {
    pub moving: DataIndex,
    pub fixed: DataIndex,
    /// Identifying integers, copied into the sample's `indices` ahead of
    /// the label index.
    pub image_indices: Vec<i64>,
}

/// Stream of index tuples for one pass.
pub type IndexStream<'a> = Box<dyn Iterator<Item = IndexTuple> + Send + 'a>;

/// Enumerates the index tuples of an epoch.
pub trait IndexSampler: Send + Sync {
    /// Number of tuples one pass yields.
    fn num_samples(&self) -> usize;

    /// Length of a sample's `indices`, label index included.
    fn num_indices(&self) -> usize;

    /// Tuples of one pass. The same seed yields the same sequence.
    fn sample_index_generator(&self, seed: u64) -> IndexStream<'_>;
}

fn as_i64(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// PairedSampler

/// Pairs image `i` of the moving backend with image `i` of the fixed one.
#[derive(Debug, Clone)]
pub struct PairedSampler {
    num_images: usize,
}

impl PairedSampler {
    pub fn new(num_images: usize) -> Self {
        Self { num_images }
    }
}

impl IndexSampler for PairedSampler {
    fn num_samples(&self) -> usize {
        self.num_images
    }

    fn num_indices(&self) -> usize {
        2
    }

    fn sample_index_generator(&self, _seed: u64) -> IndexStream<'_> {
        Box::new((0..self.num_images).map(|i| IndexTuple {
            moving: DataIndex::Flat(i),
            fixed: DataIndex::Flat(i),
            image_indices: vec![as_i64(i)],
        }))
    }
}

// UnpairedSampler

/// Pairs consecutive entries of a shuffled permutation of one backend.
///
/// With an odd number of images the last entry of the permutation is left
/// out of the pass.
#[derive(Debug, Clone)]
pub struct UnpairedSampler {
    num_images: usize,
}

impl UnpairedSampler {
    pub fn new(num_images: usize) -> Self {
        Self { num_images }
    }
}

impl IndexSampler for UnpairedSampler {
    fn num_samples(&self) -> usize {
        self.num_images / 2
    }

    fn num_indices(&self) -> usize {
        3
    }

    fn sample_index_generator(&self, seed: u64) -> IndexStream<'_> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut perm: Vec<usize> = (0..self.num_images).collect();
        perm.shuffle(&mut rng);
        let pairs: Vec<IndexTuple> = perm
            .chunks_exact(2)
            .map(|pair| IndexTuple {
                moving: DataIndex::Flat(pair[0]),
                fixed: DataIndex::Flat(pair[1]),
                image_indices: vec![as_i64(pair[0]), as_i64(pair[1])],
            })
            .collect();
        Box::new(pairs.into_iter())
    }
}

// GroupedSampler

/// Ordering of the two images of an intra-group pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntraGroupOption {
    /// Moving image precedes the fixed image in the group.
    #[default]
    Forward,
    /// Moving image follows the fixed image in the group.
    Backward,
    /// Either order.
    Unconstrained,
}

impl fmt::Display for IntraGroupOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntraGroupOption::Forward => write!(f, "forward"),
            IntraGroupOption::Backward => write!(f, "backward"),
            IntraGroupOption::Unconstrained => write!(f, "unconstrained"),
        }
    }
}

impl FromStr for IntraGroupOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(IntraGroupOption::Forward),
            "backward" => Ok(IntraGroupOption::Backward),
            "unconstrained" => Ok(IntraGroupOption::Unconstrained),
            _ => Err(Error::GroupedSampling(format!(
                "unknown intra group option {s:?}, expected forward, backward or unconstrained"
            ))),
        }
    }
}

/// Options of grouped sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedSamplingConfig {
    /// Probability that a sample is drawn within one group.
    pub intra_group_prob: f64,
    /// Ordering of intra-group pairs.
    pub intra_group_option: IntraGroupOption,
    /// Draw one sample per group per pass instead of enumerating all
    /// intra-group pairs.
    pub sample_image_in_group: bool,
}

impl Default for GroupedSamplingConfig {
    fn default() -> Self {
        Self {
            intra_group_prob: 1.0,
            intra_group_option: IntraGroupOption::Forward,
            sample_image_in_group: true,
        }
    }
}

impl GroupedSamplingConfig {
    pub fn intra_group_prob(mut self, p: f64) -> Self {
        self.intra_group_prob = p;
        self
    }

    pub fn intra_group_option(mut self, option: IntraGroupOption) -> Self {
        self.intra_group_option = option;
        self
    }

    pub fn sample_image_in_group(mut self, s: bool) -> Self {
        self.sample_image_in_group = s;
        self
    }
}

/// Samples pairs out of grouped data.
///
/// Tuples carry `[moving_group, moving_sample, fixed_group, fixed_sample]`.
#[derive(Debug, Clone)]
pub struct GroupedSampler {
    num_images_per_group: Vec<usize>,
    config: GroupedSamplingConfig,
    /// All intra-group pairs, only used when not sampling in group.
    intra_pairs: Vec<IndexTuple>,
}

impl GroupedSampler {
    /// Create a sampler over groups of the given sizes.
    ///
    /// Every group needs at least one image; empty groups are reported by
    /// position.
    pub fn new(num_images_per_group: Vec<usize>, config: GroupedSamplingConfig) -> Result<Self> {
        let empty: Vec<String> = num_images_per_group
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == 0)
            .map(|(g, _)| g.to_string())
            .collect();
        if !empty.is_empty() {
            return Err(Error::EmptyGroups { group_ids: empty });
        }
        let prob = config.intra_group_prob;
        if !(0.0..=1.0).contains(&prob) {
            return Err(Error::GroupedSampling(format!(
                "intra_group_prob should be between 0 and 1, got {prob}"
            )));
        }
        if prob < 1.0 && num_images_per_group.len() < 2 {
            return Err(Error::GroupedSampling(format!(
                "inter group sampling needs at least two groups, got {}",
                num_images_per_group.len()
            )));
        }
        if !config.sample_image_in_group && prob < 1.0 {
            return Err(Error::GroupedSampling(
                "mixing intra and inter group sampling needs sample_image_in_group".to_string(),
            ));
        }
        let intra_pairs = if config.sample_image_in_group {
            Vec::new()
        } else {
            enumerate_intra_pairs(&num_images_per_group, config.intra_group_option)
        };
        debug!(
            num_groups = num_images_per_group.len(),
            intra_group_prob = prob,
            option = %config.intra_group_option,
            sample_image_in_group = config.sample_image_in_group,
            "grouped sampler ready"
        );
        Ok(Self {
            num_images_per_group,
            config,
            intra_pairs,
        })
    }

    pub fn config(&self) -> &GroupedSamplingConfig {
        &self.config
    }

    pub fn num_groups(&self) -> usize {
        self.num_images_per_group.len()
    }
}

fn grouped_tuple(g1: usize, s1: usize, g2: usize, s2: usize) -> IndexTuple {
    IndexTuple {
        moving: DataIndex::Grouped {
            group: g1,
            sample: s1,
        },
        fixed: DataIndex::Grouped {
            group: g2,
            sample: s2,
        },
        image_indices: vec![as_i64(g1), as_i64(s1), as_i64(g2), as_i64(s2)],
    }
}

fn enumerate_intra_pairs(
    num_images_per_group: &[usize],
    option: IntraGroupOption,
) -> Vec<IndexTuple> {
    let mut pairs = Vec::new();
    for (group, &n) in num_images_per_group.iter().enumerate() {
        for i in 0..n {
            for j in 0..n {
                let keep = match option {
                    IntraGroupOption::Forward => i < j,
                    IntraGroupOption::Backward => i > j,
                    IntraGroupOption::Unconstrained => i != j,
                };
                if keep {
                    pairs.push(grouped_tuple(group, i, group, j));
                }
            }
        }
    }
    pairs
}

impl IndexSampler for GroupedSampler {
    fn num_samples(&self) -> usize {
        if self.config.sample_image_in_group {
            self.num_groups()
        } else {
            self.intra_pairs.len()
        }
    }

    fn num_indices(&self) -> usize {
        5
    }

    fn sample_index_generator(&self, seed: u64) -> IndexStream<'_> {
        let mut rng = StdRng::seed_from_u64(seed);
        if !self.config.sample_image_in_group {
            let mut pairs = self.intra_pairs.clone();
            pairs.shuffle(&mut rng);
            return Box::new(pairs.into_iter());
        }
        let mut order: Vec<usize> = (0..self.num_groups()).collect();
        order.shuffle(&mut rng);
        Box::new(InGroupIter {
            sampler: self,
            order: order.into_iter(),
            rng,
        })
    }
}

/// Lazily draws one tuple per group in shuffled group order.
struct InGroupIter<'a> {
    sampler: &'a GroupedSampler,
    order: std::vec::IntoIter<usize>,
    rng: StdRng,
}

impl InGroupIter<'_> {
    fn draw(&mut self, group: usize) -> Option<IndexTuple> {
        let sizes = &self.sampler.num_images_per_group;
        let config = &self.sampler.config;
        if self.rng.gen_bool(config.intra_group_prob) {
            let n = sizes[group];
            if n < 2 {
                debug!(group, "skipping group with a single image for intra group sampling");
                return None;
            }
            let picked = rand::seq::index::sample(&mut self.rng, n, 2);
            let (a, b) = (picked.index(0), picked.index(1));
            let (s1, s2) = match config.intra_group_option {
                IntraGroupOption::Forward => (a.min(b), a.max(b)),
                IntraGroupOption::Backward => (a.max(b), a.min(b)),
                IntraGroupOption::Unconstrained => (a, b),
            };
            Some(grouped_tuple(group, s1, group, s2))
        } else {
            // any group but this one
            let mut other = self.rng.gen_range(0..sizes.len() - 1);
            if other >= group {
                other += 1;
            }
            let s1 = self.rng.gen_range(0..sizes[group]);
            let s2 = self.rng.gen_range(0..sizes[other]);
            Some(grouped_tuple(group, s1, other, s2))
        }
    }
}

impl Iterator for InGroupIter<'_> {
    type Item = IndexTuple;

    fn next(&mut self) -> Option<IndexTuple> {
        loop {
            let group = self.order.next()?;
            if let Some(tuple) = self.draw(group) {
                return Some(tuple);
            }
        }
    }
}
