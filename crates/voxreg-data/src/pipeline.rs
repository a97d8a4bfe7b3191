// Preprocessing pipeline — from a loader's sample passes to training batches
//
// Stages, in order:
//   1. resize every sample to the loader's shapes (rayon, chunk by chunk)
//   2. windowed shuffle, training only, reseeded for every pass
//   3. repeat passes until the consumer stops pulling
//   4. batch, dropping a trailing partial batch when training
//   5. random affine augmentation, training only
//
// Shuffling happens inside a pass, so samples never cross from one pass to
// the next before batching. Batches do cross pass boundaries under repeat.
// Every stage is lazy and stops after yielding the first error.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use voxreg_core::{Error, ImageShape, Result};

use crate::augment::{AffineTransformation3D, BatchAugment};
use crate::batch::Batch;
use crate::loader::{DataLoader, SampleStream};
use crate::sample::Sample;
use crate::transform::{Resize, TrilinearResize};

/// Stream of preprocessed batches.
pub type BatchStream<'a> = Box<dyn Iterator<Item = Result<Batch>> + Send + 'a>;

/// Configuration of [`DataLoader::get_dataset_and_preprocess`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Enables shuffling, drops trailing partial batches and turns on
    /// affine augmentation.
    pub training: bool,
    /// Number of samples per batch.
    pub batch_size: usize,
    /// Restart the loader at the end of every pass.
    pub repeat: bool,
    /// Shuffle buffer size, in batches. 0 disables shuffling.
    pub shuffle_buffer_num_batch: usize,
    /// Samples resized per parallel chunk (0 = rayon's thread count).
    pub num_workers: usize,
    /// Seed for shuffling and augmentation; random when unset.
    pub seed: Option<u64>,
    /// Corner scaling range of the affine augmentation.
    pub affine_scale: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            training: false,
            batch_size: 1,
            repeat: false,
            shuffle_buffer_num_batch: 0,
            num_workers: 0,
            seed: None,
            affine_scale: 0.1,
        }
    }
}

impl PreprocessConfig {
    pub fn training(mut self, t: bool) -> Self {
        self.training = t;
        self
    }

    pub fn batch_size(mut self, bs: usize) -> Self {
        self.batch_size = bs;
        self
    }

    pub fn repeat(mut self, r: bool) -> Self {
        self.repeat = r;
        self
    }

    pub fn shuffle_buffer_num_batch(mut self, n: usize) -> Self {
        self.shuffle_buffer_num_batch = n;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }

    pub fn affine_scale(mut self, scale: f64) -> Self {
        self.affine_scale = scale;
        self
    }

    /// Shuffle buffer size in samples; 0 when shuffling is off.
    pub fn shuffle_buffer_size(&self) -> Result<usize> {
        if !self.training {
            return Ok(0);
        }
        self.batch_size
            .checked_mul(self.shuffle_buffer_num_batch)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "shuffle buffer of {} batches of {} samples overflows",
                    self.shuffle_buffer_num_batch, self.batch_size
                ))
            })
    }

    /// Check the parameters before any data is read.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.affine_scale) {
            return Err(Error::Configuration(format!(
                "affine scale should be between 0 and 1, got {}",
                self.affine_scale
            )));
        }
        self.shuffle_buffer_size().map(|_| ())
    }
}

/// Build the batch stream of `loader` as configured.
pub fn preprocess<'a, L>(loader: &'a L, config: &PreprocessConfig) -> Result<BatchStream<'a>>
where
    L: DataLoader + ?Sized,
{
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or_else(|| thread_rng().gen()));
    let chunk_size = match config.num_workers {
        0 => rayon::current_num_threads(),
        n => n,
    };
    let moving_shape = loader.moving_image_shape();
    let fixed_shape = loader.fixed_image_shape();
    debug!(
        training = config.training,
        batch_size = config.batch_size,
        repeat = config.repeat,
        shuffle_buffer_num_batch = config.shuffle_buffer_num_batch,
        chunk_size,
        "building preprocessing pipeline"
    );

    let passes = Passes {
        loader,
        repeat: config.repeat,
        shuffle_buffer_size: config.shuffle_buffer_size()?,
        chunk_size,
        moving_shape,
        fixed_shape,
        rng: StdRng::seed_from_u64(rng.gen()),
        current: None,
        yielded_in_pass: false,
        done: false,
    };
    let batches = Batches {
        samples: passes,
        batch_size: config.batch_size,
        drop_remainder: config.training,
        done: false,
    };
    if !config.training {
        return Ok(Box::new(batches));
    }
    let augment = AffineTransformation3D::new(moving_shape, fixed_shape, config.batch_size)
        .with_scale(config.affine_scale)
        .with_seed(rng.gen());
    Ok(Box::new(Augmented {
        batches,
        augment,
        done: false,
    }))
}

// Resize stage

/// Resizes samples chunk by chunk on rayon's pool, preserving order.
struct Resized<'a> {
    source: SampleStream<'a>,
    resize: TrilinearResize,
    moving_shape: ImageShape,
    fixed_shape: ImageShape,
    chunk_size: usize,
    ready: VecDeque<Result<Sample>>,
    done: bool,
}

impl Resized<'_> {
    fn fill(&mut self) {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.source.next() {
                Some(Ok(s)) => chunk.push(s),
                Some(Err(e)) => {
                    self.done = true;
                    let resized = self.resize_chunk(chunk);
                    self.ready.extend(resized);
                    self.ready.push_back(Err(e));
                    return;
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        let resized = self.resize_chunk(chunk);
        self.ready.extend(resized);
    }

    fn resize_chunk(&self, chunk: Vec<Sample>) -> Vec<Result<Sample>> {
        let resize = &self.resize;
        let (m, f) = (self.moving_shape, self.fixed_shape);
        chunk
            .into_par_iter()
            .map(|s| resize.resize(s, m, f))
            .collect()
    }
}

impl Iterator for Resized<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        if self.ready.is_empty() && !self.done {
            self.fill();
        }
        let item = self.ready.pop_front()?;
        if item.is_err() {
            self.ready.clear();
            self.done = true;
        }
        Some(item)
    }
}

// Shuffle stage

/// Windowed shuffle: keeps `size` samples and emits a random one each step.
struct ShuffleBuffer<S> {
    source: S,
    size: usize,
    buffer: Vec<Sample>,
    rng: StdRng,
    exhausted: bool,
}

impl<S> ShuffleBuffer<S> {
    fn new(source: S, size: usize, seed: u64) -> Self {
        Self {
            source,
            size,
            buffer: Vec::with_capacity(size),
            rng: StdRng::seed_from_u64(seed),
            exhausted: false,
        }
    }
}

impl<S> Iterator for ShuffleBuffer<S>
where
    S: Iterator<Item = Result<Sample>>,
{
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        while !self.exhausted && self.buffer.len() < self.size {
            match self.source.next() {
                Some(Ok(s)) => self.buffer.push(s),
                Some(Err(e)) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
                None => self.exhausted = true,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let i = self.rng.gen_range(0..self.buffer.len());
        Some(Ok(self.buffer.swap_remove(i)))
    }
}

// Repeat stage

type PassStream<'a> = Box<dyn Iterator<Item = Result<Sample>> + Send + 'a>;

/// Concatenates passes of a loader, each resized and shuffled on its own.
///
/// Without `repeat` there is a single pass. A pass that yields nothing
/// ends the stream.
struct Passes<'a, L: DataLoader + ?Sized> {
    loader: &'a L,
    repeat: bool,
    shuffle_buffer_size: usize,
    chunk_size: usize,
    moving_shape: ImageShape,
    fixed_shape: ImageShape,
    rng: StdRng,
    current: Option<PassStream<'a>>,
    yielded_in_pass: bool,
    done: bool,
}

impl<'a, L: DataLoader + ?Sized> Passes<'a, L> {
    fn open_pass(&mut self) -> Result<PassStream<'a>> {
        let resized = Resized {
            source: self.loader.get_dataset()?,
            resize: TrilinearResize::new(),
            moving_shape: self.moving_shape,
            fixed_shape: self.fixed_shape,
            chunk_size: self.chunk_size,
            ready: VecDeque::new(),
            done: false,
        };
        if self.shuffle_buffer_size > 0 {
            let seed = self.rng.gen();
            Ok(Box::new(ShuffleBuffer::new(resized, self.shuffle_buffer_size, seed)))
        } else {
            Ok(Box::new(resized))
        }
    }
}

impl<L: DataLoader + ?Sized> Iterator for Passes<'_, L> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        loop {
            if self.done {
                return None;
            }
            if let Some(pass) = self.current.as_mut() {
                match pass.next() {
                    Some(Ok(s)) => {
                        self.yielded_in_pass = true;
                        return Some(Ok(s));
                    }
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => {
                        self.current = None;
                        if !self.repeat || !self.yielded_in_pass {
                            self.done = true;
                            return None;
                        }
                    }
                }
            } else {
                match self.open_pass() {
                    Ok(pass) => {
                        self.current = Some(pass);
                        self.yielded_in_pass = false;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

// Batch stage

struct Batches<I> {
    samples: I,
    batch_size: usize,
    drop_remainder: bool,
    done: bool,
}

impl<I> Iterator for Batches<I>
where
    I: Iterator<Item = Result<Sample>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.done {
            return None;
        }
        let mut pending = Vec::with_capacity(self.batch_size);
        while pending.len() < self.batch_size {
            match self.samples.next() {
                Some(Ok(s)) => pending.push(s),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if pending.is_empty() || (pending.len() < self.batch_size && self.drop_remainder) {
            return None;
        }
        let batch = Batch::collate(pending);
        if batch.is_err() {
            self.done = true;
        }
        Some(batch)
    }
}

// Augment stage

struct Augmented<I> {
    batches: I,
    augment: AffineTransformation3D,
    done: bool,
}

impl<I> Iterator for Augmented<I>
where
    I: Iterator<Item = Result<Batch>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.done {
            return None;
        }
        let out = self.batches.next()?.and_then(|b| self.augment.transform(b));
        if out.is_err() {
            self.done = true;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn samples(n: usize) -> Vec<Result<Sample>> {
        (0..n)
            .map(|i| {
                let img = Array3::from_elem((2, 2, 2), 0.5);
                Ok(Sample::unlabeled(img.clone(), img, vec![i as i64, -1]))
            })
            .collect()
    }

    #[test]
    fn config_validation() {
        assert!(PreprocessConfig::default().validate().is_ok());
        assert!(matches!(
            PreprocessConfig::default().batch_size(0).validate(),
            Err(Error::Configuration(_))
        ));
        let overflow = PreprocessConfig::default()
            .training(true)
            .batch_size(usize::MAX)
            .shuffle_buffer_num_batch(2);
        assert!(matches!(overflow.validate(), Err(Error::Configuration(_))));
        assert!(PreprocessConfig::default().affine_scale(1.5).validate().is_err());
    }

    #[test]
    fn shuffle_buffer_is_a_permutation() {
        let shuffled: Vec<i64> = ShuffleBuffer::new(samples(10).into_iter(), 4, 3)
            .map(|s| s.unwrap().indices[0])
            .collect();
        let mut sorted = shuffled.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn batches_keep_or_drop_remainder() {
        let kept: Vec<_> = Batches {
            samples: samples(5).into_iter(),
            batch_size: 2,
            drop_remainder: false,
            done: false,
        }
        .map(|b| b.unwrap().len())
        .collect();
        assert_eq!(kept, vec![2, 2, 1]);

        let dropped: Vec<_> = Batches {
            samples: samples(5).into_iter(),
            batch_size: 2,
            drop_remainder: true,
            done: false,
        }
        .map(|b| b.unwrap().len())
        .collect();
        assert_eq!(dropped, vec![2, 2]);
    }

    #[test]
    fn batches_stop_after_error() {
        let mut input = samples(3);
        input.insert(1, Err(Error::msg("broken sample")));
        let mut it = Batches {
            samples: input.into_iter(),
            batch_size: 2,
            drop_remainder: false,
            done: false,
        };
        assert!(it.next().unwrap().is_err());
        assert!(it.next().is_none());
    }
}
