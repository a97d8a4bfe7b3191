// DataLoader — paired, unpaired and grouped registration loaders
//
// A loader ties backends, an index sampler and a sample generator together.
// `get_dataset()` starts a new pass: the sampler enumerates index tuples for
// the pass seed and the generator turns them into validated samples.
// `get_dataset_and_preprocess()` adds resizing, shuffling, repetition,
// batching and augmentation on top.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rand::{thread_rng, Rng};
use tracing::{debug, info, warn};

use voxreg_core::{Error, ImageShape, Result, ValueRange};

use crate::file_loader::FileLoader;
use crate::generator::{LabelLoaders, SampleGenerator};
use crate::label::SampleLabel;
use crate::pipeline::{self, BatchStream, PreprocessConfig};
use crate::sample::Sample;
use crate::sampler::{
    GroupedSampler, GroupedSamplingConfig, IndexSampler, PairedSampler, UnpairedSampler,
};

/// Stream of samples of one pass.
pub type SampleStream<'a> = Box<dyn Iterator<Item = Result<Sample>> + Send + 'a>;

/// A source of registration samples.
pub trait DataLoader: Send + Sync {
    /// Shape moving images (and labels) are resized to.
    fn moving_image_shape(&self) -> ImageShape;

    /// Shape fixed images (and labels) are resized to.
    fn fixed_image_shape(&self) -> ImageShape;

    /// Number of index tuples in one pass.
    ///
    /// With the `All` label policy a tuple may yield several samples.
    fn num_samples(&self) -> usize;

    /// Whether samples carry labels; `None` when the loader mixes sources.
    fn labeled(&self) -> Option<bool>;

    /// Length of a sample's `indices`; `None` when the loader mixes sources.
    fn num_indices(&self) -> Option<usize>;

    /// Start a new pass over the data.
    fn get_dataset(&self) -> Result<SampleStream<'_>>;

    /// Start a preprocessed, batched stream over the data.
    fn get_dataset_and_preprocess(&self, config: &PreprocessConfig) -> Result<BatchStream<'_>> {
        pipeline::preprocess(self, config)
    }

    /// Close every backend. Safe to call more than once.
    fn close(&self) -> Result<()>;
}

/// Options shared by all generator-backed loaders.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Base seed of the index sampler and the label draws. Random when
    /// unset.
    pub seed: Option<u64>,
    /// Use `seed + pass` as the seed of each pass instead of `seed`.
    pub reseed_each_epoch: bool,
    /// Label channel policy for multi-label volumes.
    pub sample_label: SampleLabel,
    /// Raw image values are divided by this.
    pub intensity_scale: f32,
    /// Valid range of normalized values.
    pub valid_range: ValueRange,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            seed: None,
            reseed_each_epoch: true,
            sample_label: SampleLabel::Sample,
            intensity_scale: 255.0,
            valid_range: ValueRange::default(),
        }
    }
}

impl LoaderConfig {
    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }

    pub fn reseed_each_epoch(mut self, r: bool) -> Self {
        self.reseed_each_epoch = r;
        self
    }

    pub fn sample_label(mut self, policy: SampleLabel) -> Self {
        self.sample_label = policy;
        self
    }

    pub fn intensity_scale(mut self, scale: f32) -> Self {
        self.intensity_scale = scale;
        self
    }

    pub fn valid_range(mut self, range: ValueRange) -> Self {
        self.valid_range = range;
        self
    }
}

/// A loader that draws index tuples from a sampler and reads them through
/// a [`SampleGenerator`].
pub struct GeneratorDataLoader<S> {
    kind: &'static str,
    moving_image_shape: ImageShape,
    fixed_image_shape: ImageShape,
    generator: SampleGenerator,
    sampler: S,
    seed: u64,
    reseed_each_epoch: bool,
    epoch: AtomicU64,
    closed: AtomicBool,
}

/// Moving and fixed images come from separate, aligned backends.
pub type PairedDataLoader = GeneratorDataLoader<PairedSampler>;

/// Moving and fixed images are drawn from the same flat backend.
pub type UnpairedDataLoader = GeneratorDataLoader<UnpairedSampler>;

/// Moving and fixed images are drawn from the same grouped backend.
pub type GroupedDataLoader = GeneratorDataLoader<GroupedSampler>;

/// Fail unless `left` and `right` hold the same number of entries with the
/// same ids.
fn check_aligned(left: &dyn FileLoader, right: &dyn FileLoader) -> Result<()> {
    let (left_count, right_count) = (left.get_num_images(), right.get_num_images());
    if left_count != right_count {
        return Err(Error::ImageCountMismatch {
            left: left.name().to_string(),
            left_count,
            right: right.name().to_string(),
            right_count,
        });
    }
    if left.get_data_ids()? != right.get_data_ids()? {
        return Err(Error::DataIdMismatch {
            left: left.name().to_string(),
            right: right.name().to_string(),
        });
    }
    Ok(())
}

impl<S: IndexSampler> GeneratorDataLoader<S> {
    fn build(
        kind: &'static str,
        shapes: (ImageShape, ImageShape),
        generator: SampleGenerator,
        sampler: S,
        config: &LoaderConfig,
    ) -> Self {
        let seed = config.seed.unwrap_or_else(|| thread_rng().gen());
        let loader = Self {
            kind,
            moving_image_shape: shapes.0,
            fixed_image_shape: shapes.1,
            generator: generator
                .with_intensity_scale(config.intensity_scale)
                .with_valid_range(config.valid_range),
            sampler,
            seed,
            reseed_each_epoch: config.reseed_each_epoch,
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        info!(
            kind,
            num_samples = loader.sampler.num_samples(),
            labeled = loader.generator.labeled(),
            moving_image_shape = %loader.moving_image_shape,
            fixed_image_shape = %loader.fixed_image_shape,
            "data loader ready"
        );
        loader
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn generator(&self) -> &SampleGenerator {
        &self.generator
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seed of the given pass.
    pub fn pass_seed(&self, pass: u64) -> u64 {
        if self.reseed_each_epoch {
            self.seed.wrapping_add(pass)
        } else {
            self.seed
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl GeneratorDataLoader<PairedSampler> {
    /// Create a paired loader.
    ///
    /// Moving and fixed backends must hold the same images, by count and
    /// by id. Label backends, when given, must both be given and align with
    /// the image backend of their role.
    pub fn new(
        moving_images: Box<dyn FileLoader>,
        fixed_images: Box<dyn FileLoader>,
        moving_labels: Option<Box<dyn FileLoader>>,
        fixed_labels: Option<Box<dyn FileLoader>>,
        moving_image_shape: &[usize],
        fixed_image_shape: &[usize],
        config: LoaderConfig,
    ) -> Result<Self> {
        let shapes = (
            ImageShape::from_slice(moving_image_shape)?,
            ImageShape::from_slice(fixed_image_shape)?,
        );
        check_aligned(moving_images.as_ref(), fixed_images.as_ref())?;
        let labels = match (moving_labels, fixed_labels) {
            (Some(moving), Some(fixed)) => {
                check_aligned(moving_images.as_ref(), moving.as_ref())?;
                check_aligned(fixed_images.as_ref(), fixed.as_ref())?;
                Some(LabelLoaders {
                    moving: Arc::from(moving),
                    fixed: Arc::from(fixed),
                })
            }
            (None, None) => None,
            _ => return Err(Error::LabelBackendMismatch),
        };
        let sampler = PairedSampler::new(moving_images.get_num_images());
        let generator = SampleGenerator::new(
            Arc::from(moving_images),
            Arc::from(fixed_images),
            labels,
            config.sample_label,
        );
        Ok(Self::build("paired", shapes, generator, sampler, &config))
    }
}

/// Share one image backend (and one label backend) between both roles.
fn shared_generator(
    images: Box<dyn FileLoader>,
    labels: Option<Box<dyn FileLoader>>,
    sample_label: SampleLabel,
) -> SampleGenerator {
    let images: Arc<dyn FileLoader> = Arc::from(images);
    let labels = labels.map(|l| {
        let l: Arc<dyn FileLoader> = Arc::from(l);
        LabelLoaders {
            moving: l.clone(),
            fixed: l,
        }
    });
    SampleGenerator::new(images.clone(), images, labels, sample_label)
}

impl GeneratorDataLoader<UnpairedSampler> {
    /// Create an unpaired loader over a flat backend.
    pub fn new(
        images: Box<dyn FileLoader>,
        labels: Option<Box<dyn FileLoader>>,
        image_shape: &[usize],
        config: LoaderConfig,
    ) -> Result<Self> {
        let shape = ImageShape::from_slice(image_shape)?;
        if let Some(labels) = &labels {
            check_aligned(images.as_ref(), labels.as_ref())?;
        }
        let num_images = images.get_num_images();
        if num_images % 2 == 1 {
            debug!(num_images, "odd number of images, one is left out of every pass");
        }
        let sampler = UnpairedSampler::new(num_images);
        let generator = shared_generator(images, labels, config.sample_label);
        Ok(Self::build("unpaired", (shape, shape), generator, sampler, &config))
    }
}

impl GeneratorDataLoader<GroupedSampler> {
    /// Create an unpaired loader over a grouped backend.
    ///
    /// Both backends must be grouped. Reads their group structure; any empty
    /// group fails.
    pub fn new(
        mut images: Box<dyn FileLoader>,
        mut labels: Option<Box<dyn FileLoader>>,
        image_shape: &[usize],
        sampling: GroupedSamplingConfig,
        config: LoaderConfig,
    ) -> Result<Self> {
        let shape = ImageShape::from_slice(image_shape)?;
        for backend in std::iter::once(&images).chain(labels.as_ref()) {
            if !backend.is_grouped() {
                return Err(Error::Unsupported {
                    backend: backend.name().to_string(),
                    operation: "grouped sampling",
                });
            }
        }
        images.set_group_structure()?;
        let num_images_per_group = images.get_num_images_per_group()?;
        if let Some(labels) = labels.as_mut() {
            labels.set_group_structure()?;
            check_aligned(images.as_ref(), &**labels)?;
            if labels.get_num_images_per_group()? != num_images_per_group {
                return Err(Error::GroupedSampling(format!(
                    "groups of {} do not match groups of {}",
                    labels.name(),
                    images.name()
                )));
            }
        }
        let sampler = GroupedSampler::new(num_images_per_group, sampling)?;
        let generator = shared_generator(images, labels, config.sample_label);
        Ok(Self::build("grouped", (shape, shape), generator, sampler, &config))
    }
}

impl<S: IndexSampler> DataLoader for GeneratorDataLoader<S> {
    fn moving_image_shape(&self) -> ImageShape {
        self.moving_image_shape
    }

    fn fixed_image_shape(&self) -> ImageShape {
        self.fixed_image_shape
    }

    fn num_samples(&self) -> usize {
        self.sampler.num_samples()
    }

    fn labeled(&self) -> Option<bool> {
        Some(self.generator.labeled())
    }

    fn num_indices(&self) -> Option<usize> {
        Some(self.sampler.num_indices())
    }

    fn get_dataset(&self) -> Result<SampleStream<'_>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let pass = self.epoch.fetch_add(1, Ordering::SeqCst);
        let seed = self.pass_seed(pass);
        debug!(kind = self.kind, pass, seed, "starting pass");
        let indices = self.sampler.sample_index_generator(seed);
        Ok(Box::new(self.generator.data_generator(indices, seed)))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut backends: Vec<Arc<dyn FileLoader>> = Vec::new();
        for backend in self.generator.backends() {
            if !backends.iter().any(|b| Arc::ptr_eq(b, &backend)) {
                backends.push(backend);
            }
        }
        let failures: Vec<Error> = backends
            .iter()
            .filter_map(|b| b.close().err())
            .collect();
        if failures.is_empty() {
            info!(kind = self.kind, backends = backends.len(), "data loader closed");
        } else {
            warn!(kind = self.kind, failed = failures.len(), "some backends failed to close");
        }
        Error::from_close_failures(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFileLoader;
    use ndarray::{ArrayD, IxDyn};

    fn backend(name: &str, n: usize) -> Box<dyn FileLoader> {
        let arrays = (0..n)
            .map(|i| ArrayD::from_elem(IxDyn(&[2, 2, 2]), i as f32))
            .collect();
        Box::new(MemoryFileLoader::from_arrays(name, arrays))
    }

    #[test]
    fn paired_rejects_bad_shapes() {
        let err = PairedDataLoader::new(
            backend("m", 2),
            backend("f", 2),
            None,
            None,
            &[2, 2],
            &[2, 2, 2],
            LoaderConfig::default(),
        );
        assert!(matches!(err, Err(Error::InvalidShape { .. })));
    }

    #[test]
    fn paired_rejects_count_mismatch() {
        let err = PairedDataLoader::new(
            backend("m", 2),
            backend("f", 3),
            None,
            None,
            &[2, 2, 2],
            &[2, 2, 2],
            LoaderConfig::default(),
        );
        assert!(matches!(err, Err(Error::ImageCountMismatch { .. })));
    }

    #[test]
    fn paired_rejects_half_labeled() {
        let err = PairedDataLoader::new(
            backend("m", 2),
            backend("f", 2),
            Some(backend("ml", 2)),
            None,
            &[2, 2, 2],
            &[2, 2, 2],
            LoaderConfig::default(),
        );
        assert!(matches!(err, Err(Error::LabelBackendMismatch)));
    }

    #[test]
    fn pass_seeds_advance_per_epoch() {
        let loader = UnpairedDataLoader::new(
            backend("images", 4),
            None,
            &[2, 2, 2],
            LoaderConfig::default().seed(10),
        )
        .unwrap();
        assert_eq!(loader.pass_seed(0), 10);
        assert_eq!(loader.pass_seed(3), 13);

        let fixed = UnpairedDataLoader::new(
            backend("images", 4),
            None,
            &[2, 2, 2],
            LoaderConfig::default().seed(10).reseed_each_epoch(false),
        )
        .unwrap();
        assert_eq!(fixed.pass_seed(3), 10);
    }

    #[test]
    fn closed_loader_refuses_passes() {
        let loader =
            UnpairedDataLoader::new(backend("images", 4), None, &[2, 2, 2], LoaderConfig::default())
                .unwrap();
        loader.close().unwrap();
        loader.close().unwrap();
        assert!(loader.is_closed());
        assert!(matches!(loader.get_dataset().err(), Some(Error::Closed)));
    }
}
