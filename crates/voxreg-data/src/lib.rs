//! # voxreg-data
//!
//! Data loading and sampling for 3-D image registration.
//!
//! This crate provides:
//! - [`FileLoader`] trait — storage backend for one role of the data
//! - [`MemoryFileLoader`] — in-memory backend, flat or grouped
//! - [`DataLoader`] trait — lazy, restartable passes of samples
//! - [`PairedDataLoader`], [`UnpairedDataLoader`], [`GroupedDataLoader`]
//! - [`ConcatenatedDataLoader`] — several loaders behind one stream
//! - [`SampleGenerator`] — fetch, normalize, validate, split by label
//! - Index samplers for paired, unpaired and grouped data
//! - Preprocessing: trilinear resize, windowed shuffle, repeat, batching
//!   and random affine augmentation
//!
//! Every sample carries an `indices` vector: the identifying image indices
//! followed by the label channel, `-1` for unlabeled data.

pub mod augment;
pub mod batch;
pub mod combinators;
pub mod file_loader;
pub mod generator;
pub mod label;
pub mod loader;
pub mod memory;
pub mod pipeline;
pub mod sample;
pub mod sampler;
pub mod transform;

pub use augment::{Affine, AffineTransformation3D, BatchAugment};
pub use batch::{Batch, BatchLabels};
pub use combinators::ConcatenatedDataLoader;
pub use file_loader::{DataIndex, FileLoader, GroupStructure};
pub use generator::{LabelLoaders, SampleGenerator, SampleIter};
pub use label::{label_indices, SampleLabel};
pub use loader::{
    DataLoader, GeneratorDataLoader, GroupedDataLoader, LoaderConfig, PairedDataLoader,
    SampleStream, UnpairedDataLoader,
};
pub use memory::MemoryFileLoader;
pub use pipeline::{BatchStream, PreprocessConfig};
pub use sample::{LabelPair, Sample};
pub use sampler::{
    GroupedSampler, GroupedSamplingConfig, IndexSampler, IndexStream, IndexTuple, IntraGroupOption,
    PairedSampler, UnpairedSampler,
};
pub use transform::{Resize, TrilinearResize};
