// SampleGenerator — fetch, normalize, validate and split samples
//
// Given the index tuples of a pass, the generator reads the moving and fixed
// arrays from their backends, scales images into [0, 1], checks the
// value/shape contract and emits one sample per selected label channel.
// Everything is pulled lazily: nothing is read before the consumer asks.

use std::collections::VecDeque;
use std::sync::Arc;

use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

use voxreg_core::volume::{label_channel, num_label_channels, spatial_shape, value_bounds};
use voxreg_core::{Error, Result, ValidationError, ValueRange};

use crate::file_loader::FileLoader;
use crate::label::{label_indices, SampleLabel};
use crate::sample::Sample;
use crate::sampler::{IndexStream, IndexTuple};

/// Moving and fixed label backends.
#[derive(Clone)]
pub struct LabelLoaders {
    pub moving: Arc<dyn FileLoader>,
    pub fixed: Arc<dyn FileLoader>,
}

/// Turns index tuples into validated samples.
#[derive(Clone)]
pub struct SampleGenerator {
    moving_images: Arc<dyn FileLoader>,
    fixed_images: Arc<dyn FileLoader>,
    labels: Option<LabelLoaders>,
    sample_label: SampleLabel,
    /// Raw image values are divided by this before validation.
    intensity_scale: f32,
    valid_range: ValueRange,
}

impl SampleGenerator {
    pub fn new(
        moving_images: Arc<dyn FileLoader>,
        fixed_images: Arc<dyn FileLoader>,
        labels: Option<LabelLoaders>,
        sample_label: SampleLabel,
    ) -> Self {
        Self {
            moving_images,
            fixed_images,
            labels,
            sample_label,
            intensity_scale: 255.0,
            valid_range: ValueRange::default(),
        }
    }

    pub fn with_intensity_scale(mut self, scale: f32) -> Self {
        self.intensity_scale = scale;
        self
    }

    pub fn with_valid_range(mut self, range: ValueRange) -> Self {
        self.valid_range = range;
        self
    }

    pub fn labeled(&self) -> bool {
        self.labels.is_some()
    }

    pub fn sample_label(&self) -> SampleLabel {
        self.sample_label
    }

    /// Every backend the generator reads from, label backends included.
    pub fn backends(&self) -> Vec<Arc<dyn FileLoader>> {
        let mut all = vec![self.moving_images.clone(), self.fixed_images.clone()];
        if let Some(labels) = &self.labels {
            all.push(labels.moving.clone());
            all.push(labels.fixed.clone());
        }
        all
    }

    /// Lazy pass over the samples of `indices`.
    ///
    /// `seed` drives the label channel draws of the pass.
    pub fn data_generator<'a>(&'a self, indices: IndexStream<'a>, seed: u64) -> SampleIter<'a> {
        SampleIter {
            generator: self,
            indices,
            rng: StdRng::seed_from_u64(seed),
            pending: VecDeque::new(),
            failed: false,
        }
    }

    fn fetch(&self, tuple: &IndexTuple, rng: &mut StdRng) -> Result<Vec<Sample>> {
        let scale = self.intensity_scale;
        let moving_image = self.moving_images.get_data(tuple.moving)? / scale;
        let fixed_image = self.fixed_images.get_data(tuple.fixed)? / scale;
        let (moving_label, fixed_label) = match &self.labels {
            Some(labels) => (
                Some(labels.moving.get_data(tuple.moving)?),
                Some(labels.fixed.get_data(tuple.fixed)?),
            ),
            None => (None, None),
        };
        self.sample_image_label(
            Some(moving_image),
            Some(fixed_image),
            moving_label,
            fixed_label,
            &tuple.image_indices,
            rng,
        )
    }

    /// Check the value and shape contract of one sample.
    ///
    /// Checks run in a fixed order and the first violation is returned.
    /// Image/label spatial shape mismatches are only logged.
    pub fn validate_images_and_labels(
        &self,
        moving_image: Option<&ArrayD<f32>>,
        fixed_image: Option<&ArrayD<f32>>,
        moving_label: Option<&ArrayD<f32>>,
        fixed_label: Option<&ArrayD<f32>>,
        image_indices: &[i64],
    ) -> Result<()> {
        let fail = |kind: ValidationError| -> Result<()> {
            Err(Error::validation(image_indices, kind))
        };

        let (moving_image, fixed_image) = match (moving_image, fixed_image) {
            (Some(m), Some(f)) => (m, f),
            _ => return fail(ValidationError::MissingImage),
        };
        if moving_label.is_some() != fixed_label.is_some() {
            return fail(ValidationError::LabelPresenceMismatch);
        }

        let arrays = [
            ("moving_image", Some(moving_image)),
            ("fixed_image", Some(fixed_image)),
            ("moving_label", moving_label),
            ("fixed_label", fixed_label),
        ];
        for (name, arr) in arrays {
            if let Some(arr) = arr {
                if !self.valid_range.contains_all(arr) {
                    warn!(
                        name,
                        indices = ?image_indices,
                        observed = ?value_bounds(arr),
                        "values outside the valid range"
                    );
                    return fail(ValidationError::ValueOutOfRange {
                        name,
                        low: self.valid_range.low,
                        high: self.valid_range.high,
                    });
                }
            }
        }

        for (name, arr) in [("moving_image", moving_image), ("fixed_image", fixed_image)] {
            if arr.ndim() != 3 {
                return fail(ValidationError::ImageRank {
                    name,
                    shape: arr.shape().to_vec(),
                });
            }
        }

        if let (Some(moving_label), Some(fixed_label)) = (moving_label, fixed_label) {
            for (name, arr) in [("moving_label", moving_label), ("fixed_label", fixed_label)] {
                if !matches!(arr.ndim(), 3 | 4) {
                    return fail(ValidationError::LabelRank {
                        name,
                        shape: arr.shape().to_vec(),
                    });
                }
            }
            if spatial_shape(moving_image) != spatial_shape(moving_label) {
                warn!(
                    indices = ?image_indices,
                    image = ?moving_image.shape(),
                    label = ?moving_label.shape(),
                    "moving image and label have different shapes"
                );
            }
            if spatial_shape(fixed_image) != spatial_shape(fixed_label) {
                warn!(
                    indices = ?image_indices,
                    image = ?fixed_image.shape(),
                    label = ?fixed_label.shape(),
                    "fixed image and label have different shapes"
                );
            }
            let moving = num_label_channels(moving_label);
            let fixed = num_label_channels(fixed_label);
            if moving != fixed {
                return fail(ValidationError::LabelChannelMismatch { moving, fixed });
            }
        }
        Ok(())
    }

    /// Validate one fetched sample and split it by label channel.
    ///
    /// Returns one sample for unlabeled data and for 3-D labels, and one
    /// sample per channel selected by the label policy for 4-D labels.
    pub fn sample_image_label(
        &self,
        moving_image: Option<ArrayD<f32>>,
        fixed_image: Option<ArrayD<f32>>,
        moving_label: Option<ArrayD<f32>>,
        fixed_label: Option<ArrayD<f32>>,
        image_indices: &[i64],
        rng: &mut StdRng,
    ) -> Result<Vec<Sample>> {
        self.validate_images_and_labels(
            moving_image.as_ref(),
            fixed_image.as_ref(),
            moving_label.as_ref(),
            fixed_label.as_ref(),
            image_indices,
        )?;
        let (Some(moving_image), Some(fixed_image)) = (moving_image, fixed_image) else {
            return Err(Error::validation(image_indices, ValidationError::MissingImage));
        };
        let moving_image = voxreg_core::volume::into_volume(moving_image)?;
        let fixed_image = voxreg_core::volume::into_volume(fixed_image)?;

        let with_label = |label_index: i64| {
            let mut indices = image_indices.to_vec();
            indices.push(label_index);
            indices
        };

        let (moving_label, fixed_label) = match (moving_label, fixed_label) {
            (Some(m), Some(f)) => (m, f),
            _ => {
                return Ok(vec![Sample::unlabeled(moving_image, fixed_image, with_label(-1))]);
            }
        };

        if moving_label.ndim() == 3 {
            return Ok(vec![Sample::labeled(
                moving_image,
                fixed_image,
                voxreg_core::volume::into_volume(moving_label)?,
                voxreg_core::volume::into_volume(fixed_label)?,
                with_label(0),
            )]);
        }

        let channels = label_indices(num_label_channels(&moving_label), self.sample_label, rng)
            .map_err(|e| match e {
                Error::Validation { kind, .. } => Error::validation(image_indices, kind),
                other => other,
            })?;
        channels
            .into_iter()
            .map(|ch| -> Result<Sample> {
                Ok(Sample::labeled(
                    moving_image.clone(),
                    fixed_image.clone(),
                    label_channel(&moving_label, ch)?,
                    label_channel(&fixed_label, ch)?,
                    with_label(i64::try_from(ch).unwrap_or(i64::MAX)),
                ))
            })
            .collect()
    }
}

/// Samples of one pass, in index order.
///
/// The first error ends the pass: it is yielded once and the iterator then
/// returns `None`.
pub struct SampleIter<'a> {
    generator: &'a SampleGenerator,
    indices: IndexStream<'a>,
    rng: StdRng,
    pending: VecDeque<Sample>,
    failed: bool,
}

impl Iterator for SampleIter<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Some(Ok(sample));
            }
            let tuple = self.indices.next()?;
            match self.generator.fetch(&tuple, &mut self.rng) {
                Ok(samples) => self.pending.extend(samples),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFileLoader;
    use ndarray::IxDyn;

    fn volume(shape: &[usize], v: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(shape), v)
    }

    fn generator(labeled: bool, sample_label: SampleLabel) -> SampleGenerator {
        let images: Arc<dyn FileLoader> = Arc::new(MemoryFileLoader::from_arrays(
            "images",
            vec![volume(&[2, 2, 2], 255.0), volume(&[2, 2, 2], 0.0)],
        ));
        let labels = labeled.then(|| {
            let l: Arc<dyn FileLoader> = Arc::new(MemoryFileLoader::from_arrays(
                "labels",
                vec![volume(&[2, 2, 2, 3], 1.0), volume(&[2, 2, 2, 3], 0.0)],
            ));
            LabelLoaders {
                moving: l.clone(),
                fixed: l,
            }
        });
        SampleGenerator::new(images.clone(), images, labels, sample_label)
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn unlabeled_sample_gets_minus_one() {
        let sg = generator(false, SampleLabel::Sample);
        let out = sg
            .sample_image_label(
                Some(volume(&[2, 2, 2], 0.5)),
                Some(volume(&[2, 2, 2], 0.5)),
                None,
                None,
                &[4],
                &mut rng(),
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].indices, vec![4, -1]);
        assert!(!out[0].is_labeled());
    }

    #[test]
    fn three_dim_label_gets_zero() {
        let sg = generator(true, SampleLabel::All);
        let out = sg
            .sample_image_label(
                Some(volume(&[2, 2, 2], 0.5)),
                Some(volume(&[2, 2, 2], 0.5)),
                Some(volume(&[2, 2, 2], 1.0)),
                Some(volume(&[2, 2, 2], 0.0)),
                &[1, 2],
                &mut rng(),
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].indices, vec![1, 2, 0]);
    }

    #[test]
    fn all_policy_splits_channels() {
        let sg = generator(true, SampleLabel::All);
        let mut label = volume(&[2, 2, 2, 3], 0.0);
        label[[0, 0, 0, 2]] = 1.0;
        let out = sg
            .sample_image_label(
                Some(volume(&[2, 2, 2], 0.5)),
                Some(volume(&[2, 2, 2], 0.5)),
                Some(label.clone()),
                Some(label),
                &[0],
                &mut rng(),
            )
            .unwrap();
        let indices: Vec<_> = out.iter().map(|s| s.indices.clone()).collect();
        assert_eq!(indices, vec![vec![0, 0], vec![0, 1], vec![0, 2]]);
        assert_eq!(out[2].moving_label().unwrap()[[0, 0, 0]], 1.0);
        assert_eq!(out[1].moving_label().unwrap().sum(), 0.0);
    }

    fn failure(
        sg: &SampleGenerator,
        moving_image: Option<&ArrayD<f32>>,
        fixed_image: Option<&ArrayD<f32>>,
        moving_label: Option<&ArrayD<f32>>,
        fixed_label: Option<&ArrayD<f32>>,
    ) -> Option<ValidationError> {
        let result = sg.validate_images_and_labels(
            moving_image,
            fixed_image,
            moving_label,
            fixed_label,
            &[9],
        );
        match result {
            Err(Error::Validation { indices, kind }) => {
                assert_eq!(indices, vec![9]);
                Some(kind)
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(()) => None,
        }
    }

    #[test]
    fn validation_order_and_kinds() {
        let sg = generator(true, SampleLabel::All);
        let img = volume(&[2, 2, 2], 0.5);

        assert_eq!(
            failure(&sg, None, Some(&img), None, None),
            Some(ValidationError::MissingImage)
        );
        assert_eq!(
            failure(&sg, Some(&img), Some(&img), Some(&img), None),
            Some(ValidationError::LabelPresenceMismatch)
        );

        let bright = volume(&[2, 2, 2], 1.5);
        assert!(matches!(
            failure(&sg, Some(&bright), Some(&img), None, None),
            Some(ValidationError::ValueOutOfRange { name: "moving_image", .. })
        ));

        let nan = volume(&[2, 2, 2], f32::NAN);
        assert!(matches!(
            failure(&sg, Some(&img), Some(&nan), None, None),
            Some(ValidationError::ValueOutOfRange { name: "fixed_image", .. })
        ));

        // range is checked before rank
        let flat = volume(&[2, 2], 0.5);
        assert!(matches!(
            failure(&sg, Some(&flat), Some(&img), None, None),
            Some(ValidationError::ImageRank { .. })
        ));

        let deep = volume(&[2, 2, 2, 2, 2], 0.0);
        assert!(matches!(
            failure(&sg, Some(&img), Some(&img), Some(&deep), Some(&deep)),
            Some(ValidationError::LabelRank { .. })
        ));

        let two = volume(&[2, 2, 2, 2], 0.0);
        let three = volume(&[2, 2, 2, 3], 0.0);
        assert_eq!(
            failure(&sg, Some(&img), Some(&img), Some(&two), Some(&three)),
            Some(ValidationError::LabelChannelMismatch { moving: 2, fixed: 3 })
        );

        let small_label = volume(&[1, 1, 1], 0.0);
        assert_eq!(
            failure(&sg, Some(&img), Some(&img), Some(&small_label), Some(&small_label)),
            None
        );
    }

    #[test]
    fn fixed_policy_out_of_range_carries_indices() {
        let sg = generator(true, SampleLabel::Fixed(5));
        let label = volume(&[2, 2, 2, 3], 0.0);
        let err = sg
            .sample_image_label(
                Some(volume(&[2, 2, 2], 0.5)),
                Some(volume(&[2, 2, 2], 0.5)),
                Some(label.clone()),
                Some(label),
                &[3],
                &mut rng(),
            )
            .unwrap_err();
        match err {
            Error::Validation { indices, kind } => {
                assert_eq!(indices, vec![3]);
                assert!(matches!(kind, ValidationError::LabelIndexOutOfRange { index: 5, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn generator_scales_images() {
        let sg = generator(false, SampleLabel::Sample);
        let tuples = vec![IndexTuple {
            moving: crate::file_loader::DataIndex::Flat(0),
            fixed: crate::file_loader::DataIndex::Flat(1),
            image_indices: vec![0, 1],
        }];
        let samples: Vec<_> = sg
            .data_generator(Box::new(tuples.into_iter()), 0)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].moving_image[[0, 0, 0]], 1.0);
        assert_eq!(samples[0].fixed_image[[0, 0, 0]], 0.0);
        assert_eq!(samples[0].indices, vec![0, 1, -1]);
    }

    #[test]
    fn generator_stops_after_first_error() {
        let sg = generator(false, SampleLabel::Sample);
        let bad = IndexTuple {
            moving: crate::file_loader::DataIndex::Flat(7),
            fixed: crate::file_loader::DataIndex::Flat(0),
            image_indices: vec![7],
        };
        let good = IndexTuple {
            moving: crate::file_loader::DataIndex::Flat(0),
            fixed: crate::file_loader::DataIndex::Flat(0),
            image_indices: vec![0],
        };
        let mut it = sg.data_generator(Box::new(vec![bad, good].into_iter()), 0);
        assert!(matches!(it.next(), Some(Err(Error::IndexOutOfRange { .. }))));
        assert!(it.next().is_none());
    }
}
