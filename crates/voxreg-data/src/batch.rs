// Batch — samples stacked along a leading batch axis

use ndarray::{stack, Array2, Array3, Array4, ArrayView3, Axis};

use voxreg_core::{Error, Result};

use crate::sample::Sample;

/// Stacked moving and fixed labels, `[B, W, H, D]` each.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLabels {
    pub moving: Array4<f32>,
    pub fixed: Array4<f32>,
}

/// A batch of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[B, W, H, D]`
    pub moving_images: Array4<f32>,
    /// `[B, W, H, D]`
    pub fixed_images: Array4<f32>,
    pub labels: Option<BatchLabels>,
    /// `[B, num_indices]`
    pub indices: Array2<i64>,
}

fn stack_volumes<'a>(
    what: &str,
    views: impl Iterator<Item = &'a Array3<f32>>,
) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<'_, f32>> = views.map(|v| v.view()).collect();
    stack(Axis(0), &views).map_err(|e| Error::Collate(format!("{what}: {e}")))
}

impl Batch {
    /// Stack samples into a batch.
    ///
    /// All samples must agree on labeling, on the shape of each role and
    /// on the number of indices.
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| Error::Collate("cannot build a batch from zero samples".to_string()))?;
        let labeled = first.is_labeled();
        let num_indices = first.indices.len();
        if samples.iter().any(|s| s.is_labeled() != labeled) {
            return Err(Error::Collate(
                "labeled and unlabeled samples in the same batch".to_string(),
            ));
        }
        if let Some(s) = samples.iter().find(|s| s.indices.len() != num_indices) {
            return Err(Error::Collate(format!(
                "sample {:?} has {} indices, expected {num_indices}",
                s.indices,
                s.indices.len()
            )));
        }

        let moving_images = stack_volumes("moving_image", samples.iter().map(|s| &s.moving_image))?;
        let fixed_images = stack_volumes("fixed_image", samples.iter().map(|s| &s.fixed_image))?;
        let labels = if labeled {
            let moving = samples.iter().filter_map(Sample::moving_label);
            let fixed = samples.iter().filter_map(Sample::fixed_label);
            Some(BatchLabels {
                moving: stack_volumes("moving_label", moving)?,
                fixed: stack_volumes("fixed_label", fixed)?,
            })
        } else {
            None
        };
        let flat: Vec<i64> = samples.iter().flat_map(|s| s.indices.iter().copied()).collect();
        let indices = Array2::from_shape_vec((samples.len(), num_indices), flat)?;

        Ok(Self {
            moving_images,
            fixed_images,
            labels,
            indices,
        })
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.moving_images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_labeled(&self) -> bool {
        self.labels.is_some()
    }
}
