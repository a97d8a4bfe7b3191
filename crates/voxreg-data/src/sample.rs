// Sample — one normalized moving/fixed record
//
// A sample is what the generator yields and what the preprocessing stages
// pass along: two 3-D images in [0, 1], an optional pair of single-channel
// labels and the integer indices that identify where it came from.

use ndarray::Array3;

/// Moving and fixed labels of one sample.
///
/// Stored together so that a sample can never carry just one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelPair {
    pub moving: Array3<f32>,
    pub fixed: Array3<f32>,
}

/// A single registration sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub moving_image: Array3<f32>,
    pub fixed_image: Array3<f32>,
    pub labels: Option<LabelPair>,
    /// Image indices followed by the label index; the label index is `-1`
    /// for unlabeled samples.
    pub indices: Vec<i64>,
}

impl Sample {
    /// Create an unlabeled sample.
    pub fn unlabeled(
        moving_image: Array3<f32>,
        fixed_image: Array3<f32>,
        indices: Vec<i64>,
    ) -> Self {
        Self {
            moving_image,
            fixed_image,
            labels: None,
            indices,
        }
    }

    /// Create a labeled sample.
    pub fn labeled(
        moving_image: Array3<f32>,
        fixed_image: Array3<f32>,
        moving_label: Array3<f32>,
        fixed_label: Array3<f32>,
        indices: Vec<i64>,
    ) -> Self {
        Self {
            moving_image,
            fixed_image,
            labels: Some(LabelPair {
                moving: moving_label,
                fixed: fixed_label,
            }),
            indices,
        }
    }

    pub fn is_labeled(&self) -> bool {
        self.labels.is_some()
    }

    pub fn moving_label(&self) -> Option<&Array3<f32>> {
        self.labels.as_ref().map(|l| &l.moving)
    }

    pub fn fixed_label(&self) -> Option<&Array3<f32>> {
        self.labels.as_ref().map(|l| &l.fixed)
    }

    /// The label index, i.e. the last entry of `indices`.
    pub fn label_index(&self) -> Option<i64> {
        self.indices.last().copied()
    }
}
