// Volume helpers — small operations on the dense arrays backends return
//
// Backends hand out `ArrayD<f32>` because a label file may be 3-D (one mask)
// or 4-D (masks stacked along the last axis). Once a sample has been
// validated and its label channel chosen, everything is a plain `Array3`.

use ndarray::{Array3, ArrayD, Axis, Ix3};

use crate::error::{Error, Result, ValidationError};

/// Closed interval every normalized voxel value must fall in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub low: f32,
    pub high: f32,
}

impl ValueRange {
    pub fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    /// Whether `v` lies in `[low, high]`. NaN is never contained.
    pub fn contains(&self, v: f32) -> bool {
        v >= self.low && v <= self.high
    }

    /// Whether every element of `arr` lies in the range.
    pub fn contains_all<D: ndarray::Dimension>(&self, arr: &ndarray::Array<f32, D>) -> bool {
        arr.iter().all(|&v| self.contains(v))
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::new(0.0, 1.0)
    }
}

/// Minimum and maximum of an array, `None` when it is empty.
///
/// NaN entries are skipped.
pub fn value_bounds(arr: &ArrayD<f32>) -> Option<(f32, f32)> {
    arr.iter()
        .filter(|v| !v.is_nan())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Number of label channels: 1 for a 3-D label, the size of the last axis
/// for a 4-D label.
pub fn num_label_channels(label: &ArrayD<f32>) -> usize {
    if label.ndim() == 4 {
        label.shape()[3]
    } else {
        1
    }
}

/// Spatial part of a shape (the first three extents).
pub fn spatial_shape(arr: &ArrayD<f32>) -> &[usize] {
    let shape = arr.shape();
    &shape[..shape.len().min(3)]
}

/// Convert a dynamic-rank array into a 3-D volume.
pub fn into_volume(arr: ArrayD<f32>) -> Result<Array3<f32>> {
    Ok(arr.into_dimensionality::<Ix3>()?)
}

/// Extract one channel of a label as a 3-D volume.
///
/// A 3-D label is its own single channel; a 4-D label is sliced along its
/// last axis.
pub fn label_channel(label: &ArrayD<f32>, channel: usize) -> Result<Array3<f32>> {
    let num_labels = num_label_channels(label);
    if channel >= num_labels {
        return Err(Error::validation(
            &[],
            ValidationError::LabelIndexOutOfRange {
                index: channel,
                num_labels,
            },
        ));
    }
    if label.ndim() == 4 {
        let slice = label.index_axis(Axis(3), channel).to_owned();
        into_volume(slice)
    } else {
        into_volume(label.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn range_rejects_nan_and_outliers() {
        let range = ValueRange::default();
        assert!(range.contains(0.0));
        assert!(range.contains(1.0));
        assert!(!range.contains(1.5));
        assert!(!range.contains(-0.1));
        assert!(!range.contains(f32::NAN));
    }

    #[test]
    fn bounds_of_array() {
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.5, -1.0, 3.0, f32::NAN]).unwrap();
        assert_eq!(value_bounds(&arr), Some((-1.0, 3.0)));
        assert_eq!(value_bounds(&ArrayD::zeros(IxDyn(&[0]))), None);
    }

    #[test]
    fn channels_of_labels() {
        let single = ArrayD::<f32>::zeros(IxDyn(&[2, 3, 4]));
        let multi = ArrayD::<f32>::zeros(IxDyn(&[2, 3, 4, 5]));
        assert_eq!(num_label_channels(&single), 1);
        assert_eq!(num_label_channels(&multi), 5);
        assert_eq!(spatial_shape(&multi), &[2, 3, 4]);
    }

    #[test]
    fn label_channel_slices_last_axis() {
        let mut multi = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2, 3]));
        multi[[1, 1, 1, 2]] = 1.0;
        let ch2 = label_channel(&multi, 2).unwrap();
        assert_eq!(ch2.shape(), &[2, 2, 2]);
        assert_eq!(ch2[[1, 1, 1]], 1.0);
        let ch0 = label_channel(&multi, 0).unwrap();
        assert_eq!(ch0.sum(), 0.0);
        assert!(label_channel(&multi, 3).is_err());
    }
}
