// ImageShape — spatial shape of a 3-D volume
//
// Every loader fixes the shape its images are resized to before batching:
//   - paired loaders keep separate moving and fixed shapes,
//   - unpaired and grouped loaders use a single shape for both roles.
//
// The order is (width, height, depth), matching the axis order of the
// arrays returned by the backends.

use std::fmt;

/// Spatial shape `(width, height, depth)` of a 3-D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageShape([usize; 3]);

impl ImageShape {
    /// Create a shape from its three extents.
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        ImageShape([width, height, depth])
    }

    /// Build a shape from a slice, which must have exactly three non-zero
    /// entries.
    pub fn from_slice(dims: &[usize]) -> crate::Result<Self> {
        match dims {
            &[w, h, d] if w > 0 && h > 0 && d > 0 => Ok(ImageShape([w, h, d])),
            _ => Err(crate::Error::InvalidShape { got: dims.to_vec() }),
        }
    }

    /// The extents as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// The extents as a fixed-size array, e.g. for `Array3::zeros`.
    pub fn as_array(&self) -> [usize; 3] {
        self.0
    }

    pub fn width(&self) -> usize {
        self.0[0]
    }

    pub fn height(&self) -> usize {
        self.0[1]
    }

    pub fn depth(&self) -> usize {
        self.0[2]
    }

    /// Number of voxels.
    pub fn voxel_count(&self) -> usize {
        self.0.iter().product()
    }
}

impl TryFrom<&[usize]> for ImageShape {
    type Error = crate::Error;

    fn try_from(dims: &[usize]) -> crate::Result<Self> {
        ImageShape::from_slice(dims)
    }
}

impl TryFrom<Vec<usize>> for ImageShape {
    type Error = crate::Error;

    fn try_from(dims: Vec<usize>) -> crate::Result<Self> {
        ImageShape::from_slice(&dims)
    }
}

impl From<[usize; 3]> for ImageShape {
    fn from(dims: [usize; 3]) -> Self {
        ImageShape(dims)
    }
}

impl From<(usize, usize, usize)> for ImageShape {
    fn from((w, h, d): (usize, usize, usize)) -> Self {
        ImageShape([w, h, d])
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn from_slice_accepts_three_dims() {
        let shape = ImageShape::from_slice(&[4, 5, 6]).unwrap();
        assert_eq!(shape.dims(), &[4, 5, 6]);
        assert_eq!(shape.voxel_count(), 120);
        assert_eq!(shape.to_string(), "(4, 5, 6)");
    }

    #[test]
    fn from_slice_rejects_bad_dims() {
        for dims in [vec![], vec![4, 5], vec![4, 5, 6, 7], vec![0, 4, 4], vec![4, 4, 0]] {
            let err = ImageShape::try_from(dims.clone()).unwrap_err();
            match err {
                Error::InvalidShape { got } => assert_eq!(got, dims),
                other => panic!("unexpected error: {other}"),
            }
        }
    }
}
