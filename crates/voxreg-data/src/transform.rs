// Resize — bring every sample to the loader's image shapes
//
// Resizing is a pure function of the sample and the target shapes. Images
// and labels of the same role are resized to the same shape so that they
// stay aligned voxel for voxel.

use ndarray::{Array3, ArrayBase, Data, Ix3};

use voxreg_core::{bail, ImageShape, Result};

use crate::sample::{LabelPair, Sample};

/// Resizes the volumes of a sample to fixed shapes.
pub trait Resize: Send + Sync {
    /// Resize the moving side to `moving_shape` and the fixed side to
    /// `fixed_shape`.
    fn resize(
        &self,
        sample: Sample,
        moving_shape: ImageShape,
        fixed_shape: ImageShape,
    ) -> Result<Sample>;
}

/// Trilinear interpolation at a continuous voxel position.
///
/// Coordinates are clamped to the volume, so positions outside it take the
/// value of the nearest border voxel.
pub(crate) fn sample_trilinear<S>(vol: &ArrayBase<S, Ix3>, pos: [f64; 3]) -> f32
where
    S: Data<Elem = f32>,
{
    let shape = vol.shape();
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut frac = [0f64; 3];
    for axis in 0..3 {
        let max = (shape[axis] - 1) as f64;
        let p = pos[axis].clamp(0.0, max);
        let floor = p.floor();
        lo[axis] = floor as usize;
        hi[axis] = (lo[axis] + 1).min(shape[axis] - 1);
        frac[axis] = p - floor;
    }
    let mut acc = 0.0f64;
    for (dx, wx) in [(lo[0], 1.0 - frac[0]), (hi[0], frac[0])] {
        for (dy, wy) in [(lo[1], 1.0 - frac[1]), (hi[1], frac[1])] {
            for (dz, wz) in [(lo[2], 1.0 - frac[2]), (hi[2], frac[2])] {
                let w = wx * wy * wz;
                if w != 0.0 {
                    acc += w * f64::from(vol[[dx, dy, dz]]);
                }
            }
        }
    }
    acc as f32
}

/// Trilinear resize with half-voxel aligned centres and edge clamping.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrilinearResize;

impl TrilinearResize {
    pub fn new() -> Self {
        Self
    }

    /// Resize one volume to `shape`.
    pub fn resize_volume(&self, vol: &Array3<f32>, shape: ImageShape) -> Result<Array3<f32>> {
        if vol.shape() == shape.dims() {
            return Ok(vol.clone());
        }
        if vol.is_empty() {
            bail!("cannot resize an empty volume of shape {:?} to {shape}", vol.shape());
        }
        let src = vol.shape();
        let scale: Vec<f64> = (0..3)
            .map(|a| src[a] as f64 / shape.dims()[a] as f64)
            .collect();
        Ok(Array3::from_shape_fn(shape.as_array(), |(i, j, k)| {
            let pos = [
                (i as f64 + 0.5) * scale[0] - 0.5,
                (j as f64 + 0.5) * scale[1] - 0.5,
                (k as f64 + 0.5) * scale[2] - 0.5,
            ];
            sample_trilinear(vol, pos)
        }))
    }
}

impl Resize for TrilinearResize {
    fn resize(
        &self,
        sample: Sample,
        moving_shape: ImageShape,
        fixed_shape: ImageShape,
    ) -> Result<Sample> {
        let labels = match &sample.labels {
            Some(pair) => Some(LabelPair {
                moving: self.resize_volume(&pair.moving, moving_shape)?,
                fixed: self.resize_volume(&pair.fixed, fixed_shape)?,
            }),
            None => None,
        };
        Ok(Sample {
            moving_image: self.resize_volume(&sample.moving_image, moving_shape)?,
            fixed_image: self.resize_volume(&sample.fixed_image, fixed_shape)?,
            labels,
            indices: sample.indices,
        })
    }
}
