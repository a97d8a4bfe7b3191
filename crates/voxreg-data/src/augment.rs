// Affine augmentation — random 3-D affine warps applied per batch
//
// Each element of a batch gets two independent random affine maps, one for
// the moving side and one for the fixed side. A map is defined by moving
// four reference corners of the normalized cube [-1, 1]^3:
//
//   (-1,-1,-1), (-1,-1, 1), (-1, 1,-1), ( 1,-1,-1)
//
// each coordinate scaled by a factor drawn from U(1 - scale, 1). Four point
// correspondences determine the 4x3 affine exactly. Volumes are resampled
// trilinearly in coordinates normalized about the volume centre; labels use
// the transform of their image.

use ndarray::{stack, Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use rayon::prelude::*;

use voxreg_core::{bail, ImageShape, Result};

use crate::batch::{Batch, BatchLabels};
use crate::transform::sample_trilinear;

/// A random transformation applied to whole batches.
pub trait BatchAugment: Send {
    /// Transform a batch, returning the new batch.
    fn transform(&mut self, batch: Batch) -> Result<Batch>;
}

const CORNERS: [[f64; 3]; 4] = [
    [-1.0, -1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [-1.0, 1.0, -1.0],
    [1.0, -1.0, -1.0],
];

/// Affine map in normalized coordinates: `u' = [u, 1] @ theta`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    /// Rows 0..3 hold the linear part, row 3 the translation.
    pub theta: [[f64; 3]; 4],
}

impl Affine {
    pub fn identity() -> Self {
        Self {
            theta: [
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [0.0, 0.0, 0.0],
            ],
        }
    }

    /// The affine map sending the reference corners to `targets`.
    ///
    /// Corners differ from the first one along exactly one axis each, so the
    /// system solves in closed form.
    pub fn from_corners(targets: [[f64; 3]; 4]) -> Self {
        let mut theta = [[0.0; 3]; 4];
        for j in 0..3 {
            let y0 = targets[0][j];
            let a = (targets[3][j] - y0) / 2.0;
            let b = (targets[2][j] - y0) / 2.0;
            let c = (targets[1][j] - y0) / 2.0;
            theta[0][j] = a;
            theta[1][j] = b;
            theta[2][j] = c;
            theta[3][j] = y0 + a + b + c;
        }
        Self { theta }
    }

    pub fn apply(&self, u: [f64; 3]) -> [f64; 3] {
        let t = &self.theta;
        let mut out = [0.0; 3];
        for (j, o) in out.iter_mut().enumerate() {
            *o = u[0] * t[0][j] + u[1] * t[1][j] + u[2] * t[2][j] + t[3][j];
        }
        out
    }
}

/// Resample `vol` through `affine`, keeping its shape.
pub fn warp_volume(vol: &ArrayView3<'_, f32>, affine: &Affine) -> Array3<f32> {
    if vol.is_empty() {
        return vol.to_owned();
    }
    let shape = vol.shape();
    let centre: Vec<f64> = shape.iter().map(|&n| (n as f64 - 1.0) / 2.0).collect();
    let half: Vec<f64> = centre.iter().map(|&c| c.max(1.0)).collect();
    Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let u = [
            (i as f64 - centre[0]) / half[0],
            (j as f64 - centre[1]) / half[1],
            (k as f64 - centre[2]) / half[2],
        ];
        let w = affine.apply(u);
        let pos = [
            w[0] * half[0] + centre[0],
            w[1] * half[1] + centre[1],
            w[2] * half[2] + centre[2],
        ];
        sample_trilinear(vol, pos)
    })
}

fn warp_stack(volumes: &Array4<f32>, affines: &[Affine]) -> Result<Array4<f32>> {
    let warped: Vec<Array3<f32>> = affines
        .par_iter()
        .enumerate()
        .map(|(i, affine)| warp_volume(&volumes.index_axis(Axis(0), i), affine))
        .collect();
    let views: Vec<ArrayView3<'_, f32>> = warped.iter().map(|v| v.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Random affine augmentation of moving and fixed volumes.
#[derive(Debug, Clone)]
pub struct AffineTransformation3D {
    moving_image_size: ImageShape,
    fixed_image_size: ImageShape,
    batch_size: usize,
    scale: f64,
    rng: StdRng,
}

impl AffineTransformation3D {
    /// Create an augmentation with scale 0.1 and a random seed.
    pub fn new(
        moving_image_size: ImageShape,
        fixed_image_size: ImageShape,
        batch_size: usize,
    ) -> Self {
        Self {
            moving_image_size,
            fixed_image_size,
            batch_size,
            scale: 0.1,
            rng: StdRng::seed_from_u64(thread_rng().gen()),
        }
    }

    /// Set the corner scaling factor range `U(1 - scale, 1)`.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Make the drawn transforms reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn random_affine(&mut self) -> Affine {
        let mut targets = CORNERS;
        for corner in targets.iter_mut() {
            for v in corner.iter_mut() {
                *v *= self.rng.gen_range(1.0 - self.scale..=1.0);
            }
        }
        Affine::from_corners(targets)
    }

    /// Draw `(moving, fixed)` transforms for `n` batch elements.
    pub fn gen_transform_params(&mut self, n: usize) -> Vec<(Affine, Affine)> {
        (0..n)
            .map(|_| {
                let moving = self.random_affine();
                let fixed = self.random_affine();
                (moving, fixed)
            })
            .collect()
    }
}

impl BatchAugment for AffineTransformation3D {
    fn transform(&mut self, batch: Batch) -> Result<Batch> {
        let n = batch.len();
        if n == 0 {
            return Ok(batch);
        }
        let moving_dims = &batch.moving_images.shape()[1..];
        let fixed_dims = &batch.fixed_images.shape()[1..];
        if moving_dims != self.moving_image_size.dims()
            || fixed_dims != self.fixed_image_size.dims()
        {
            bail!(
                "affine augmentation configured for moving {} and fixed {}, \
                 got moving {:?} and fixed {:?}",
                self.moving_image_size,
                self.fixed_image_size,
                moving_dims,
                fixed_dims
            );
        }

        let params = self.gen_transform_params(n);
        let moving: Vec<Affine> = params.iter().map(|p| p.0).collect();
        let fixed: Vec<Affine> = params.iter().map(|p| p.1).collect();

        let labels = match &batch.labels {
            Some(l) => Some(BatchLabels {
                moving: warp_stack(&l.moving, &moving)?,
                fixed: warp_stack(&l.fixed, &fixed)?,
            }),
            None => None,
        };
        Ok(Batch {
            moving_images: warp_stack(&batch.moving_images, &moving)?,
            fixed_images: warp_stack(&batch.fixed_images, &fixed)?,
            labels,
            indices: batch.indices,
        })
    }
}
