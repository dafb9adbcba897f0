//! PCA reconstruction + pseudo-inverse blendshape solve data.
//!
//! ## `solve_data.npz` keys
//!
//! | Key            | Shape       | Meaning                                   |
//! |----------------|-------------|-------------------------------------------|
//! | `pca_basis`    | `[K, 3V]`   | reconstruction basis, one row per coefficient |
//! | `pca_mean`     | `[3V]`      | mean vertex positions                     |
//! | `D_pinv`       | `[52, 3F]`  | pseudo-inverse of the frontal delta matrix |
//! | `neutral`      | `[3V]`      | neutral-pose vertex positions             |
//! | `frontal_mask` | `[F]`       | vertex indices used by the solve          |
//! | `D`            | `[3F, 52]`  | forward delta matrix (optional)           |
//!
//! Loaded once and shared read-only (`Arc<SolveData>`) across pipelines.

use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1};
use tracing::info;

use crate::error::{FacecastError, Result};
use crate::face::blendshape::BLENDSHAPE_COUNT;
use crate::npz::{load_npz, NpyArray, NpzArchive};

pub const SOLVE_DATA_FILE: &str = "solve_data.npz";

#[derive(Debug, Clone)]
pub struct SolveData {
    pca_basis: Array2<f32>,
    pca_mean: Array1<f32>,
    pinv: Array2<f32>,
    neutral: Array1<f32>,
    frontal_mask: Vec<usize>,
    delta: Option<Array2<f32>>,
}

impl SolveData {
    /// Load `solve_data.npz` from `dir`.
    ///
    /// Returns `Ok(None)` when the file does not exist; the pipeline then
    /// decodes blendshapes directly from the network logits.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SOLVE_DATA_FILE);
        if !path.exists() {
            info!(path = ?path, "solve data not found, using direct decoding");
            return Ok(None);
        }
        info!(path = ?path, "loading solve data");
        let data = Self::from_archive(&load_npz(&path)?)?;
        info!(
            coefficients = data.coefficient_count(),
            vertices = data.vertex_count(),
            frontal = data.frontal_count(),
            "solve data loaded"
        );
        Ok(Some(data))
    }

    /// Assemble and validate solve data from a decoded archive.
    pub fn from_archive(archive: &NpzArchive) -> Result<Self> {
        let mean = archive.require("pca_mean")?.to_f32_vec();
        let neutral = archive.require("neutral")?.to_f32_vec();
        let frontal_mask = archive.require("frontal_mask")?.to_index_vec()?;
        let pinv = matrix(archive.require("D_pinv")?, Some(BLENDSHAPE_COUNT), "D_pinv")?;
        let basis = matrix(archive.require("pca_basis")?, None, "pca_basis")?;
        let delta = archive
            .get("D")
            .map(|d| matrix(d, None, "D"))
            .transpose()?;

        Self::new(basis, Array1::from(mean), pinv, Array1::from(neutral), frontal_mask, delta)
    }

    /// Build from raw parts, checking every cross-array invariant.
    pub fn new(
        pca_basis: Array2<f32>,
        pca_mean: Array1<f32>,
        pinv: Array2<f32>,
        neutral: Array1<f32>,
        frontal_mask: Vec<usize>,
        delta: Option<Array2<f32>>,
    ) -> Result<Self> {
        let coords = pca_mean.len();
        if coords % 3 != 0 {
            return Err(FacecastError::format(format!(
                "pca_mean length {coords} is not a multiple of 3"
            )));
        }
        if pca_basis.ncols() != coords {
            return Err(FacecastError::format(format!(
                "pca_basis has {} columns, pca_mean has {coords} entries",
                pca_basis.ncols()
            )));
        }
        if neutral.len() != coords {
            return Err(FacecastError::format(format!(
                "neutral has {} entries, pca_mean has {coords}",
                neutral.len()
            )));
        }
        if pinv.nrows() != BLENDSHAPE_COUNT {
            return Err(FacecastError::format(format!(
                "D_pinv has {} rows, expected {BLENDSHAPE_COUNT}",
                pinv.nrows()
            )));
        }
        if pinv.ncols() != frontal_mask.len() * 3 {
            return Err(FacecastError::format(format!(
                "D_pinv has {} columns, frontal mask implies {}",
                pinv.ncols(),
                frontal_mask.len() * 3
            )));
        }
        let vertices = coords / 3;
        if let Some(bad) = frontal_mask.iter().find(|&&v| v >= vertices) {
            return Err(FacecastError::format(format!(
                "frontal mask index {bad} out of range for {vertices} vertices"
            )));
        }

        Ok(Self {
            pca_basis,
            pca_mean,
            pinv,
            neutral,
            frontal_mask,
            delta,
        })
    }

    pub fn coefficient_count(&self) -> usize {
        self.pca_basis.nrows()
    }

    pub fn vertex_count(&self) -> usize {
        self.pca_mean.len() / 3
    }

    pub fn frontal_count(&self) -> usize {
        self.frontal_mask.len()
    }

    pub fn delta(&self) -> Option<&Array2<f32>> {
        self.delta.as_ref()
    }

    /// Mean + rank-K update: `mean + Σ coeffs[i] × basis[i]` over the first
    /// `min(coeffs.len(), K)` coefficients.
    pub fn reconstruct_vertices(&self, coeffs: &[f32]) -> Array1<f32> {
        let mut vertices = self.pca_mean.clone();
        for (row, &c) in self.pca_basis.outer_iter().zip(coeffs) {
            vertices.scaled_add(c, &row);
        }
        vertices
    }

    /// Frontal-vertex displacement from neutral, flattened `[x0, y0, z0, x1, ...]`.
    pub fn displacement_target(&self, vertices: ArrayView1<'_, f32>) -> Array1<f32> {
        let mut target = Array1::<f32>::zeros(self.frontal_mask.len() * 3);
        for (i, &v) in self.frontal_mask.iter().enumerate() {
            for c in 0..3 {
                target[i * 3 + c] = vertices[v * 3 + c] - self.neutral[v * 3 + c];
            }
        }
        target
    }

    /// Project a displacement onto the 52 blendshape directions, clamped to [0, 1].
    pub fn solve_weights(&self, target: ArrayView1<'_, f32>) -> [f32; BLENDSHAPE_COUNT] {
        let raw = self.pinv.dot(&target);
        let mut weights = [0f32; BLENDSHAPE_COUNT];
        for (w, r) in weights.iter_mut().zip(raw.iter()) {
            *w = r.clamp(0.0, 1.0);
        }
        weights
    }
}

fn matrix(array: &NpyArray, rows_hint: Option<usize>, key: &str) -> Result<Array2<f32>> {
    let data = array.to_f32_vec();
    let (rows, cols) = match array.shape.as_slice() {
        [r, c] => (*r, *c),
        _ => {
            // Flat storage: fall back to the expected row count.
            let rows = rows_hint.ok_or_else(|| {
                FacecastError::format(format!("{key} must be 2-D, got shape {:?}", array.shape))
            })?;
            if rows == 0 || data.len() % rows != 0 {
                return Err(FacecastError::format(format!(
                    "{key} has {} elements, not divisible into {rows} rows",
                    data.len()
                )));
            }
            (rows, data.len() / rows)
        }
    };
    if array.fortran_order {
        return Array2::from_shape_vec((cols, rows), data)
            .map(|m| m.reversed_axes().as_standard_layout().into_owned())
            .map_err(|e| FacecastError::format(format!("{key}: {e}")));
    }
    Array2::from_shape_vec((rows, cols), data).map_err(|e| FacecastError::format(format!("{key}: {e}")))
}
