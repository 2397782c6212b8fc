use std::path::{Path, PathBuf};

use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use ndarray_npy::{read_npy, ReadNpyError};
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::config::Normalization;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("sample {index} out of range, file holds {count} samples")]
    SampleOutOfRange { index: usize, count: usize },
    #[error("profile needs at least 3 columns (R, .., P, W), found {0}")]
    TooFewColumns(usize),
    #[error("no radii below the {0} m cutoff")]
    Empty(f64),
    #[error("cannot normalize by {name} maximum {value}")]
    DegenerateScale { name: &'static str, value: f64 },
    #[error("requested {requested} points but only {available} rows are available")]
    NotEnoughPoints { requested: usize, available: usize },
    #[error("splitting {num_points} points at fraction {fraction} leaves an empty set")]
    EmptySplit { num_points: usize, fraction: f64 },
}

// Raw radial profile in physical units.
#[derive(Debug, Clone)]
pub struct Profile {
    pub radius: Array1<f64>,     // m
    pub pressure: Array1<f64>,   // Pa
    pub deflection: Array1<f64>, // m
}

/// Reads one radial profile from a `.npy` file.
///
/// A 3-D `[samples, rows, cols]` array is indexed at `sample`; a 2-D
/// `[rows, cols]` array is taken as is and `sample` is ignored. Either `f64`
/// or `f32` storage works.
pub fn load_profile(path: &Path, sample: usize) -> Result<Profile, DatasetError> {
    match read_table(path)? {
        Table::Single(table) => {
            debug!(path = %path.display(), shape = ?table.shape(), "loaded profile table");
            Profile::from_table(table.view())
        }
        Table::Stack(stack) => {
            let count = stack.len_of(Axis(0));
            if sample >= count {
                return Err(DatasetError::SampleOutOfRange {
                    index: sample,
                    count,
                });
            }
            debug!(path = %path.display(), shape = ?stack.shape(), sample, "loaded profile stack");
            Profile::from_table(stack.index_axis(Axis(0), sample))
        }
    }
}

enum Table {
    Single(Array2<f64>),
    Stack(Array3<f64>),
}

fn read_table(path: &Path) -> Result<Table, DatasetError> {
    let first_err = match read_npy::<_, Array3<f64>>(path) {
        Ok(stack) => return Ok(Table::Stack(stack)),
        Err(e) => e,
    };
    if let Ok(stack) = read_npy::<_, Array3<f32>>(path) {
        return Ok(Table::Stack(stack.mapv(f64::from)));
    }
    if let Ok(table) = read_npy::<_, Array2<f64>>(path) {
        return Ok(Table::Single(table));
    }
    if let Ok(table) = read_npy::<_, Array2<f32>>(path) {
        return Ok(Table::Single(table.mapv(f64::from)));
    }
    Err(DatasetError::Read {
        path: path.to_path_buf(),
        source: first_err,
    })
}

impl Profile {
    pub fn from_table(table: ArrayView2<f64>) -> Result<Self, DatasetError> {
        let cols = table.ncols();
        if cols < 3 {
            return Err(DatasetError::TooFewColumns(cols));
        }
        Ok(Profile {
            radius: table.column(0).to_owned(),
            pressure: table.column(cols - 2).to_owned(),
            deflection: table.column(cols - 1).to_owned(),
        })
    }

    /// Trims the profile at the radius cutoff and scales every field.
    ///
    /// The radius mask only decides how many rows survive: pressure and
    /// deflection are taken from the leading rows, which assumes the profile
    /// is sorted by radius.
    pub fn prepare(&self, norm: &Normalization) -> Result<PreparedData, DatasetError> {
        let radius: Array1<f64> = self
            .radius
            .iter()
            .filter(|&&r| r < norm.radius_cutoff)
            .map(|&r| r + norm.radius_offset)
            .collect();
        let n = radius.len();
        if n == 0 {
            return Err(DatasetError::Empty(norm.radius_cutoff));
        }

        let pressure = self.pressure.slice(s![..n]);
        let deflection = self.deflection.slice(s![..n]);
        let shear = Array1::from_elem(n, norm.applied_pressure);

        let w_max = max_of(deflection.iter().copied());
        let q_max = max_of(shear.iter().copied());
        check_scale("deflection", w_max)?;
        check_scale("shear", q_max)?;

        Ok(PreparedData {
            r: &radius / norm.radius_scale,
            w: &deflection / w_max,
            q: &shear / q_max,
            p: &pressure / q_max,
            radius_scale: norm.radius_scale,
            radius_offset: norm.radius_offset,
            pressure_scale: q_max,
            deflection_scale: w_max,
        })
    }
}

fn max_of(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(f64::NEG_INFINITY, f64::max)
}

fn check_scale(name: &'static str, value: f64) -> Result<(), DatasetError> {
    if value.is_finite() && value != 0.0 {
        Ok(())
    } else {
        Err(DatasetError::DegenerateScale { name, value })
    }
}

// Normalized fields plus the scales needed to undo the normalization.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub r: Array1<f64>,
    pub w: Array1<f64>,
    pub q: Array1<f64>,
    pub p: Array1<f64>,
    pub radius_scale: f64,
    pub radius_offset: f64,
    pub pressure_scale: f64,
    pub deflection_scale: f64,
}

#[derive(Debug, Clone)]
pub struct Samples {
    pub r: Array1<f64>,
    pub w: Array1<f64>,
    pub q: Array1<f64>,
    pub p: Array1<f64>,
}

impl Samples {
    pub fn len(&self) -> usize {
        self.r.len()
    }

    fn select(data: &PreparedData, indices: &[usize]) -> Self {
        Samples {
            r: data.r.select(Axis(0), indices),
            w: data.w.select(Axis(0), indices),
            q: data.q.select(Axis(0), indices),
            p: data.p.select(Axis(0), indices),
        }
    }
}

// Everything the PINN trains and validates against.
#[derive(Debug, Clone)]
pub struct Splits {
    pub collocation: Samples,
    pub train: Samples,
    pub val: Samples,
}

impl PreparedData {
    pub fn len(&self) -> usize {
        self.r.len()
    }

    /// Undoes both the scaling and the offset of a normalized radius.
    pub fn physical_radius(&self, r: f64) -> f64 {
        r * self.radius_scale - self.radius_offset
    }

    /// Draws `num_points` distinct rows; the leading `train_fraction` of them
    /// train, the rest validate. Every row is a collocation point.
    pub fn split<R: Rng + ?Sized>(
        &self,
        num_points: usize,
        train_fraction: f64,
        rng: &mut R,
    ) -> Result<Splits, DatasetError> {
        let available = self.len();
        if num_points > available {
            return Err(DatasetError::NotEnoughPoints {
                requested: num_points,
                available,
            });
        }
        let n_train = (num_points as f64 * train_fraction) as usize;
        if n_train == 0 || n_train == num_points {
            return Err(DatasetError::EmptySplit {
                num_points,
                fraction: train_fraction,
            });
        }

        let picked = rand::seq::index::sample(rng, available, num_points).into_vec();
        let (train_idx, val_idx) = picked.split_at(n_train);
        let all: Vec<usize> = (0..available).collect();

        Ok(Splits {
            collocation: Samples::select(self, &all),
            train: Samples::select(self, train_idx),
            val: Samples::select(self, val_idx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array;
    use ndarray_npy::write_npy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    // Columns: R, something, P, W. Radii sit at 0.5 mm, 1.5 mm, ..
    fn synthetic_table(rows: usize) -> Array2<f64> {
        Array::from_shape_fn((rows, 4), |(i, j)| {
            let r = 1e-3 * i as f64 + 5e-4;
            match j {
                0 => r,
                1 => -1.0,
                2 => 1000.0 + r,
                _ => 1e-6 * (1.0 + i as f64),
            }
        })
    }

    #[test]
    fn picks_the_requested_sample_from_a_stack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmp_Y.npy");
        let mut stack = Array3::<f64>::zeros((3, 10, 4));
        stack
            .index_axis_mut(Axis(0), 1)
            .assign(&synthetic_table(10));
        write_npy(&path, &stack).unwrap();

        let profile = load_profile(&path, 1).unwrap();
        assert_eq!(profile.radius.len(), 10);
        assert_relative_eq!(profile.pressure[0], 1000.0005);
        assert_relative_eq!(profile.deflection[9], 1e-5);

        assert!(matches!(
            load_profile(&path, 3),
            Err(DatasetError::SampleOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn reads_single_precision_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.npy");
        write_npy(&path, &synthetic_table(8).mapv(|v| v as f32)).unwrap();

        let profile = load_profile(&path, 0).unwrap();
        assert_eq!(profile.radius.len(), 8);
        assert_relative_eq!(profile.pressure[0], 1000.0, max_relative = 1e-6);
    }

    #[test]
    fn single_profile_ignores_the_sample_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile2d.npy");
        write_npy(&path, &synthetic_table(10)).unwrap();

        let profile = load_profile(&path, 1).unwrap();
        assert_eq!(profile.radius.len(), 10);
        assert_relative_eq!(profile.deflection[9], 1e-5);
        assert!(load_profile(&path, 0).is_ok());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_profile(Path::new("/nonexistent/cmp_Y.npy"), 0).unwrap_err();
        assert!(matches!(err, DatasetError::Read { .. }));
    }

    #[test]
    fn prepare_trims_and_normalizes() {
        let profile = Profile::from_table(synthetic_table(100).view()).unwrap();
        let data = profile.prepare(&Normalization::default()).unwrap();

        // Radii 0.0005 .. 0.0985 survive the 0.099 cutoff.
        assert_eq!(data.len(), 99);
        assert_relative_eq!(data.r[0], 0.015, max_relative = 1e-12);
        assert_relative_eq!(data.r[98], 0.995, max_relative = 1e-12);
        assert_relative_eq!(data.physical_radius(data.r[0]), 5e-4, max_relative = 1e-9);

        assert!(data.q.iter().all(|&q| q == 1.0));
        assert_relative_eq!(data.pressure_scale, 2.0 * 6894.76);
        assert_relative_eq!(data.p[0], 1000.0005 / (2.0 * 6894.76), max_relative = 1e-12);

        assert_relative_eq!(data.deflection_scale, 99e-6, max_relative = 1e-12);
        assert_relative_eq!(data.w[98], 1.0, max_relative = 1e-12);
    }

    #[test]
    fn prepare_rejects_degenerate_profiles() {
        let profile = Profile::from_table(synthetic_table(10).view()).unwrap();
        let norm = Normalization {
            radius_cutoff: -1.0,
            ..Normalization::default()
        };
        assert!(matches!(profile.prepare(&norm), Err(DatasetError::Empty(_))));

        let mut flat = synthetic_table(10);
        flat.column_mut(3).fill(0.0);
        let profile = Profile::from_table(flat.view()).unwrap();
        assert!(matches!(
            profile.prepare(&Normalization::default()),
            Err(DatasetError::DegenerateScale { name: "deflection", .. })
        ));

        let narrow = Array2::<f64>::zeros((4, 2));
        assert!(matches!(
            Profile::from_table(narrow.view()),
            Err(DatasetError::TooFewColumns(2))
        ));
    }

    #[test]
    fn split_draws_disjoint_train_and_validation_rows() {
        let profile = Profile::from_table(synthetic_table(200).view()).unwrap();
        let norm = Normalization {
            radius_cutoff: f64::INFINITY,
            ..Normalization::default()
        };
        let data = profile.prepare(&norm).unwrap();
        assert_eq!(data.len(), 200);
        let mut rng = StdRng::seed_from_u64(7);

        let splits = data.split(150, 0.8, &mut rng).unwrap();
        assert_eq!(splits.train.len(), 120);
        assert_eq!(splits.val.len(), 30);
        assert_eq!(splits.collocation.len(), data.len());

        // Radii are strictly increasing, so they identify rows.
        let train: HashSet<u64> = splits.train.r.iter().map(|r| r.to_bits()).collect();
        let val: HashSet<u64> = splits.val.r.iter().map(|r| r.to_bits()).collect();
        assert_eq!(train.len(), 120);
        assert!(train.is_disjoint(&val));
    }

    #[test]
    fn split_rejects_oversized_or_empty_requests() {
        let profile = Profile::from_table(synthetic_table(20).view()).unwrap();
        let data = profile.prepare(&Normalization::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        assert!(matches!(
            data.split(1500, 0.8, &mut rng),
            Err(DatasetError::NotEnoughPoints { requested: 1500, .. })
        ));
        assert!(matches!(
            data.split(1, 0.8, &mut rng),
            Err(DatasetError::EmptySplit { .. })
        ));
    }
}
