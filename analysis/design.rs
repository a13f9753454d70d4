//! Design matrix with per-cell missingness.
//!
//! Each cell is either an observed value or a handle into the arena of latent
//! imputation parameters. The arena is enumerated in row-major `(row, col)` order,
//! which is also the order the latent block of the parameter vector uses.

use ndarray::{Array1, Array2, ArrayView1, Axis};

/// One entry of the predictor matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Observed(f64),
    /// Index into the latent-parameter arena.
    Latent(usize),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Latent(_))
    }
}

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    cells: Array2<Cell>,
    /// `(row, col)` of every latent cell, indexed by its arena position.
    latent: Vec<(usize, usize)>,
    column_names: Vec<String>,
}

impl DesignMatrix {
    /// Builds the matrix from optional values; `None` becomes a latent cell.
    pub fn from_options(values: Array2<Option<f64>>, column_names: Vec<String>) -> Self {
        assert_eq!(
            values.ncols(),
            column_names.len(),
            "one column name per predictor column"
        );
        let mut latent = Vec::new();
        let mut cells = Array2::from_elem(values.dim(), Cell::Observed(0.0));
        for ((row, col), value) in values.indexed_iter() {
            cells[[row, col]] = match value {
                Some(v) => Cell::Observed(*v),
                None => {
                    latent.push((row, col));
                    Cell::Latent(latent.len() - 1)
                }
            };
        }
        Self {
            cells,
            latent,
            column_names,
        }
    }

    /// Builds a fully observed matrix.
    pub fn from_observed(values: Array2<f64>, column_names: Vec<String>) -> Self {
        Self::from_options(values.mapv(Some), column_names)
    }

    pub fn nrows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn n_latent(&self) -> usize {
        self.latent.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn cell(&self, row: usize, col: usize) -> Cell {
        self.cells[[row, col]]
    }

    /// Position of every latent cell, in arena order.
    pub fn latent_positions(&self) -> &[(usize, usize)] {
        &self.latent
    }

    /// Boolean mask, true where the source value was missing.
    pub fn mask(&self) -> Array2<bool> {
        self.cells.mapv(|c| c.is_missing())
    }

    pub fn missing_per_row(&self) -> Vec<usize> {
        self.cells
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|c| c.is_missing()).count())
            .collect()
    }

    /// Materialises the matrix with latent cells taken from `latent_values`.
    pub fn fill(&self, latent_values: ArrayView1<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(self.cells.dim());
        self.fill_into(latent_values, &mut out);
        out
    }

    /// Like [`fill`](Self::fill), writing into an existing buffer.
    pub fn fill_into(&self, latent_values: ArrayView1<f64>, out: &mut Array2<f64>) {
        debug_assert_eq!(latent_values.len(), self.latent.len());
        debug_assert_eq!(out.dim(), self.cells.dim());
        ndarray::Zip::from(out)
            .and(&self.cells)
            .for_each(|slot, cell| {
                *slot = match *cell {
                    Cell::Observed(v) => v,
                    Cell::Latent(idx) => latent_values[idx],
                }
            });
    }

    /// Mean and standard deviation of the observed values of each column.
    ///
    /// Columns with fewer than two observed values fall back to a unit standard
    /// deviation, and to a zero mean when nothing is observed.
    pub fn observed_column_moments(&self) -> (Array1<f64>, Array1<f64>) {
        let k = self.ncols();
        let mut means = Array1::zeros(k);
        let mut sds = Array1::ones(k);
        for (col, column) in self.cells.axis_iter(Axis(1)).enumerate() {
            let observed: Vec<f64> = column
                .iter()
                .filter_map(|c| match c {
                    Cell::Observed(v) => Some(*v),
                    Cell::Latent(_) => None,
                })
                .collect();
            if observed.is_empty() {
                continue;
            }
            let mean = observed.iter().sum::<f64>() / observed.len() as f64;
            means[col] = mean;
            if observed.len() >= 2 {
                let var = observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (observed.len() - 1) as f64;
                if var > 0.0 {
                    sds[col] = var.sqrt();
                }
            }
        }
        (means, sds)
    }

    /// Number of observed values per column.
    pub fn observed_per_column(&self) -> Vec<usize> {
        self.cells
            .axis_iter(Axis(1))
            .map(|col| col.iter().filter(|c| !c.is_missing()).count())
            .collect()
    }

    /// Returns a new matrix whose columns are this one's, reordered by `order`.
    /// Latent cells are renumbered in row-major order of the new layout.
    pub fn select_columns(&self, order: &[usize]) -> Self {
        let values = Array2::from_shape_fn((self.nrows(), order.len()), |(row, col)| {
            match self.cells[[row, order[col]]] {
                Cell::Observed(v) => Some(v),
                Cell::Latent(_) => None,
            }
        });
        let names = order.iter().map(|&c| self.column_names[c].clone()).collect();
        Self::from_options(values, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_matrix() -> DesignMatrix {
        let values = array![
            [Some(1.0), None, Some(3.0)],
            [None, Some(5.0), None],
            [Some(7.0), Some(8.0), Some(9.0)],
        ];
        DesignMatrix::from_options(values, vec!["a".into(), "b".into(), "c".into()])
    }

    #[test]
    fn mask_marks_exactly_the_missing_cells() {
        let design = sample_matrix();
        let mask = design.mask();
        assert_eq!(mask.dim(), (3, 3));
        assert_eq!(
            mask,
            array![[false, true, false], [true, false, true], [false, false, false]]
        );
        assert_eq!(design.missing_per_row(), vec![1, 2, 0]);
    }

    #[test]
    fn latent_arena_is_row_major() {
        let design = sample_matrix();
        assert_eq!(design.latent_positions(), &[(0, 1), (1, 0), (1, 2)]);
        assert_eq!(design.cell(1, 2), Cell::Latent(2));
    }

    #[test]
    fn fill_places_latent_values_in_their_cells() {
        let design = sample_matrix();
        let filled = design.fill(array![10.0, 20.0, 30.0].view());
        assert_eq!(
            filled,
            array![[1.0, 10.0, 3.0], [20.0, 5.0, 30.0], [7.0, 8.0, 9.0]]
        );
    }

    #[test]
    fn fully_observed_matrix_has_no_latent_cells() {
        let design = DesignMatrix::from_observed(array![[1.0, 2.0], [3.0, 4.0]], vec![
            "x".into(),
            "y".into(),
        ]);
        assert_eq!(design.n_latent(), 0);
        assert!(design.mask().iter().all(|m| !m));
    }

    #[test]
    fn column_moments_ignore_missing_cells() {
        let design = sample_matrix();
        let (means, sds) = design.observed_column_moments();
        assert!((means[0] - 4.0).abs() < 1e-12);
        assert!((means[1] - 6.5).abs() < 1e-12);
        assert!((sds[0] - (18.0f64).sqrt()).abs() < 1e-12);
        assert_eq!(design.observed_per_column(), vec![2, 2, 2]);
    }

    #[test]
    fn column_selection_keeps_row_missing_counts() {
        let design = sample_matrix();
        let permuted = design.select_columns(&[2, 0, 1]);
        assert_eq!(permuted.column_names(), &["c", "a", "b"]);
        assert_eq!(permuted.missing_per_row(), design.missing_per_row());
        assert_eq!(permuted.latent_positions(), &[(0, 2), (1, 0), (1, 1)]);
    }
}
