//! Row-tile execution helpers.
//!
//! Every kernel computes output rows independently from an immutable input,
//! so the result does not depend on the tile size or the number of workers.

use ndarray::{Array2, ArrayViewMut1, Axis};

/// Default number of rows per work tile
pub const DEFAULT_TILE_ROWS: usize = 64;

/// Horizontal tiling used by pixel kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    pub tile_rows: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_rows: DEFAULT_TILE_ROWS,
        }
    }
}

impl TileConfig {
    pub fn new(tile_rows: usize) -> Self {
        Self {
            tile_rows: tile_rows.max(1),
        }
    }
}

/// Build a `height x width` array by filling each row with `f(row_index, row)`
pub fn fill_rows<T, F>(height: usize, width: usize, tiles: TileConfig, f: F) -> Array2<T>
where
    T: Clone + Default + Send + Sync,
    F: Fn(usize, ArrayViewMut1<T>) + Send + Sync,
{
    let mut out = Array2::<T>::default((height, width));
    let tile_rows = tiles.tile_rows.max(1);

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        out.axis_chunks_iter_mut(Axis(0), tile_rows)
            .into_par_iter()
            .enumerate()
            .for_each(|(tile_idx, mut tile)| {
                let base = tile_idx * tile_rows;
                for (r, row) in tile.axis_iter_mut(Axis(0)).enumerate() {
                    f(base + r, row);
                }
            });
    }

    #[cfg(not(feature = "parallel"))]
    {
        for (tile_idx, mut tile) in out.axis_chunks_iter_mut(Axis(0), tile_rows).enumerate() {
            let base = tile_idx * tile_rows;
            for (r, row) in tile.axis_iter_mut(Axis(0)).enumerate() {
                f(base + r, row);
            }
        }
    }

    out
}

/// Per-pixel variant of [`fill_rows`]
pub fn map_pixels<T, F>(height: usize, width: usize, tiles: TileConfig, f: F) -> Array2<T>
where
    T: Clone + Default + Send + Sync,
    F: Fn(usize, usize) -> T + Send + Sync,
{
    fill_rows(height, width, tiles, |i, mut row| {
        for (j, v) in row.iter_mut().enumerate() {
            *v = f(i, j);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_size_does_not_change_result() {
        let f = |i: usize, j: usize| (i * 31 + j * 7) as f32 * 0.5;
        let a = map_pixels(37, 11, TileConfig::new(1), f);
        let b = map_pixels(37, 11, TileConfig::new(8), f);
        let c = map_pixels(37, 11, TileConfig::new(100), f);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a[[36, 10]], (36 * 31 + 70) as f32 * 0.5);
    }

    #[test]
    fn test_zero_tile_rows_is_clamped() {
        assert_eq!(TileConfig::new(0).tile_rows, 1);
    }
}
