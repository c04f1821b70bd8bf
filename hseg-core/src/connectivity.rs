//! Neighbor direction tables for 1-D, 2-D and 3-D rasters
//!
//! Directions are ordered nearest-first so a connectivity type selects a
//! prefix of the table: 2/4/6/8 directions in 1-D, 4/8/12/20/24 in 2-D and
//! 6/18/26 in 3-D.

use crate::config::Dims;

/// (dcol,) offsets for 1-D data, out to distance 4
const OFFSETS_1D: [isize; 8] = [-1, 1, -2, 2, -3, 3, -4, 4];

/// (dcol, drow) offsets for 2-D data: cardinal, diagonal, distance-2
/// cardinal, knight moves, distance-2 diagonal
const OFFSETS_2D: [(isize, isize); 24] = [
    (-1, 0),
    (0, -1),
    (1, 0),
    (0, 1),
    (-1, -1),
    (1, -1),
    (1, 1),
    (-1, 1),
    (-2, 0),
    (0, -2),
    (2, 0),
    (0, 2),
    (-2, -1),
    (-1, -2),
    (1, -2),
    (2, -1),
    (2, 1),
    (1, 2),
    (-1, 2),
    (-2, 1),
    (-2, -2),
    (2, -2),
    (2, 2),
    (-2, 2),
];

/// (dcol, drow, dslice) offsets for 3-D data: faces, edges, corners
const OFFSETS_3D: [(isize, isize, isize); 26] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
    (-1, -1, 0),
    (1, -1, 0),
    (1, 1, 0),
    (-1, 1, 0),
    (-1, 0, -1),
    (1, 0, -1),
    (1, 0, 1),
    (-1, 0, 1),
    (0, -1, -1),
    (0, 1, -1),
    (0, 1, 1),
    (0, -1, 1),
    (-1, -1, -1),
    (1, -1, -1),
    (1, 1, -1),
    (-1, 1, -1),
    (-1, -1, 1),
    (1, -1, 1),
    (1, 1, 1),
    (-1, 1, 1),
];

/// Offset of neighbor direction `nbdir` as (dcol, drow, dslice).
pub fn neighbor_offset(nb_dimensions: u8, nbdir: usize) -> (isize, isize, isize) {
    match nb_dimensions {
        1 => (OFFSETS_1D[nbdir], 0, 0),
        2 => {
            let (dc, dr) = OFFSETS_2D[nbdir];
            (dc, dr, 0)
        }
        _ => OFFSETS_3D[nbdir],
    }
}

/// Pixel index of the neighbor of (col, row, slice) in direction `nbdir`,
/// or `None` when it falls outside the window.
pub fn find_neighbor(
    dims: &Dims,
    nb_dimensions: u8,
    col: usize,
    row: usize,
    slice: usize,
    nbdir: usize,
) -> Option<usize> {
    let (dc, dr, ds) = neighbor_offset(nb_dimensions, nbdir);
    let nc = col as isize + dc;
    let nr = row as isize + dr;
    let ns = slice as isize + ds;
    if nc < 0
        || nr < 0
        || ns < 0
        || nc >= dims.ncols as isize
        || nr >= dims.nrows as isize
        || ns >= dims.nslices as isize
    {
        return None;
    }
    Some(nc as usize + nr as usize * dims.ncols + ns as usize * dims.ncols * dims.nrows)
}

/// Axis along which a processing window was split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    Col,
    Row,
    Slice,
}

/// True when direction `nbdir` steps exactly one pixel along `axis` and
/// nothing along the other axes.
pub fn is_direct_across(nb_dimensions: u8, nbdir: usize, axis: SplitAxis) -> bool {
    let (dc, dr, ds) = neighbor_offset(nb_dimensions, nbdir);
    match axis {
        SplitAxis::Col => dc.abs() == 1 && dr == 0 && ds == 0,
        SplitAxis::Row => dr.abs() == 1 && dc == 0 && ds == 0,
        SplitAxis::Slice => ds.abs() == 1 && dc == 0 && dr == 0,
    }
}

/// Decompose a pixel index into (col, row, slice).
pub fn pixel_coords(dims: &Dims, pixel_index: usize) -> (usize, usize, usize) {
    let frame = dims.ncols * dims.nrows;
    let slice = pixel_index / frame;
    let rem = pixel_index - slice * frame;
    let row = rem / dims.ncols;
    let col = rem - row * dims.ncols;
    (col, row, slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_direction_has_an_inverse() {
        for nd in [1u8, 2, 3] {
            let maxnbdir = match nd {
                1 => 8,
                2 => 24,
                _ => 26,
            };
            for nbdir in 0..maxnbdir {
                let (dc, dr, ds) = neighbor_offset(nd, nbdir);
                let found = (0..maxnbdir)
                    .any(|other| neighbor_offset(nd, other) == (-dc, -dr, -ds));
                assert!(found, "no inverse for direction {nbdir} in {nd}-D");
            }
        }
    }

    #[test]
    fn four_connectivity_prefix_is_cardinal() {
        for nbdir in 0..4 {
            let (dc, dr, _) = neighbor_offset(2, nbdir);
            assert_eq!(dc.abs() + dr.abs(), 1);
        }
    }

    #[test]
    fn find_neighbor_respects_bounds() {
        let dims = Dims::new_2d(4, 2);
        // West of the first column is outside.
        assert_eq!(find_neighbor(&dims, 2, 0, 0, 0, 0), None);
        // East of (0, 0) is pixel 1.
        assert_eq!(find_neighbor(&dims, 2, 0, 0, 0, 2), Some(1));
        // South of (0, 0) is pixel 4.
        assert_eq!(find_neighbor(&dims, 2, 0, 0, 0, 3), Some(4));
    }

    #[test]
    fn direct_across_excludes_diagonals() {
        assert!(is_direct_across(2, 0, SplitAxis::Col));
        assert!(!is_direct_across(2, 4, SplitAxis::Col));
        assert!(!is_direct_across(2, 1, SplitAxis::Col));
        assert!(is_direct_across(2, 1, SplitAxis::Row));
    }

    #[test]
    fn pixel_coords_round_trip() {
        let dims = Dims::new_3d(5, 4, 3);
        for idx in 0..dims.npixels() {
            let (c, r, s) = pixel_coords(&dims, idx);
            assert_eq!(idx, c + r * 5 + s * 20);
        }
    }
}
