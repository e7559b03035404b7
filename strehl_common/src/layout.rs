//! 2-dimensional layouts of active nodes.
//!
//! A layout maps a `dim1` by `dim2` grid (column-major storage, first index
//! varying fastest) onto a compact vector of active nodes.  Active grid
//! entries hold the nonnegative position of the node in the compact vector,
//! inactive entries hold `-1`.  Deformable mirror actuators and wavefront
//! sensor sub-images both use this representation.

use crate::error::{Error, ErrorKind, Result};

/// Numbering inverted along the first dimension.
pub const ORIENT_FLIP_DIM1: u32 = 1 << 0;
/// Numbering inverted along the second dimension.
pub const ORIENT_FLIP_DIM2: u32 = 1 << 1;
/// Numbering in row-major order instead of column-major.
pub const ORIENT_ROW_MAJOR: u32 = 1 << 2;

fn check_dims(func: &'static str, dim1: i64, dim2: i64) -> Result<usize> {
    if dim1 < 1 || dim2 < 1 {
        return Err(Error::new(func, ErrorKind::BadSize));
    }
    dim1.checked_mul(dim2)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(Error::new(func, ErrorKind::BadSize))
}

/// Build an indexed layout from a mask of active nodes.
///
/// The mask is a `dim1` by `dim2` column-major array of bytes where active
/// nodes are non-zero.  Active nodes receive consecutive indices in the order
/// selected by the lower three bits of `orient`; inactive entries of `inds`
/// are set to `-1`.  Pass `None` for `inds` to only count the active nodes.
///
/// Returns the number of active nodes.
pub fn build_indexed_layout(
    mut inds: Option<&mut [i64]>,
    mask: &[u8],
    dim1: i64,
    dim2: i64,
    orient: u32,
) -> Result<i64> {
    let n = check_dims("build_indexed_layout", dim1, dim2)?;
    if mask.len() != n {
        return Err(Error::new("build_indexed_layout", ErrorKind::BadSize));
    }
    if let Some(dst) = inds.as_deref_mut() {
        if dst.len() != n {
            return Err(Error::new("build_indexed_layout", ErrorKind::BadSize));
        }
        dst.fill(-1);
    }

    let (d1, d2) = (dim1 as usize, dim2 as usize);
    let pos1 = |i: usize| -> usize {
        if orient & ORIENT_FLIP_DIM1 != 0 { d1 - 1 - i } else { i }
    };
    let pos2 = |j: usize| -> usize {
        if orient & ORIENT_FLIP_DIM2 != 0 { d2 - 1 - j } else { j }
    };

    let mut count: i64 = 0;
    let mut visit = |i1: usize, i2: usize, inds: &mut Option<&mut [i64]>| {
        let cell = i1 + i2 * d1;
        if mask[cell] != 0 {
            if let Some(dst) = inds.as_deref_mut() {
                dst[cell] = count;
            }
            count += 1;
        }
    };
    if orient & ORIENT_ROW_MAJOR != 0 {
        for i in 0..d1 {
            for j in 0..d2 {
                visit(pos1(i), pos2(j), &mut inds);
            }
        }
    } else {
        for j in 0..d2 {
            for i in 0..d1 {
                visit(pos1(i), pos2(j), &mut inds);
            }
        }
    }
    Ok(count)
}

/// Check a 2-dimensional indexed layout.
///
/// The layout is valid when the active indices are unique and form the range
/// `[0, count)` with `count` one more than the largest index.
///
/// Returns the number of active nodes.
pub fn check_indexed_layout(inds: &[i64], dim1: i64, dim2: i64) -> Result<i64> {
    let n = check_dims("check_indexed_layout", dim1, dim2)?;
    if inds.len() != n {
        return Err(Error::new("check_indexed_layout", ErrorKind::BadSize));
    }
    let count = inds.iter().filter(|&&v| v >= 0).count();
    let mut seen = vec![false; count];
    for &v in inds {
        if v < -1 {
            return Err(Error::new("check_indexed_layout", ErrorKind::OutOfRange));
        }
        if v >= 0 {
            let v = v as usize;
            if v >= count || seen[v] {
                return Err(Error::new("check_indexed_layout", ErrorKind::OutOfRange));
            }
            seen[v] = true;
        }
    }
    Ok(count as i64)
}

/// Integer centering score of grid cell `(i1, i2)` (1-based).
///
/// The score is maximal at the grid center and symmetric under both axis
/// reflections, so thresholding it carves a centred disk.
fn score(i1: i64, i2: i64, dim1: i64, dim2: i64) -> i64 {
    (dim1 + 1 - i1) * i1 + (dim2 + 1 - i2) * i2
}

/// Instantiate a mask of `nacts` active nodes centred on a `dim1` by `dim2`
/// grid.
///
/// Nodes are selected by decreasing centering score; when a tie straddles the
/// cut, the whole tied shell is kept, so the result holds at least `nacts`
/// active nodes and exactly `nacts` whenever an exact match exists.
pub fn instantiate_mask(dim1: i64, dim2: i64, nacts: i64) -> Result<Vec<u8>> {
    let n = check_dims("instantiate_mask", dim1, dim2)?;
    if nacts < 0 || nacts as usize > n {
        return Err(Error::new("instantiate_mask", ErrorKind::OutOfRange));
    }
    let mut mask = vec![0u8; n];
    if nacts == 0 {
        return Ok(mask);
    }
    let mut scores: Vec<i64> = Vec::with_capacity(n);
    for i2 in 1..=dim2 {
        for i1 in 1..=dim1 {
            scores.push(score(i1, i2, dim1, dim2));
        }
    }
    let mut sorted = scores.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let threshold = sorted[nacts as usize - 1];
    for (cell, &s) in scores.iter().enumerate() {
        if s >= threshold {
            mask[cell] = 1;
        }
    }
    Ok(mask)
}

/// Build a mask from a human-readable shape.
///
/// Non-space characters mark active nodes.  The first dimension runs along
/// each row, the second across rows; short rows are padded with inactive
/// nodes.
///
/// Returns the column-major mask and its dimensions.
pub fn mask_from_text(rows: &[&str]) -> Result<(Vec<u8>, [i64; 2])> {
    if rows.is_empty() {
        return Err(Error::new("mask_from_text", ErrorKind::BadArgument));
    }
    let dim2 = rows.len();
    let dim1 = rows.iter().map(|r| r.chars().count()).max().unwrap_or(0);
    if dim1 == 0 {
        return Err(Error::new("mask_from_text", ErrorKind::BadArgument));
    }
    let mut mask = vec![0u8; dim1 * dim2];
    for (j, row) in rows.iter().enumerate() {
        for (i, ch) in row.chars().enumerate() {
            if ch != ' ' {
                mask[i + j * dim1] = 1;
            }
        }
    }
    Ok((mask, [dim1 as i64, dim2 as i64]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_check_round_trip() {
        let mask = [1u8, 0, 1, 1, 1, 0];
        let mut inds = [0i64; 6];
        let count = build_indexed_layout(Some(&mut inds), &mask, 2, 3, 0).unwrap();
        assert_eq!(count, 4);
        assert_eq!(inds, [0, -1, 1, 2, 3, -1]);
        assert_eq!(check_indexed_layout(&inds, 2, 3).unwrap(), 4);
    }

    #[test]
    fn count_only() {
        let mask = [1u8, 1, 0, 0];
        assert_eq!(build_indexed_layout(None, &mask, 2, 2, 0).unwrap(), 2);
    }

    #[test]
    fn orientation_bits() {
        let mask = [1u8; 4];
        let mut inds = [0i64; 4];

        build_indexed_layout(Some(&mut inds), &mask, 2, 2, ORIENT_FLIP_DIM1).unwrap();
        assert_eq!(inds, [1, 0, 3, 2]);

        build_indexed_layout(Some(&mut inds), &mask, 2, 2, ORIENT_ROW_MAJOR).unwrap();
        assert_eq!(inds, [0, 2, 1, 3]);
    }

    #[test]
    fn check_rejects_bad_indices() {
        // Index beyond the number of active nodes.
        assert!(check_indexed_layout(&[0, 2, -1, -1], 2, 2).is_err());
        // Duplicate index.
        assert!(check_indexed_layout(&[0, 0, -1, -1], 2, 2).is_err());
        // Entry below -1.
        assert!(check_indexed_layout(&[-2, 0, -1, -1], 2, 2).is_err());
    }

    #[test]
    fn centred_mask_is_symmetric() {
        let dim = 10i64;
        let mask = instantiate_mask(dim, dim, 60).unwrap();
        assert_eq!(mask.iter().filter(|&&m| m != 0).count(), 60);
        let at = |i: i64, j: i64| mask[(i + j * dim) as usize];
        for j in 0..dim {
            for i in 0..dim {
                assert_eq!(at(i, j), at(dim - 1 - i, j));
                assert_eq!(at(i, j), at(i, dim - 1 - j));
            }
        }
        // Central 2x2 block is active on an even-sized grid.
        for j in 4..6 {
            for i in 4..6 {
                assert_eq!(at(i, j), 1);
            }
        }
    }

    #[test]
    fn full_and_empty_masks() {
        assert!(instantiate_mask(3, 3, 0).unwrap().iter().all(|&m| m == 0));
        assert!(instantiate_mask(3, 3, 9).unwrap().iter().all(|&m| m == 1));
        assert!(instantiate_mask(3, 3, 10).is_err());
    }

    #[test]
    fn text_shape() {
        let (mask, dims) = mask_from_text(&[" x ", "xxx", " x "]).unwrap();
        assert_eq!(dims, [3, 3]);
        assert_eq!(mask, vec![0, 1, 0, 1, 1, 1, 0, 1, 0]);
    }
}
