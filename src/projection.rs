// Sparse clockwork hierarchy - spatial projection between column grids
//
// A destination column is projected onto a source grid of (possibly) different
// resolution. The receptive field is a square of cells with half-width
// `radius`, centered on the middle cell of the projected column. Codes address
// columns, so callers iterate candidate columns and test each one's active
// cell against the clipped cell window.

use crate::helpers::*;

/// Receptive field of one destination column on a source grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    /// Projected column on the source grid.
    pub center_column: Int2,
    /// Middle cell of `center_column`, in source cell coordinates.
    pub center: Int2,
    /// Unclipped lower cell corner; weight offsets are relative to this.
    pub field_lower: Int2,
    /// Clipped cell bounds (inclusive).
    pub cell_lower: Int2,
    pub cell_upper: Int2,
    /// Candidate source columns (inclusive, clipped).
    pub column_lower: Int2,
    pub column_upper: Int2,
    pub diam: i32,
}

impl Window {
    pub fn new(
        dst_column: Int2,
        dst_columns: Int2,
        src_columns: Int2,
        src_column_size: i32,
        radius: i32,
    ) -> Self {
        let to_src = Float2::new(
            src_columns.x as f32 / dst_columns.x as f32,
            src_columns.y as f32 / dst_columns.y as f32,
        );

        let center_column = project(dst_column, to_src);

        let center = Int2::new(
            ((center_column.x as f32 + 0.5) * src_column_size as f32) as i32,
            ((center_column.y as f32 + 0.5) * src_column_size as f32) as i32,
        );

        let field_lower = Int2::new(center.x - radius, center.y - radius);

        let cell_dims = Int2::new(
            src_columns.x * src_column_size,
            src_columns.y * src_column_size,
        );

        let cell_lower = Int2::new(field_lower.x.max(0), field_lower.y.max(0));
        let cell_upper = Int2::new(
            (center.x + radius).min(cell_dims.x - 1),
            (center.y + radius).min(cell_dims.y - 1),
        );

        let column_radius = column_radius(radius, src_column_size);

        let column_lower = Int2::new(
            (center_column.x - column_radius).max(0),
            (center_column.y - column_radius).max(0),
        );
        let column_upper = Int2::new(
            (center_column.x + column_radius).min(src_columns.x - 1),
            (center_column.y + column_radius).min(src_columns.y - 1),
        );

        Self {
            center_column,
            center,
            field_lower,
            cell_lower,
            cell_upper,
            column_lower,
            column_upper,
            diam: radius * 2 + 1,
        }
    }

    /// Number of weights one destination cell holds for this window.
    pub fn area(&self) -> usize {
        (self.diam * self.diam) as usize
    }

    pub fn contains(&self, cell: Int2) -> bool {
        in_bounds(cell, self.cell_lower, self.cell_upper)
    }

    /// Weight offset of a source cell. The cell must lie inside the window.
    pub fn offset(&self, cell: Int2) -> usize {
        debug_assert!(self.contains(cell), "cell {cell:?} outside window {self:?}");

        ((cell.x - self.field_lower.x) + (cell.y - self.field_lower.y) * self.diam) as usize
    }

    /// Candidate source columns, x outer, y inner.
    pub fn columns(&self) -> impl Iterator<Item = Int2> {
        let lower = self.column_lower;
        let upper = self.column_upper;

        (lower.x..=upper.x).flat_map(move |x| (lower.y..=upper.y).map(move |y| Int2::new(x, y)))
    }

    /// Offset of `column`'s active cell `ci`, if that cell is inside the window.
    pub fn active_offset(&self, column: Int2, ci: i32, src_column_size: i32) -> Option<usize> {
        let cell = cell_pos(column, ci, src_column_size);

        if self.contains(cell) {
            Some(self.offset(cell))
        } else {
            None
        }
    }
}

/// Column-space half-width needed to cover a cell radius.
pub fn column_radius(radius: i32, src_column_size: i32) -> i32 {
    ceil_divide(radius, src_column_size)
}

/// Inclusive range of destination columns whose window on the source grid can
/// touch cells of `src_column`. A superset: callers still test each cell with
/// [`Window::contains`].
pub fn inverse_columns(
    src_column: Int2,
    src_columns: Int2,
    src_column_size: i32,
    dst_columns: Int2,
    radius: i32,
) -> (Int2, Int2) {
    let to_dst = Float2::new(
        dst_columns.x as f32 / src_columns.x as f32,
        dst_columns.y as f32 / src_columns.y as f32,
    );

    let center = project(src_column, to_dst);

    // Reach in source columns (plus one for rounding), scaled to destination columns
    let reach = (radius + 2 * src_column_size) as f32 / src_column_size as f32;
    let half = Int2::new(
        (reach * to_dst.x).ceil() as i32 + 1,
        (reach * to_dst.y).ceil() as i32 + 1,
    );

    (
        Int2::new((center.x - half.x).max(0), (center.y - half.y).max(0)),
        Int2::new(
            (center.x + half.x).min(dst_columns.x - 1),
            (center.y + half.y).min(dst_columns.y - 1),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grids() -> Vec<(Int2, Int2, i32, i32)> {
        // (dst columns, src columns, src column size, radius)
        vec![
            (Int2::new(4, 4), Int2::new(1, 1), 8, 12),
            (Int2::new(4, 4), Int2::new(4, 4), 4, 6),
            (Int2::new(3, 5), Int2::new(7, 2), 3, 2),
            (Int2::new(8, 8), Int2::new(2, 2), 5, 0),
            (Int2::new(2, 2), Int2::new(9, 9), 2, 5),
        ]
    }

    #[test]
    fn window_cells_stay_in_source_bounds() {
        for (dst, src, cs, r) in grids() {
            let cell_dims = Int2::new(src.x * cs, src.y * cs);

            for i in 0..dst.area() {
                let w = Window::new(column_pos(i, dst), dst, src, cs, r);

                assert!(in_bounds0(w.cell_lower, cell_dims));
                assert!(in_bounds0(w.cell_upper, cell_dims));
                assert!(in_bounds0(w.column_lower, src));
                assert!(in_bounds0(w.column_upper, src));

                for column in w.columns() {
                    for ci in 0..cs * cs {
                        if let Some(offset) = w.active_offset(column, ci, cs) {
                            assert!(offset < w.area());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn candidate_columns_cover_cell_window() {
        for (dst, src, cs, r) in grids() {
            let column_r = column_radius(r, cs);
            assert!(column_r * cs >= r);

            for i in 0..dst.area() {
                let w = Window::new(column_pos(i, dst), dst, src, cs, r);

                for x in w.cell_lower.x..=w.cell_upper.x {
                    for y in w.cell_lower.y..=w.cell_upper.y {
                        let column = Int2::new(x / cs, y / cs);
                        assert!(in_bounds(column, w.column_lower, w.column_upper));
                        assert!((column.x - w.center_column.x).abs() <= column_r);
                        assert!((column.y - w.center_column.y).abs() <= column_r);
                    }
                }
            }
        }
    }

    #[test]
    fn inverse_range_is_a_superset() {
        for (dst, src, cs, r) in grids() {
            for s in 0..src.area() {
                let src_column = column_pos(s, src);
                let (lower, upper) = inverse_columns(src_column, src, cs, dst, r);

                for d in 0..dst.area() {
                    let dst_column = column_pos(d, dst);
                    let w = Window::new(dst_column, dst, src, cs, r);

                    let touches = (0..cs * cs).any(|ci| w.contains(cell_pos(src_column, ci, cs)));

                    if touches {
                        assert!(
                            in_bounds(dst_column, lower, upper),
                            "dst {dst_column:?} touches src {src_column:?} but is outside {lower:?}..{upper:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn offsets_are_unique_within_window() {
        let w = Window::new(Int2::new(1, 2), Int2::new(4, 4), Int2::new(4, 4), 4, 3);
        let mut seen = vec![false; w.area()];

        for column in w.columns() {
            for ci in 0..16 {
                if let Some(offset) = w.active_offset(column, ci, 4) {
                    assert!(!seen[offset]);
                    seen[offset] = true;
                }
            }
        }

        assert!(seen.iter().any(|&s| s));
    }
}
