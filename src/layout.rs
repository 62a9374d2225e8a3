//! Window allocation across displays.
//!
//! Allocation runs in two phases. Windows are first apportioned to displays in
//! proportion to usable area (largest-remainder method, so the shares always
//! sum to the window count). Each display then lays its share out on a grid
//! whose column count comes from the layout preset.

use serde::Serialize;

use crate::protocol::{DisplayGeometry, LayoutPreset, Rect};

/// Inset between the usable rectangle's edge and the outermost windows.
pub const WINDOW_MARGIN: i32 = 12;
/// Space between neighbouring windows.
pub const WINDOW_GAP: i32 = 10;

const MIN_ASPECT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowPlacement {
    pub display_id: String,
    pub bounds: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

/// Split `count` windows across `displays` by usable area.
pub fn apportion(count: usize, displays: &[DisplayGeometry]) -> Vec<usize> {
    match displays.len() {
        0 => return Vec::new(),
        1 => return vec![count],
        _ => {}
    }

    let mut weights: Vec<i128> = displays.iter().map(|d| i128::from(d.usable.area())).collect();
    let mut total: i128 = weights.iter().sum();
    if total == 0 {
        weights = vec![1; displays.len()];
        total = displays.len() as i128;
    }

    let n = count as i128;
    let mut shares: Vec<usize> = Vec::with_capacity(displays.len());
    let mut remainders: Vec<(i128, usize)> = Vec::with_capacity(displays.len());
    for (index, weight) in weights.iter().enumerate() {
        let scaled = weight * n;
        shares.push((scaled / total) as usize);
        remainders.push((scaled % total, index));
    }

    let assigned: usize = shares.iter().sum();
    let leftover = count - assigned;
    // Largest fractional remainder first; earlier displays win ties.
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, index) in remainders.into_iter().take(leftover) {
        shares[index] += 1;
    }
    shares
}

/// Grid dimensions for `count` windows on a display with the given usable area.
pub fn grid_shape(count: usize, preset: LayoutPreset, usable: &Rect) -> GridShape {
    if count == 0 {
        return GridShape { rows: 0, cols: 0 };
    }
    let cols = match preset.fixed_columns() {
        Some(fixed) => fixed,
        None => {
            let aspect = if usable.height > 0 {
                f64::from(usable.width) / f64::from(usable.height)
            } else {
                1.0
            };
            let aspect = aspect.max(MIN_ASPECT);
            (count as f64 * aspect).sqrt().ceil() as usize
        }
    }
    .clamp(1, count);
    let rows = count.div_ceil(cols);
    GridShape { rows, cols }
}

fn cell_extent(available: i32, cells: usize) -> i32 {
    let cells = cells.max(1) as i64;
    let inner = i64::from(available) - 2 * i64::from(WINDOW_MARGIN) - (cells - 1) * i64::from(WINDOW_GAP);
    (inner.div_euclid(cells)).max(1) as i32
}

/// Lay out `count` windows on one display's usable rectangle.
pub fn layout_display(count: usize, preset: LayoutPreset, usable: &Rect) -> Vec<Rect> {
    let shape = grid_shape(count, preset, usable);
    if count == 0 {
        return Vec::new();
    }
    let cell_w = cell_extent(usable.width, shape.cols);
    let cell_h = cell_extent(usable.height, shape.rows);

    (0..count)
        .map(|i| {
            let row = (i / shape.cols) as i32;
            let col = (i % shape.cols) as i32;
            Rect::new(
                usable.x + WINDOW_MARGIN + col * (cell_w + WINDOW_GAP),
                usable.y + WINDOW_MARGIN + row * (cell_h + WINDOW_GAP),
                cell_w,
                cell_h,
            )
        })
        .collect()
}

/// Produce exactly `count` placements, filling displays in order.
pub fn allocate(
    count: usize,
    preset: LayoutPreset,
    displays: &[DisplayGeometry],
) -> Vec<WindowPlacement> {
    let shares = apportion(count, displays);
    let mut placements = Vec::with_capacity(count);
    for (display, share) in displays.iter().zip(shares) {
        for bounds in layout_display(share, preset, &display.usable) {
            placements.push(WindowPlacement {
                display_id: display.id.clone(),
                bounds,
            });
        }
    }
    placements
}

/// Restrict `displays` to the requested ids, keeping every display when the
/// selection is empty or matches nothing.
pub fn select_displays(displays: Vec<DisplayGeometry>, wanted: &[String]) -> Vec<DisplayGeometry> {
    if wanted.is_empty() {
        return displays;
    }
    let selected: Vec<DisplayGeometry> = displays
        .iter()
        .filter(|d| wanted.iter().any(|id| id == &d.id))
        .cloned()
        .collect();
    if selected.is_empty() {
        tracing::warn!(
            target = "agent_fleet::layout",
            wanted = ?wanted,
            "no requested display is connected, tiling across all displays"
        );
        displays
    } else {
        selected
    }
}
