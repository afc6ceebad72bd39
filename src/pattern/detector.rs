//! Pattern detection seam and the built-in dark-blob grid detector.
//!
//! Detection is the one step the estimators delegate: they hand a borrowed
//! frame to a [`PatternDetector`] and receive one image point per pattern
//! node in row-major order. Neither the detector nor the estimators keep the
//! frame after the call.

use crate::geometry::{apply_homography, find_homography};
use crate::pattern::{PatternSpec, PatternType};
use image::GrayImage;
use log::debug;
use nalgebra::Point2;

pub trait PatternDetector {
    /// Locates the pattern nodes in `frame`, row-major, or `None` if the
    /// complete pattern is not visible.
    fn detect(&self, frame: &GrayImage, spec: &PatternSpec) -> Option<Vec<Point2<f64>>>;

    /// Whether this detector can find patterns of the given type.
    fn supports(&self, _pattern_type: PatternType) -> bool {
        true
    }
}

impl<D: PatternDetector + ?Sized> PatternDetector for Box<D> {
    fn detect(&self, frame: &GrayImage, spec: &PatternSpec) -> Option<Vec<Point2<f64>>> {
        (**self).detect(frame, spec)
    }

    fn supports(&self, pattern_type: PatternType) -> bool {
        (**self).supports(pattern_type)
    }
}

/// Tuning of [`BlobGridDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct BlobDetectorConfig {
    /// Smallest blob kept, in pixels.
    pub min_area: usize,
    /// Largest blob kept, as a fraction of the frame area.
    pub max_area_fraction: f64,
    /// Minimum ratio of blob area to bounding-box area.
    pub min_fill_ratio: f64,
    /// Maximum bounding-box aspect ratio.
    pub max_aspect_ratio: f64,
    /// Minimum gap between the dark and light class means of the threshold.
    pub min_contrast: f64,
    /// Maximum distance of a node from its integer grid cell, in cells.
    pub cell_tolerance: f64,
    /// Two dark squares are diagonal neighbours when their centroids are
    /// closer than this many mean square sides.
    pub diagonal_factor: f64,
}

impl Default for BlobDetectorConfig {
    fn default() -> Self {
        BlobDetectorConfig {
            min_area: 12,
            max_area_fraction: 0.05,
            min_fill_ratio: 0.3,
            max_aspect_ratio: 4.0,
            min_contrast: 20.0,
            cell_tolerance: 0.3,
            diagonal_factor: 1.8,
        }
    }
}

/// Finds chessboards and symmetric circle grids from dark connected blobs.
///
/// Circle grids use the blob centroids directly. For chessboards the dark
/// squares are separated by a one-pixel erosion and every inner corner is the
/// midpoint of the two diagonally adjacent dark squares that meet there.
/// The nodes are then ordered through the homography that sends the four
/// extreme nodes to the grid corners.
#[derive(Debug, Clone, Default)]
pub struct BlobGridDetector {
    config: BlobDetectorConfig,
}

#[derive(Debug, Clone)]
struct Blob {
    area: usize,
    centroid: Point2<f64>,
}

impl BlobGridDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BlobDetectorConfig) -> Self {
        BlobGridDetector { config }
    }

    fn dark_mask(&self, frame: &GrayImage) -> Option<Vec<bool>> {
        let (threshold, contrast) = otsu_threshold(frame);
        if contrast < self.config.min_contrast {
            debug!("Frame contrast {:.1} too low for detection", contrast);
            return None;
        }
        Some(frame.as_raw().iter().map(|&v| v <= threshold).collect())
    }

    fn blobs(&self, mask: &[bool], width: usize, height: usize) -> Vec<Blob> {
        let max_area = (self.config.max_area_fraction * (width * height) as f64) as usize;
        label_components(mask, width, height)
            .into_iter()
            .filter(|c| {
                let bw = (c.max_x - c.min_x + 1) as f64;
                let bh = (c.max_y - c.min_y + 1) as f64;
                let fill = c.area as f64 / (bw * bh);
                let aspect = bw.max(bh) / bw.min(bh);
                !c.touches_border
                    && c.area >= self.config.min_area
                    && c.area <= max_area
                    && fill >= self.config.min_fill_ratio
                    && aspect <= self.config.max_aspect_ratio
            })
            .map(|c| Blob {
                area: c.area,
                centroid: Point2::new(
                    c.sum_x as f64 / c.area as f64,
                    c.sum_y as f64 / c.area as f64,
                ),
            })
            .collect()
    }

    fn circle_nodes(&self, mut blobs: Vec<Blob>, count: usize) -> Option<Vec<Point2<f64>>> {
        if blobs.len() < count {
            return None;
        }
        if blobs.len() > count {
            let median = median_area(&blobs);
            blobs.sort_by(|a, b| {
                (a.area as f64 - median)
                    .abs()
                    .total_cmp(&(b.area as f64 - median).abs())
            });
            blobs.truncate(count);
        }
        Some(blobs.into_iter().map(|b| b.centroid).collect())
    }

    fn chessboard_corners(&self, blobs: Vec<Blob>) -> Vec<Point2<f64>> {
        if blobs.is_empty() {
            return Vec::new();
        }
        let median = median_area(&blobs);
        let squares: Vec<Blob> = blobs
            .into_iter()
            .filter(|b| {
                let ratio = b.area as f64 / median;
                (0.25..=4.0).contains(&ratio)
            })
            .collect();

        let mut corners = Vec::new();
        for (a_idx, a) in squares.iter().enumerate() {
            for b in squares.iter().skip(a_idx + 1) {
                let side = ((a.area as f64).sqrt() + (b.area as f64).sqrt()) / 2.0;
                let dist = (a.centroid - b.centroid).norm();
                if dist < self.config.diagonal_factor * side {
                    corners.push(Point2::from((a.centroid.coords + b.centroid.coords) / 2.0));
                }
            }
        }
        corners
    }

    /// Orders `nodes` row-major on a `columns × rows` grid.
    fn order_grid(
        &self,
        nodes: &[Point2<f64>],
        columns: usize,
        rows: usize,
    ) -> Option<Vec<Point2<f64>>> {
        if columns < 2 || rows < 2 || nodes.len() != columns * rows {
            return None;
        }

        let sum = |p: &Point2<f64>| p.x + p.y;
        let diff = |p: &Point2<f64>| p.x - p.y;
        let top_left = extreme(nodes, sum, false);
        let bottom_right = extreme(nodes, sum, true);
        let top_right = extreme(nodes, diff, true);
        let bottom_left = extreme(nodes, diff, false);

        let extremes = [top_left, top_right, bottom_right, bottom_left];
        for i in 0..4 {
            for j in (i + 1)..4 {
                if extremes[i] == extremes[j] {
                    return None;
                }
            }
        }

        let image_corners: Vec<Point2<f64>> = extremes.iter().map(|&i| nodes[i]).collect();
        let c = (columns - 1) as f64;
        let r = (rows - 1) as f64;
        let grid_corners = [
            Point2::new(0.0, 0.0),
            Point2::new(c, 0.0),
            Point2::new(c, r),
            Point2::new(0.0, r),
        ];
        let h = find_homography(&image_corners, &grid_corners)?;

        let mut ordered: Vec<Option<Point2<f64>>> = vec![None; nodes.len()];
        for node in nodes {
            let cell = apply_homography(&h, node)?;
            let (j, i) = (cell.x.round(), cell.y.round());
            if (cell.x - j).abs() > self.config.cell_tolerance
                || (cell.y - i).abs() > self.config.cell_tolerance
                || j < 0.0
                || i < 0.0
                || j > c
                || i > r
            {
                return None;
            }
            let slot = &mut ordered[i as usize * columns + j as usize];
            if slot.is_some() {
                return None;
            }
            *slot = Some(*node);
        }
        ordered.into_iter().collect()
    }
}

impl PatternDetector for BlobGridDetector {
    fn detect(&self, frame: &GrayImage, spec: &PatternSpec) -> Option<Vec<Point2<f64>>> {
        if !self.supports(spec.pattern_type) || spec.columns < 2 || spec.rows < 2 {
            return None;
        }
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let mut mask = self.dark_mask(frame)?;
        let columns = spec.columns as usize;
        let rows = spec.rows as usize;

        let nodes = match spec.pattern_type {
            PatternType::Chessboard => {
                mask = erode(&mask, width, height);
                self.chessboard_corners(self.blobs(&mask, width, height))
            }
            _ => self.circle_nodes(self.blobs(&mask, width, height), columns * rows)?,
        };
        if nodes.len() != columns * rows {
            debug!(
                "Found {} pattern nodes, expected {}",
                nodes.len(),
                columns * rows
            );
            return None;
        }
        self.order_grid(&nodes, columns, rows)
    }

    fn supports(&self, pattern_type: PatternType) -> bool {
        matches!(
            pattern_type,
            PatternType::Chessboard | PatternType::CirclesGrid
        )
    }
}

/// Otsu threshold of the frame and the gap between the two class means.
fn otsu_threshold(frame: &GrayImage) -> (u8, f64) {
    let mut histogram = [0u64; 256];
    for &v in frame.as_raw() {
        histogram[v as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    let sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &h)| i as f64 * h as f64)
        .sum();

    let mut weight_background = 0u64;
    let mut sum_background = 0.0;
    let mut best = (0u8, 0.0f64, 0.0f64);
    for (t, &h) in histogram.iter().enumerate() {
        weight_background += h;
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0 {
            break;
        }
        sum_background += t as f64 * h as f64;
        let mean_background = sum_background / weight_background as f64;
        let mean_foreground = (sum - sum_background) / weight_foreground as f64;
        let between = weight_background as f64
            * weight_foreground as f64
            * (mean_background - mean_foreground).powi(2);
        if between > best.1 {
            best = (t as u8, between, mean_foreground - mean_background);
        }
    }
    (best.0, best.2)
}

/// Keeps a pixel only when it and its four neighbours are set.
fn erode(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let idx = y * width + x;
            out[idx] = mask[idx]
                && mask[idx - 1]
                && mask[idx + 1]
                && mask[idx - width]
                && mask[idx + width];
        }
    }
    out
}

#[derive(Debug, Clone)]
struct Component {
    area: usize,
    sum_x: u64,
    sum_y: u64,
    min_x: usize,
    max_x: usize,
    min_y: usize,
    max_y: usize,
    touches_border: bool,
}

/// 4-connected components of the set pixels.
fn label_components(mask: &[bool], width: usize, height: usize) -> Vec<Component> {
    let mut visited = vec![false; mask.len()];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let mut component = Component {
            area: 0,
            sum_x: 0,
            sum_y: 0,
            min_x: usize::MAX,
            max_x: 0,
            min_y: usize::MAX,
            max_y: 0,
            touches_border: false,
        };

        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;
            component.area += 1;
            component.sum_x += x as u64;
            component.sum_y += y as u64;
            component.min_x = component.min_x.min(x);
            component.max_x = component.max_x.max(x);
            component.min_y = component.min_y.min(y);
            component.max_y = component.max_y.max(y);
            if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
                component.touches_border = true;
            }

            let mut visit = |n: usize| {
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < width {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - width);
            }
            if y + 1 < height {
                visit(idx + width);
            }
        }
        components.push(component);
    }
    components
}

/// Index of the node with the smallest (or largest) key.
fn extreme(nodes: &[Point2<f64>], key: impl Fn(&Point2<f64>) -> f64, max: bool) -> usize {
    let mut best = 0;
    for (i, p) in nodes.iter().enumerate() {
        let better = if max {
            key(p) > key(&nodes[best])
        } else {
            key(p) < key(&nodes[best])
        };
        if better {
            best = i;
        }
    }
    best
}

fn median_area(blobs: &[Blob]) -> f64 {
    let mut areas: Vec<usize> = blobs.iter().map(|b| b.area).collect();
    areas.sort_unstable();
    areas[areas.len() / 2] as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use nalgebra::Matrix3;

    fn board_homography() -> Matrix3<f64> {
        Matrix3::new(32.0, 3.0, 150.0, -2.0, 31.0, 120.0, 0.004, 0.002, 1.0)
    }

    /// Renders a pattern whose nodes sit at integer plane coordinates.
    fn render(h: &Matrix3<f64>, dark: impl Fn(f64, f64) -> bool) -> GrayImage {
        let h_inv = h.try_inverse().unwrap();
        GrayImage::from_fn(640, 480, |x, y| {
            let plane = apply_homography(&h_inv, &Point2::new(x as f64, y as f64)).unwrap();
            if dark(plane.x, plane.y) {
                Luma([30u8])
            } else {
                Luma([220u8])
            }
        })
    }

    fn spec(pattern_type: PatternType, columns: i32, rows: i32) -> PatternSpec {
        PatternSpec {
            pattern_type,
            columns,
            rows,
            square_size: 25.0,
        }
    }

    fn assert_nodes(found: &[Point2<f64>], h: &Matrix3<f64>, columns: usize, rows: usize) {
        assert_eq!(found.len(), columns * rows);
        for i in 0..rows {
            for j in 0..columns {
                let expected = apply_homography(h, &Point2::new(j as f64, i as f64)).unwrap();
                let got = found[i * columns + j];
                assert!(
                    (got - expected).norm() < 1.0,
                    "node ({}, {}) at {:?}, expected {:?}",
                    j,
                    i,
                    got,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_detects_rendered_chessboard() {
        let h = board_homography();
        let (columns, rows) = (9, 6);
        let frame = render(&h, |x, y| {
            // Squares span [-1, columns] x [-1, rows]; inner corners are integers.
            if x < -1.0 || y < -1.0 || x >= columns as f64 || y >= rows as f64 {
                return false;
            }
            let sx = (x + 1.0).floor() as i64;
            let sy = (y + 1.0).floor() as i64;
            (sx + sy) % 2 == 0
        });

        let detector = BlobGridDetector::new();
        let found = detector
            .detect(&frame, &spec(PatternType::Chessboard, columns, rows))
            .expect("chessboard should be found");
        assert_nodes(&found, &h, columns as usize, rows as usize);
    }

    #[test]
    fn test_detects_rendered_circle_grid() {
        let h = board_homography();
        let (columns, rows) = (7, 5);
        let frame = render(&h, |x, y| {
            let (j, i) = (x.round(), y.round());
            j >= 0.0
                && i >= 0.0
                && j < columns as f64
                && i < rows as f64
                && ((x - j).powi(2) + (y - i).powi(2)).sqrt() < 0.3
        });

        let detector = BlobGridDetector::new();
        let found = detector
            .detect(&frame, &spec(PatternType::CirclesGrid, columns, rows))
            .expect("circle grid should be found");
        assert_nodes(&found, &h, columns as usize, rows as usize);
    }

    #[test]
    fn test_blank_frame_has_no_pattern() {
        let frame = GrayImage::from_pixel(640, 480, Luma([200u8]));
        let detector = BlobGridDetector::new();
        assert!(detector
            .detect(&frame, &spec(PatternType::Chessboard, 9, 6))
            .is_none());
    }

    #[test]
    fn test_wrong_grid_size_is_not_found() {
        let h = board_homography();
        let frame = render(&h, |x, y| {
            let (j, i) = (x.round(), y.round());
            (0.0..7.0).contains(&j)
                && (0.0..5.0).contains(&i)
                && ((x - j).powi(2) + (y - i).powi(2)).sqrt() < 0.3
        });
        let detector = BlobGridDetector::new();
        assert!(detector
            .detect(&frame, &spec(PatternType::CirclesGrid, 8, 5))
            .is_none());
    }

    #[test]
    fn test_asymmetric_grid_unsupported() {
        let detector = BlobGridDetector::new();
        assert!(!detector.supports(PatternType::AsymmetricCirclesGrid));
        assert!(detector.supports(PatternType::Chessboard));
    }

    #[test]
    fn test_otsu_splits_two_levels() {
        let frame = GrayImage::from_fn(20, 10, |x, _| {
            if x < 10 {
                Luma([40u8])
            } else {
                Luma([210u8])
            }
        });
        let (threshold, contrast) = otsu_threshold(&frame);
        assert!((40..210).contains(&threshold));
        assert!((contrast - 170.0).abs() < 1e-9);
    }
}
