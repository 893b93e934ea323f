use super::heatmap::ImportanceMap;
use shared::RegionReport;

/// A connected high-activation component of an importance map. Derived data;
/// never persisted independently of the parent explanation.
#[derive(Debug, Clone, PartialEq)]
pub struct DefectRegion {
    /// Bounding box `(x, y, width, height)` in map pixels.
    pub bbox: (u32, u32, u32, u32),
    /// Exact component pixel count (mask area, not bounding-box area).
    pub area_px: usize,
    /// `area_px / (map height * map width)`.
    pub coverage_ratio: f32,
    /// Mean map value over the component's pixels.
    pub mean_intensity: f32,
    /// Component centroid `(x, y)`.
    pub centroid: (f32, f32),
}

impl DefectRegion {
    pub fn to_report(&self) -> RegionReport {
        RegionReport {
            x: self.bbox.0,
            y: self.bbox.1,
            width: self.bbox.2,
            height: self.bbox.3,
            area_px: self.area_px,
            coverage_ratio: self.coverage_ratio,
            mean_intensity: self.mean_intensity,
            centroid_x: self.centroid.0,
            centroid_y: self.centroid.1,
        }
    }
}

/// Thresholds the importance map and finds connected high-activation
/// components, discarding sub-threshold noise.
#[derive(Debug, Clone)]
pub struct RegionExtractor {
    threshold: f32,
    min_area: usize,
}

impl RegionExtractor {
    pub fn new(threshold: f32, min_area: usize) -> Self {
        Self {
            threshold,
            min_area,
        }
    }

    /// Extract regions ordered by descending area (ties broken by mean
    /// intensity).
    pub fn extract(&self, map: &ImportanceMap) -> Vec<DefectRegion> {
        let grid = map.grid();
        let (height, width) = grid.dim();
        if height == 0 || width == 0 {
            return Vec::new();
        }
        let total_px = height * width;
        let mut visited = vec![false; total_px];
        let mut regions = Vec::new();
        let mut stack = Vec::new();

        for start_y in 0..height {
            for start_x in 0..width {
                let start = start_y * width + start_x;
                if visited[start] || grid[[start_y, start_x]] <= self.threshold {
                    continue;
                }

                // Flood-fill one 4-connected component.
                visited[start] = true;
                stack.push((start_y, start_x));
                let (mut min_x, mut max_x) = (start_x, start_x);
                let (mut min_y, mut max_y) = (start_y, start_y);
                let mut area = 0usize;
                let mut intensity_sum = 0f32;
                let (mut sum_x, mut sum_y) = (0f64, 0f64);

                while let Some((y, x)) = stack.pop() {
                    area += 1;
                    intensity_sum += grid[[y, x]];
                    sum_x += x as f64;
                    sum_y += y as f64;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);

                    let neighbors = [
                        (y.wrapping_sub(1), x),
                        (y + 1, x),
                        (y, x.wrapping_sub(1)),
                        (y, x + 1),
                    ];
                    for (ny, nx) in neighbors {
                        if ny >= height || nx >= width {
                            continue;
                        }
                        let idx = ny * width + nx;
                        if !visited[idx] && grid[[ny, nx]] > self.threshold {
                            visited[idx] = true;
                            stack.push((ny, nx));
                        }
                    }
                }

                if area < self.min_area {
                    continue;
                }
                regions.push(DefectRegion {
                    bbox: (
                        min_x as u32,
                        min_y as u32,
                        (max_x - min_x + 1) as u32,
                        (max_y - min_y + 1) as u32,
                    ),
                    area_px: area,
                    coverage_ratio: area as f32 / total_px as f32,
                    mean_intensity: intensity_sum / area as f32,
                    centroid: ((sum_x / area as f64) as f32, (sum_y / area as f64) as f32),
                });
            }
        }

        regions.sort_by(|a, b| {
            b.area_px
                .cmp(&a.area_px)
                .then(b.mean_intensity.total_cmp(&a.mean_intensity))
        });
        regions
    }

    /// Compose the human-readable location phrase for an ordered region list.
    pub fn describe(&self, regions: &[DefectRegion], map_dim: (usize, usize)) -> String {
        let (height, width) = map_dim;
        match regions {
            [] => "No well-localized region identified; diffuse low-level activation across image."
                .to_string(),
            [primary] => format!(
                "Primary defect indication in {} (coverage: {:.1}%)",
                grid_position(primary.centroid, width, height),
                primary.coverage_ratio * 100.0
            ),
            [primary, secondary, rest @ ..] => {
                let mut description = format!(
                    "Primary defect indication in {} (coverage: {:.1}%); secondary indication in {} (coverage: {:.1}%)",
                    grid_position(primary.centroid, width, height),
                    primary.coverage_ratio * 100.0,
                    grid_position(secondary.centroid, width, height),
                    secondary.coverage_ratio * 100.0
                );
                if !rest.is_empty() {
                    description.push_str(&format!("; {} additional minor regions", rest.len()));
                }
                description
            }
        }
    }
}

/// Map a centroid to the 3x3 positional grid. Horizontal "middle" is elided,
/// so the center cell reads "central region".
fn grid_position(centroid: (f32, f32), width: usize, height: usize) -> String {
    let (cx, cy) = centroid;
    let h = height as f32;
    let w = width as f32;
    let vertical = if cy < h / 3.0 {
        "upper"
    } else if cy < 2.0 * h / 3.0 {
        "central"
    } else {
        "lower"
    };
    let horizontal = if cx < w / 3.0 {
        "left"
    } else if cx < 2.0 * w / 3.0 {
        "middle"
    } else {
        "right"
    };
    if horizontal == "middle" {
        format!("{vertical} region")
    } else {
        format!("{vertical}-{horizontal} region")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn map_with_block(
        dim: (usize, usize),
        block: (usize, usize, usize, usize),
        value: f32,
    ) -> ImportanceMap {
        let mut grid = Array2::<f32>::zeros(dim);
        let (y0, x0, h, w) = block;
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                grid[[y, x]] = value;
            }
        }
        ImportanceMap::new(grid, false)
    }

    #[test]
    fn coverage_is_exact_mask_area_over_image_area() {
        // 10x10 block in a 40x40 map: 100 / 1600.
        let map = map_with_block((40, 40), (5, 5, 10, 10), 0.9);
        let extractor = RegionExtractor::new(0.5, 50);
        let regions = extractor.extract(&map);
        assert_eq!(regions.len(), 1);
        let region = &regions[0];
        assert_eq!(region.area_px, 100);
        assert_eq!(region.coverage_ratio, 100.0 / 1600.0);
        assert!((0.0..=1.0).contains(&region.coverage_ratio));
        assert_eq!(region.bbox, (5, 5, 10, 10));
        assert!((region.mean_intensity - 0.9).abs() < 1e-6);
    }

    #[test]
    fn small_components_are_discarded_as_noise() {
        let map = map_with_block((30, 30), (2, 2, 3, 3), 0.9);
        let extractor = RegionExtractor::new(0.5, 50);
        assert!(extractor.extract(&map).is_empty());
    }

    #[test]
    fn l_shaped_component_uses_mask_area_not_bbox_area() {
        let mut grid = Array2::<f32>::zeros((40, 40));
        // L shape: vertical 12x4 bar plus horizontal 4x12 bar sharing a corner.
        for y in 0..12 {
            for x in 0..4 {
                grid[[y, x]] = 0.8;
            }
        }
        for y in 8..12 {
            for x in 4..12 {
                grid[[y, x]] = 0.8;
            }
        }
        let map = ImportanceMap::new(grid, false);
        let extractor = RegionExtractor::new(0.5, 10);
        let regions = extractor.extract(&map);
        assert_eq!(regions.len(), 1);
        // 12*4 + 4*8 = 80 pixels, while the bbox would be 12*12 = 144.
        assert_eq!(regions[0].area_px, 80);
        assert_eq!(regions[0].coverage_ratio, 80.0 / 1600.0);
    }

    #[test]
    fn regions_are_ordered_by_descending_area() {
        let mut grid = Array2::<f32>::zeros((60, 60));
        for y in 2..10 {
            for x in 2..10 {
                grid[[y, x]] = 0.9; // 64 px
            }
        }
        for y in 30..50 {
            for x in 30..50 {
                grid[[y, x]] = 0.7; // 400 px
            }
        }
        let map = ImportanceMap::new(grid, false);
        let extractor = RegionExtractor::new(0.5, 10);
        let regions = extractor.extract(&map);
        assert_eq!(regions.len(), 2);
        assert!(regions[0].area_px > regions[1].area_px);
        assert_eq!(regions[0].area_px, 400);
    }

    #[test]
    fn central_region_phrase_for_centered_blob() {
        // Blob centered in the middle third covering 8.5% of a 200x200 map:
        // 3400 px as a 50x68 block.
        let map = map_with_block((200, 200), (75, 66, 50, 68), 0.9);
        let extractor = RegionExtractor::new(0.5, 50);
        let regions = extractor.extract(&map);
        assert_eq!(regions.len(), 1);
        let description = extractor.describe(&regions, map.dim());
        assert!(description.contains("central region"), "{description}");
        assert!(description.contains("8.5%"), "{description}");
    }

    #[test]
    fn empty_map_description_mentions_diffuse_activation() {
        let extractor = RegionExtractor::new(0.5, 50);
        let description = extractor.describe(&[], (100, 100));
        assert_eq!(
            description,
            "No well-localized region identified; diffuse low-level activation across image."
        );
    }

    #[test]
    fn many_regions_report_top_two_and_minor_count() {
        let mut grid = Array2::<f32>::zeros((90, 90));
        let blocks = [
            (2usize, 2usize, 20usize, 20usize),  // 400 px upper-left
            (60, 60, 18, 18),                    // 324 px lower-right
            (2, 70, 10, 10),                     // 100 px
            (70, 2, 9, 9),                       // 81 px
        ];
        for (y0, x0, h, w) in blocks {
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    grid[[y, x]] = 0.9;
                }
            }
        }
        let map = ImportanceMap::new(grid, false);
        let extractor = RegionExtractor::new(0.5, 50);
        let regions = extractor.extract(&map);
        assert_eq!(regions.len(), 4);
        let description = extractor.describe(&regions, map.dim());
        assert!(description.contains("Primary defect indication in upper-left region"));
        assert!(description.contains("secondary indication in lower-right region"));
        assert!(description.contains("2 additional minor regions"), "{description}");
    }

    #[test]
    fn corner_positions_name_both_axes() {
        assert_eq!(grid_position((5.0, 5.0), 100, 100), "upper-left region");
        assert_eq!(grid_position((95.0, 95.0), 100, 100), "lower-right region");
        assert_eq!(grid_position((50.0, 95.0), 100, 100), "lower region");
    }
}
