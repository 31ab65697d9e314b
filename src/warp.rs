//! Output grid and nearest-neighbour resampling.
//!
//! The grid is north-up and lives in the target CRS. Sampling a source raster
//! onto it means transforming every grid pixel centre into the source CRS and
//! picking the source pixel it falls into. Doing this once per asset resamples
//! and reprojects in a single step and never interpolates class values.

/// Metres per degree along the equator, used to express a metric resolution in
/// a geographic CRS.
pub const METRES_PER_DEGREE: f64 = 111_320.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a [f64; 2]>) -> Option<Self> {
        let mut bounds: Option<Self> = None;
        for &[x, y] in points {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            bounds = Some(match bounds {
                None => Self { min_x: x, min_y: y, max_x: x, max_y: y },
                Some(b) => Self {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
            });
        }
        bounds
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Grid {
    pub x_min: f64,
    pub y_max: f64,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
}

impl Grid {
    /// Smallest grid with `resolution` sized pixels aligned to multiples of
    /// the resolution that covers `bounds`. Degenerate bounds still yield one
    /// pixel.
    pub fn covering(bounds: &Bounds, resolution: f64) -> Option<Self> {
        if !(resolution > 0.0) || !resolution.is_finite() {
            return None;
        }
        let x_min = (bounds.min_x / resolution).floor() * resolution;
        let y_min = (bounds.min_y / resolution).floor() * resolution;
        let x_max = (bounds.max_x / resolution).ceil() * resolution;
        let y_max = (bounds.max_y / resolution).ceil() * resolution;
        let width = (((x_max - x_min) / resolution).round() as usize).max(1);
        let height = (((y_max - y_min) / resolution).round() as usize).max(1);
        Some(Self { x_min, y_max, resolution, width, height })
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn geo_transform(&self) -> [f64; 6] {
        [self.x_min, self.resolution, 0.0, self.y_max, 0.0, -self.resolution]
    }

    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.x_min + (col as f64 + 0.5) * self.resolution,
            self.y_max - (row as f64 + 0.5) * self.resolution,
        )
    }

    /// Pixel centres in row-major order, as separate coordinate vectors.
    pub fn pixel_centers(&self) -> (Vec<f64>, Vec<f64>) {
        let mut xs = Vec::with_capacity(self.pixel_count());
        let mut ys = Vec::with_capacity(self.pixel_count());
        for row in 0..self.height {
            for col in 0..self.width {
                let (x, y) = self.pixel_center(col, row);
                xs.push(x);
                ys.push(y);
            }
        }
        (xs, ys)
    }
}

/// Express a resolution given in metres in units of the target CRS.
pub fn resolution_in_crs(resolution_m: f64, geographic: bool) -> f64 {
    if geographic {
        resolution_m / METRES_PER_DEGREE
    } else {
        resolution_m
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// Maps every grid pixel onto a pixel inside a window of the source raster.
#[derive(Debug, Clone)]
pub struct NearestSampler {
    window: PixelWindow,
    lookup: Vec<Option<usize>>,
}

impl NearestSampler {
    /// `xs`/`ys` are grid pixel centres already transformed into the source
    /// CRS. Returns `None` when no centre falls inside the source raster.
    pub fn new(
        geo_transform: &[f64; 6],
        raster_size: (usize, usize),
        xs: &[f64],
        ys: &[f64],
    ) -> Option<Self> {
        let inverse = invert_geo_transform(geo_transform)?;
        let (cols, rows) = raster_size;

        let pixels: Vec<Option<(usize, usize)>> = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| {
                if !x.is_finite() || !y.is_finite() {
                    return None;
                }
                let col = (inverse[0] + inverse[1] * x + inverse[2] * y).floor();
                let row = (inverse[3] + inverse[4] * x + inverse[5] * y).floor();
                if col < 0.0 || row < 0.0 || col >= cols as f64 || row >= rows as f64 {
                    return None;
                }
                Some((col as usize, row as usize))
            })
            .collect();

        let (mut col_min, mut row_min) = (usize::MAX, usize::MAX);
        let (mut col_max, mut row_max) = (0, 0);
        for &(col, row) in pixels.iter().flatten() {
            col_min = col_min.min(col);
            row_min = row_min.min(row);
            col_max = col_max.max(col);
            row_max = row_max.max(row);
        }
        if col_min == usize::MAX {
            return None;
        }

        let window = PixelWindow {
            col_off: col_min,
            row_off: row_min,
            width: col_max - col_min + 1,
            height: row_max - row_min + 1,
        };
        let lookup = pixels
            .into_iter()
            .map(|p| p.map(|(col, row)| (row - window.row_off) * window.width + (col - window.col_off)))
            .collect();

        Some(Self { window, lookup })
    }

    /// Source window that has to be read.
    pub fn window(&self) -> PixelWindow {
        self.window
    }

    /// Number of grid pixels that land inside the source raster.
    pub fn coverage(&self) -> usize {
        self.lookup.iter().filter(|p| p.is_some()).count()
    }

    /// Resample the window's values (row-major) onto the grid.
    pub fn sample(&self, window_values: &[f32], nodata: f32) -> Vec<f32> {
        self.lookup
            .iter()
            .map(|p| match p {
                Some(i) => window_values.get(*i).copied().unwrap_or(nodata),
                None => nodata,
            })
            .collect()
    }
}

/// Inverse of a GDAL affine geo transform, mapping georeferenced coordinates
/// to fractional pixel/line positions.
pub fn invert_geo_transform(gt: &[f64; 6]) -> Option<[f64; 6]> {
    let det = gt[1] * gt[5] - gt[2] * gt[4];
    if det.abs() < f64::EPSILON * 1e-3 || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    let a = gt[5] * inv_det;
    let b = -gt[2] * inv_det;
    let d = -gt[4] * inv_det;
    let e = gt[1] * inv_det;
    Some([
        -gt[0] * a - gt[3] * b,
        a,
        b,
        -gt[0] * d - gt[3] * e,
        d,
        e,
    ])
}
