//! Pure conversions between image, render and screen space.
//!
//! Image space is native map pixels with y growing downward. Render space is
//! centered on the image plane with y growing upward, scaled so the whole
//! image fits the viewport. Screen space is device pixels from the top-left
//! corner of the viewport, after the local pan/zoom transform.

use crate::geometry::{Dimensions, ImageBounds, ImagePoint, RenderPoint, ScreenPoint};
use crate::scene::Grid;
use crate::viewport::{ViewportMetrics, ViewportTransform};

/// Size of the image plane in render space plus the image-to-render ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderGeometry {
    pub factor: f64,
    pub dimensions: Dimensions,
}

impl RenderGeometry {
    /// Fits `image` into `fit_ratio` of the visible render area.
    pub fn fit(image: ImageBounds, metrics: ViewportMetrics, fit_ratio: f64) -> Option<Self> {
        let natural = image.as_dimensions();
        if !natural.is_drawable() {
            return None;
        }
        let available = Dimensions::new(metrics.width * fit_ratio, metrics.height * fit_ratio);
        let dimensions = optimal_dimensions(natural, available)?;
        Some(Self {
            factor: dimensions.width / natural.width,
            dimensions,
        })
    }

    pub fn to_render(self, point: ImagePoint) -> RenderPoint {
        to_render_space(point, self.factor, self.dimensions)
    }

    pub fn to_image(self, point: RenderPoint) -> ImagePoint {
        to_image_space(point, self.factor, self.dimensions)
    }
}

pub fn to_render_space(point: ImagePoint, factor: f64, dimensions: Dimensions) -> RenderPoint {
    RenderPoint::new(
        point.x * factor - dimensions.width / 2.0,
        -point.y * factor + dimensions.height / 2.0,
    )
}

pub fn to_image_space(point: RenderPoint, factor: f64, dimensions: Dimensions) -> ImagePoint {
    ImagePoint::new(
        (point.x + dimensions.width / 2.0) / factor,
        -((point.y - dimensions.height / 2.0) / factor),
    )
}

/// Largest size with the ratio of `natural` that fits inside `available`.
pub fn optimal_dimensions(natural: Dimensions, available: Dimensions) -> Option<Dimensions> {
    if !natural.is_drawable() || !available.is_drawable() {
        return None;
    }
    let ratio = natural.ratio();
    if available.width / ratio <= available.height {
        Some(Dimensions::new(available.width, available.width / ratio))
    } else {
        Some(Dimensions::new(available.height * ratio, available.height))
    }
}

/// Maps a screen point onto the untransformed viewport plane (world units).
pub fn screen_to_world(point: ScreenPoint, metrics: ViewportMetrics) -> RenderPoint {
    let pixels = metrics.pixel_size();
    RenderPoint::new(
        (point.x - pixels.width / 2.0) / metrics.factor,
        (pixels.height / 2.0 - point.y) / metrics.factor,
    )
}

pub fn world_to_screen(point: RenderPoint, metrics: ViewportMetrics) -> ScreenPoint {
    let pixels = metrics.pixel_size();
    ScreenPoint::new(
        point.x * metrics.factor + pixels.width / 2.0,
        pixels.height / 2.0 - point.y * metrics.factor,
    )
}

/// Screen point to image-plane render coordinates under the pan/zoom transform.
pub fn screen_to_render(
    point: ScreenPoint,
    metrics: ViewportMetrics,
    transform: ViewportTransform,
) -> RenderPoint {
    let world = screen_to_world(point, metrics);
    RenderPoint::new(
        (world.x - transform.translate_x) / transform.scale,
        (world.y - transform.translate_y) / transform.scale,
    )
}

pub fn render_to_screen(
    point: RenderPoint,
    metrics: ViewportMetrics,
    transform: ViewportTransform,
) -> ScreenPoint {
    let world = RenderPoint::new(
        point.x * transform.scale + transform.translate_x,
        point.y * transform.scale + transform.translate_y,
    );
    world_to_screen(world, metrics)
}

pub fn screen_to_image(
    point: ScreenPoint,
    metrics: ViewportMetrics,
    transform: ViewportTransform,
    geometry: RenderGeometry,
) -> ImagePoint {
    geometry.to_image(screen_to_render(point, metrics, transform))
}

pub fn image_to_screen(
    point: ImagePoint,
    metrics: ViewportMetrics,
    transform: ViewportTransform,
    geometry: RenderGeometry,
) -> ScreenPoint {
    render_to_screen(geometry.to_render(point), metrics, transform)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLine {
    pub from: RenderPoint,
    pub to: RenderPoint,
}

/// Grids finer than this many lines per axis are not drawn.
const MAX_GRID_LINES_PER_AXIS: f64 = 4096.0;

/// Line positions along one axis: `offset` reduced into `[0, side)`, then
/// every `side` up to and including `extent`.
fn axis_lines(offset: f64, side: f64, extent: f64) -> Vec<f64> {
    let first = if offset.is_finite() {
        offset.rem_euclid(side)
    } else {
        0.0
    };
    if first > extent {
        return Vec::new();
    }
    let count = ((extent - first) / side).floor() + 1.0;
    if !count.is_finite() || count > MAX_GRID_LINES_PER_AXIS {
        tracing::warn!(side, extent, "grid too dense to draw");
        return Vec::new();
    }
    // Bounded by MAX_GRID_LINES_PER_AXIS above.
    (0..count as usize)
        .map(|index| first + index as f64 * side)
        .collect()
}

/// Horizontal then vertical grid lines across the image plane.
pub fn grid_lines(grid: &Grid, image: ImageBounds, geometry: RenderGeometry) -> Vec<GridLine> {
    let side = grid.side_length;
    if !side.is_finite() || side <= 0.0 {
        return Vec::new();
    }
    let half_width = geometry.dimensions.width / 2.0;
    let half_height = geometry.dimensions.height / 2.0;

    let rows = axis_lines(grid.y, side, f64::from(image.height))
        .into_iter()
        .map(|y| {
            let render_y = geometry.to_render(ImagePoint::new(0.0, y)).y;
            GridLine {
                from: RenderPoint::new(-half_width, render_y),
                to: RenderPoint::new(half_width, render_y),
            }
        });
    let columns = axis_lines(grid.x, side, f64::from(image.width))
        .into_iter()
        .map(|x| {
            let render_x = geometry.to_render(ImagePoint::new(x, 0.0)).x;
            GridLine {
                from: RenderPoint::new(render_x, -half_height),
                to: RenderPoint::new(render_x, half_height),
            }
        });
    rows.chain(columns).collect()
}
