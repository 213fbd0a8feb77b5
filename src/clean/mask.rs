//! Clean masks.

use ndarray::{s, Array2, ArrayView2};

/// How a mask is handed to the imaging engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    /// A rectangle, passed as a region string.
    Box([usize; 4]),
    /// Arbitrary pixels, passed as a mask image.
    Image,
}

/// Pixels the deconvolution may place model components in.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pixels: Array2<bool>,
    kind: MaskKind,
}

impl Mask {
    /// A mask covering `[x0, x1) × [y0, y1)` given as `[x0, y0, x1, y1]`, clipped to
    /// `shape = (height, width)`.
    pub fn from_box(shape: (usize, usize), bbox: [usize; 4]) -> Self {
        let (height, width) = shape;
        let [x0, y0, x1, y1] = bbox;
        let (x1, y1) = (x1.min(width), y1.min(height));
        let (x0, y0) = (x0.min(x1), y0.min(y1));
        let mut pixels = Array2::from_elem(shape, false);
        pixels.slice_mut(s![y0..y1, x0..x1]).fill(true);
        Self {
            pixels,
            kind: MaskKind::Box([x0, y0, x1, y1]),
        }
    }

    /// The central quarter of an image, `x` in `[W/4, 3W/4)` and `y` in `[H/4, 3H/4)`.
    pub fn central_quarter(shape: (usize, usize)) -> Self {
        let (height, width) = shape;
        Self::from_box(shape, [width / 4, height / 4, 3 * width / 4, 3 * height / 4])
    }

    /// Pixels where `image` is above `limit`, e.g. a primary beam above the beam limit.
    pub fn from_threshold(image: ArrayView2<f32>, limit: f32) -> Self {
        Self {
            pixels: image.mapv(|v| v > limit),
            kind: MaskKind::Image,
        }
    }

    /// A mask from raw pixels.
    pub fn from_pixels(pixels: Array2<bool>) -> Self {
        Self {
            pixels,
            kind: MaskKind::Image,
        }
    }

    /// `(height, width)`
    pub fn shape(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    /// The mask pixels, indexed `[y, x]`.
    pub fn pixels(&self) -> ArrayView2<bool> {
        self.pixels.view()
    }

    /// How the mask is passed to the engine.
    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    /// Number of pixels in the mask.
    pub fn count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p).count()
    }

    /// Whether no pixel is in the mask.
    pub fn is_empty(&self) -> bool {
        !self.pixels.iter().any(|&p| p)
    }

    /// The smallest box holding every masked pixel as `[x0, y0, x1, y1]`, upper bounds exclusive.
    pub fn bounding_box(&self) -> Option<[usize; 4]> {
        let mut bbox: Option<[usize; 4]> = None;
        for ((y, x), &set) in self.pixels.indexed_iter() {
            if !set {
                continue;
            }
            bbox = Some(match bbox {
                None => [x, y, x + 1, y + 1],
                Some([x0, y0, x1, y1]) => [x0.min(x), y0.min(y), x1.max(x + 1), y1.max(y + 1)],
            });
        }
        bbox
    }

    /// The box as an engine region, corners inclusive. `None` for image masks.
    pub fn to_region(&self) -> Option<String> {
        match self.kind {
            MaskKind::Box([x0, y0, x1, y1]) if x1 > x0 && y1 > y0 => Some(format!(
                "box[[{x0}pix,{y0}pix],[{}pix,{}pix]]",
                x1 - 1,
                y1 - 1
            )),
            _ => None,
        }
    }

    /// The mask as a 1/0 image.
    pub fn to_image(&self) -> Array2<f32> {
        self.pixels.mapv(|p| if p { 1.0 } else { 0.0 })
    }
}
