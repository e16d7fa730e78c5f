//! Visualization of class maps over the original frame.
//!
//! Four composition modes share one colormap lookup: a translucent fill, a
//! one-pixel class contour, an original/segmentation split view, and an HSV
//! hue transplant that keeps image detail while painting scene semantics.
//! Class 0 is background everywhere: it colors black and never draws a
//! contour.

use std::str::FromStr;

use image::{Rgb, RgbImage};
use seg_core::catalog::hsv_to_rgb;
use seg_core::{ClassMap, ModelMode};

/// The closed set of composition modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VizMode {
    #[default]
    Filled,
    Contour,
    SideBySide,
    Blend,
}

impl VizMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VizMode::Filled => "filled",
            VizMode::Contour => "contour",
            VizMode::SideBySide => "side-by-side",
            VizMode::Blend => "blend",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown visualization mode: {0:?}")]
pub struct UnknownVizMode(pub String);

impl FromStr for VizMode {
    type Err = UnknownVizMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filled" => Ok(VizMode::Filled),
            "contour" => Ok(VizMode::Contour),
            "side-by-side" => Ok(VizMode::SideBySide),
            "blend" => Ok(VizMode::Blend),
            other => Err(UnknownVizMode(other.to_string())),
        }
    }
}

/// Renders class maps for one vocabulary.
///
/// Sessions rebuild their renderer on mode change so the colormap always
/// matches the active vocabulary.
pub struct Renderer {
    colormap: &'static [[u8; 3]],
    num_classes: usize,
}

impl Renderer {
    pub fn for_mode(mode: ModelMode) -> Self {
        let vocabulary = mode.vocabulary();
        Self {
            colormap: vocabulary.colormap(),
            num_classes: vocabulary.num_classes(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Compose `map` over `image` in the requested mode.
    ///
    /// `opacity` is clamped to `[0, 1]` and only affects `Filled`. A filter
    /// restricts the overlay to the listed classes; entries outside the
    /// vocabulary are ignored.
    pub fn render(
        &self,
        image: &RgbImage,
        map: &ClassMap,
        mode: VizMode,
        opacity: f64,
        class_filter: Option<&[u32]>,
    ) -> RgbImage {
        let pass = self.filter_table(class_filter);
        let opacity = opacity.clamp(0.0, 1.0);
        match mode {
            VizMode::Filled => self.filled(image, map, opacity, &pass),
            VizMode::Contour => self.contour(image, map, &pass),
            VizMode::SideBySide => self.side_by_side(image, map, &pass),
            VizMode::Blend => self.blend(image, map, &pass),
        }
    }

    /// Per-class pass table; `None` filter means everything passes.
    fn filter_table(&self, class_filter: Option<&[u32]>) -> Vec<bool> {
        match class_filter {
            None => vec![true; self.num_classes],
            Some(classes) => {
                let mut table = vec![false; self.num_classes];
                for &class in classes {
                    if let Some(slot) = table.get_mut(class as usize) {
                        *slot = true;
                    }
                }
                table
            }
        }
    }

    #[inline]
    fn color_of(&self, class: u8) -> [u8; 3] {
        let index = (class as usize).min(self.num_classes - 1);
        self.colormap[index]
    }

    fn filled(
        &self,
        image: &RgbImage,
        map: &ClassMap,
        opacity: f64,
        pass: &[bool],
    ) -> RgbImage {
        let mut out = image.clone();
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let class = map.class_at(x, y);
            if !passes(pass, class) {
                continue;
            }
            let color = self.color_of(class);
            for channel in 0..3 {
                let blended = (1.0 - opacity) * pixel[channel] as f64
                    + opacity * color[channel] as f64;
                pixel[channel] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    fn contour(&self, image: &RgbImage, map: &ClassMap, pass: &[bool]) -> RgbImage {
        let mut out = image.clone();
        let (width, height) = (map.width(), map.height());
        for y in 0..height {
            for x in 0..width {
                let class = map.class_at(x, y);
                if class == 0 || !passes(pass, class) {
                    continue;
                }
                if self.is_boundary(map, x, y, class, pass) {
                    out.put_pixel(x, y, Rgb(self.color_of(class)));
                }
            }
        }
        out
    }

    /// A pixel sits on a boundary when any 4-neighbor carries a different
    /// class. With a filter active the edge is only drawn when both sides
    /// pass, so filtered-out regions get no outline against their
    /// neighbours.
    fn is_boundary(&self, map: &ClassMap, x: u32, y: u32, class: u8, pass: &[bool]) -> bool {
        let mut neighbours = [None; 4];
        if x > 0 {
            neighbours[0] = Some(map.class_at(x - 1, y));
        }
        if x + 1 < map.width() {
            neighbours[1] = Some(map.class_at(x + 1, y));
        }
        if y > 0 {
            neighbours[2] = Some(map.class_at(x, y - 1));
        }
        if y + 1 < map.height() {
            neighbours[3] = Some(map.class_at(x, y + 1));
        }
        neighbours
            .into_iter()
            .flatten()
            .any(|neighbour| neighbour != class && passes(pass, neighbour))
    }

    fn side_by_side(&self, image: &RgbImage, map: &ClassMap, pass: &[bool]) -> RgbImage {
        let (width, height) = image.dimensions();
        let mut out = RgbImage::new(width * 2, height);
        for (x, y, pixel) in image.enumerate_pixels() {
            out.put_pixel(x, y, *pixel);
            let class = map.class_at(x, y);
            let color = if passes(pass, class) {
                self.color_of(class)
            } else {
                [0, 0, 0]
            };
            out.put_pixel(x + width, y, Rgb(color));
        }
        out
    }

    fn blend(&self, image: &RgbImage, map: &ClassMap, pass: &[bool]) -> RgbImage {
        let mut out = image.clone();
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let class = map.class_at(x, y);
            if !passes(pass, class) {
                continue;
            }
            let color = self.color_of(class);
            if color == [0, 0, 0] {
                continue;
            }
            let (class_hue, _, _) = rgb_to_hsv(color);
            let (_, saturation, value) = rgb_to_hsv([pixel[0], pixel[1], pixel[2]]);
            let replaced = hsv_to_rgb(class_hue, saturation, value);
            *pixel = Rgb(replaced);
        }
        out
    }
}

#[inline]
fn passes(pass: &[bool], class: u8) -> bool {
    pass.get(class as usize).copied().unwrap_or(false)
}

/// RGB bytes to HSV with hue in degrees and saturation/value in `[0, 1]`.
fn rgb_to_hsv(rgb: [u8; 3]) -> (f32, f32, f32) {
    let r = rgb[0] as f32 / 255.0;
    let g = rgb[1] as f32 / 255.0;
    let b = rgb[2] as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation, max)
}
