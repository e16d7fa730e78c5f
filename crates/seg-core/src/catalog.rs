//! Class vocabularies and their colormaps.
//!
//! Two fixed vocabularies are served: a 21-entry COCO-stuff subset used by
//! the DeepLab presets and the 150-entry ADE20K list used by the transformer
//! presets. Index 0 is treated as background in both: it renders black and is
//! excluded from detected-class reporting and contour drawing.

use std::sync::OnceLock;

/// Identifier of a class vocabulary shared by one or more model modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vocabulary {
    Coco21,
    Ade150,
}

/// COCO-stuff subset predicted by the DeepLab exports.
pub const COCO_CLASSES: [&str; 21] = [
    "background",
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
];

/// ADE20K scene-parsing labels predicted by the transformer exports.
pub const ADE20K_CLASSES: [&str; 150] = [
    "wall",
    "building",
    "sky",
    "floor",
    "tree",
    "ceiling",
    "road",
    "bed",
    "windowpane",
    "grass",
    "cabinet",
    "sidewalk",
    "person",
    "earth",
    "door",
    "table",
    "mountain",
    "plant",
    "curtain",
    "chair",
    "car",
    "water",
    "painting",
    "sofa",
    "shelf",
    "house",
    "sea",
    "mirror",
    "rug",
    "field",
    "armchair",
    "seat",
    "fence",
    "desk",
    "rock",
    "wardrobe",
    "lamp",
    "bathtub",
    "railing",
    "cushion",
    "base",
    "box",
    "column",
    "signboard",
    "chest of drawers",
    "counter",
    "sand",
    "sink",
    "skyscraper",
    "fireplace",
    "refrigerator",
    "grandstand",
    "path",
    "stairs",
    "runway",
    "case",
    "pool table",
    "pillow",
    "screen door",
    "stairway",
    "river",
    "bridge",
    "bookcase",
    "blind",
    "coffee table",
    "toilet",
    "flower",
    "book",
    "hill",
    "bench",
    "countertop",
    "stove",
    "palm",
    "kitchen island",
    "computer",
    "swivel chair",
    "boat",
    "bar",
    "arcade machine",
    "hovel",
    "bus",
    "towel",
    "light",
    "truck",
    "tower",
    "chandelier",
    "awning",
    "streetlight",
    "booth",
    "television",
    "airplane",
    "dirt track",
    "apparel",
    "pole",
    "land",
    "bannister",
    "escalator",
    "ottoman",
    "bottle",
    "buffet",
    "poster",
    "stage",
    "van",
    "ship",
    "fountain",
    "conveyer belt",
    "canopy",
    "washer",
    "plaything",
    "swimming pool",
    "stool",
    "barrel",
    "basket",
    "waterfall",
    "tent",
    "bag",
    "minibike",
    "cradle",
    "oven",
    "ball",
    "food",
    "step",
    "tank",
    "trade name",
    "microwave",
    "pot",
    "animal",
    "bicycle",
    "lake",
    "dishwasher",
    "screen",
    "blanket",
    "sculpture",
    "hood",
    "sconce",
    "vase",
    "traffic light",
    "tray",
    "ashcan",
    "fan",
    "pier",
    "crt screen",
    "plate",
    "monitor",
    "bulletin board",
    "shower",
    "radiator",
    "glass",
    "clock",
    "flag",
];

impl Vocabulary {
    pub fn num_classes(self) -> usize {
        match self {
            Vocabulary::Coco21 => COCO_CLASSES.len(),
            Vocabulary::Ade150 => ADE20K_CLASSES.len(),
        }
    }

    pub fn labels(self) -> &'static [&'static str] {
        match self {
            Vocabulary::Coco21 => &COCO_CLASSES,
            Vocabulary::Ade150 => &ADE20K_CLASSES,
        }
    }

    /// RGB color table indexed by class, computed on first access and shared
    /// process-wide afterwards.
    pub fn colormap(self) -> &'static [[u8; 3]] {
        static COCO_COLORMAP: OnceLock<Vec<[u8; 3]>> = OnceLock::new();
        static ADE_COLORMAP: OnceLock<Vec<[u8; 3]>> = OnceLock::new();
        match self {
            Vocabulary::Coco21 => {
                COCO_COLORMAP.get_or_init(|| bit_reversal_colormap(COCO_CLASSES.len()))
            }
            Vocabulary::Ade150 => {
                ADE_COLORMAP.get_or_init(|| spread_colormap(ADE20K_CLASSES.len()))
            }
        }
    }
}

/// PASCAL VOC style colormap: each channel of class `i` collects one bit of
/// `i` per round, reversed into the high bits.
fn bit_reversal_colormap(num_classes: usize) -> Vec<[u8; 3]> {
    const NUM_BITS: u32 = 8;
    let mut table = Vec::with_capacity(num_classes);
    for i in 0..num_classes {
        let mut r: u8 = 0;
        let mut g: u8 = 0;
        let mut b: u8 = 0;
        let mut c = i;
        for j in 0..NUM_BITS {
            r |= ((c & 1) as u8) << (NUM_BITS - 1 - j);
            g |= (((c >> 1) & 1) as u8) << (NUM_BITS - 1 - j);
            b |= (((c >> 2) & 1) as u8) << (NUM_BITS - 1 - j);
            c >>= 3;
        }
        table.push([r, g, b]);
    }
    if !table.is_empty() {
        table[0] = [0, 0, 0];
    }
    table
}

/// Perceptually spread palette for large vocabularies: golden-angle hue
/// rotation over banded saturation/value so neighbouring class indices land
/// far apart on the color wheel. Entry 0 stays black.
fn spread_colormap(num_classes: usize) -> Vec<[u8; 3]> {
    const GOLDEN_ANGLE: f32 = 137.507_77;
    const SATURATIONS: [f32; 3] = [0.55, 0.75, 0.95];
    const VALUES: [f32; 3] = [0.95, 0.80, 0.65];
    let mut table = Vec::with_capacity(num_classes);
    table.push([0, 0, 0]);
    for i in 1..num_classes {
        let hue = (i as f32 * GOLDEN_ANGLE) % 360.0;
        let sat = SATURATIONS[i % SATURATIONS.len()];
        let val = VALUES[(i / SATURATIONS.len()) % VALUES.len()];
        table.push(hsv_to_rgb(hue, sat, val));
    }
    table
}

/// Convert an HSV triple (`h` in degrees, `s`/`v` in `[0, 1]`) to RGB bytes.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let h = h.rem_euclid(360.0);
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn vocabulary_sizes() {
        assert_eq!(Vocabulary::Coco21.num_classes(), 21);
        assert_eq!(Vocabulary::Ade150.num_classes(), 150);
        assert_eq!(Vocabulary::Coco21.labels().len(), 21);
        assert_eq!(Vocabulary::Ade150.labels().len(), 150);
    }

    #[test]
    fn background_is_index_zero_and_black() {
        assert_eq!(Vocabulary::Coco21.labels()[0], "background");
        assert_eq!(Vocabulary::Coco21.colormap()[0], [0, 0, 0]);
        assert_eq!(Vocabulary::Ade150.colormap()[0], [0, 0, 0]);
    }

    #[test]
    fn bit_reversal_matches_known_entries() {
        let map = Vocabulary::Coco21.colormap();
        assert_eq!(map[1], [128, 0, 0]);
        assert_eq!(map[2], [0, 128, 0]);
        assert_eq!(map[3], [128, 128, 0]);
        assert_eq!(map[4], [0, 0, 128]);
        assert_eq!(map[7], [128, 128, 128]);
        assert_eq!(map[8], [64, 0, 0]);
    }

    #[test]
    fn colormaps_are_injective() {
        for vocab in [Vocabulary::Coco21, Vocabulary::Ade150] {
            let map = vocab.colormap();
            let unique: HashSet<[u8; 3]> = map.iter().copied().collect();
            assert_eq!(unique.len(), map.len(), "{vocab:?} palette has collisions");
        }
    }

    #[test]
    fn spread_palette_avoids_black_outside_background() {
        let map = Vocabulary::Ade150.colormap();
        for (i, color) in map.iter().enumerate().skip(1) {
            assert_ne!(*color, [0, 0, 0], "class {i} rendered black");
        }
    }

    #[test]
    fn colormap_is_cached() {
        let a = Vocabulary::Ade150.colormap().as_ptr();
        let b = Vocabulary::Ade150.colormap().as_ptr();
        assert_eq!(a, b);
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [255, 0, 0]);
        assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), [0, 255, 0]);
        assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), [0, 0, 255]);
        assert_eq!(hsv_to_rgb(0.0, 0.0, 1.0), [255, 255, 255]);
    }
}
