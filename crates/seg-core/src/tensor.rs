//! Frame/tensor conversion for model input and output.

use tch::{Device, Kind, Tensor};

use crate::model::ModelError;

/// ImageNet channel statistics used by every export family.
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Borrowed view of one decoded RGB frame.
///
/// `pixels` is tightly packed `(height, width, 3)` RGB8 data; `timestamp_ms`
/// is the client-supplied capture time echoed back in the reply.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
}

impl<'a> Frame<'a> {
    pub fn new(pixels: &'a [u8], width: u32, height: u32, timestamp_ms: i64) -> Self {
        Self {
            pixels,
            width,
            height,
            timestamp_ms,
        }
    }
}

/// Dense per-pixel class assignment at image resolution.
///
/// Values lie in `[0, num_classes)` for the mode that produced the map; both
/// served vocabularies fit in a byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMap {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl ClassMap {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width as usize) * (height as usize));
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn class_at(&self, x: u32, y: u32) -> u8 {
        self.data[(y as usize) * (self.width as usize) + (x as usize)]
    }

    /// Sorted unique class indices present in the map, background excluded.
    pub fn present_classes(&self) -> Vec<usize> {
        let mut seen = [false; 256];
        for &class in &self.data {
            seen[class as usize] = true;
        }
        seen.iter()
            .enumerate()
            .skip(1)
            .filter_map(|(class, present)| present.then_some(class))
            .collect()
    }
}

/// Convert a frame into the `(1, 3, H, W)` batch the models expect.
///
/// Downscaling uses area averaging, upscaling bilinear interpolation; pixels
/// are scaled to `[0, 1]` and normalized per channel with the ImageNet
/// statistics. The returned tensor is contiguous on `device`, in half
/// precision when `fp16` is set.
pub fn preprocess(
    frame: &Frame<'_>,
    target_hw: (i64, i64),
    device: Device,
    fp16: bool,
) -> Result<Tensor, ModelError> {
    let expected = (frame.width as usize) * (frame.height as usize) * 3;
    if frame.pixels.len() != expected {
        return Err(ModelError::Output(format!(
            "frame buffer holds {} bytes, expected {} for {}x{}",
            frame.pixels.len(),
            expected,
            frame.width,
            frame.height
        )));
    }

    let (target_h, target_w) = target_hw;
    let mut tensor = Tensor::from_slice(frame.pixels)
        .to_kind(Kind::Float)
        .view([frame.height as i64, frame.width as i64, 3])
        .permute([2, 0, 1])
        .unsqueeze(0)
        / 255.0;

    if (frame.height as i64, frame.width as i64) != (target_h, target_w) {
        let downscale = target_w < frame.width as i64 && target_h < frame.height as i64;
        tensor = if downscale {
            tensor.adaptive_avg_pool2d([target_h, target_w])
        } else {
            tensor.upsample_bilinear2d(&[target_h, target_w], false, None, None)
        };
    }

    let mean = Tensor::from_slice(&IMAGENET_MEAN).view([1, 3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).view([1, 3, 1, 1]);
    let mut tensor = ((tensor - mean) / std).contiguous().to_device(device);
    if fp16 {
        tensor = tensor.to_kind(Kind::Half);
    }
    Ok(tensor)
}

/// Resize an argmaxed `(H, W)` class tensor back to the original frame size.
///
/// Nearest-neighbour only: interpolating between class indices would invent
/// classes that were never predicted.
pub fn postprocess(mask: &Tensor, original_hw: (u32, u32)) -> Result<ClassMap, ModelError> {
    let mask = mask.to_device(Device::Cpu);
    let dims = mask.size();
    let (mask_h, mask_w) = match dims.as_slice() {
        [h, w] => (*h, *w),
        [1, h, w] => (*h, *w),
        other => {
            return Err(ModelError::Output(format!(
                "expected an (H, W) class tensor, got shape {other:?}"
            )))
        }
    };

    let (out_h, out_w) = (original_hw.0 as i64, original_hw.1 as i64);
    let resized = if (mask_h, mask_w) == (out_h, out_w) {
        mask.reshape([out_h, out_w])
    } else {
        mask.reshape([1, 1, mask_h, mask_w])
            .to_kind(Kind::Float)
            .upsample_nearest2d(&[out_h, out_w], None, None)
            .reshape([out_h, out_w])
    };

    let flat = Vec::<i64>::try_from(&resized.to_kind(Kind::Int64).reshape([-1]))?;
    let data = flat.iter().map(|&class| class.clamp(0, 255) as u8).collect();
    Ok(ClassMap::new(data, original_hw.1, original_hw.0))
}
