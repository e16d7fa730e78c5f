//! TorchScript-backed segmentation model wrapper.
//!
//! A `SegModel` owns one loaded module and knows how to turn its raw forward
//! output into per-pixel class scores. The three export families differ in
//! output shape:
//!
//! - DeepLab exports return a dict keyed `"out"` with logits at input size.
//! - SegFormer exports return plain logits at the model's internal stride.
//! - Mask2Former exports return a `(mask_logits, class_logits)` tuple from a
//!   query-based head that has to be combined into dense scores.

use std::path::Path;

use tch::{CModule, Device, IValue, Kind, TchError, Tensor};
use tracing::debug;

use crate::mode::ModelMode;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("torch error: {0}")]
    Torch(#[from] TchError),
    #[error("unexpected model output: {0}")]
    Output(String),
}

/// One loaded TorchScript module, pinned to a device.
///
/// Forward passes lock the module for the duration of the call; per-model
/// serialization matches the serialization the GPU driver imposes anyway.
pub struct SegModel {
    module: std::sync::Mutex<CModule>,
    mode: ModelMode,
    device: Device,
    fp16: bool,
}

impl SegModel {
    /// Load the TorchScript export for `mode` from `dir` onto `device`.
    pub fn load(dir: &Path, mode: ModelMode, device: Device, fp16: bool) -> Result<Self, TchError> {
        let path = dir.join(mode.profile().file);
        debug!("loading {} model from {}", mode, path.display());
        let mut module = CModule::load_on_device(&path, device)?;
        module.set_eval();
        if fp16 {
            module.to(device, Kind::Half, false);
        }
        Ok(Self {
            module: std::sync::Mutex::new(module),
            mode,
            device,
            fp16,
        })
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn fp16(&self) -> bool {
        self.fp16
    }

    /// Run the module on a preprocessed `(1, 3, H, W)` batch and decode the
    /// output into class scores of shape `(1, C, H, W)` at input resolution.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| ModelError::Output("model mutex poisoned".to_string()))?;
            module.forward_is(&[IValue::Tensor(input.shallow_clone())])?
        };
        let (_, _, in_h, in_w) = size4(input)?;
        match self.mode {
            ModelMode::Fast | ModelMode::Balanced => decode_dict_logits(output),
            ModelMode::Accurate => decode_strided_logits(output, (in_h, in_w)),
            ModelMode::Sota => decode_query_head(output, (in_h, in_w)),
        }
    }
}

/// DeepLab family: dict output keyed `"out"`, logits already at input size.
/// Plain-tensor outputs are accepted for exports that drop the aux head.
fn decode_dict_logits(output: IValue) -> Result<Tensor, ModelError> {
    match output {
        IValue::Tensor(logits) => Ok(logits),
        IValue::GenericDict(entries) => {
            for (key, value) in entries {
                if let (IValue::String(name), IValue::Tensor(logits)) = (key, value) {
                    if name == "out" {
                        return Ok(logits);
                    }
                }
            }
            Err(ModelError::Output(
                "dict output is missing the \"out\" entry".to_string(),
            ))
        }
        other => Err(ModelError::Output(format!(
            "expected tensor or dict output, got {other:?}"
        ))),
    }
}

/// SegFormer family: plain logits at the model's internal stride, resized
/// bilinearly back to the input resolution before the argmax.
fn decode_strided_logits(output: IValue, input_hw: (i64, i64)) -> Result<Tensor, ModelError> {
    let logits = match output {
        IValue::Tensor(logits) => logits,
        IValue::Tuple(mut values) if !values.is_empty() => match values.remove(0) {
            IValue::Tensor(logits) => logits,
            other => {
                return Err(ModelError::Output(format!(
                    "expected logits tensor in tuple, got {other:?}"
                )))
            }
        },
        other => {
            return Err(ModelError::Output(format!(
                "expected logits tensor, got {other:?}"
            )))
        }
    };
    let (_, _, h, w) = size4(&logits)?;
    if (h, w) == input_hw {
        Ok(logits)
    } else {
        Ok(logits.upsample_bilinear2d(&[input_hw.0, input_hw.1], false, None, None))
    }
}

/// Query-based head: combine `Q` candidate masks with their class scores
/// into dense per-pixel scores.
///
/// The trailing "no object" column of the class logits is sliced away before
/// the combine so the later argmax can never select it.
fn decode_query_head(output: IValue, input_hw: (i64, i64)) -> Result<Tensor, ModelError> {
    let (mask_logits, class_logits) = match output {
        IValue::Tuple(mut values) if values.len() == 2 => {
            let second = values.pop();
            let first = values.pop();
            match (first, second) {
                (Some(IValue::Tensor(masks)), Some(IValue::Tensor(classes))) => (masks, classes),
                (first, second) => {
                    return Err(ModelError::Output(format!(
                        "expected (mask_logits, class_logits) tensors, got ({first:?}, {second:?})"
                    )))
                }
            }
        }
        other => {
            return Err(ModelError::Output(format!(
                "expected a two-tensor tuple from the query head, got {other:?}"
            )))
        }
    };
    combine_query_outputs(&mask_logits, &class_logits, input_hw)
}

/// Dense score assembly shared by the query-head decode and its tests.
pub(crate) fn combine_query_outputs(
    mask_logits: &Tensor,
    class_logits: &Tensor,
    input_hw: (i64, i64),
) -> Result<Tensor, ModelError> {
    let (batch, queries, h, w) = size4(mask_logits)?;
    let class_dims = class_logits.size();
    if class_dims.len() != 3 || class_dims[0] != batch || class_dims[1] != queries {
        return Err(ModelError::Output(format!(
            "class logits shape {class_dims:?} does not match {queries} queries"
        )));
    }
    let num_classes = class_dims[2] - 1;
    if num_classes < 1 {
        return Err(ModelError::Output(
            "class logits carry no real classes".to_string(),
        ));
    }

    let class_probs = class_logits.softmax(-1, Kind::Float).narrow(2, 0, num_classes);
    let mut mask_probs = mask_logits.sigmoid().to_kind(Kind::Float);
    let (out_h, out_w) = input_hw;
    if (h, w) != (out_h, out_w) {
        mask_probs = mask_probs.upsample_bilinear2d(&[out_h, out_w], false, None, None);
    }

    let masks_flat = mask_probs.view([batch, queries, out_h * out_w]);
    let scores = class_probs.transpose(1, 2).bmm(&masks_flat);
    Ok(scores.view([batch, num_classes, out_h, out_w]))
}

fn size4(tensor: &Tensor) -> Result<(i64, i64, i64, i64), ModelError> {
    match tensor.size().as_slice() {
        [a, b, c, d] => Ok((*a, *b, *c, *d)),
        dims => Err(ModelError::Output(format!(
            "expected a rank-4 tensor, got shape {dims:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_head_combines_to_dense_scores() {
        let masks = Tensor::randn([1, 10, 8, 8], (Kind::Float, Device::Cpu));
        let classes = Tensor::randn([1, 10, 151], (Kind::Float, Device::Cpu));
        let scores = combine_query_outputs(&masks, &classes, (32, 32)).unwrap();
        assert_eq!(scores.size(), vec![1, 150, 32, 32]);

        let map = scores.argmax(1, false);
        assert_eq!(map.size(), vec![1, 32, 32]);
        let max = map.max().int64_value(&[]);
        let min = map.min().int64_value(&[]);
        assert!(min >= 0 && max < 150);
    }

    #[test]
    fn query_head_ignores_dominant_no_object_column() {
        // Every query screams "no object"; the argmax must still land on a
        // real class because the sink column is sliced before the combine.
        let masks = Tensor::randn([1, 4, 16, 16], (Kind::Float, Device::Cpu));
        let mut class_logits = Tensor::zeros([1, 4, 151], (Kind::Float, Device::Cpu));
        let _ = class_logits.narrow(2, 150, 1).fill_(50.0);
        let scores = combine_query_outputs(&masks, &class_logits, (16, 16)).unwrap();
        assert_eq!(scores.size(), vec![1, 150, 16, 16]);
        let map = scores.argmax(1, false);
        let max = map.max().int64_value(&[]);
        assert!(max < 150);
    }

    #[test]
    fn query_head_rejects_mismatched_shapes() {
        let masks = Tensor::randn([1, 10, 8, 8], (Kind::Float, Device::Cpu));
        let classes = Tensor::randn([1, 7, 151], (Kind::Float, Device::Cpu));
        assert!(combine_query_outputs(&masks, &classes, (8, 8)).is_err());
    }

    #[test]
    fn dict_decode_prefers_out_entry() {
        let logits = Tensor::randn([1, 21, 4, 4], (Kind::Float, Device::Cpu));
        let dict = IValue::GenericDict(vec![
            (
                IValue::String("aux".to_string()),
                IValue::Tensor(Tensor::zeros([1, 21, 4, 4], (Kind::Float, Device::Cpu))),
            ),
            (
                IValue::String("out".to_string()),
                IValue::Tensor(logits.shallow_clone()),
            ),
        ]);
        let decoded = decode_dict_logits(dict).unwrap();
        assert_eq!(decoded.size(), logits.size());
    }

    #[test]
    fn strided_decode_resizes_to_input() {
        let logits = Tensor::randn([1, 150, 192, 192], (Kind::Float, Device::Cpu));
        let decoded = decode_strided_logits(IValue::Tensor(logits), (768, 768)).unwrap();
        assert_eq!(decoded.size(), vec![1, 150, 768, 768]);
    }
}
