// 该文件是 Bakulan 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::{Tensor as OrtTensor, ValueType},
};
use tracing::{debug, info};

use crate::{
  model::{
    Backend, Category, ClassifierSession, DetectItem, DetectorSession, InferenceError,
    InferenceOptions, ModelLoadError, load_labels,
  },
  tensor::{Tensor, TensorLayout, TensorSpec},
};

const CLASSIFIER_FALLBACK_SIZE: u32 = 224;
const DETECTOR_FALLBACK_SIZE: u32 = 320;
// lite 系列模型的输入归一化
const LITE_MEAN: [f32; 3] = [127.0; 3];
const LITE_STD: [f32; 3] = [128.0; 3];
const DETECTOR_NUM_OUTPUTS: usize = 3;

fn load_error(e: ort::Error) -> ModelLoadError {
  ModelLoadError::Incompatible(e.to_string())
}

fn runtime_error(e: ort::Error) -> InferenceError {
  InferenceError::Runtime(e.to_string())
}

fn build_session(options: &InferenceOptions) -> Result<Session, ModelLoadError> {
  let path = options.model_path();
  if !path.exists() {
    return Err(ModelLoadError::Missing(path.to_path_buf()));
  }

  info!("加载模型文件: {}", path.display());
  let session = Session::builder()
    .map_err(load_error)?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(load_error)?
    .with_intra_threads(options.threads())
    .map_err(load_error)?
    .commit_from_file(path)
    .map_err(load_error)?;

  debug!("模型输入数量: {}", session.inputs.len());
  debug!("模型输出数量: {}", session.outputs.len());
  if session.inputs.len() != 1 {
    return Err(ModelLoadError::Incompatible(format!(
      "预期模型输入数量为 1, 实际为 {}",
      session.inputs.len()
    )));
  }
  Ok(session)
}

/// 根据输入形状推断排布与尺寸，动态维度使用 `fallback`
fn input_spec_of(session: &Session, fallback: u32) -> TensorSpec {
  let dims: Vec<i64> = match &session.inputs[0].input_type {
    ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
    _ => Vec::new(),
  };
  let size = |d: i64| if d > 0 { d as u32 } else { fallback };

  let spec = match dims.as_slice() {
    [_, 3, h, w] => TensorSpec::new(size(*w), size(*h), TensorLayout::Nchw),
    [_, h, w, 3] => TensorSpec::new(size(*w), size(*h), TensorLayout::Nhwc),
    _ => TensorSpec::new(fallback, fallback, TensorLayout::Nhwc),
  };
  debug!("模型输入规格: {:?}", spec);
  spec.with_normalization(LITE_MEAN, LITE_STD)
}

fn to_ort(input: &Tensor) -> Result<OrtTensor<f32>, InferenceError> {
  OrtTensor::from_array((input.shape(), input.data().to_vec())).map_err(runtime_error)
}

fn softmax_if_logits(scores: &mut [f32]) {
  if scores.iter().all(|s| (0.0..=1.0).contains(s)) {
    return;
  }
  let max = scores.iter().copied().fold(f32::MIN, f32::max);
  let mut sum = 0.0;
  for s in scores.iter_mut() {
    *s = (*s - max).exp();
    sum += *s;
  }
  if sum > 0.0 {
    scores.iter_mut().for_each(|s| *s /= sum);
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxBackend;

impl Backend for OnnxBackend {
  fn load_classifier(
    &self,
    options: &InferenceOptions,
  ) -> Result<Box<dyn ClassifierSession>, ModelLoadError> {
    let session = build_session(options)?;
    let labels = load_labels(&options.labels_path())?;
    let spec = input_spec_of(&session, CLASSIFIER_FALLBACK_SIZE);
    info!("分类模型加载完成, 标签数: {}", labels.len());
    Ok(Box::new(OnnxClassifierSession {
      session,
      labels,
      spec,
    }))
  }

  fn load_detector(
    &self,
    options: &InferenceOptions,
  ) -> Result<Box<dyn DetectorSession>, ModelLoadError> {
    let session = build_session(options)?;
    if session.outputs.len() < DETECTOR_NUM_OUTPUTS {
      return Err(ModelLoadError::Incompatible(format!(
        "预期模型输出数量至少为 {}, 实际为 {}",
        DETECTOR_NUM_OUTPUTS,
        session.outputs.len()
      )));
    }
    let labels = load_labels(&options.labels_path())?;
    let spec = input_spec_of(&session, DETECTOR_FALLBACK_SIZE);
    info!("检测模型加载完成, 标签数: {}", labels.len());
    Ok(Box::new(OnnxDetectorSession {
      session,
      labels,
      spec,
    }))
  }
}

pub struct OnnxClassifierSession {
  session: Session,
  labels: Vec<String>,
  spec: TensorSpec,
}

impl ClassifierSession for OnnxClassifierSession {
  fn input_spec(&self) -> TensorSpec {
    self.spec
  }

  fn classify(&mut self, input: &Tensor) -> Result<Vec<Category>, InferenceError> {
    let value = to_ort(input)?;
    let outputs = self
      .session
      .run(ort::inputs![value])
      .map_err(runtime_error)?;
    let (_, scores) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(runtime_error)?;

    let mut scores = scores.to_vec();
    // 部分模型在首位带有背景类
    let offset = match scores.len().checked_sub(self.labels.len()) {
      Some(0) => 0,
      Some(1) => 1,
      _ => {
        return Err(InferenceError::UnexpectedOutput(format!(
          "分数数量 {} 与标签数量 {} 不一致",
          scores.len(),
          self.labels.len()
        )));
      }
    };
    softmax_if_logits(&mut scores);

    Ok(
      self
        .labels
        .iter()
        .zip(&scores[offset..])
        .map(|(label, score)| Category::new(label.clone(), *score))
        .collect(),
    )
  }
}

pub struct OnnxDetectorSession {
  session: Session,
  labels: Vec<String>,
  spec: TensorSpec,
}

impl DetectorSession for OnnxDetectorSession {
  fn input_spec(&self) -> TensorSpec {
    self.spec
  }

  fn detect(&mut self, input: &Tensor) -> Result<Vec<DetectItem>, InferenceError> {
    let value = to_ort(input)?;
    let outputs = self
      .session
      .run(ort::inputs![value])
      .map_err(runtime_error)?;

    // 输出顺序: boxes [1, N, 4] (ymin, xmin, ymax, xmax), classes [1, N], scores [1, N]
    let (_, boxes) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(runtime_error)?;
    let (_, classes) = outputs[1]
      .try_extract_tensor::<f32>()
      .map_err(runtime_error)?;
    let (_, scores) = outputs[2]
      .try_extract_tensor::<f32>()
      .map_err(runtime_error)?;

    let count = scores.len().min(classes.len()).min(boxes.len() / 4);
    debug!("检测候选数量: {}", count);

    let mut items = Vec::with_capacity(count);
    for i in 0..count {
      let class_id = classes[i].max(0.0) as usize;
      let Some(label) = self.labels.get(class_id) else {
        continue;
      };
      let b = &boxes[i * 4..i * 4 + 4];
      items.push(DetectItem {
        label: label.clone(),
        score: scores[i],
        bbox: [b[1], b[0], b[3], b[2]],
      });
    }
    Ok(items)
  }
}
