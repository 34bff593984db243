// 该文件是 Bakulan 项目的一部分。
// src/adapter.rs - 推理适配器统一接口
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

use std::sync::Arc;

use clap::ValueEnum;
use url::Url;

use crate::{
  FromUrl,
  frame::Frame,
  model::{
    Backend, ClassificationResult, DetectResult, InferenceError, InferenceOptions, ModelLoadError,
    OptionsError,
  },
};

/// 适配器生命周期：Uninitialized -> Ready | Failed，Failed 为终止状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
  #[default]
  Uninitialized,
  Ready,
  Failed,
}

pub trait Adapter: Send {
  type Output;

  /// 加载模型并构建会话；失败后适配器永久不可用
  fn set_up(&mut self) -> Result<(), ModelLoadError>;

  /// 消费一帧；适配器未就绪时不返回结果
  fn detect(&mut self, frame: Frame) -> Option<Result<Self::Output, InferenceError>>;

  fn state(&self) -> AdapterState;

  /// 初始化失败的原因
  fn setup_error(&self) -> Option<&ModelLoadError>;
}

/// 推理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AdapterMode {
  /// 图像分类
  Classify,
  /// 目标检测
  Detect,
}

impl AdapterMode {
  /// 随程序分发的默认模型路径
  pub fn default_model_path(self) -> &'static str {
    match self {
      AdapterMode::Classify => "models/efficientnet-lite4-int8.onnx",
      AdapterMode::Detect => "models/efficientdet-lite0.onnx",
    }
  }

  /// 未指定模型 URL 时使用默认模型与默认选项
  pub fn options(self, model: Option<&Url>) -> Result<InferenceOptions, OptionsError> {
    match model {
      Some(url) => InferenceOptions::from_url(url),
      None => Ok(InferenceOptions::new(self.default_model_path())),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Classification(ClassificationResult),
  Detection(DetectResult),
}

impl From<ClassificationResult> for Outcome {
  fn from(result: ClassificationResult) -> Self {
    Outcome::Classification(result)
  }
}

impl From<DetectResult> for Outcome {
  fn from(result: DetectResult) -> Self {
    Outcome::Detection(result)
  }
}

/// 当前激活的适配器，二选一
pub enum ActiveAdapter {
  Classifier(ClassificationAdapter),
  Detector(DetectionAdapter),
}

impl ActiveAdapter {
  pub fn new(mode: AdapterMode, options: InferenceOptions, backend: Arc<dyn Backend>) -> Self {
    match mode {
      AdapterMode::Classify => ActiveAdapter::Classifier(ClassificationAdapter::new(options, backend)),
      AdapterMode::Detect => ActiveAdapter::Detector(DetectionAdapter::new(options, backend)),
    }
  }

  pub fn mode(&self) -> AdapterMode {
    match self {
      ActiveAdapter::Classifier(_) => AdapterMode::Classify,
      ActiveAdapter::Detector(_) => AdapterMode::Detect,
    }
  }
}

impl Adapter for ActiveAdapter {
  type Output = Outcome;

  fn set_up(&mut self) -> Result<(), ModelLoadError> {
    match self {
      ActiveAdapter::Classifier(adapter) => adapter.set_up(),
      ActiveAdapter::Detector(adapter) => adapter.set_up(),
    }
  }

  fn detect(&mut self, frame: Frame) -> Option<Result<Self::Output, InferenceError>> {
    match self {
      ActiveAdapter::Classifier(adapter) => adapter
        .detect(frame)
        .map(|r| r.map(Outcome::Classification)),
      ActiveAdapter::Detector(adapter) => adapter.detect(frame).map(|r| r.map(Outcome::Detection)),
    }
  }

  fn state(&self) -> AdapterState {
    match self {
      ActiveAdapter::Classifier(adapter) => adapter.state(),
      ActiveAdapter::Detector(adapter) => adapter.state(),
    }
  }

  fn setup_error(&self) -> Option<&ModelLoadError> {
    match self {
      ActiveAdapter::Classifier(adapter) => adapter.setup_error(),
      ActiveAdapter::Detector(adapter) => adapter.setup_error(),
    }
  }
}

mod classification;
mod detection;
pub use self::classification::ClassificationAdapter;
pub use self::detection::DetectionAdapter;


#[cfg(test)]
mod tests {
  use super::{testing::MockBackend, *};
  use crate::{
    frame::Rotation,
    model::{Category, DetectItem},
  };
  use image::RgbImage;

  #[test]
  fn mode_selects_adapter_variant() {
    let (backend, _) = MockBackend::classifier(vec![Category::new("cat", 0.9)]);
    let adapter = ActiveAdapter::new(AdapterMode::Classify, InferenceOptions::new("c.onnx"), backend);
    assert_eq!(adapter.mode(), AdapterMode::Classify);
    assert_eq!(adapter.state(), AdapterState::Ready);

    let backend = MockBackend::detector(vec![]);
    let adapter = ActiveAdapter::new(AdapterMode::Detect, InferenceOptions::new("d.onnx"), backend);
    assert_eq!(adapter.mode(), AdapterMode::Detect);
    assert_eq!(adapter.state(), AdapterState::Ready);
  }

  #[test]
  fn active_adapter_wraps_outcomes() {
    let backend = MockBackend::detector(vec![DetectItem {
      label: "car".into(),
      score: 0.7,
      bbox: [0.0, 0.0, 0.5, 0.5],
    }]);
    let mut adapter =
      ActiveAdapter::new(AdapterMode::Detect, InferenceOptions::new("d.onnx"), backend);
    let frame = Frame::from_rgb_image(RgbImage::new(8, 4), Rotation::Deg0);
    match adapter.detect(frame) {
      Some(Ok(Outcome::Detection(result))) => assert_eq!(result.len(), 1),
      other => panic!("unexpected outcome: {other:?}"),
    }
  }

  #[test]
  fn default_model_paths_differ_per_mode() {
    assert_ne!(
      AdapterMode::Classify.default_model_path(),
      AdapterMode::Detect.default_model_path()
    );
  }

  #[test]
  fn mode_supplies_default_model() {
    let options = AdapterMode::Detect.options(None).unwrap();
    assert_eq!(
      options.model_path(),
      std::path::Path::new("models/efficientdet-lite0.onnx")
    );
    let url = Url::parse("model:///m/x.onnx?max_results=0").unwrap();
    assert!(AdapterMode::Classify.options(Some(&url)).is_err());
  }
}
