// 该文件是 Bakulan 项目的一部分。
// src/adapter/classification.rs - 图像分类适配器
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

use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::{
  adapter::{Adapter, AdapterState},
  frame::Frame,
  model::{
    Backend, ClassificationResult, ClassifierSession, InferenceError, InferenceOptions,
    ModelLoadError, Orientation,
  },
  tensor::Tensor,
};

pub struct ClassificationAdapter {
  options: InferenceOptions,
  backend: Arc<dyn Backend>,
  session: Option<Box<dyn ClassifierSession>>,
  state: AdapterState,
  setup_error: Option<ModelLoadError>,
}

impl ClassificationAdapter {
  /// 构造后立即尝试初始化，失败时状态为 Failed
  pub fn new(options: InferenceOptions, backend: Arc<dyn Backend>) -> Self {
    let mut adapter = Self {
      options,
      backend,
      session: None,
      state: AdapterState::Uninitialized,
      setup_error: None,
    };
    if let Err(e) = adapter.set_up() {
      error!("分类器初始化失败: {}", e);
    }
    adapter
  }

  pub fn options(&self) -> &InferenceOptions {
    &self.options
  }

  /// 对已经摆正的静态图像分类
  pub fn classify_image(&mut self, image: &RgbImage) -> Option<Result<ClassificationResult, InferenceError>> {
    let session = self.session.as_mut()?;
    let tensor = Tensor::from_rgb_image(image, &session.input_spec());
    let result = session
      .classify(&tensor)
      .map(|categories| ClassificationResult::from_categories(categories, &self.options));
    if let Ok(result) = &result {
      debug!("分类结果数量: {}", result.len());
    }
    Some(result)
  }
}

impl Adapter for ClassificationAdapter {
  type Output = ClassificationResult;

  fn set_up(&mut self) -> Result<(), ModelLoadError> {
    match self.state {
      AdapterState::Ready => return Ok(()),
      AdapterState::Failed => return Err(ModelLoadError::Terminal),
      AdapterState::Uninitialized => {}
    }

    let loaded = self
      .options
      .validate()
      .map_err(ModelLoadError::from)
      .and_then(|_| self.backend.load_classifier(&self.options));

    match loaded {
      Ok(session) => {
        info!("分类器就绪, 输入规格: {:?}", session.input_spec());
        self.session = Some(session);
        self.state = AdapterState::Ready;
        Ok(())
      }
      Err(e) => {
        self.state = AdapterState::Failed;
        self.setup_error = Some(e.clone());
        Err(e)
      }
    }
  }

  fn detect(&mut self, frame: Frame) -> Option<Result<Self::Output, InferenceError>> {
    if self.session.is_none() {
      warn!("分类器未就绪, 丢弃帧");
      return None;
    }
    let orientation = Orientation::from_rotation(frame.rotation());
    let image = frame.into_rgb_image();
    let upright = orientation.apply(&image);
    self.classify_image(&upright)
  }

  fn state(&self) -> AdapterState {
    self.state
  }

  fn setup_error(&self) -> Option<&ModelLoadError> {
    self.setup_error.as_ref()
  }
}
