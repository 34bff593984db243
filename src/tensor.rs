// 该文件是 Bakulan 项目的一部分。
// src/tensor.rs - 模型输入张量
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

use image::{RgbImage, imageops::FilterType};

const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nchw,
  Nhwc,
}

/// 模型输入要求：尺寸、排布与逐通道归一化 `(x - mean) / std`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorSpec {
  pub width: u32,
  pub height: u32,
  pub layout: TensorLayout,
  pub mean: [f32; 3],
  pub std: [f32; 3],
}

impl TensorSpec {
  /// 默认归一化到 [0, 1]
  pub fn new(width: u32, height: u32, layout: TensorLayout) -> Self {
    Self {
      width,
      height,
      layout,
      mean: [0.0; 3],
      std: [255.0; 3],
    }
  }

  pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
    self.mean = mean;
    self.std = std;
    self
  }

  pub fn shape(&self) -> [usize; 4] {
    let (h, w) = (self.height as usize, self.width as usize);
    match self.layout {
      TensorLayout::Nchw => [1, RGB_CHANNELS, h, w],
      TensorLayout::Nhwc => [1, h, w, RGB_CHANNELS],
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  shape: [usize; 4],
  layout: TensorLayout,
  data: Vec<f32>,
}

impl Tensor {
  /// 将摆正后的 RGB 图像缩放到模型输入尺寸，并按排布与归一化填充
  pub fn from_rgb_image(image: &RgbImage, spec: &TensorSpec) -> Self {
    let resized;
    let image = if image.dimensions() == (spec.width, spec.height) {
      image
    } else {
      resized = image::imageops::resize(image, spec.width, spec.height, FilterType::Triangle);
      &resized
    };

    let height = spec.height as usize;
    let width = spec.width as usize;
    let mut data = vec![0f32; RGB_CHANNELS * height * width];

    for (x, y, pixel) in image.enumerate_pixels() {
      let (x, y) = (x as usize, y as usize);
      for c in 0..RGB_CHANNELS {
        let value = (pixel[c] as f32 - spec.mean[c]) / spec.std[c];
        let index = match spec.layout {
          TensorLayout::Nchw => c * height * width + y * width + x,
          TensorLayout::Nhwc => (y * width + x) * RGB_CHANNELS + c,
        };
        data[index] = value;
      }
    }

    Self {
      shape: spec.shape(),
      layout: spec.layout,
      data,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn layout(&self) -> TensorLayout {
    self.layout
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn into_data(self) -> Vec<f32> {
    self.data
  }
}
