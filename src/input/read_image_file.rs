// 该文件是 Bakulan 项目的一部分。
// src/input/read_image_file.rs - 静态图像文件输入
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

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError, Rotation},
  utils::{QueryError, decoded_path, query_value},
};

use image::{DynamicImage, ImageReader};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("帧参数错误: {0}")]
  FrameError(#[from] FrameError),
  #[error(transparent)]
  Query(#[from] QueryError),
}

/// 单张图像，只产生一帧
pub struct ImageFileInput {
  image: Option<DynamicImage>,
  rotation: Rotation,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let rotation = match query_value::<String>(url, "rotation")? {
      Some(value) => value.parse::<Rotation>()?,
      None => Rotation::Deg0,
    };
    let path = decoded_path(url);
    let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;
    info!(
      "读取图像 {}: {}x{}",
      path.display(),
      image.width(),
      image.height()
    );

    Ok(ImageFileInput {
      image: Some(image),
      rotation,
    })
  }
}

impl Iterator for ImageFileInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    let rotation = self.rotation;
    self
      .image
      .take()
      .map(|image| Frame::from_dynamic(image, rotation))
  }
}
