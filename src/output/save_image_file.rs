// 该文件是 Bakulan 项目的一部分。
// src/output/save_image_file.rs - 保存标注后的图像文件
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{
    Render,
    draw::{Draw, DrawError},
  },
  render::ResultRenderer,
  utils::{QueryError, decoded_path, query_value},
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制配置错误: {0}")]
  DrawError(#[from] DrawError),
  #[error(transparent)]
  Query(#[from] QueryError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 输出视图尺寸，`?width=&height=` 需同时给出
pub(crate) fn view_size_of(url: &Url) -> Result<Option<(u32, u32)>, QueryError> {
  let width = query_value::<u32>(url, "width")?;
  let height = query_value::<u32>(url, "height")?;
  Ok(width.zip(height).filter(|(w, h)| *w > 0 && *h > 0))
}

/// `?font=` 指定字体文件
pub(crate) fn draw_of(url: &Url) -> Result<Draw, DrawError> {
  match query_value::<PathBuf>(url, "font") {
    Ok(Some(path)) => Draw::with_font_file(&path),
    _ => Ok(Draw::default()),
  }
}

pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
  view_size: Option<(u32, u32)>,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: decoded_path(uri),
      draw: draw_of(uri)?,
      view_size: view_size_of(uri)?,
    })
  }
}

impl SaveImageFileOutput {
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save_image(&self, image: RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;

    warn!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl Render for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn view_size(&self) -> Option<(u32, u32)> {
    self.view_size
  }

  fn render_result(&self, image: &RgbImage, renderer: &ResultRenderer) -> Result<(), Self::Error> {
    let image = self.draw.compose(image, renderer);
    self.save_image(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Category, ClassificationResult, InferenceOptions};

  #[test]
  fn saves_annotated_image() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested/out.png");
    let url = Url::from_file_path(&target).unwrap();
    let url = Url::parse(&url.as_str().replacen("file:", "image:", 1)).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), target.as_path());

    let mut renderer = ResultRenderer::new(32, 16);
    renderer.set_classification(ClassificationResult::from_categories(
      vec![Category::new("cat", 0.92)],
      &InferenceOptions::new("m.onnx"),
    ));
    output.render_result(&RgbImage::new(64, 32), &renderer).unwrap();

    let saved = image::open(&target).unwrap();
    assert_eq!((saved.width(), saved.height()), (32, 16));
  }

  #[test]
  fn view_size_needs_both_dimensions() {
    let url = Url::parse("image:///tmp/a.png?width=640").unwrap();
    assert_eq!(view_size_of(&url).unwrap(), None);
    let url = Url::parse("image:///tmp/a.png?width=640&height=480").unwrap();
    assert_eq!(view_size_of(&url).unwrap(), Some((640, 480)));
    let url = Url::parse("image:///tmp/a.png?width=wide&height=480").unwrap();
    assert!(view_size_of(&url).is_err());
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
