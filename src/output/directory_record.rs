// 该文件是 Bakulan 项目的一部分。
// src/output/directory_record.rs - 按日期目录记录标注帧
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

use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{DateTime, Datelike, Utc};
use image::RgbImage;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{
    Render,
    draw::{Draw, DrawError},
    save_image_file::{draw_of, view_size_of},
  },
  render::{RenderContent, ResultRenderer},
  utils::{QueryError, decoded_path, query_flag},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("绘制配置错误: {0}")]
  DrawError(#[from] DrawError),
  #[error(transparent)]
  Query(#[from] QueryError),
}

/// 当前结果的 JSON 记录
pub fn record_of(renderer: &ResultRenderer) -> Value {
  let state = renderer.state();
  match &state.content {
    RenderContent::Empty => json!({ "kind": "empty" }),
    RenderContent::Classification(result) => json!({
      "kind": "classification",
      "categories": result
        .categories()
        .iter()
        .map(|c| json!({ "label": c.label, "score": c.score }))
        .collect::<Vec<_>>(),
    }),
    RenderContent::Detection(result) => json!({
      "kind": "detection",
      "image_width": result.image_width(),
      "image_height": result.image_height(),
      "scale_factor": state.scale_factor,
      "items": result
        .items()
        .iter()
        .map(|i| json!({ "label": i.label, "score": i.score, "bbox": i.bbox }))
        .collect::<Vec<_>>(),
    }),
  }
}

fn has_results(renderer: &ResultRenderer) -> bool {
  match &renderer.state().content {
    RenderContent::Empty => false,
    RenderContent::Classification(result) => !result.is_empty(),
    RenderContent::Detection(result) => !result.is_empty(),
  }
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: Draw,
  view_size: Option<(u32, u32)>,
  frame_counter: AtomicU16,
  always: bool,
  record: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    Ok(DirectoryRecordOutput {
      directory: decoded_path(uri),
      draw: draw_of(uri)?,
      view_size: view_size_of(uri)?,
      frame_counter: AtomicU16::new(0),
      always: query_flag(uri, "always"),
      record: query_flag(uri, "record"),
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self, now: DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn view_size(&self) -> Option<(u32, u32)> {
    self.view_size
  }

  fn render_result(&self, image: &RgbImage, renderer: &ResultRenderer) -> Result<(), Self::Error> {
    if !self.always && !has_results(renderer) {
      return Ok(());
    }

    let path = self.frame_path(Utc::now())?;
    self.draw.compose(image, renderer).save(&path)?;
    if self.record {
      let record = serde_json::to_string_pretty(&record_of(renderer))?;
      std::fs::write(path.with_extension("json"), record)?;
    }
    debug!("记录帧: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{DetectItem, DetectResult, InferenceOptions};

  fn folder_url(dir: &Path, query: &str) -> Url {
    let url = Url::from_directory_path(dir).unwrap();
    Url::parse(&format!("{}{}", url.as_str().replacen("file:", "folder:", 1), query)).unwrap()
  }

  fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
      for entry in std::fs::read_dir(current).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else {
          files.push(path);
        }
      }
    }
    files.sort();
    files
  }

  fn detections() -> DetectResult {
    DetectResult::from_items(
      vec![DetectItem {
        label: "dog".into(),
        score: 0.75,
        bbox: [1.0, 2.0, 10.0, 12.0],
      }],
      16,
      16,
      &InferenceOptions::new("m.onnx"),
    )
  }

  #[test]
  fn skips_empty_results_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::from_url(&folder_url(dir.path(), "")).unwrap();
    let renderer = ResultRenderer::new(16, 16);
    output.render_result(&RgbImage::new(16, 16), &renderer).unwrap();
    assert!(files_under(dir.path()).is_empty());

    let always = DirectoryRecordOutput::from_url(&folder_url(dir.path(), "?always")).unwrap();
    always.render_result(&RgbImage::new(16, 16), &renderer).unwrap();
    assert_eq!(files_under(dir.path()).len(), 1);
  }

  #[test]
  fn writes_image_and_json_record() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::from_url(&folder_url(dir.path(), "?record")).unwrap();
    let mut renderer = ResultRenderer::new(16, 16);
    renderer.set_results(detections());
    output.render_result(&RgbImage::new(16, 16), &renderer).unwrap();

    let files = files_under(dir.path());
    assert_eq!(files.len(), 2);
    let json = files.iter().find(|p| p.extension().unwrap() == "json").unwrap();
    assert!(json.file_name().unwrap().to_string_lossy().ends_with("-0001.json"));
    let record: Value = serde_json::from_str(&std::fs::read_to_string(json).unwrap()).unwrap();
    assert_eq!(record["kind"], "detection");
    assert_eq!(record["items"][0]["label"], "dog");
    assert_eq!(record["items"][0]["bbox"][3], 12.0);
  }

  #[test]
  fn record_of_empty_state() {
    let renderer = ResultRenderer::new(1, 1);
    assert_eq!(record_of(&renderer), json!({ "kind": "empty" }));
  }
}
