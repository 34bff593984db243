// 该文件是 Bakulan 项目的一部分。
// src/output/draw.rs - 推理结果叠加绘制
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage, imageops};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::render::{
  DrawOp, FixedAdvance, LABEL_BACKGROUND_COLOR, LABEL_TEXT_COLOR, RectF, ResultRenderer,
  TEXT_PADDING, TEXT_SIZE, TextMeasure, cover_scale,
};

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
}

/// 字体可选；没有字体时只画框和标签背景，尺寸按等宽估算
#[derive(Default)]
pub struct Draw {
  font: Option<FontVec>,
  fallback: FixedAdvance,
}

impl Draw {
  pub fn with_font_file(path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data).map_err(|e| DrawError::InvalidFont(e.to_string()))?;
    info!("加载字体: {}", path.display());
    Ok(Self {
      font: Some(font),
      fallback: FixedAdvance::default(),
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 预览帧按覆盖缩放填满视图后从左上角裁剪，再叠加结果
  pub fn compose(&self, image: &RgbImage, renderer: &ResultRenderer) -> RgbImage {
    let (view_width, view_height) = match renderer.view_size() {
      (0, _) | (_, 0) => image.dimensions(),
      size => size,
    };
    let mut canvas = cover_crop(image, view_width, view_height);

    for op in renderer.draw_ops(self) {
      self.apply(&mut canvas, &op);
    }
    self.draw_text_panel(&mut canvas, &renderer.text_lines());
    canvas
  }

  fn apply(&self, canvas: &mut RgbImage, op: &DrawOp) {
    match op {
      DrawOp::StrokeRect { rect, width, color } => stroke_rect(canvas, rect, *width, Rgb(*color)),
      DrawOp::FillRect { rect, color } => {
        if let Some(r) = to_rect(rect) {
          draw_filled_rect_mut(canvas, r, Rgb(*color));
        }
      }
      DrawOp::Text {
        x,
        y,
        text,
        size,
        color,
      } => {
        if let Some(font) = &self.font {
          draw_text_mut(
            canvas,
            Rgb(*color),
            x.round() as i32,
            y.round() as i32,
            PxScale::from(*size),
            font,
            text,
          );
        }
      }
    }
  }

  /// 分类结果面板：左上角逐行绘制
  fn draw_text_panel(&self, canvas: &mut RgbImage, lines: &[String]) {
    let mut top = 0.0;
    for line in lines {
      let (width, height) = self.measure(line, TEXT_SIZE);
      let background = RectF::new(0.0, top, width + TEXT_PADDING * 2.0, top + height + TEXT_PADDING);
      self.apply(
        canvas,
        &DrawOp::FillRect {
          rect: background,
          color: LABEL_BACKGROUND_COLOR,
        },
      );
      self.apply(
        canvas,
        &DrawOp::Text {
          x: TEXT_PADDING,
          y: top,
          text: line.clone(),
          size: TEXT_SIZE,
          color: LABEL_TEXT_COLOR,
        },
      );
      top = background.bottom;
    }
  }
}

impl TextMeasure for Draw {
  fn measure(&self, text: &str, size: f32) -> (f32, f32) {
    match &self.font {
      Some(font) => {
        let (w, h) = text_size(PxScale::from(size), font, text);
        (w as f32, h as f32)
      }
      None => self.fallback.measure(text, size),
    }
  }
}

fn to_rect(rect: &RectF) -> Option<Rect> {
  let left = rect.left.round() as i32;
  let top = rect.top.round() as i32;
  let width = (rect.right.round() as i32 - left).max(0) as u32;
  let height = (rect.bottom.round() as i32 - top).max(0) as u32;
  (width > 0 && height > 0).then(|| Rect::at(left, top).of_size(width, height))
}

/// 描边以矩形边线为中心
fn stroke_rect(canvas: &mut RgbImage, rect: &RectF, width: f32, color: Rgb<u8>) {
  let stroke = width.round().max(1.0) as i32;
  let half = stroke / 2;
  let left = rect.left.round() as i32 - half;
  let top = rect.top.round() as i32 - half;
  let right = rect.right.round() as i32 + (stroke - half);
  let bottom = rect.bottom.round() as i32 + (stroke - half);

  for inset in 0..stroke {
    let (x0, y0) = (left + inset, top + inset);
    let (x1, y1) = (right - inset, bottom - inset);
    if x1 <= x0 || y1 <= y0 {
      break;
    }
    let r = Rect::at(x0, y0).of_size((x1 - x0) as u32, (y1 - y0) as u32);
    draw_hollow_rect_mut(canvas, r, color);
  }
}

/// 覆盖缩放后裁剪左上角，与叠加层坐标对齐
pub fn cover_crop(image: &RgbImage, view_width: u32, view_height: u32) -> RgbImage {
  let (width, height) = image.dimensions();
  if (width, height) == (view_width, view_height) || width == 0 || height == 0 {
    return image.clone();
  }
  let scale = cover_scale(view_width, view_height, width, height);
  let scaled_width = ((width as f32 * scale).ceil() as u32).max(view_width);
  let scaled_height = ((height as f32 * scale).ceil() as u32).max(view_height);
  debug!(
    "预览缩放 {}x{} -> {}x{}, 裁剪到 {}x{}",
    width, height, scaled_width, scaled_height, view_width, view_height
  );
  let resized = imageops::resize(
    image,
    scaled_width,
    scaled_height,
    imageops::FilterType::Triangle,
  );
  imageops::crop_imm(&resized, 0, 0, view_width, view_height).to_image()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::{DetectItem, DetectResult, InferenceOptions},
    render::BOX_COLOR,
  };

  #[test]
  fn cover_crop_fills_view() {
    let image = RgbImage::new(100, 50);
    let out = cover_crop(&image, 60, 60);
    assert_eq!(out.dimensions(), (60, 60));
  }

  #[test]
  fn draws_box_and_label_background_without_font() {
    let mut renderer = ResultRenderer::new(100, 100);
    renderer.set_results(DetectResult::from_items(
      vec![DetectItem {
        label: "cup".into(),
        score: 0.5,
        bbox: [20.0, 30.0, 80.0, 90.0],
      }],
      100,
      100,
      &InferenceOptions::new("m.onnx"),
    ));

    let draw = Draw::default();
    assert!(!draw.has_font());
    let canvas = draw.compose(&RgbImage::from_pixel(100, 100, Rgb([9, 9, 9])), &renderer);

    assert_eq!(canvas.dimensions(), (100, 100));
    // 右边线为橙色，标签背景为黑色，框外不变
    assert_eq!(canvas.get_pixel(80, 60), &Rgb(BOX_COLOR));
    assert_eq!(canvas.get_pixel(30, 40), &Rgb(LABEL_BACKGROUND_COLOR));
    assert_eq!(canvas.get_pixel(5, 5), &Rgb([9, 9, 9]));
    assert_eq!(canvas.get_pixel(95, 20), &Rgb([9, 9, 9]));
  }

  #[test]
  fn rejects_invalid_font_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("font.ttf");
    std::fs::write(&path, b"not a font").unwrap();
    assert!(matches!(
      Draw::with_font_file(&path),
      Err(DrawError::InvalidFont(_))
    ));
    assert!(matches!(
      Draw::with_font_file(&dir.path().join("missing.ttf")),
      Err(DrawError::Io(_))
    ));
  }
}
