// 该文件是 Bakulan 项目的一部分。
// src/render.rs - 推理结果到绘制指令的转换
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

use tracing::debug;

use crate::model::{ClassificationResult, DetectResult};

pub const STROKE_WIDTH: f32 = 8.0;
pub const TEXT_SIZE: f32 = 50.0;
pub const TEXT_PADDING: f32 = 8.0;
pub const BOX_COLOR: [u8; 3] = [0xFF, 0x88, 0x00]; // 橙色
pub const LABEL_BACKGROUND_COLOR: [u8; 3] = [0x00, 0x00, 0x00];
pub const LABEL_TEXT_COLOR: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// 字符平均宽度与字号之比，用于没有字体时的估算
const FIXED_ADVANCE_RATIO: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectF {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl RectF {
  pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  pub fn from_bbox(bbox: &[f32; 4]) -> Self {
    Self::new(bbox[0], bbox[1], bbox[2], bbox[3])
  }

  pub fn scaled(self, factor: f32) -> Self {
    Self::new(
      self.left * factor,
      self.top * factor,
      self.right * factor,
      self.bottom * factor,
    )
  }

  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
  StrokeRect {
    rect: RectF,
    width: f32,
    color: [u8; 3],
  },
  FillRect {
    rect: RectF,
    color: [u8; 3],
  },
  /// 文本左上角位于 (x, y)
  Text {
    x: f32,
    y: f32,
    text: String,
    size: f32,
    color: [u8; 3],
  },
}

/// 文本尺寸测量，返回 (宽, 高)
pub trait TextMeasure {
  fn measure(&self, text: &str, size: f32) -> (f32, f32);
}

/// 等宽估算
#[derive(Debug, Clone, Copy)]
pub struct FixedAdvance {
  ratio: f32,
}

impl Default for FixedAdvance {
  fn default() -> Self {
    Self {
      ratio: FIXED_ADVANCE_RATIO,
    }
  }
}

impl FixedAdvance {
  pub fn with_ratio(mut self, ratio: f32) -> Self {
    self.ratio = ratio;
    self
  }
}

impl TextMeasure for FixedAdvance {
  fn measure(&self, text: &str, size: f32) -> (f32, f32) {
    (text.chars().count() as f32 * size * self.ratio, size)
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum RenderContent {
  #[default]
  Empty,
  Classification(ClassificationResult),
  Detection(DetectResult),
}

/// 最近一次结果及其缩放系数，每次整体替换
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
  pub content: RenderContent,
  pub scale_factor: f32,
}

impl Default for RenderState {
  fn default() -> Self {
    Self {
      content: RenderContent::Empty,
      scale_factor: 1.0,
    }
  }
}

/// 覆盖缩放：内容填满视图，多余部分裁剪
pub fn cover_scale(view_width: u32, view_height: u32, image_width: u32, image_height: u32) -> f32 {
  if image_width == 0 || image_height == 0 {
    return 1.0;
  }
  let sx = view_width as f32 / image_width as f32;
  let sy = view_height as f32 / image_height as f32;
  sx.max(sy)
}

#[derive(Debug)]
pub struct ResultRenderer {
  view_width: u32,
  view_height: u32,
  state: RenderState,
  needs_redraw: bool,
}

impl ResultRenderer {
  pub fn new(view_width: u32, view_height: u32) -> Self {
    Self {
      view_width,
      view_height,
      state: RenderState::default(),
      needs_redraw: false,
    }
  }

  pub fn view_size(&self) -> (u32, u32) {
    (self.view_width, self.view_height)
  }

  pub fn set_view_size(&mut self, width: u32, height: u32) {
    if (width, height) == (self.view_width, self.view_height) {
      return;
    }
    self.view_width = width;
    self.view_height = height;
    if let RenderContent::Detection(result) = &self.state.content {
      self.state.scale_factor = cover_scale(
        width,
        height,
        result.image_width(),
        result.image_height(),
      );
    }
    self.needs_redraw = true;
  }

  pub fn state(&self) -> &RenderState {
    &self.state
  }

  pub fn set_results(&mut self, result: DetectResult) {
    let scale_factor = cover_scale(
      self.view_width,
      self.view_height,
      result.image_width(),
      result.image_height(),
    );
    debug!("更新检测结果, 数量 {}, 缩放 {:.3}", result.len(), scale_factor);
    self.state = RenderState {
      content: RenderContent::Detection(result),
      scale_factor,
    };
    self.needs_redraw = true;
  }

  pub fn set_classification(&mut self, result: ClassificationResult) {
    self.state = RenderState {
      content: RenderContent::Classification(result),
      scale_factor: 1.0,
    };
    self.needs_redraw = true;
  }

  pub fn clear(&mut self) {
    self.state = RenderState::default();
    self.needs_redraw = true;
  }

  /// 取出并重置重绘标记
  pub fn take_redraw(&mut self) -> bool {
    std::mem::take(&mut self.needs_redraw)
  }

  /// 检测框叠加层的绘制指令，只依赖当前状态
  pub fn draw_ops(&self, measure: &dyn TextMeasure) -> Vec<DrawOp> {
    let RenderContent::Detection(result) = &self.state.content else {
      return Vec::new();
    };
    let scale = self.state.scale_factor;

    let mut ops = Vec::with_capacity(result.len() * 3);
    for item in result.items() {
      let rect = RectF::from_bbox(&item.bbox).scaled(scale);
      ops.push(DrawOp::StrokeRect {
        rect,
        width: STROKE_WIDTH,
        color: BOX_COLOR,
      });

      let text = item.display_text();
      let (text_width, text_height) = measure.measure(&text, TEXT_SIZE);
      ops.push(DrawOp::FillRect {
        rect: RectF::new(
          rect.left,
          rect.top,
          rect.left + text_width + TEXT_PADDING,
          rect.top + text_height + TEXT_PADDING,
        ),
        color: LABEL_BACKGROUND_COLOR,
      });
      ops.push(DrawOp::Text {
        x: rect.left,
        y: rect.top,
        text,
        size: TEXT_SIZE,
        color: LABEL_TEXT_COLOR,
      });
    }
    ops
  }

  /// 分类文本面板，每个类别一行
  pub fn text_lines(&self) -> Vec<String> {
    match &self.state.content {
      RenderContent::Classification(result) => result
        .categories()
        .iter()
        .map(|c| c.to_string())
        .collect(),
      _ => Vec::new(),
    }
  }
}
