// 该文件是 Bakulan 项目的一部分。
// src/model.rs - 推理选项、结果类型与推理运行时接口
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
  fmt,
  path::{Path, PathBuf},
  sync::Arc,
};

use image::{RgbImage, imageops};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Rotation,
  tensor::{Tensor, TensorSpec},
  utils::{QueryError, decoded_path, query_value},
};

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.1;
pub const DEFAULT_MAX_RESULTS: usize = 3;
pub const DEFAULT_NUM_THREADS: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionsError {
  #[error("分数阈值必须位于 [0, 1]: {0}")]
  InvalidThreshold(f32),
  #[error("最大结果数必须大于 0")]
  InvalidMaxResults,
  #[error("推理线程数必须大于 0")]
  InvalidThreads,
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch { expected: String, actual: String },
  #[error(transparent)]
  Query(#[from] QueryError),
}

/// 会话构建失败；适配器因此进入终止的 Failed 状态
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
  #[error("模型文件不存在: {0}")]
  Missing(PathBuf),
  #[error("模型不兼容: {0}")]
  Incompatible(String),
  #[error("推理选项无效: {0}")]
  Options(#[from] OptionsError),
  #[error("未编译推理运行时，无法加载模型: {0}")]
  RuntimeUnavailable(PathBuf),
  #[error("适配器初始化已失败，需要重新创建实例")]
  Terminal,
}

/// 单帧推理失败，会话保持可用
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("推理运行错误: {0}")]
  Runtime(String),
  #[error("输出形状不符合预期: {0}")]
  UnexpectedOutput(String),
}

/// 按平台百分比格式输出整数百分数，四舍六入五取偶
///
/// 先扩展为 f64 再乘 100，f32 乘法的舍入误差会改变 .5 附近的结果
pub fn format_percent(score: f32) -> String {
  let percent = (f64::from(score) * 100.0).round_ties_even();
  format!("{}%", percent as i64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
  pub label: String,
  pub score: f32,
}

impl Category {
  pub fn new(label: impl Into<String>, score: f32) -> Self {
    Self {
      label: label.into(),
      score,
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.label, format_percent(self.score))
  }
}

/// 去掉非有限分数，截断到 [0, 1]，按阈值过滤
fn qualifies(score: f32, threshold: f32) -> Option<f32> {
  if !score.is_finite() {
    return None;
  }
  let score = score.clamp(0.0, 1.0);
  (score >= threshold).then_some(score)
}

/// 分数降序排列的分类结果，长度不超过 max_results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationResult {
  categories: Vec<Category>,
}

impl ClassificationResult {
  pub fn from_categories(
    categories: impl IntoIterator<Item = Category>,
    options: &InferenceOptions,
  ) -> Self {
    let mut categories: Vec<Category> = categories
      .into_iter()
      .filter_map(|c| {
        qualifies(c.score, options.threshold()).map(|score| Category { score, ..c })
      })
      .collect();
    categories.sort_by(|a, b| b.score.total_cmp(&a.score));
    categories.truncate(options.result_limit());
    Self { categories }
  }

  pub fn categories(&self) -> &[Category] {
    &self.categories
  }

  pub fn top(&self) -> Option<&Category> {
    self.categories.first()
  }

  pub fn is_empty(&self) -> bool {
    self.categories.is_empty()
  }

  pub fn len(&self) -> usize {
    self.categories.len()
  }

  /// 每个类别一行 `<label> <pct>%`
  pub fn display_text(&self) -> String {
    self
      .categories
      .iter()
      .map(Category::to_string)
      .collect::<Vec<_>>()
      .join("\n")
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub label: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl DetectItem {
  pub fn display_text(&self) -> String {
    format!("{} {}", self.label, format_percent(self.score))
  }
}

/// 检测结果；bbox 位于模型输入（摆正后）图像的像素坐标系
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  items: Vec<DetectItem>,
  image_width: u32,
  image_height: u32,
}

impl DetectResult {
  /// `items` 的 bbox 为归一化坐标，映射到 `width x height` 像素坐标后过滤排序
  pub fn from_normalized(
    items: impl IntoIterator<Item = DetectItem>,
    width: u32,
    height: u32,
    options: &InferenceOptions,
  ) -> Self {
    let (w, h) = (width as f32, height as f32);
    let items = items.into_iter().map(|item| {
      let [x0, y0, x1, y1] = item.bbox;
      let bbox = [
        (x0.min(x1) * w).clamp(0.0, w),
        (y0.min(y1) * h).clamp(0.0, h),
        (x0.max(x1) * w).clamp(0.0, w),
        (y0.max(y1) * h).clamp(0.0, h),
      ];
      DetectItem { bbox, ..item }
    });
    Self::from_items(items, width, height, options)
  }

  /// `items` 的 bbox 已是像素坐标
  pub fn from_items(
    items: impl IntoIterator<Item = DetectItem>,
    width: u32,
    height: u32,
    options: &InferenceOptions,
  ) -> Self {
    let mut items: Vec<DetectItem> = items
      .into_iter()
      .filter_map(|item| {
        qualifies(item.score, options.threshold()).map(|score| DetectItem { score, ..item })
      })
      .collect();
    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    items.truncate(options.result_limit());

    Self {
      items,
      image_width: width,
      image_height: height,
    }
  }

  pub fn items(&self) -> &[DetectItem] {
    &self.items
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn image_width(&self) -> u32 {
    self.image_width
  }

  pub fn image_height(&self) -> u32 {
    self.image_height
  }
}

/// EXIF 方向标签，描述存储的像素相对于正向图像的摆放方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
  TopLeft,
  TopRight,
  BottomRight,
  BottomLeft,
  LeftTop,
  RightTop,
  RightBottom,
  LeftBottom,
}

impl Orientation {
  /// 帧旋转元数据到方向标签的直接映射
  pub fn from_rotation(rotation: Rotation) -> Self {
    match rotation {
      Rotation::Deg0 => Orientation::TopLeft,
      Rotation::Deg90 => Orientation::RightTop,
      Rotation::Deg180 => Orientation::BottomRight,
      Rotation::Deg270 => Orientation::LeftBottom,
    }
  }

  /// 将存储的像素变换为正向图像
  pub fn apply(self, image: &RgbImage) -> RgbImage {
    match self {
      Orientation::TopLeft => image.clone(),
      Orientation::TopRight => imageops::flip_horizontal(image),
      Orientation::BottomRight => imageops::rotate180(image),
      Orientation::BottomLeft => imageops::flip_vertical(image),
      Orientation::LeftTop => imageops::flip_horizontal(&imageops::rotate90(image)),
      Orientation::RightTop => imageops::rotate90(image),
      Orientation::RightBottom => imageops::flip_horizontal(&imageops::rotate270(image)),
      Orientation::LeftBottom => imageops::rotate270(image),
    }
  }
}

/// 推理选项，在适配器构造时设定且不可变
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOptions {
  score_threshold: f32,
  max_results: usize,
  num_threads: usize,
  model_path: PathBuf,
  label_path: Option<PathBuf>,
}

impl InferenceOptions {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      score_threshold: DEFAULT_SCORE_THRESHOLD,
      max_results: DEFAULT_MAX_RESULTS,
      num_threads: DEFAULT_NUM_THREADS,
      model_path: model_path.into(),
      label_path: None,
    }
  }

  pub fn score_threshold(mut self, threshold: f32) -> Self {
    self.score_threshold = threshold;
    self
  }

  pub fn max_results(mut self, max_results: usize) -> Self {
    self.max_results = max_results;
    self
  }

  pub fn num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }

  pub fn label_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.label_path = Some(path.into());
    self
  }

  pub fn validate(&self) -> Result<(), OptionsError> {
    if !(0.0..=1.0).contains(&self.score_threshold) {
      return Err(OptionsError::InvalidThreshold(self.score_threshold));
    }
    if self.max_results == 0 {
      return Err(OptionsError::InvalidMaxResults);
    }
    if self.num_threads == 0 {
      return Err(OptionsError::InvalidThreads);
    }
    Ok(())
  }

  pub fn threshold(&self) -> f32 {
    self.score_threshold
  }

  pub fn result_limit(&self) -> usize {
    self.max_results
  }

  pub fn threads(&self) -> usize {
    self.num_threads
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  /// 标签文件，未指定时为模型同名 `.txt`
  pub fn labels_path(&self) -> PathBuf {
    self
      .label_path
      .clone()
      .unwrap_or_else(|| self.model_path.with_extension("txt"))
  }
}

impl FromUrlWithScheme for InferenceOptions {
  const SCHEME: &'static str = "model";
}

impl FromUrl for InferenceOptions {
  type Error = OptionsError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OptionsError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        actual: url.scheme().to_string(),
      });
    }

    let mut options = InferenceOptions::new(decoded_path(url));
    if let Some(threshold) = query_value::<f32>(url, "threshold")? {
      options = options.score_threshold(threshold);
    }
    if let Some(max_results) = query_value::<usize>(url, "max_results")? {
      options = options.max_results(max_results);
    }
    if let Some(threads) = query_value::<usize>(url, "threads")? {
      options = options.num_threads(threads);
    }
    if let Some(labels) = query_value::<PathBuf>(url, "labels")? {
      options = options.label_path(labels);
    }

    options.validate()?;
    debug!("推理选项: {:?}", options);
    Ok(options)
  }
}

/// 分类会话，由推理运行时提供
pub trait ClassifierSession: Send {
  fn input_spec(&self) -> TensorSpec;
  fn classify(&mut self, input: &Tensor) -> Result<Vec<Category>, InferenceError>;
}

/// 检测会话，返回归一化坐标的检测框
pub trait DetectorSession: Send {
  fn input_spec(&self) -> TensorSpec;
  fn detect(&mut self, input: &Tensor) -> Result<Vec<DetectItem>, InferenceError>;
}

/// 推理运行时：按选项加载模型并构建会话
pub trait Backend: Send + Sync {
  fn load_classifier(
    &self,
    options: &InferenceOptions,
  ) -> Result<Box<dyn ClassifierSession>, ModelLoadError>;

  fn load_detector(
    &self,
    options: &InferenceOptions,
  ) -> Result<Box<dyn DetectorSession>, ModelLoadError>;
}

/// 未启用任何推理运行时时使用，加载总是失败
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl Backend for UnavailableBackend {
  fn load_classifier(
    &self,
    options: &InferenceOptions,
  ) -> Result<Box<dyn ClassifierSession>, ModelLoadError> {
    Err(ModelLoadError::RuntimeUnavailable(
      options.model_path().to_path_buf(),
    ))
  }

  fn load_detector(
    &self,
    options: &InferenceOptions,
  ) -> Result<Box<dyn DetectorSession>, ModelLoadError> {
    Err(ModelLoadError::RuntimeUnavailable(
      options.model_path().to_path_buf(),
    ))
  }
}

pub fn default_backend() -> Arc<dyn Backend> {
  #[cfg(feature = "onnx_runtime")]
  {
    Arc::new(OnnxBackend)
  }
  #[cfg(not(feature = "onnx_runtime"))]
  {
    Arc::new(UnavailableBackend)
  }
}

/// 读取标签文件，每行一个标签
pub fn load_labels(path: &Path) -> Result<Vec<String>, ModelLoadError> {
  let content =
    std::fs::read_to_string(path).map_err(|_| ModelLoadError::Missing(path.to_path_buf()))?;
  let labels: Vec<String> = content
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .map(String::from)
    .collect();
  if labels.is_empty() {
    return Err(ModelLoadError::Incompatible(format!(
      "标签文件为空: {}",
      path.display()
    )));
  }
  Ok(labels)
}

#[cfg(feature = "onnx_runtime")]
mod onnx;
#[cfg(feature = "onnx_runtime")]
pub use self::onnx::{OnnxBackend, OnnxClassifierSession, OnnxDetectorSession};

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn options() -> InferenceOptions {
    InferenceOptions::new("m.onnx")
  }

  #[test]
  fn percent_matches_platform_formatter() {
    assert_eq!(format_percent(0.92), "92%");
    assert_eq!(format_percent(0.05), "5%");
    assert_eq!(format_percent(1.0), "100%");
    assert_eq!(format_percent(0.0), "0%");
    assert_eq!(format_percent(0.925), "93%");
    assert_eq!(format_percent(0.015), "1%");
    assert_eq!(Category::new("cat", 0.92).to_string(), "cat 92%");
  }

  #[test]
  fn classification_is_filtered_sorted_and_truncated() {
    let raw = vec![
      Category::new("a", 0.3),
      Category::new("b", 0.05),
      Category::new("c", 0.9),
      Category::new("d", f32::NAN),
      Category::new("e", 1.7),
      Category::new("f", 0.5),
    ];
    let result = ClassificationResult::from_categories(raw, &options());
    let labels: Vec<&str> = result.categories().iter().map(|c| c.label.as_str()).collect();
    assert_eq!(labels, vec!["e", "c", "f"]);
    assert!(result.len() <= DEFAULT_MAX_RESULTS);
    assert!(result.categories().iter().all(|c| (0.0..=1.0).contains(&c.score)));
    assert!(
      result
        .categories()
        .windows(2)
        .all(|w| w[0].score >= w[1].score)
    );
  }

  #[test]
  fn display_text_joins_lines() {
    let result = ClassificationResult::from_categories(
      vec![Category::new("dog", 0.4), Category::new("cat", 0.6)],
      &options(),
    );
    assert_eq!(result.display_text(), "cat 60%\ndog 40%");
  }

  #[test]
  fn detections_map_to_pixel_coordinates() {
    let items = vec![
      DetectItem {
        label: "cup".into(),
        score: 0.8,
        bbox: [0.5, 0.5, 0.25, 0.25],
      },
      DetectItem {
        label: "noise".into(),
        score: 0.01,
        bbox: [0.0, 0.0, 1.0, 1.0],
      },
    ];
    let result = DetectResult::from_normalized(items, 200, 100, &options());
    assert_eq!(result.len(), 1);
    assert_eq!(result.items()[0].bbox, [50.0, 25.0, 100.0, 50.0]);
    assert_eq!((result.image_width(), result.image_height()), (200, 100));
  }

  #[test]
  fn detections_respect_max_results() {
    let items = (0..10).map(|i| DetectItem {
      label: format!("obj{i}"),
      score: i as f32 / 10.0,
      bbox: [0.0, 0.0, 1.0, 1.0],
    });
    let result = DetectResult::from_normalized(items, 10, 10, &options().max_results(2));
    let scores: Vec<f32> = result.items().iter().map(|i| i.score).collect();
    assert_eq!(scores, vec![0.9, 0.8]);
  }

  #[test]
  fn orientation_mapping_is_total() {
    let tags: Vec<Orientation> = Rotation::ALL
      .iter()
      .map(|r| Orientation::from_rotation(*r))
      .collect();
    assert_eq!(
      tags,
      vec![
        Orientation::TopLeft,
        Orientation::RightTop,
        Orientation::BottomRight,
        Orientation::LeftBottom
      ]
    );
    for rotation in Rotation::ALL {
      assert_eq!(
        Orientation::from_rotation(rotation),
        Orientation::from_rotation(rotation)
      );
    }
  }

  #[test]
  fn right_top_rotates_clockwise() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([1, 1, 1]));
    let upright = Orientation::RightTop.apply(&image);
    assert_eq!(upright.dimensions(), (1, 2));
    assert_eq!(upright.get_pixel(0, 0), &Rgb([1, 1, 1]));
  }

  #[test]
  fn transposing_tags_swap_axes() {
    let mut image = RgbImage::new(3, 2);
    image.put_pixel(2, 0, Rgb([9, 9, 9]));
    let transposed = Orientation::LeftTop.apply(&image);
    assert_eq!(transposed.dimensions(), (2, 3));
    assert_eq!(transposed.get_pixel(0, 2), &Rgb([9, 9, 9]));
    let transversed = Orientation::RightBottom.apply(&image);
    assert_eq!(transversed.get_pixel(1, 0), &Rgb([9, 9, 9]));
  }

  #[test]
  fn options_validation() {
    assert!(options().validate().is_ok());
    assert_eq!(
      options().score_threshold(1.5).validate(),
      Err(OptionsError::InvalidThreshold(1.5))
    );
    assert_eq!(
      options().max_results(0).validate(),
      Err(OptionsError::InvalidMaxResults)
    );
    assert_eq!(
      options().num_threads(0).validate(),
      Err(OptionsError::InvalidThreads)
    );
  }

  #[test]
  fn options_from_url() {
    let url =
      Url::parse("model:///models/net.onnx?threshold=0.25&max_results=5&threads=2").unwrap();
    let options = InferenceOptions::from_url(&url).unwrap();
    assert_eq!(options.threshold(), 0.25);
    assert_eq!(options.result_limit(), 5);
    assert_eq!(options.threads(), 2);
    assert_eq!(options.model_path(), Path::new("/models/net.onnx"));
    assert_eq!(options.labels_path(), PathBuf::from("/models/net.txt"));

    let bad = Url::parse("model:///m.onnx?threshold=2").unwrap();
    assert_eq!(
      InferenceOptions::from_url(&bad),
      Err(OptionsError::InvalidThreshold(2.0))
    );
    let wrong = Url::parse("image:///m.onnx").unwrap();
    assert!(matches!(
      InferenceOptions::from_url(&wrong),
      Err(OptionsError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn labels_are_read_line_by_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "cat\n\ndog\n  bird \n").unwrap();
    assert_eq!(load_labels(&path).unwrap(), vec!["cat", "dog", "bird"]);
    assert_eq!(
      load_labels(&dir.path().join("missing.txt")),
      Err(ModelLoadError::Missing(dir.path().join("missing.txt")))
    );
  }

  #[test]
  fn unavailable_backend_reports_model_path() {
    let err = UnavailableBackend
      .load_classifier(&options())
      .err()
      .unwrap();
    assert_eq!(err, ModelLoadError::RuntimeUnavailable(PathBuf::from("m.onnx")));
  }
}
