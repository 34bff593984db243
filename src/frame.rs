// 该文件是 Bakulan 项目的一部分。
// src/frame.rs - 帧缓冲定义与帧池
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

use std::sync::{Arc, Mutex, PoisonError, Weak};

use image::{DynamicImage, ImageBuffer, Rgb, RgbImage, RgbaImage, imageops};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("不支持的旋转角度: {0}")]
  UnsupportedRotation(i32),
  #[error("旋转角度无法解析: {0}")]
  InvalidRotation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  /// 相机默认输出格式
  Rgba8,
  Rgb8,
}

impl PixelFormat {
  pub fn channels(self) -> usize {
    match self {
      PixelFormat::Rgba8 => 4,
      PixelFormat::Rgb8 => 3,
    }
  }
}

/// 帧的旋转元数据：图像需要顺时针旋转多少度才能摆正
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub const ALL: [Rotation; 4] = [
    Rotation::Deg0,
    Rotation::Deg90,
    Rotation::Deg180,
    Rotation::Deg270,
  ];

  pub fn degrees(self) -> i32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }

  /// 摆正图像所需的逆时针四分之一圈数，即 `-degrees / 90`
  pub fn quarter_turns_ccw(self) -> i32 {
    -self.degrees() / 90
  }

  /// 旋转后是否交换宽高
  pub fn swaps_axes(self) -> bool {
    matches!(self, Rotation::Deg90 | Rotation::Deg270)
  }
}

impl TryFrom<i32> for Rotation {
  type Error = FrameError;

  fn try_from(degrees: i32) -> Result<Self, Self::Error> {
    match degrees.rem_euclid(360) {
      0 => Ok(Rotation::Deg0),
      90 => Ok(Rotation::Deg90),
      180 => Ok(Rotation::Deg180),
      270 => Ok(Rotation::Deg270),
      _ => Err(FrameError::UnsupportedRotation(degrees)),
    }
  }
}

impl std::str::FromStr for Rotation {
  type Err = FrameError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let degrees = s
      .trim()
      .parse::<i32>()
      .map_err(|_| FrameError::InvalidRotation(s.to_string()))?;
    Rotation::try_from(degrees)
  }
}

/// 按逆时针四分之一圈数旋转图像
pub fn rotate_quarter_turns(image: &RgbImage, turns_ccw: i32) -> RgbImage {
  match turns_ccw.rem_euclid(4) {
    0 => image.clone(),
    1 => imageops::rotate270(image),
    2 => imageops::rotate180(image),
    _ => imageops::rotate90(image),
  }
}

struct PoolInner {
  free: Mutex<Vec<Vec<u8>>>,
  capacity: usize,
}

/// 帧缓冲池，由采集端持有；帧被释放后缓冲区回到池中复用
#[derive(Clone)]
pub struct FramePool {
  inner: Arc<PoolInner>,
}

impl FramePool {
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        free: Mutex::new(Vec::with_capacity(capacity)),
        capacity,
      }),
    }
  }

  /// 池中空闲缓冲区数量
  pub fn available(&self) -> usize {
    self
      .inner
      .free
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  /// 从池中取出缓冲区并复制像素数据，构造一帧
  pub fn fill(
    &self,
    width: u32,
    height: u32,
    format: PixelFormat,
    rotation: Rotation,
    pixels: &[u8],
  ) -> Result<Frame, FrameError> {
    let expected = width as usize * height as usize * format.channels();
    if pixels.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: pixels.len(),
      });
    }

    let mut data = self
      .inner
      .free
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .pop()
      .unwrap_or_default();
    data.clear();
    data.extend_from_slice(pixels);

    Ok(Frame {
      data,
      width,
      height,
      format,
      rotation,
      pool: Some(Arc::downgrade(&self.inner)),
    })
  }
}

fn release(pool: &Weak<PoolInner>, buffer: Vec<u8>) {
  if let Some(pool) = pool.upgrade() {
    let mut free = pool.free.lock().unwrap_or_else(PoisonError::into_inner);
    if free.len() < pool.capacity {
      free.push(buffer);
    }
  }
}

/// 一帧图像：来自相机采集或文件解码，被适配器消费一次后释放
pub struct Frame {
  data: Vec<u8>,
  width: u32,
  height: u32,
  format: PixelFormat,
  rotation: Rotation,
  pool: Option<Weak<PoolInner>>,
}

impl std::fmt::Debug for Frame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Frame")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("format", &self.format)
      .field("rotation", &self.rotation)
      .field("pooled", &self.pool.is_some())
      .finish()
  }
}

impl Frame {
  pub fn new(
    width: u32,
    height: u32,
    format: PixelFormat,
    rotation: Rotation,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let expected = width as usize * height as usize * format.channels();
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data,
      width,
      height,
      format,
      rotation,
      pool: None,
    })
  }

  pub fn from_rgba_image(image: RgbaImage, rotation: Rotation) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw(),
      width,
      height,
      format: PixelFormat::Rgba8,
      rotation,
      pool: None,
    }
  }

  pub fn from_rgb_image(image: RgbImage, rotation: Rotation) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw(),
      width,
      height,
      format: PixelFormat::Rgb8,
      rotation,
      pool: None,
    }
  }

  pub fn from_dynamic(image: DynamicImage, rotation: Rotation) -> Self {
    Self::from_rgba_image(image.into_rgba8(), rotation)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 摆正后的宽高
  pub fn upright_dimensions(&self) -> (u32, u32) {
    if self.rotation.swaps_axes() {
      (self.height, self.width)
    } else {
      (self.width, self.height)
    }
  }

  /// 复制为 RGB 图像（丢弃 alpha 通道）
  pub fn to_rgb_image(&self) -> RgbImage {
    let channels = self.format.channels();
    let width = self.width as usize;
    let data = &self.data;

    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * width + x as usize) * channels;
      Rgb([data[idx], data[idx + 1], data[idx + 2]])
    })
  }

  /// 提取像素后立即释放帧，缓冲区归还帧池
  pub fn into_rgb_image(self) -> RgbImage {
    let image = self.to_rgb_image();
    drop(self);
    image
  }

  /// 摆正后的 RGB 图像，预览使用
  pub fn to_upright_rgb_image(&self) -> RgbImage {
    rotate_quarter_turns(&self.to_rgb_image(), self.rotation.quarter_turns_ccw())
  }
}

impl Clone for Frame {
  /// 克隆得到的帧不属于任何帧池
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      width: self.width,
      height: self.height,
      format: self.format,
      rotation: self.rotation,
      pool: None,
    }
  }
}

impl Drop for Frame {
  fn drop(&mut self) {
    if let Some(pool) = self.pool.take() {
      debug!("释放帧缓冲 {}x{}", self.width, self.height);
      release(&pool, std::mem::take(&mut self.data));
    }
  }
}
