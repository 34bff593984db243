// 该文件是 Bakulan 项目的一部分。
// src/input/v4l_input.rs - V4L 相机输入
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use v4l::{
  Device, FourCC, Format,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError, FramePool, PixelFormat, Rotation},
  utils::{QueryError, decoded_path, query_value},
};

const DEFAULT_DEVICE: &str = "/dev/video0";
// 优先请求 16:9
const PREFERRED_WIDTH: u32 = 1280;
const PREFERRED_HEIGHT: u32 = 720;
const STREAM_BUFFERS: u32 = 4;
const POOL_CAPACITY: usize = 3;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
  #[error("帧参数错误: {0}")]
  FrameError(#[from] FrameError),
  #[error(transparent)]
  Query(#[from] QueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
  Rgb3,
  Yuyv,
}

impl SourceFormat {
  fn of(fourcc: FourCC) -> Option<Self> {
    match &fourcc.repr {
      b"RGB3" => Some(SourceFormat::Rgb3),
      b"YUYV" => Some(SourceFormat::Yuyv),
      _ => None,
    }
  }
}

/// RGB24 转 RGBA
fn rgb_to_rgba(src: &[u8], dst: &mut Vec<u8>) {
  dst.clear();
  for px in src.chunks_exact(3) {
    dst.extend_from_slice(&[px[0], px[1], px[2], 0xFF]);
  }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let c = y as f32 - 16.0;
  let d = u as f32 - 128.0;
  let e = v as f32 - 128.0;
  let r = 1.164 * c + 1.596 * e;
  let g = 1.164 * c - 0.392 * d - 0.813 * e;
  let b = 1.164 * c + 2.017 * d;
  [
    r.round().clamp(0.0, 255.0) as u8,
    g.round().clamp(0.0, 255.0) as u8,
    b.round().clamp(0.0, 255.0) as u8,
  ]
}

/// YUYV (4:2:2) 转 RGBA，每 4 字节对应两个像素
fn yuyv_to_rgba(src: &[u8], dst: &mut Vec<u8>) {
  dst.clear();
  for px in src.chunks_exact(4) {
    let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
    for y in [y0, y1] {
      let [r, g, b] = yuv_to_rgb(y, u, v);
      dst.extend_from_slice(&[r, g, b, 0xFF]);
    }
  }
}

/// 请求 1280x720 的 RGB 采集，设备不接受时退回到当前格式
fn negotiate(device: &Device) -> Result<(Format, SourceFormat), V4lInputError> {
  for fourcc in [b"RGB3", b"YUYV"] {
    let wanted = Format::new(PREFERRED_WIDTH, PREFERRED_HEIGHT, FourCC::new(fourcc));
    match device.set_format(&wanted) {
      Ok(actual) => {
        if let Some(source) = SourceFormat::of(actual.fourcc) {
          return Ok((actual, source));
        }
      }
      Err(e) => warn!("设备不接受格式 {}: {}", FourCC::new(fourcc), e),
    }
  }

  let current = device.format()?;
  match SourceFormat::of(current.fourcc) {
    Some(source) => Ok((current, source)),
    None => Err(V4lInputError::UnsupportedPixelFormat(current.fourcc.to_string())),
  }
}

pub struct V4lInput {
  device_path: PathBuf,
  width: u32,
  height: u32,
  source: SourceFormat,
  rotation: Rotation,
  stream: Stream<'static>,
  scratch: Vec<u8>,
  pool: FramePool,
  _device: Device,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    // v4l:///dev/video0
    let device_path = match decoded_path(url) {
      path if path.as_os_str().is_empty() || path.as_os_str() == "/" => PathBuf::from(DEFAULT_DEVICE),
      path => path,
    };
    let rotation = match query_value::<String>(url, "rotation")? {
      Some(value) => value.parse::<Rotation>()?,
      None => Rotation::Deg0,
    };

    let device = Device::with_path(&device_path)?;
    let (format, source) = negotiate(&device)?;
    info!(
      "打开相机 {}: {}x{} {}",
      device_path.display(),
      format.width,
      format.height,
      format.fourcc
    );
    let stream = Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)?;

    Ok(V4lInput {
      device_path,
      width: format.width,
      height: format.height,
      source,
      rotation,
      stream,
      scratch: Vec::new(),
      pool: FramePool::new(POOL_CAPACITY),
      _device: device,
    })
  }
}

impl V4lInput {
  fn capture_frame(&mut self) -> Result<Frame, V4lInputError> {
    let (buf, _meta) = self.stream.next()?;
    match self.source {
      SourceFormat::Rgb3 => rgb_to_rgba(buf, &mut self.scratch),
      SourceFormat::Yuyv => yuyv_to_rgba(buf, &mut self.scratch),
    }
    // 驱动可能给出带填充的缓冲区
    let expected = self.width as usize * self.height as usize * PixelFormat::Rgba8.channels();
    self.scratch.truncate(expected);
    let frame = self.pool.fill(
      self.width,
      self.height,
      PixelFormat::Rgba8,
      self.rotation,
      &self.scratch,
    )?;
    Ok(frame)
  }
}

impl Iterator for V4lInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    match self.capture_frame() {
      Ok(frame) => Some(frame),
      Err(e) => {
        error!("相机 {} 采集失败: {}", self.device_path.display(), e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rgb_gains_opaque_alpha() {
    let mut out = Vec::new();
    rgb_to_rgba(&[1, 2, 3, 4, 5, 6], &mut out);
    assert_eq!(out, vec![1, 2, 3, 255, 4, 5, 6, 255]);
  }

  #[test]
  fn yuyv_expands_to_two_pixels() {
    let mut out = Vec::new();
    // 黑色与白色
    yuyv_to_rgba(&[16, 128, 235, 128], &mut out);
    assert_eq!(out, vec![0, 0, 0, 255, 255, 255, 255, 255]);
  }

  #[test]
  fn recognizes_capture_formats() {
    assert_eq!(SourceFormat::of(FourCC::new(b"RGB3")), Some(SourceFormat::Rgb3));
    assert_eq!(SourceFormat::of(FourCC::new(b"YUYV")), Some(SourceFormat::Yuyv));
    assert_eq!(SourceFormat::of(FourCC::new(b"MJPG")), None);
  }
}
