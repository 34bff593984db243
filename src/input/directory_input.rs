// 该文件是 Bakulan 项目的一部分。
// src/input/directory_input.rs - 按固定帧率回放图像目录
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
  thread,
  time::{Duration, Instant},
};

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError, FramePool, PixelFormat, Rotation},
  utils::{QueryError, decoded_path, query_flag, query_value},
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
/// 采集端与推理端同时持有的缓冲区数量
const POOL_CAPACITY: usize = 3;

#[derive(Error, Debug)]
pub enum DirectoryInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("目录中没有图像文件: {0}")]
  Empty(PathBuf),
  #[error("帧率必须为正数: {0}")]
  InvalidFps(f64),
  #[error("帧参数错误: {0}")]
  FrameError(#[from] FrameError),
  #[error(transparent)]
  Query(#[from] QueryError),
}

/// 目录回放：模拟相机，以 `?fps=` 的速率依次产出目录中的图像
pub struct DirectoryInput {
  files: Vec<PathBuf>,
  cursor: usize,
  repeat: bool,
  interval: Option<Duration>,
  last: Option<Instant>,
  rotation: Rotation,
  pool: FramePool,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryInput {
  type Error = DirectoryInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryInputError::SchemaMismatch);
    }

    let rotation = match query_value::<String>(url, "rotation")? {
      Some(value) => value.parse::<Rotation>()?,
      None => Rotation::Deg0,
    };
    let interval = match query_value::<f64>(url, "fps")? {
      Some(fps) if fps > 0.0 && fps.is_finite() => Some(Duration::from_secs_f64(1.0 / fps)),
      Some(fps) => return Err(DirectoryInputError::InvalidFps(fps)),
      None => None,
    };

    let mut input = DirectoryInput::open(&decoded_path(url))?;
    input.rotation = rotation;
    input.interval = interval;
    input.repeat = query_flag(url, "loop");
    Ok(input)
  }
}

impl DirectoryInput {
  pub fn open(directory: &Path) -> Result<Self, DirectoryInputError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| {
        path
          .extension()
          .and_then(|ext| ext.to_str())
          .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
      })
      .collect();
    if files.is_empty() {
      return Err(DirectoryInputError::Empty(directory.to_path_buf()));
    }
    files.sort();
    info!("目录 {} 中共有 {} 张图像", directory.display(), files.len());

    Ok(Self {
      files,
      cursor: 0,
      repeat: false,
      interval: None,
      last: None,
      rotation: Rotation::Deg0,
      pool: FramePool::new(POOL_CAPACITY),
    })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  fn pace(&mut self) {
    if let (Some(interval), Some(last)) = (self.interval, self.last) {
      let elapsed = last.elapsed();
      if elapsed < interval {
        thread::sleep(interval - elapsed);
      }
    }
    self.last = Some(Instant::now());
  }

  fn load(&self, path: &Path) -> Option<Frame> {
    let image = ImageReader::open(path)
      .and_then(|r| r.with_guessed_format())
      .map_err(image::ImageError::IoError)
      .and_then(|r| r.decode());
    let image = match image {
      Ok(image) => image.into_rgba8(),
      Err(e) => {
        warn!("跳过无法解码的图像 {}: {}", path.display(), e);
        return None;
      }
    };
    let (width, height) = image.dimensions();
    match self
      .pool
      .fill(width, height, PixelFormat::Rgba8, self.rotation, image.as_raw())
    {
      Ok(frame) => Some(frame),
      Err(e) => {
        warn!("图像 {} 无法构造帧: {}", path.display(), e);
        None
      }
    }
  }
}

impl Iterator for DirectoryInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    let mut skipped = 0;
    while skipped < self.files.len() {
      if self.cursor >= self.files.len() {
        if !self.repeat {
          return None;
        }
        debug!("目录回放结束, 从头开始");
        self.cursor = 0;
      }
      let path = self.files[self.cursor].clone();
      self.cursor += 1;

      if let Some(frame) = self.load(&path) {
        self.pace();
        return Some(frame);
      }
      skipped += 1;
    }
    warn!("目录中没有可解码的图像");
    None
  }
}
