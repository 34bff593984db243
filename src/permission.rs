// 该文件是 Bakulan 项目的一部分。
// src/permission.rs - 相机/麦克风权限检查
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
  fs::OpenOptions,
  path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
pub const DEFAULT_MICROPHONE_DEVICE: &str = "/dev/snd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
  Camera,
  Microphone,
}

impl fmt::Display for Permission {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Permission::Camera => write!(f, "相机"),
      Permission::Microphone => write!(f, "麦克风"),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("权限被拒绝: {}", .denied.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
pub struct PermissionDenied {
  pub denied: Vec<Permission>,
}

pub trait PermissionBroker {
  fn is_granted(&self, permission: Permission) -> bool;

  /// 批量请求，返回每个权限的授予结果
  fn request(&mut self, permissions: &[Permission]) -> Vec<(Permission, bool)>;
}

pub fn ensure_permission<B>(broker: &mut B, permission: Permission) -> Result<(), PermissionDenied>
where
  B: PermissionBroker + ?Sized,
{
  ensure_permissions(broker, &[permission])
}

/// 只请求尚未授予的权限；没有应答的权限视为拒绝
pub fn ensure_permissions<B>(broker: &mut B, permissions: &[Permission]) -> Result<(), PermissionDenied>
where
  B: PermissionBroker + ?Sized,
{
  let missing: Vec<Permission> = permissions
    .iter()
    .copied()
    .filter(|p| !broker.is_granted(*p))
    .collect();
  if missing.is_empty() {
    return Ok(());
  }

  debug!("请求权限: {:?}", missing);
  let answers = broker.request(&missing);
  let denied: Vec<Permission> = missing
    .into_iter()
    .filter(|p| !answers.iter().any(|(q, granted)| q == p && *granted))
    .collect();

  if denied.is_empty() {
    Ok(())
  } else {
    let error = PermissionDenied { denied };
    warn!("{}", error);
    Err(error)
  }
}

/// 由命令行决定的固定权限
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
  denied: Vec<Permission>,
}

impl StaticPermissions {
  pub fn allow_all() -> Self {
    Self::default()
  }

  pub fn with_denied(mut self, permission: Permission) -> Self {
    if !self.denied.contains(&permission) {
      self.denied.push(permission);
    }
    self
  }
}

impl PermissionBroker for StaticPermissions {
  fn is_granted(&self, permission: Permission) -> bool {
    !self.denied.contains(&permission)
  }

  fn request(&mut self, permissions: &[Permission]) -> Vec<(Permission, bool)> {
    permissions
      .iter()
      .map(|p| (*p, self.is_granted(*p)))
      .collect()
  }
}

/// 以设备节点能否打开作为授权依据
#[derive(Debug, Clone)]
pub struct DevicePermissions {
  camera: PathBuf,
  microphone: PathBuf,
}

impl Default for DevicePermissions {
  fn default() -> Self {
    Self::new(DEFAULT_CAMERA_DEVICE)
  }
}

impl DevicePermissions {
  pub fn new(camera: impl Into<PathBuf>) -> Self {
    Self {
      camera: camera.into(),
      microphone: PathBuf::from(DEFAULT_MICROPHONE_DEVICE),
    }
  }

  pub fn with_microphone(mut self, microphone: impl Into<PathBuf>) -> Self {
    self.microphone = microphone.into();
    self
  }

  fn device_of(&self, permission: Permission) -> &Path {
    match permission {
      Permission::Camera => &self.camera,
      Permission::Microphone => &self.microphone,
    }
  }
}

impl PermissionBroker for DevicePermissions {
  fn is_granted(&self, permission: Permission) -> bool {
    let device = self.device_of(permission);
    match OpenOptions::new().read(true).open(device) {
      Ok(_) => true,
      Err(e) => {
        debug!("无法打开设备 {}: {}", device.display(), e);
        false
      }
    }
  }

  fn request(&mut self, permissions: &[Permission]) -> Vec<(Permission, bool)> {
    permissions
      .iter()
      .map(|p| {
        let granted = self.is_granted(*p);
        info!(
          "{}权限 ({}): {}",
          p,
          self.device_of(*p).display(),
          if granted { "已授予" } else { "被拒绝" }
        );
        (*p, granted)
      })
      .collect()
  }
}
