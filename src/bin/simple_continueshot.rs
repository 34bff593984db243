// 该文件是 Bakulan 项目的一部分。
// src/bin/simple_continueshot.rs - 相机实时分类/检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use url::Url;

use bakulan::{
  FromUrl,
  adapter::{ActiveAdapter, AdapterMode},
  input::InputWrapper,
  model::default_backend,
  output::OutputWrapper,
  permission::{
    DEFAULT_CAMERA_DEVICE, DevicePermissions, Permission, PermissionBroker, StaticPermissions,
    ensure_permission,
  },
  task::{ContinuousTask, Task},
  utils::decoded_path,
};

/// Bakulan 实时推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理模式
  #[arg(long, value_enum, default_value = "detect")]
  pub mode: AdapterMode,
  /// 模型地址，缺省时使用随程序分发的模型
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 输入来源，例如 v4l:///dev/video0 或 folder:///path/frames?fps=15
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  /// 拒绝相机权限
  #[arg(long)]
  pub deny_camera: bool,
}

/// 相机输入按设备节点检查权限，回放输入不需要相机
fn broker_for(args: &Args) -> Box<dyn PermissionBroker> {
  if args.deny_camera {
    return Box::new(StaticPermissions::allow_all().with_denied(Permission::Camera));
  }
  match args.input.scheme() {
    "v4l" => {
      let device = decoded_path(&args.input);
      if device.as_os_str().is_empty() || device.as_os_str() == "/" {
        Box::new(DevicePermissions::new(DEFAULT_CAMERA_DEVICE))
      } else {
        Box::new(DevicePermissions::new(device))
      }
    }
    _ => Box::new(StaticPermissions::allow_all()),
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("推理模式: {:?}", args.mode);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut broker = broker_for(&args);
  if let Err(denied) = ensure_permission(broker.as_mut(), Permission::Camera) {
    error!("{}", denied);
    eprintln!("{}", denied);
    return Ok(());
  }

  let options = args.mode.options(args.model.as_ref()).context("模型参数错误")?;
  info!("模型文件路径: {}", options.model_path().display());

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let adapter = ActiveAdapter::new(args.mode, options, default_backend());

  let stats = ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .run_task(input, adapter, output)?;
  info!("统计: {:?}", stats);

  Ok(())
}
