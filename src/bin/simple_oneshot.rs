// 该文件是 Bakulan 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像分类/检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use bakulan::{
  FromUrl,
  adapter::{ActiveAdapter, AdapterMode},
  input::InputWrapper,
  model::default_backend,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

/// Bakulan 单张推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理模式
  #[arg(long, value_enum, default_value = "classify")]
  pub mode: AdapterMode,
  /// 模型地址，例如 model:///models/x.onnx?threshold=0.2，缺省时使用随程序分发的模型
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 输入图片，例如 image:///path/photo.jpg?rotation=90
  #[arg(long, value_name = "SOURCE")]
  pub input: Option<Url>,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let Some(input) = args.input else {
    warn!("未选择图片");
    eprintln!("未选择图片");
    return Ok(());
  };

  info!("推理模式: {:?}", args.mode);
  info!("输入来源: {}", input);
  info!("输出路径: {}", args.output);

  let options = args.mode.options(args.model.as_ref()).context("模型参数错误")?;
  info!("模型文件路径: {}", options.model_path().display());

  let input = InputWrapper::from_url(&input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let adapter = ActiveAdapter::new(args.mode, options, default_backend());

  let outcome = OneShotTask.run_task(input, adapter, output)?;
  info!("结果: {:?}", outcome);

  Ok(())
}
