// 该文件是 Bakulan 项目的一部分。
// src/bin/submit.rs - 上传照片到远程预测服务
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use bakulan::remote::PredictClient;

/// Bakulan 远程预测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 预测服务地址
  #[arg(long, value_name = "SERVER")]
  pub server: Url,
  /// 待上传的照片
  #[arg(long, value_name = "FILE")]
  pub file: PathBuf,
  /// 照片类别
  #[arg(long, value_name = "CATEGORY")]
  pub category: String,
  /// 用户标识
  #[arg(long, value_name = "USER_ID")]
  pub user_id: String,
  /// 拍摄时间，缺省为当前时间
  #[arg(long, value_name = "TIMESTAMP")]
  pub timestamp: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let timestamp = args
    .timestamp
    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

  info!("预测服务: {}", args.server);
  info!("上传文件: {}", args.file.display());

  let client = PredictClient::new(args.server);
  let result = client
    .predict_image(&args.file, &args.category, &args.user_id, &timestamp)
    .await
    .context("远程预测失败")?;

  println!("{}", serde_json::to_string_pretty(result.payload())?);
  Ok(())
}
