// 该文件是 Bakulan 项目的一部分。
// src/utils.rs - URL 解析辅助函数
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

use std::{path::PathBuf, str::FromStr};

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("查询参数无效: {key}={value}")]
pub struct QueryError {
  pub key: String,
  pub value: String,
}

/// 取出 URL 路径并做百分号解码，`image:///tmp/a%20b.jpg` 得到 `/tmp/a b.jpg`
pub fn decoded_path(url: &Url) -> PathBuf {
  let raw = url.path();
  match urlencoding::decode(raw) {
    Ok(path) => PathBuf::from(path.into_owned()),
    Err(_) => PathBuf::from(raw),
  }
}

/// 读取查询参数并解析为指定类型，参数不存在时返回 `Ok(None)`
pub fn query_value<T: FromStr>(url: &Url, key: &str) -> Result<Option<T>, QueryError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, value)) => value.parse::<T>().map(Some).map_err(|_| QueryError {
      key: key.to_string(),
      value: value.into_owned(),
    }),
    None => Ok(None),
  }
}

/// 查询参数是否出现（不关心取值），如 `?always`
pub fn query_flag(url: &Url, key: &str) -> bool {
  url.query_pairs().any(|(k, _)| k == key)
}
