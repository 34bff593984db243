// 该文件是 Bakulan 项目的一部分。
// src/remote.rs - 远程预测服务上传
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

use std::path::Path;

use reqwest::{
  Client,
  multipart::{Form, Part},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const PREDICT_ENDPOINT: &str = "nilevia/predict";

#[derive(Error, Debug)]
pub enum NetworkError {
  #[error("读取待上传文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("请求失败: {0}")]
  Request(#[from] reqwest::Error),
  #[error("服务返回状态 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("响应不是合法 JSON: {0}")]
  Decode(String),
  #[error("服务地址错误: {0}")]
  Url(#[from] url::ParseError),
}

/// 服务返回的预测结果，内容不做解释
#[derive(Debug, Clone, PartialEq)]
pub struct PredictResult(Value);

impl PredictResult {
  pub fn payload(&self) -> &Value {
    &self.0
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  pub fn into_payload(self) -> Value {
    self.0
  }
}

pub struct PredictClient {
  base: Url,
  client: Client,
}

impl PredictClient {
  pub fn new(mut base: Url) -> Self {
    // 保证 join 时保留基础路径
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    Self {
      base,
      client: Client::new(),
    }
  }

  pub fn endpoint(&self) -> Result<Url, NetworkError> {
    Ok(self.base.join(PREDICT_ENDPOINT)?)
  }

  /// 上传照片与三个文本字段，只尝试一次
  pub async fn predict_image(
    &self,
    file: &Path,
    category: &str,
    user_id: &str,
    timestamp: &str,
  ) -> Result<PredictResult, NetworkError> {
    let bytes = tokio::fs::read(file).await?;
    let file_name = file
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| "photo.jpg".to_string());
    debug!("上传 {} ({} 字节)", file_name, bytes.len());

    let form = Form::new()
      .part(
        "photo",
        Part::bytes(bytes)
          .file_name(file_name)
          .mime_str("image/jpeg")?,
      )
      .part("category", text_part(category)?)
      .part("timestamp", text_part(timestamp)?)
      .part("user_id", text_part(user_id)?);

    let endpoint = self.endpoint()?;
    let response = self.client.post(endpoint.clone()).multipart(form).send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
      warn!("预测服务 {} 返回 {}", endpoint, status);
      return Err(NetworkError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let payload: Value =
      serde_json::from_str(&body).map_err(|e| NetworkError::Decode(e.to_string()))?;
    info!("预测服务返回结果");
    Ok(PredictResult(payload))
  }
}

fn text_part(value: &str) -> Result<Part, reqwest::Error> {
  Part::text(value.to_string()).mime_str("text/plain")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoint_keeps_base_path() {
    let client = PredictClient::new(Url::parse("http://example.com/api").unwrap());
    assert_eq!(
      client.endpoint().unwrap().as_str(),
      "http://example.com/api/nilevia/predict"
    );
    let client = PredictClient::new(Url::parse("http://example.com").unwrap());
    assert_eq!(
      client.endpoint().unwrap().as_str(),
      "http://example.com/nilevia/predict"
    );
  }

  #[tokio::test]
  async fn missing_file_is_io_error() {
    let client = PredictClient::new(Url::parse("http://127.0.0.1:9").unwrap());
    let result = client
      .predict_image(Path::new("/definitely/not/here.jpg"), "leaf", "u1", "t")
      .await;
    assert!(matches!(result, Err(NetworkError::Io(_))));
  }

  #[tokio::test]
  async fn non_json_reply_is_decode_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/nilevia/predict")
      .with_status(200)
      .with_body("plain text")
      .expect(1)
      .create_async()
      .await;

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"jpeg").unwrap();
    let client = PredictClient::new(Url::parse(&server.url()).unwrap());
    let result = client.predict_image(file.path(), "leaf", "u1", "t").await;
    assert!(matches!(result, Err(NetworkError::Decode(_))));
    mock.assert_async().await;
  }
}
