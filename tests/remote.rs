// 该文件是 Bakulan 项目的一部分。
// tests/remote.rs - 远程预测上传测试
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

use bakulan::remote::{NetworkError, PredictClient};
use mockito::Matcher;
use serde_json::json;
use url::Url;

fn photo() -> (tempfile::TempDir, std::path::PathBuf) {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("leaf.jpg");
  std::fs::write(&path, b"\xFF\xD8fake-jpeg").unwrap();
  (dir, path)
}

#[tokio::test]
async fn uploads_photo_and_fields() {
  let mut server = mockito::Server::new_async().await;
  let mock = server
    .mock("POST", "/nilevia/predict")
    .match_header(
      "content-type",
      Matcher::Regex("^multipart/form-data; boundary=".to_string()),
    )
    .match_body(Matcher::AllOf(vec![
      Matcher::Regex(r#"name="photo"; filename="leaf.jpg""#.to_string()),
      Matcher::Regex(
        r#"(?s)name="photo".*name="category".*name="timestamp".*name="user_id""#.to_string(),
      ),
      Matcher::Regex("rust-leaf".to_string()),
      Matcher::Regex("user-7".to_string()),
    ]))
    .with_status(200)
    .with_header("content-type", "application/json")
    .with_body(r#"{"label":"healthy","confidence":0.97}"#)
    .expect(1)
    .create_async()
    .await;

  let (_dir, path) = photo();
  let client = PredictClient::new(Url::parse(&server.url()).unwrap());
  let result = client
    .predict_image(&path, "rust-leaf", "user-7", "2026-01-02T03:04:05Z")
    .await
    .unwrap();

  assert_eq!(
    result.payload(),
    &json!({ "label": "healthy", "confidence": 0.97 })
  );
  assert_eq!(result.get("label"), Some(&json!("healthy")));
  mock.assert_async().await;
}

#[tokio::test]
async fn server_failure_is_reported_once() {
  let mut server = mockito::Server::new_async().await;
  let mock = server
    .mock("POST", "/nilevia/predict")
    .with_status(500)
    .with_body("model offline")
    .expect(1)
    .create_async()
    .await;

  let (_dir, path) = photo();
  let client = PredictClient::new(Url::parse(&server.url()).unwrap());
  let result = client.predict_image(&path, "leaf", "user-7", "t").await;

  match result {
    Err(NetworkError::Status { status, body }) => {
      assert_eq!(status, 500);
      assert_eq!(body, "model offline");
    }
    other => panic!("unexpected result: {other:?}"),
  }
  // 不重试
  mock.assert_async().await;
}

#[tokio::test]
async fn unreachable_server_is_a_request_error() {
  // 绑定后立即释放端口，连接会被拒绝
  let port = {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
  };

  let (_dir, path) = photo();
  let client = PredictClient::new(Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap());
  let result = client.predict_image(&path, "leaf", "user-7", "t").await;

  assert!(
    matches!(result, Err(NetworkError::Request(_))),
    "unexpected result: {result:?}"
  );
}
