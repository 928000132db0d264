// 该文件是 DeepMID 项目的一部分。
// tests/common/mod.rs - 集成测试共用工具
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

#![allow(dead_code)]

use std::path::Path;

use httpmock::prelude::*;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;
use url::Url;

use deepmid::{
  codec::encode_png,
  config::Credentials,
  detector::{DetectionClient, DetectorWrapper},
  page::{DeepMid, DeepVision},
  prompt::Language,
  upload::UploadedImage,
  vision::VisionWrapper,
};

pub const ROBOFLOW_KEY: &str = "rf-test-key";
pub const GROQ_KEY: &str = "groq-test-key";
pub const PROJECT_PATH: &str = "/chest-xray-yolo/6";

pub fn credentials() -> Credentials {
  Credentials {
    roboflow_api_key: Some(ROBOFLOW_KEY.to_string()),
    groq_api_key: Some(GROQ_KEY.to_string()),
  }
}

pub fn detector_url(server: &MockServer) -> Url {
  Url::parse(&format!("roboflow+http://{}{}", server.address(), PROJECT_PATH)).unwrap()
}

pub fn groq_url(server: &MockServer) -> Url {
  Url::parse(&format!(
    "groq+http://{}/openai/v1?model=test-vision",
    server.address()
  ))
  .unwrap()
}

pub fn ollama_url(server: &MockServer) -> Url {
  Url::parse(&format!("ollama://{}?model=llama3.2-vision:11b", server.address())).unwrap()
}

/// 没有服务监听的本机端口
pub fn refused_ollama_url() -> Url {
  Url::parse("ollama://127.0.0.1:1").unwrap()
}

pub fn deepmid_page(
  server: &MockServer,
  language: Language,
  temp_dir: &Path,
) -> DeepMid<DetectorWrapper, VisionWrapper> {
  let credentials = credentials();
  let detector = DetectorWrapper::connect(&detector_url(server), &credentials).unwrap();
  let vision = VisionWrapper::connect(&groq_url(server), &credentials).unwrap();
  DeepMid::new(DetectionClient::new(detector), vision)
    .with_language(language)
    .with_temp_dir(Some(temp_dir.to_path_buf()))
}

pub fn deepvision_page(cloud: Url, local: Url) -> DeepVision<VisionWrapper> {
  let credentials = credentials();
  DeepVision::new(
    VisionWrapper::connect(&cloud, &credentials).unwrap(),
    VisionWrapper::connect(&local, &credentials).unwrap(),
  )
}

pub fn chest_png() -> Vec<u8> {
  let image = RgbImage::from_pixel(200, 160, Rgb([30, 30, 30]));
  encode_png(&DynamicImage::ImageRgb8(image)).unwrap()
}

pub fn chest_upload() -> UploadedImage {
  UploadedImage::new(chest_png(), Some("chest.png")).unwrap()
}

pub fn mock_roboflow<'a>(server: &'a MockServer, classes: &[&str]) -> httpmock::Mock<'a> {
  let predictions: Vec<_> = classes
    .iter()
    .enumerate()
    .map(|(i, class)| {
      json!({
        "x": 60.0 + 40.0 * i as f32,
        "y": 80.0,
        "width": 50.0,
        "height": 60.0,
        "confidence": 0.87,
        "class": class,
        "class_id": 3,
        "detection_id": format!("det-{i}"),
      })
    })
    .collect();

  server.mock(|when, then| {
    when
      .method(POST)
      .path(PROJECT_PATH)
      .query_param("api_key", ROBOFLOW_KEY)
      .query_param("confidence", "40")
      .query_param("overlap", "30")
      .header("content-type", "application/x-www-form-urlencoded");
    then.status(200).json_body(json!({
      "time": 0.05,
      "image": {"width": 200, "height": 160},
      "predictions": predictions,
    }));
  })
}

pub fn mock_groq<'a>(server: &'a MockServer, body_contains: &str, answer: &str) -> httpmock::Mock<'a> {
  server.mock(|when, then| {
    when
      .method(POST)
      .path("/openai/v1/chat/completions")
      .header("authorization", format!("Bearer {GROQ_KEY}"))
      .body_contains(body_contains);
    then.status(200).json_body(json!({
      "id": "chatcmpl-test",
      "object": "chat.completion",
      "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": answer},
        "finish_reason": "stop",
      }],
    }));
  })
}

pub fn dir_is_empty(dir: &Path) -> bool {
  std::fs::read_dir(dir).unwrap().next().is_none()
}
