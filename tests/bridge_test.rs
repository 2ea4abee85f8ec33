// 该文件是 Xunlu （寻路） 项目的一部分。
// tests/bridge_test.rs - 宿主调用边界集成测试
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

use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{Value, json};
use tempfile::TempDir;

use xunlu::asset::AssetRoot;
use xunlu::bridge::{Bridge, DetectRequest, LoadModelRequest};
use xunlu::delegate::DelegateKind;
use xunlu::pipeline::{ErrorKind, InferencePipeline};
use xunlu::runtime::StubRuntime;

const BEST_INT8: &str =
  r#"{"input":{"type":"uint8","shape":[1,640,640,3]},"output":{"type":"float32","shape":[1,5,2100]}}"#;

fn setup() -> (TempDir, StubRuntime, Bridge) {
  let dir = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(dir.path().join("public")).unwrap();
  std::fs::write(dir.path().join("public/best_int8.tflite"), BEST_INT8).unwrap();
  let runtime = StubRuntime::new();
  let bridge = Bridge::new(InferencePipeline::new(
    Arc::new(runtime.clone()),
    AssetRoot::new(dir.path()),
  ));
  (dir, runtime, bridge)
}

fn jpeg_base64(rgb: [u8; 3]) -> String {
  let image = RgbImage::from_pixel(32, 24, Rgb(rgb));
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Jpeg).unwrap();
  STANDARD.encode(buffer.into_inner())
}

#[test]
fn load_with_defaults() {
  let (_dir, _runtime, bridge) = setup();
  let response = bridge.call("loadModel", json!({})).unwrap();
  assert_eq!(
    response,
    json!({"status": "loaded", "delegate": "GPU_Quantized"})
  );
}

#[test]
fn load_with_explicit_delegate() {
  let (_dir, _runtime, bridge) = setup();
  let response = bridge
    .load_model(LoadModelRequest {
      model_path: "assets/best_int8.tflite".to_string(),
      delegate: DelegateKind::Cpu,
    })
    .unwrap();
  assert_eq!(response.delegate, "CPU");
}

#[test]
fn detect_before_load() {
  let (_dir, _runtime, bridge) = setup();
  let err = bridge
    .call("detect", json!({"image": jpeg_base64([0, 0, 0])}))
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::NotLoaded);
  assert_eq!(err.message, "Model not loaded");
}

#[test]
fn invalid_base64_is_a_decode_error() {
  let (_dir, _runtime, bridge) = setup();
  bridge.call("loadModel", Value::Null).unwrap();

  let err = bridge
    .detect(DetectRequest {
      image: Some("not-base64!!".to_string()),
    })
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::Decode);
  assert!(bridge.pipeline().is_loaded());
}

#[test]
fn detect_returns_flat_data_and_shape() {
  let (_dir, _runtime, bridge) = setup();
  bridge.call("loadModel", json!({"delegate": "GPU"})).unwrap();

  let response = bridge
    .call("detect", json!({"image": jpeg_base64([128, 128, 128])}))
    .unwrap();
  let shape: Vec<usize> = serde_json::from_value(response["shape"].clone()).unwrap();
  let data: Vec<f32> = serde_json::from_value(response["data"].clone()).unwrap();
  assert_eq!(shape, vec![1, 5, 2100]);
  assert_eq!(data.len(), 10500);
}

#[test]
fn data_url_payloads_are_accepted() {
  let (_dir, _runtime, bridge) = setup();
  bridge.call("loadModel", json!({})).unwrap();

  let image = format!("data:image/jpeg;base64,{}", jpeg_base64([200, 10, 10]));
  let response = bridge.detect(DetectRequest { image: Some(image) }).unwrap();
  assert_eq!(response.data.len(), 10500);
}

#[test]
fn dropping_the_bridge_releases_the_delegate() {
  let (_dir, runtime, bridge) = setup();
  bridge.call("loadModel", json!({"delegate": "NPU"})).unwrap();
  assert_eq!(runtime.live_delegates(), 1);

  bridge.teardown();
  assert_eq!(runtime.live_delegates(), 0);
  drop(bridge);
  assert_eq!(runtime.live_delegates(), 0);
}

#[test]
fn missing_image_after_load() {
  let (_dir, _runtime, bridge) = setup();
  bridge.call("loadModel", json!({})).unwrap();

  let err = bridge.call("detect", json!({})).unwrap_err();
  assert_eq!(err.kind, ErrorKind::Decode);
  assert_eq!(err.message, "No image data provided");
}
