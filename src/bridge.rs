// 该文件是 Xunlu （寻路） 项目的一部分。
// src/bridge.rs - 宿主调用边界
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

//! 宿主应用跨进程调用的入口。请求与响应都是 camelCase JSON，
//! 失败统一转换为带错误类别的 [`Rejection`]。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::codec::DecodeError;
use crate::delegate::DelegateKind;
use crate::pipeline::{ErrorKind, InferencePipeline, LoadStatus, PipelineError};

const DEFAULT_MODEL_PATH: &str = "best_int8.tflite";

fn default_model_path() -> String {
  DEFAULT_MODEL_PATH.to_string()
}

fn default_delegate() -> DelegateKind {
  DelegateKind::Gpu
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelRequest {
  #[serde(default = "default_model_path")]
  pub model_path: String,
  #[serde(default = "default_delegate", alias = "delegatePreference")]
  pub delegate: DelegateKind,
}

impl Default for LoadModelRequest {
  fn default() -> Self {
    Self {
      model_path: default_model_path(),
      delegate: default_delegate(),
    }
  }
}

pub type LoadModelResponse = LoadStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRequest {
  /// base64 编码的压缩图像
  #[serde(default)]
  pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectResponse {
  pub data: Vec<f32>,
  pub shape: Vec<usize>,
}

/// 拒绝结果：错误类别与可读消息
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct Rejection {
  pub kind: ErrorKind,
  pub message: String,
}

impl From<PipelineError> for Rejection {
  fn from(err: PipelineError) -> Self {
    Rejection {
      kind: err.kind(),
      message: err.to_string(),
    }
  }
}

impl Rejection {
  fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
    Rejection {
      kind,
      message: message.into(),
    }
  }
}

pub struct Bridge {
  pipeline: InferencePipeline,
}

impl Bridge {
  pub fn new(pipeline: InferencePipeline) -> Self {
    Self { pipeline }
  }

  pub fn pipeline(&self) -> &InferencePipeline {
    &self.pipeline
  }

  pub fn load_model(&self, request: LoadModelRequest) -> Result<LoadModelResponse, Rejection> {
    info!(
      "loadModel: {} ({})",
      request.model_path, request.delegate
    );
    self
      .pipeline
      .load_model(&request.model_path, request.delegate.strategy())
      .map_err(|e| {
        error!("Error loading model: {}", e);
        Rejection::from(e)
      })
  }

  pub fn detect(&self, request: DetectRequest) -> Result<DetectResponse, Rejection> {
    // 先检查会话，未加载时不必检查与解码图像
    if !self.pipeline.is_loaded() {
      return Err(PipelineError::NotLoaded.into());
    }

    let Some(image) = request.image else {
      return Err(Rejection::with_kind(
        ErrorKind::Decode,
        "No image data provided",
      ));
    };

    let bytes = STANDARD
      .decode(strip_transport(&image))
      .map_err(|e| Rejection::from(PipelineError::Decode(DecodeError::from(e))))?;

    let result = self.pipeline.detect(&bytes).map_err(|e| {
      error!("Inference error: {}", e);
      Rejection::from(e)
    })?;
    let (data, shape) = result.into_parts();
    Ok(DetectResponse { data, shape })
  }

  /// 按方法名分发 JSON 调用
  pub fn call(&self, method: &str, payload: Value) -> Result<Value, Rejection> {
    match method {
      "loadModel" => {
        let request: LoadModelRequest = parse_payload(payload, ErrorKind::Load)?;
        to_value(self.load_model(request)?)
      }
      "detect" => {
        let request: DetectRequest = parse_payload(payload, ErrorKind::Decode)?;
        to_value(self.detect(request)?)
      }
      other => Err(Rejection::with_kind(
        ErrorKind::Inference,
        format!("Unknown method: {}", other),
      )),
    }
  }

  pub fn teardown(&self) {
    self.pipeline.teardown();
  }
}

impl Drop for Bridge {
  fn drop(&mut self) {
    self.pipeline.teardown();
  }
}

/// 去掉 data URL 前缀与换行等空白
fn strip_transport(image: &str) -> String {
  let payload = match image.split_once(";base64,") {
    Some((prefix, rest)) if prefix.starts_with("data:") => rest,
    _ => image,
  };
  payload.split_whitespace().collect()
}

fn parse_payload<T: DeserializeOwned>(payload: Value, kind: ErrorKind) -> Result<T, Rejection> {
  let payload = if payload.is_null() {
    Value::Object(Default::default())
  } else {
    payload
  };
  serde_json::from_value(payload)
    .map_err(|e| Rejection::with_kind(kind, format!("Invalid request: {}", e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, Rejection> {
  serde_json::to_value(value)
    .map_err(|e| Rejection::with_kind(ErrorKind::Inference, e.to_string()))
}
