// 该文件是 Xunlu （寻路） 项目的一部分。
// src/pipeline.rs - 推理流水线
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
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::asset::AssetRoot;
use crate::codec::{self, DecodeError, DetectionResult};
use crate::delegate::DelegateStrategy;
use crate::frame::RgbFrame;
use crate::runtime::Runtime;
use crate::session::{InferenceError, LoadError, ModelSession, SessionConfig};

const LOADED_STATUS: &str = "loaded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Load,
  NotLoaded,
  Decode,
  Inference,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("Error loading model: {0}")]
  Load(#[from] LoadError),
  #[error("Model not loaded")]
  NotLoaded,
  #[error("Decode failed: {0}")]
  Decode(#[from] DecodeError),
  #[error("Inference failed: {0}")]
  Inference(#[from] InferenceError),
}

impl PipelineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::Load(_) => ErrorKind::Load,
      PipelineError::NotLoaded => ErrorKind::NotLoaded,
      PipelineError::Decode(_) => ErrorKind::Decode,
      PipelineError::Inference(_) => ErrorKind::Inference,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStatus {
  pub status: String,
  /// 实际生效的代理
  pub delegate: String,
}

/// 对外的推理入口：最多持有一个会话，按 加载 → 预处理 → 推理 → 解码 的顺序执行。
///
/// 所有操作都独占会话锁，推理过程中不会被并发的加载或销毁打断。
pub struct InferencePipeline {
  runtime: Arc<dyn Runtime>,
  assets: AssetRoot,
  config: SessionConfig,
  session: Mutex<Option<ModelSession>>,
}

impl InferencePipeline {
  pub fn new(runtime: Arc<dyn Runtime>, assets: AssetRoot) -> Self {
    Self::with_config(runtime, assets, SessionConfig::default())
  }

  pub fn with_config(runtime: Arc<dyn Runtime>, assets: AssetRoot, config: SessionConfig) -> Self {
    Self {
      runtime,
      assets,
      config,
      session: Mutex::new(None),
    }
  }

  pub fn assets(&self) -> &AssetRoot {
    &self.assets
  }

  fn lock(&self) -> MutexGuard<'_, Option<ModelSession>> {
    self.session.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 按资源根目录解析逻辑路径并加载模型
  pub fn load_model(
    &self,
    model_path: &str,
    strategy: Box<dyn DelegateStrategy>,
  ) -> Result<LoadStatus, PipelineError> {
    let mut guard = self.lock();
    Self::close_session(&mut guard);
    let path = self.assets.resolve(model_path).map_err(LoadError::from)?;
    self.load_locked(&mut guard, &path, strategy)
  }

  /// 直接从文件路径加载模型
  pub fn load_model_file(
    &self,
    path: &Path,
    strategy: Box<dyn DelegateStrategy>,
  ) -> Result<LoadStatus, PipelineError> {
    let mut guard = self.lock();
    Self::close_session(&mut guard);
    self.load_locked(&mut guard, path, strategy)
  }

  fn load_locked(
    &self,
    slot: &mut Option<ModelSession>,
    path: &Path,
    strategy: Box<dyn DelegateStrategy>,
  ) -> Result<LoadStatus, PipelineError> {
    let mut session = ModelSession::new(strategy, self.config);
    session.load_file(self.runtime.as_ref(), path)?;

    let delegate = session.active_delegate().unwrap_or_default().to_string();
    info!("模型已就绪: {}，代理 {}", path.display(), delegate);
    *slot = Some(session);

    Ok(LoadStatus {
      status: LOADED_STATUS.to_string(),
      delegate,
    })
  }

  fn close_session(slot: &mut Option<ModelSession>) {
    if let Some(mut previous) = slot.take() {
      debug!("释放旧的模型会话");
      previous.close();
    }
  }

  /// 对压缩图像字节执行一次检测
  pub fn detect(&self, image: &[u8]) -> Result<DetectionResult, PipelineError> {
    let mut guard = self.lock();
    let session = match guard.as_mut() {
      Some(session) if session.is_ready() => session,
      _ => return Err(PipelineError::NotLoaded),
    };

    let frame = RgbFrame::decode(image).map_err(DecodeError::from)?;
    let (input, output_shape) = match (session.input_descriptor(), session.output_descriptor()) {
      (Some(input), Some(output)) => (input.clone(), output.shape.clone()),
      _ => return Err(PipelineError::NotLoaded),
    };

    let encoding = codec::encode(&frame, &input).map_err(InferenceError::from)?;
    let raw = session.run(&encoding.input)?;
    let result = codec::decode(&raw, &output_shape)?;
    debug!("检测完成，输出形状 {:?}", result.shape());
    Ok(result)
  }

  pub fn is_loaded(&self) -> bool {
    self.lock().as_ref().is_some_and(ModelSession::is_ready)
  }

  /// 释放当前会话，可重复调用
  pub fn teardown(&self) {
    let mut guard = self.lock();
    if guard.is_some() {
      info!("销毁推理流水线会话");
    }
    Self::close_session(&mut guard);
  }
}

impl Drop for InferencePipeline {
  fn drop(&mut self) {
    self.teardown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::delegate::{CpuOnly, GpuAccelerated};
  use crate::runtime::StubRuntime;

  const MODEL: &str =
    r#"{"input":{"type":"uint8","shape":[1,320,320,3]},"output":{"type":"float32","shape":[1,6]}}"#;

  fn pipeline_with_model() -> (tempfile::TempDir, StubRuntime, InferencePipeline) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("public")).unwrap();
    std::fs::write(dir.path().join("public/model.json"), MODEL).unwrap();
    let runtime = StubRuntime::new();
    let pipeline = InferencePipeline::new(Arc::new(runtime.clone()), AssetRoot::new(dir.path()));
    (dir, runtime, pipeline)
  }

  #[test]
  fn detect_before_load_is_not_loaded() {
    let (_dir, _runtime, pipeline) = pipeline_with_model();
    let err = pipeline.detect(b"whatever").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLoaded);
    assert_eq!(err.to_string(), "Model not loaded");
  }

  #[test]
  fn failed_load_leaves_no_session() {
    let (_dir, runtime, pipeline) = pipeline_with_model();
    pipeline
      .load_model("model.json", Box::new(CpuOnly::default()))
      .unwrap();
    let err = pipeline
      .load_model("missing.tflite", Box::new(GpuAccelerated::default()))
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Load);
    assert!(err.to_string().starts_with("Error loading model: "));
    assert!(!pipeline.is_loaded());
    assert_eq!(runtime.live_delegates(), 0);
  }

  #[test]
  fn escaping_asset_path_is_a_load_error() {
    let (_dir, _runtime, pipeline) = pipeline_with_model();
    let err = pipeline
      .load_model("../model.json", Box::new(CpuOnly::default()))
      .unwrap_err();
    assert!(matches!(err, PipelineError::Load(LoadError::Asset(_))));
  }

  #[test]
  fn teardown_is_idempotent() {
    let (_dir, runtime, pipeline) = pipeline_with_model();
    pipeline
      .load_model("assets/model.json", Box::new(CpuOnly::default()))
      .unwrap();
    pipeline.teardown();
    let events = runtime.events();
    pipeline.teardown();
    assert_eq!(runtime.events(), events);
    assert!(!pipeline.is_loaded());
    assert_eq!(runtime.live_delegates(), 0);
  }
}
