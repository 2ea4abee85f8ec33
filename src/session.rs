// 该文件是 Xunlu （寻路） 项目的一部分。
// src/session.rs - 模型会话
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

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::{EncodedInput, TensorDescriptor};
use crate::delegate::{DelegateError, DelegateHandle, DelegateStrategy};
use crate::frame::RGB_CHANNELS;
use crate::runtime::{Interpreter, Runtime, RuntimeError};

const DEFAULT_INPUT_SIZE: u32 = 320;
const INPUT_INDEX: usize = 0;
const OUTPUT_INDEX: usize = 0;
const OUTPUT_ELEMENT_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("failed to read model file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("{0}")]
  Delegate(#[from] DelegateError),
  #[error("invalid model: {0}")]
  Model(#[source] RuntimeError),
  #[error("shape negotiation failed: {0}")]
  Shape(RuntimeError),
  #[error("model has no {0} tensor")]
  MissingTensor(&'static str),
  #[error("invalid output shape {0:?}")]
  InvalidOutputShape(Vec<usize>),
  #[error("{0}")]
  Asset(#[from] crate::asset::AssetError),
  #[error("session cannot load from state {0}")]
  State(SessionState),
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("session is {0}, not ready")]
  NotReady(SessionState),
  #[error("encoded input holds {actual} bytes, expected {expected}")]
  InputLength { expected: usize, actual: usize },
  #[error("output shape {0:?} is too large")]
  OutputTooLarge(Vec<usize>),
  #[error("{0}")]
  Runtime(#[from] RuntimeError),
  #[error("{0}")]
  Encode(#[from] crate::codec::CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Unloaded,
  Loading,
  Ready,
  Running,
  Closed,
}

impl fmt::Display for SessionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SessionState::Unloaded => "unloaded",
      SessionState::Loading => "loading",
      SessionState::Ready => "ready",
      SessionState::Running => "running",
      SessionState::Closed => "closed",
    };
    write!(f, "{}", name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
  /// 固定的输入边长，输入形状为 `[1, size, size, channels]`
  pub input_size: u32,
  pub channels: usize,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      input_size: DEFAULT_INPUT_SIZE,
      channels: RGB_CHANNELS,
    }
  }
}

impl SessionConfig {
  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn canonical_input_shape(&self) -> [usize; 4] {
    let size = self.input_size as usize;
    [1, size, size, self.channels]
  }
}

/// 持有一个已加载模型及其代理。
///
/// 字段声明顺序保证析构时模型先于代理释放。
pub struct ModelSession {
  interpreter: Option<Box<dyn Interpreter>>,
  delegate: Option<DelegateHandle>,
  strategy: Box<dyn DelegateStrategy>,
  config: SessionConfig,
  state: SessionState,
  input: Option<TensorDescriptor>,
  output: Option<TensorDescriptor>,
}

impl ModelSession {
  pub fn new(strategy: Box<dyn DelegateStrategy>, config: SessionConfig) -> Self {
    Self {
      interpreter: None,
      delegate: None,
      strategy,
      config,
      state: SessionState::Unloaded,
      input: None,
      output: None,
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn is_ready(&self) -> bool {
    self.state == SessionState::Ready
  }

  pub fn input_descriptor(&self) -> Option<&TensorDescriptor> {
    self.input.as_ref()
  }

  pub fn output_descriptor(&self) -> Option<&TensorDescriptor> {
    self.output.as_ref()
  }

  /// 实际生效的代理名称
  pub fn active_delegate(&self) -> Option<&'static str> {
    self.delegate.as_ref().map(DelegateHandle::active_label)
  }

  pub fn strategy(&self) -> &dyn DelegateStrategy {
    self.strategy.as_ref()
  }

  /// 读取模型文件并加载
  pub fn load_file(&mut self, runtime: &dyn Runtime, path: &Path) -> Result<(), LoadError> {
    if self.state != SessionState::Unloaded {
      return Err(LoadError::State(self.state));
    }

    info!("加载模型文件: {}", path.display());
    let model = std::fs::read(path).map_err(|source| LoadError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      model.len() as f64 / (1024.0 * 1024.0)
    );

    self.load(runtime, &model)
  }

  /// 从内存中的模型字节加载：创建代理、构建解释器、协商输入形状、分配张量。
  /// 任一步骤失败都会释放已创建的资源并回到 `Unloaded`。
  pub fn load(&mut self, runtime: &dyn Runtime, model: &[u8]) -> Result<(), LoadError> {
    if self.state != SessionState::Unloaded {
      return Err(LoadError::State(self.state));
    }

    self.state = SessionState::Loading;
    match self.try_load(runtime, model) {
      Ok(()) => {
        self.state = SessionState::Ready;
        Ok(())
      }
      Err(e) => {
        error!("模型加载失败: {}", e);
        self.release_handles();
        self.input = None;
        self.output = None;
        self.state = SessionState::Unloaded;
        Err(e)
      }
    }
  }

  fn try_load(&mut self, runtime: &dyn Runtime, model: &[u8]) -> Result<(), LoadError> {
    let delegate = self.strategy.build(runtime)?;
    let native = delegate.native().ok_or(LoadError::State(self.state))?;
    let interpreter = runtime.load(model, native).map_err(LoadError::Model);
    // 代理先落位，失败路径上才能按顺序释放
    self.delegate = Some(delegate);
    let interpreter = self.interpreter.insert(interpreter?);

    if interpreter.input_count() == 0 {
      return Err(LoadError::MissingTensor("input"));
    }
    if interpreter.output_count() == 0 {
      return Err(LoadError::MissingTensor("output"));
    }

    let declared = interpreter
      .input_tensor(INPUT_INDEX)
      .map_err(LoadError::Shape)?;
    let canonical = self.config.canonical_input_shape();
    if declared.shape != canonical {
      info!(
        "模型声明的输入形状 {:?}，强制调整为 {:?}",
        declared.shape, canonical
      );
    }
    interpreter
      .resize_input(INPUT_INDEX, &canonical)
      .map_err(LoadError::Shape)?;
    interpreter.allocate_tensors().map_err(LoadError::Shape)?;

    let input = interpreter
      .input_tensor(INPUT_INDEX)
      .map_err(LoadError::Shape)?;
    if input.shape != canonical {
      return Err(LoadError::Shape(RuntimeError::InvalidShape {
        shape: input.shape,
        reason: format!("runtime did not accept {:?}", canonical),
      }));
    }
    let output = interpreter
      .output_tensor(OUTPUT_INDEX)
      .map_err(LoadError::Shape)?;
    if output.shape.is_empty() || output.shape.contains(&0) || output.element_count().is_none() {
      return Err(LoadError::InvalidOutputShape(output.shape));
    }
    if !input.element_type.is_recognized() {
      warn!("输入张量类型 {} 未识别，推理时将按 Float32 编码", input.element_type);
    }

    info!(
      "模型加载完成，代理: {}",
      self.active_delegate().unwrap_or("none")
    );
    info!("输入张量: 类型={}, 形状={:?}", input.element_type, input.shape);
    info!("输出张量: 类型={}, 形状={:?}", output.element_type, output.shape);

    self.input = Some(input);
    self.output = Some(output);
    Ok(())
  }

  /// 执行一次推理，返回按输出形状分配的 float32 字节
  pub fn run(&mut self, input: &EncodedInput) -> Result<Vec<u8>, InferenceError> {
    if self.state != SessionState::Ready {
      return Err(InferenceError::NotReady(self.state));
    }
    let (Some(interpreter), Some(descriptor), Some(output)) =
      (self.interpreter.as_mut(), self.input.as_ref(), self.output.as_ref())
    else {
      return Err(InferenceError::NotReady(self.state));
    };

    let expected = descriptor.encoded_len().unwrap_or(0);
    if input.len() != expected {
      return Err(InferenceError::InputLength {
        expected,
        actual: input.len(),
      });
    }

    let out_len = output
      .element_count()
      .and_then(|n| n.checked_mul(OUTPUT_ELEMENT_SIZE))
      .ok_or_else(|| InferenceError::OutputTooLarge(output.shape.clone()))?;
    let mut buffer = vec![0u8; out_len];

    self.state = SessionState::Running;
    debug!("执行模型推理");
    let result = interpreter.run(input.as_bytes(), &mut buffer);
    self.state = SessionState::Ready;

    result?;
    Ok(buffer)
  }

  /// 释放模型与代理，进入 `Closed`。可重复调用。
  pub fn close(&mut self) {
    if self.state == SessionState::Closed {
      return;
    }
    debug!("关闭模型会话");
    self.release_handles();
    self.input = None;
    self.output = None;
    self.state = SessionState::Closed;
  }

  // 模型句柄可能引用代理管理的内存，必须先释放
  fn release_handles(&mut self) {
    drop(self.interpreter.take());
    if let Some(mut delegate) = self.delegate.take() {
      self.strategy.release(&mut delegate);
    }
  }
}

impl Drop for ModelSession {
  fn drop(&mut self) {
    self.close();
  }
}

impl fmt::Debug for ModelSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelSession")
      .field("state", &self.state)
      .field("strategy", &self.strategy)
      .field("delegate", &self.delegate)
      .field("input", &self.input)
      .field("output", &self.output)
      .finish()
  }
}
