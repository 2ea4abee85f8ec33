// 该文件是 Xunlu （寻路） 项目的一部分。
// src/runtime.rs - 推理运行时抽象
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

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::codec::TensorDescriptor;
use crate::delegate::DelegateOptions;

mod stub;
pub use self::stub::{StubEvent, StubRuntime};

#[cfg(feature = "onnxruntime")]
mod onnx;
#[cfg(feature = "onnxruntime")]
pub use self::onnx::OrtRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
  #[error("invalid model: {0}")]
  InvalidModel(String),
  #[error("delegate unavailable: {0}")]
  DelegateUnavailable(String),
  #[error("{kind} tensor index {index} out of range (count {count})")]
  TensorIndex {
    kind: &'static str,
    index: usize,
    count: usize,
  },
  #[error("invalid shape {shape:?}: {reason}")]
  InvalidShape { shape: Vec<usize>, reason: String },
  #[error("tensors not allocated")]
  NotAllocated,
  #[error("execution failed: {0}")]
  Execution(String),
  #[cfg(feature = "onnxruntime")]
  #[error("ONNX Runtime error: {0}")]
  Ort(#[from] ort::Error),
}

/// 运行时内部的加速代理绑定
pub trait NativeDelegate: Send + fmt::Debug {
  /// 请求的加速器是否实际生效；为 false 时推理在 CPU 内核上执行
  fn accelerated(&self) -> bool;
  /// 释放底层资源，可重复调用
  fn close(&mut self);
  fn as_any(&self) -> &dyn Any;
}

/// 已加载的模型。析构即释放模型句柄。
pub trait Interpreter: Send {
  fn input_count(&self) -> usize;
  fn output_count(&self) -> usize;
  fn input_tensor(&self, index: usize) -> Result<TensorDescriptor, RuntimeError>;
  fn output_tensor(&self, index: usize) -> Result<TensorDescriptor, RuntimeError>;
  fn resize_input(&mut self, index: usize, shape: &[usize]) -> Result<(), RuntimeError>;
  fn allocate_tensors(&mut self) -> Result<(), RuntimeError>;
  /// 以编码后的输入执行一次推理，结果写入 `output`
  fn run(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), RuntimeError>;
}

pub trait Runtime: Send + Sync {
  fn name(&self) -> &'static str;
  fn create_delegate(
    &self,
    options: &DelegateOptions,
  ) -> Result<Box<dyn NativeDelegate>, RuntimeError>;
  fn load(
    &self,
    model: &[u8],
    delegate: &dyn NativeDelegate,
  ) -> Result<Box<dyn Interpreter>, RuntimeError>;
}
