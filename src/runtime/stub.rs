// 该文件是 Xunlu （寻路） 项目的一部分。
// src/runtime/stub.rs - 清单驱动的参考运行时
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

//! 不依赖任何推理库的运行时，用于空跑与测试。
//!
//! 模型文件是一个 JSON 清单：
//!
//! ```json
//! {"input": {"type": "uint8", "shape": [100, 640, 640, 3]},
//!  "output": {"type": "float32", "shape": [1, 5, 2100]}}
//! ```
//!
//! 每个输出元素都等于输入元素归一化到 `[0, 1]` 后的平均值。

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tracing::debug;

use crate::codec::{ElementType, TensorDescriptor};
use crate::delegate::{DelegateKind, DelegateOptions};
use crate::runtime::{Interpreter, NativeDelegate, Runtime, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubEvent {
  DelegateCreated { id: u64, kind: DelegateKind },
  DelegateClosed { id: u64 },
  ModelLoaded { delegate: u64 },
  ModelClosed { delegate: u64 },
}

#[derive(Debug, Default)]
struct StubLog {
  events: Mutex<Vec<StubEvent>>,
  live_delegates: AtomicUsize,
  next_id: AtomicU64,
}

impl StubLog {
  fn push(&self, event: StubEvent) {
    debug!("stub 运行时事件: {:?}", event);
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(event);
  }
}

#[derive(Debug, Clone, Default)]
pub struct StubRuntime {
  unavailable: Vec<DelegateKind>,
  failing: Vec<DelegateKind>,
  log: Arc<StubLog>,
}

impl StubRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  /// 该类代理可以创建，但推理退回 CPU 内核
  pub fn without_accelerator(mut self, kind: DelegateKind) -> Self {
    self.unavailable.push(kind);
    self
  }

  /// 该类代理创建失败
  pub fn with_failing_delegate(mut self, kind: DelegateKind) -> Self {
    self.failing.push(kind);
    self
  }

  pub fn events(&self) -> Vec<StubEvent> {
    self
      .log
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn live_delegates(&self) -> usize {
    self.log.live_delegates.load(Ordering::SeqCst)
  }
}

impl Runtime for StubRuntime {
  fn name(&self) -> &'static str {
    "stub"
  }

  fn create_delegate(
    &self,
    options: &DelegateOptions,
  ) -> Result<Box<dyn NativeDelegate>, RuntimeError> {
    let kind = options.kind();
    if self.failing.contains(&kind) {
      return Err(RuntimeError::DelegateUnavailable(format!(
        "{} delegate construction failed",
        kind
      )));
    }

    let id = self.log.next_id.fetch_add(1, Ordering::SeqCst);
    let live = self.log.live_delegates.fetch_add(1, Ordering::SeqCst) + 1;
    debug!("stub 代理 #{} 已创建，当前存活 {}", id, live);
    self.log.push(StubEvent::DelegateCreated { id, kind });

    Ok(Box::new(StubDelegate {
      id,
      accelerated: kind == DelegateKind::Cpu || !self.unavailable.contains(&kind),
      closed: false,
      log: self.log.clone(),
    }))
  }

  fn load(
    &self,
    model: &[u8],
    delegate: &dyn NativeDelegate,
  ) -> Result<Box<dyn Interpreter>, RuntimeError> {
    let delegate = delegate
      .as_any()
      .downcast_ref::<StubDelegate>()
      .ok_or_else(|| RuntimeError::DelegateUnavailable("foreign delegate".to_string()))?;
    if delegate.closed {
      return Err(RuntimeError::DelegateUnavailable(format!(
        "delegate #{} already closed",
        delegate.id
      )));
    }

    let manifest: Manifest =
      serde_json::from_slice(model).map_err(|e| RuntimeError::InvalidModel(e.to_string()))?;
    let input = manifest.input.descriptor();
    let output = manifest.output.descriptor();
    if input.shape.is_empty() || output.shape.is_empty() {
      return Err(RuntimeError::InvalidModel(
        "tensor shapes must not be empty".to_string(),
      ));
    }

    self.log.push(StubEvent::ModelLoaded {
      delegate: delegate.id,
    });

    Ok(Box::new(StubInterpreter {
      delegate: delegate.id,
      input,
      output,
      allocated: false,
      fail_run: manifest.fail_run,
      log: self.log.clone(),
    }))
  }
}

#[derive(Debug)]
struct StubDelegate {
  id: u64,
  accelerated: bool,
  closed: bool,
  log: Arc<StubLog>,
}

impl NativeDelegate for StubDelegate {
  fn accelerated(&self) -> bool {
    self.accelerated
  }

  fn close(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    self.log.live_delegates.fetch_sub(1, Ordering::SeqCst);
    self.log.push(StubEvent::DelegateClosed { id: self.id });
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

impl Drop for StubDelegate {
  fn drop(&mut self) {
    self.close();
  }
}

#[derive(Debug, Deserialize)]
struct Manifest {
  input: TensorSpec,
  output: TensorSpec,
  #[serde(default)]
  fail_run: bool,
}

#[derive(Debug, Deserialize)]
struct TensorSpec {
  #[serde(rename = "type")]
  element_type: String,
  shape: Vec<usize>,
}

impl TensorSpec {
  fn descriptor(&self) -> TensorDescriptor {
    let element_type = self
      .element_type
      .parse::<ElementType>()
      .unwrap_or_else(|never| match never {});
    TensorDescriptor::new(element_type, self.shape.clone())
  }
}

struct StubInterpreter {
  delegate: u64,
  input: TensorDescriptor,
  output: TensorDescriptor,
  allocated: bool,
  fail_run: bool,
  log: Arc<StubLog>,
}

impl StubInterpreter {
  fn check_index(kind: &'static str, index: usize) -> Result<(), RuntimeError> {
    if index == 0 {
      Ok(())
    } else {
      Err(RuntimeError::TensorIndex {
        kind,
        index,
        count: 1,
      })
    }
  }

  fn mean(&self, input: &[u8]) -> f32 {
    match self.input.element_type.encoded_as() {
      ElementType::UInt8 => {
        let sum: u64 = input.iter().map(|&b| b as u64).sum();
        (sum as f64 / input.len().max(1) as f64 / 255.0) as f32
      }
      _ => {
        let (sum, count) = input
          .chunks_exact(4)
          .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64)
          .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (sum / count.max(1) as f64) as f32
      }
    }
  }
}

impl Interpreter for StubInterpreter {
  fn input_count(&self) -> usize {
    1
  }

  fn output_count(&self) -> usize {
    1
  }

  fn input_tensor(&self, index: usize) -> Result<TensorDescriptor, RuntimeError> {
    Self::check_index("input", index)?;
    Ok(self.input.clone())
  }

  fn output_tensor(&self, index: usize) -> Result<TensorDescriptor, RuntimeError> {
    Self::check_index("output", index)?;
    Ok(self.output.clone())
  }

  fn resize_input(&mut self, index: usize, shape: &[usize]) -> Result<(), RuntimeError> {
    Self::check_index("input", index)?;
    if shape.is_empty() || shape.contains(&0) {
      return Err(RuntimeError::InvalidShape {
        shape: shape.to_vec(),
        reason: "dimensions must be positive".to_string(),
      });
    }
    self.input.shape = shape.to_vec();
    self.allocated = false;
    Ok(())
  }

  fn allocate_tensors(&mut self) -> Result<(), RuntimeError> {
    if self.input.encoded_len().is_none() || self.output.element_count().is_none() {
      return Err(RuntimeError::InvalidShape {
        shape: self.input.shape.clone(),
        reason: "tensor too large".to_string(),
      });
    }
    self.allocated = true;
    Ok(())
  }

  fn run(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), RuntimeError> {
    if !self.allocated {
      return Err(RuntimeError::NotAllocated);
    }
    if self.fail_run {
      return Err(RuntimeError::Execution("simulated backend failure".to_string()));
    }

    let expected_in = self.input.encoded_len().unwrap_or(0);
    if input.len() != expected_in {
      return Err(RuntimeError::Execution(format!(
        "input holds {} bytes, expected {}",
        input.len(),
        expected_in
      )));
    }
    let expected_out = self.output.element_count().unwrap_or(0) * 4;
    if output.len() != expected_out {
      return Err(RuntimeError::Execution(format!(
        "output holds {} bytes, expected {}",
        output.len(),
        expected_out
      )));
    }

    let value = self.mean(input).to_ne_bytes();
    for chunk in output.chunks_exact_mut(4) {
      chunk.copy_from_slice(&value);
    }
    Ok(())
  }
}

impl Drop for StubInterpreter {
  fn drop(&mut self) {
    self.log.push(StubEvent::ModelClosed {
      delegate: self.delegate,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MANIFEST: &[u8] =
    br#"{"input":{"type":"uint8","shape":[100,640,640,3]},"output":{"type":"float32","shape":[1,5,2100]}}"#;

  fn cpu_delegate(runtime: &StubRuntime) -> Box<dyn NativeDelegate> {
    runtime
      .create_delegate(&DelegateOptions::Cpu { threads: 1 })
      .unwrap()
  }

  #[test]
  fn loads_manifest_descriptors() {
    let runtime = StubRuntime::new();
    let delegate = cpu_delegate(&runtime);
    let interpreter = runtime.load(MANIFEST, delegate.as_ref()).unwrap();
    let input = interpreter.input_tensor(0).unwrap();
    assert_eq!(input.element_type, ElementType::UInt8);
    assert_eq!(input.shape, vec![100, 640, 640, 3]);
    assert_eq!(interpreter.output_tensor(0).unwrap().shape, vec![1, 5, 2100]);
    assert!(interpreter.input_tensor(1).is_err());
  }

  #[test]
  fn rejects_corrupt_model() {
    let runtime = StubRuntime::new();
    let delegate = cpu_delegate(&runtime);
    assert!(matches!(
      runtime.load(b"\x00\x01garbage", delegate.as_ref()),
      Err(RuntimeError::InvalidModel(_))
    ));
  }

  #[test]
  fn run_requires_allocation() {
    let runtime = StubRuntime::new();
    let delegate = cpu_delegate(&runtime);
    let mut interpreter = runtime.load(MANIFEST, delegate.as_ref()).unwrap();
    interpreter.resize_input(0, &[1, 2, 2, 3]).unwrap();
    let mut output = vec![0u8; 4 * 5 * 2100];
    assert!(matches!(
      interpreter.run(&[0; 12], &mut output),
      Err(RuntimeError::NotAllocated)
    ));

    interpreter.allocate_tensors().unwrap();
    interpreter.run(&[255; 12], &mut output).unwrap();
    assert_eq!(f32::from_ne_bytes([output[0], output[1], output[2], output[3]]), 1.0);
  }

  #[test]
  fn closes_model_before_delegate_when_dropped_in_order() {
    let runtime = StubRuntime::new();
    let delegate = cpu_delegate(&runtime);
    let interpreter = runtime.load(MANIFEST, delegate.as_ref()).unwrap();
    drop(interpreter);
    drop(delegate);
    assert_eq!(
      runtime.events(),
      vec![
        StubEvent::DelegateCreated {
          id: 0,
          kind: DelegateKind::Cpu
        },
        StubEvent::ModelLoaded { delegate: 0 },
        StubEvent::ModelClosed { delegate: 0 },
        StubEvent::DelegateClosed { id: 0 },
      ]
    );
  }
}
