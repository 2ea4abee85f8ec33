// 该文件是 Xunlu （寻路） 项目的一部分。
// src/runtime/onnx.rs - ONNX Runtime 后端
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

//! 以 ONNX Runtime 执行提供程序实现各代理：
//! GPU 使用 CUDA，NPU 使用 NNAPI 并以 XNNPACK 兜底，CPU 使用默认提供程序。

use std::any::Any;

use ort::execution_providers::{
  CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
  NNAPIExecutionProvider, XNNPACKExecutionProvider,
};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use tracing::{debug, info, warn};

use crate::codec::{ElementType, TensorDescriptor};
use crate::delegate::{DelegateOptions, InferencePreference};
use crate::runtime::{Interpreter, NativeDelegate, Runtime, RuntimeError};

const DEFAULT_THREADS: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct OrtRuntime;

impl OrtRuntime {
  pub fn new() -> Self {
    Self
  }
}

#[derive(Debug)]
struct OrtDelegate {
  options: DelegateOptions,
  accelerated: bool,
  closed: bool,
}

impl NativeDelegate for OrtDelegate {
  fn accelerated(&self) -> bool {
    self.accelerated
  }

  fn close(&mut self) {
    self.closed = true;
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

fn probe<E: ExecutionProvider>(provider: &E, name: &str) -> bool {
  match provider.is_available() {
    Ok(available) => {
      debug!("{} 执行提供程序可用: {}", name, available);
      available
    }
    Err(e) => {
      warn!("查询 {} 执行提供程序失败: {}", name, e);
      false
    }
  }
}

impl OrtDelegate {
  fn providers(&self) -> Vec<ExecutionProviderDispatch> {
    match self.options {
      DelegateOptions::Gpu { .. } => vec![
        CUDAExecutionProvider::default().build(),
        CPUExecutionProvider::default().build(),
      ],
      DelegateOptions::Npu {
        allow_fp16,
        xnnpack_fallback,
        ..
      } => {
        let mut providers = vec![NNAPIExecutionProvider::default().with_fp16(allow_fp16).build()];
        if xnnpack_fallback {
          providers.push(XNNPACKExecutionProvider::default().build());
        }
        providers.push(CPUExecutionProvider::default().build());
        providers
      }
      DelegateOptions::Cpu { .. } => vec![CPUExecutionProvider::default().build()],
    }
  }

  fn threads(&self) -> usize {
    match self.options {
      DelegateOptions::Npu {
        fallback_threads, ..
      } => fallback_threads,
      DelegateOptions::Cpu { threads } => threads,
      DelegateOptions::Gpu { .. } => DEFAULT_THREADS,
    }
  }

  // 单次推理优先时缩短会话创建（Level1），持续推理时做全部图优化（Level3）。
  // ONNX Runtime 按模型本身的量化算子执行，quantized_models_allowed 无对应开关。
  fn optimization_level(&self) -> GraphOptimizationLevel {
    match self.options {
      DelegateOptions::Gpu {
        preference: InferencePreference::FastSingleAnswer,
        ..
      } => GraphOptimizationLevel::Level1,
      _ => GraphOptimizationLevel::Level3,
    }
  }
}

impl Runtime for OrtRuntime {
  fn name(&self) -> &'static str {
    "onnxruntime"
  }

  fn create_delegate(
    &self,
    options: &DelegateOptions,
  ) -> Result<Box<dyn NativeDelegate>, RuntimeError> {
    let accelerated = match options {
      DelegateOptions::Gpu { .. } => probe(&CUDAExecutionProvider::default(), "CUDA"),
      DelegateOptions::Npu { .. } => probe(&NNAPIExecutionProvider::default(), "NNAPI"),
      DelegateOptions::Cpu { .. } => true,
    };
    if !accelerated {
      warn!("请求的加速器不可用，推理将在 CPU 上执行");
    }

    Ok(Box::new(OrtDelegate {
      options: options.clone(),
      accelerated,
      closed: false,
    }))
  }

  fn load(
    &self,
    model: &[u8],
    delegate: &dyn NativeDelegate,
  ) -> Result<Box<dyn Interpreter>, RuntimeError> {
    let delegate = delegate
      .as_any()
      .downcast_ref::<OrtDelegate>()
      .ok_or_else(|| RuntimeError::DelegateUnavailable("foreign delegate".to_string()))?;
    if delegate.closed {
      return Err(RuntimeError::DelegateUnavailable(
        "delegate already closed".to_string(),
      ));
    }

    info!("创建 ONNX Runtime 会话");
    let session = Session::builder()?
      .with_optimization_level(delegate.optimization_level())?
      .with_intra_threads(delegate.threads())?
      .with_execution_providers(delegate.providers())?
      .commit_from_memory(model)?;

    let (input_name, input_type, input_dims) = tensor_info(
      session.inputs.first().map(|i| (&i.name, &i.input_type)),
      "input",
    )?;
    let (output_name, output_type, output_dims) = tensor_info(
      session.outputs.first().map(|o| (&o.name, &o.output_type)),
      "output",
    )?;
    debug!("模型输入 {}: {:?}", input_name, input_dims);
    debug!("模型输出 {}: {:?}", output_name, output_dims);

    Ok(Box::new(OrtInterpreter {
      input_count: session.inputs.len(),
      output_count: session.outputs.len(),
      session,
      output_name,
      input_type,
      input_dims,
      output_type,
      output_dims,
      input_shape: None,
      allocated: false,
    }))
  }
}

fn tensor_info(
  value: Option<(&String, &ValueType)>,
  kind: &'static str,
) -> Result<(String, ElementType, Vec<i64>), RuntimeError> {
  let (name, value_type) =
    value.ok_or_else(|| RuntimeError::InvalidModel(format!("model has no {} tensor", kind)))?;
  match value_type {
    ValueType::Tensor { ty, shape, .. } => Ok((
      name.clone(),
      element_type(*ty),
      shape.iter().copied().collect(),
    )),
    other => Err(RuntimeError::InvalidModel(format!(
      "{} {} is not a tensor: {:?}",
      kind, name, other
    ))),
  }
}

fn element_type(ty: TensorElementType) -> ElementType {
  match ty {
    TensorElementType::Float32 => ElementType::Float32,
    TensorElementType::Uint8 => ElementType::UInt8,
    other => ElementType::Other(format!("{:?}", other)),
  }
}

/// 用规范形状覆盖声明的输入维度：动态维度（负值）可以覆盖，静态维度必须一致
fn negotiate_input(declared: &[i64], requested: &[usize]) -> Result<Vec<usize>, RuntimeError> {
  if requested.len() != declared.len() {
    return Err(RuntimeError::InvalidShape {
      shape: requested.to_vec(),
      reason: format!("model declares rank {}", declared.len()),
    });
  }
  let conflicts = declared
    .iter()
    .zip(requested)
    .any(|(&d, &r)| d >= 0 && d as usize != r);
  if conflicts {
    return Err(RuntimeError::InvalidShape {
      shape: requested.to_vec(),
      reason: format!("conflicts with declared static shape {:?}", declared),
    });
  }
  Ok(requested.to_vec())
}

/// 解析输出形状：动态批次取输入批次，其余动态维度记为 0
fn resolve_output(declared: &[i64], batch: Option<usize>) -> Vec<usize> {
  declared
    .iter()
    .enumerate()
    .map(|(i, &d)| match (i, d) {
      (_, d) if d >= 0 => d as usize,
      (0, _) => batch.unwrap_or(1),
      _ => 0,
    })
    .collect()
}

struct OrtInterpreter {
  session: Session,
  input_count: usize,
  output_count: usize,
  output_name: String,
  input_type: ElementType,
  input_dims: Vec<i64>,
  output_type: ElementType,
  output_dims: Vec<i64>,
  input_shape: Option<Vec<usize>>,
  allocated: bool,
}

impl OrtInterpreter {
  fn check_index(kind: &'static str, index: usize, count: usize) -> Result<(), RuntimeError> {
    // 只暴露首个张量
    if index == 0 && count > 0 {
      Ok(())
    } else {
      Err(RuntimeError::TensorIndex { kind, index, count })
    }
  }
}

impl Interpreter for OrtInterpreter {
  fn input_count(&self) -> usize {
    self.input_count
  }

  fn output_count(&self) -> usize {
    self.output_count
  }

  fn input_tensor(&self, index: usize) -> Result<TensorDescriptor, RuntimeError> {
    Self::check_index("input", index, self.input_count)?;
    let shape = match &self.input_shape {
      Some(shape) => shape.clone(),
      None => self.input_dims.iter().map(|&d| d.max(0) as usize).collect(),
    };
    Ok(TensorDescriptor::new(self.input_type.clone(), shape))
  }

  fn output_tensor(&self, index: usize) -> Result<TensorDescriptor, RuntimeError> {
    Self::check_index("output", index, self.output_count)?;
    let batch = self.input_shape.as_ref().and_then(|s| s.first().copied());
    let shape = resolve_output(&self.output_dims, batch);
    Ok(TensorDescriptor::new(self.output_type.clone(), shape))
  }

  fn resize_input(&mut self, index: usize, shape: &[usize]) -> Result<(), RuntimeError> {
    Self::check_index("input", index, self.input_count)?;
    self.input_shape = Some(negotiate_input(&self.input_dims, shape)?);
    self.allocated = false;
    Ok(())
  }

  fn allocate_tensors(&mut self) -> Result<(), RuntimeError> {
    if self.input_shape.is_none() && self.input_dims.iter().any(|&d| d < 0) {
      return Err(RuntimeError::InvalidShape {
        shape: Vec::new(),
        reason: "dynamic input dimensions must be resized first".to_string(),
      });
    }
    // ONNX Runtime 在 run 时分配内存
    self.allocated = true;
    Ok(())
  }

  fn run(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), RuntimeError> {
    if !self.allocated {
      return Err(RuntimeError::NotAllocated);
    }
    let shape: Vec<i64> = match &self.input_shape {
      Some(shape) => shape.iter().map(|&d| d as i64).collect(),
      None => self.input_dims.clone(),
    };

    let value = match self.input_type.encoded_as() {
      ElementType::UInt8 => Tensor::<u8>::from_array((shape, input.to_vec()))?.into_dyn(),
      _ => {
        let floats: Vec<f32> = input
          .chunks_exact(4)
          .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
          .collect();
        Tensor::<f32>::from_array((shape, floats))?.into_dyn()
      }
    };

    let outputs = self.session.run(ort::inputs![value])?;
    // 输出名取自会话本身
    let (_, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

    if data.len() * 4 != output.len() {
      return Err(RuntimeError::Execution(format!(
        "runtime produced {} elements, buffer holds {}",
        data.len(),
        output.len() / 4
      )));
    }
    for (chunk, value) in output.chunks_exact_mut(4).zip(data) {
      chunk.copy_from_slice(&value.to_ne_bytes());
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dynamic_dimensions_take_the_canonical_shape() {
    assert_eq!(
      negotiate_input(&[-1, -1, -1, 3], &[1, 320, 320, 3]).unwrap(),
      vec![1, 320, 320, 3]
    );
    assert_eq!(
      negotiate_input(&[1, 320, 320, 3], &[1, 320, 320, 3]).unwrap(),
      vec![1, 320, 320, 3]
    );
  }

  #[test]
  fn conflicting_static_dimension_is_rejected() {
    let err = negotiate_input(&[100, 640, 640, 3], &[1, 320, 320, 3]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidShape { .. }));
    let err = negotiate_input(&[-1, 640, 640, 3], &[1, 320, 320, 3]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidShape { .. }));
  }

  #[test]
  fn rank_mismatch_is_rejected() {
    let err = negotiate_input(&[-1, 3, -1], &[1, 320, 320, 3]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidShape { ref reason, .. } if reason.contains("rank 3")));
  }

  #[test]
  fn dynamic_output_batch_follows_input() {
    assert_eq!(resolve_output(&[-1, 84, 8400], Some(1)), vec![1, 84, 8400]);
    assert_eq!(resolve_output(&[-1, 5, 2100], None), vec![1, 5, 2100]);
    assert_eq!(resolve_output(&[1, 5, 2100], Some(4)), vec![1, 5, 2100]);
  }

  #[test]
  fn other_dynamic_output_dimensions_become_zero() {
    assert_eq!(resolve_output(&[1, -1, 6], Some(1)), vec![1, 0, 6]);
  }

  #[test]
  fn element_types_map_to_codec_types() {
    assert_eq!(element_type(TensorElementType::Float32), ElementType::Float32);
    assert_eq!(element_type(TensorElementType::Uint8), ElementType::UInt8);
    let other = element_type(TensorElementType::Int16);
    assert!(!other.is_recognized());
    assert_eq!(other.encoded_as(), ElementType::Float32);
  }
}
