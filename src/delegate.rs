// 该文件是 Xunlu （寻路） 项目的一部分。
// src/delegate.rs - 硬件加速代理策略
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
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::runtime::{NativeDelegate, Runtime, RuntimeError};

const CPU_LABEL: &str = "CPU";
const DEFAULT_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum DelegateError {
  #[error("failed to create {label} delegate: {source}")]
  Create {
    label: &'static str,
    #[source]
    source: RuntimeError,
  },
  #[error("unknown delegate: {0}")]
  Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum DelegateKind {
  Gpu,
  #[value(alias = "nnapi")]
  Npu,
  Cpu,
}

impl DelegateKind {
  /// 该类型的默认策略
  pub fn strategy(self) -> Box<dyn DelegateStrategy> {
    match self {
      DelegateKind::Gpu => Box::new(GpuAccelerated::default()),
      DelegateKind::Npu => Box::new(NpuAccelerated::default()),
      DelegateKind::Cpu => Box::new(CpuOnly::default()),
    }
  }
}

impl fmt::Display for DelegateKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DelegateKind::Gpu => write!(f, "GPU"),
      DelegateKind::Npu => write!(f, "NPU"),
      DelegateKind::Cpu => write!(f, "CPU"),
    }
  }
}

impl FromStr for DelegateKind {
  type Err = DelegateError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GPU" => Ok(DelegateKind::Gpu),
      "NPU" | "NNAPI" => Ok(DelegateKind::Npu),
      "CPU" => Ok(DelegateKind::Cpu),
      _ => Err(DelegateError::Unknown(s.to_string())),
    }
  }
}

impl TryFrom<String> for DelegateKind {
  type Error = DelegateError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferencePreference {
  FastSingleAnswer,
  #[default]
  SustainedSpeed,
}

/// 交给运行时的代理参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateOptions {
  Gpu {
    preference: InferencePreference,
    quantized_models_allowed: bool,
  },
  Npu {
    allow_fp16: bool,
    xnnpack_fallback: bool,
    fallback_threads: usize,
  },
  Cpu {
    threads: usize,
  },
}

impl DelegateOptions {
  pub fn kind(&self) -> DelegateKind {
    match self {
      DelegateOptions::Gpu { .. } => DelegateKind::Gpu,
      DelegateOptions::Npu { .. } => DelegateKind::Npu,
      DelegateOptions::Cpu { .. } => DelegateKind::Cpu,
    }
  }
}

/// 加速后端的能力约定。流水线只依赖这个 trait，不关心具体硬件。
pub trait DelegateStrategy: Send + Sync + fmt::Debug {
  fn options(&self) -> DelegateOptions;

  /// 用于状态回报的名称，例如 `GPU_Quantized`
  fn label(&self) -> &'static str;

  fn kind(&self) -> DelegateKind {
    self.options().kind()
  }

  fn build(&self, runtime: &dyn Runtime) -> Result<DelegateHandle, DelegateError> {
    let options = self.options();
    info!("创建 {} 代理 ({}): {:?}", self.label(), runtime.name(), options);
    let native = runtime
      .create_delegate(&options)
      .map_err(|source| DelegateError::Create {
        label: self.label(),
        source,
      })?;
    Ok(DelegateHandle::new(self.label(), native))
  }

  /// 幂等；对已释放的句柄不做任何事
  fn release(&self, handle: &mut DelegateHandle) {
    handle.release();
  }
}

/// 独占持有的原生代理句柄，析构时自动释放
#[derive(Debug)]
pub struct DelegateHandle {
  label: &'static str,
  native: Option<Box<dyn NativeDelegate>>,
}

impl DelegateHandle {
  pub fn new(label: &'static str, native: Box<dyn NativeDelegate>) -> Self {
    Self {
      label,
      native: Some(native),
    }
  }

  pub fn label(&self) -> &'static str {
    self.label
  }

  pub fn is_live(&self) -> bool {
    self.native.is_some()
  }

  pub fn native(&self) -> Option<&dyn NativeDelegate> {
    self.native.as_deref()
  }

  /// 实际生效的后端名称；加速器不可用时为 `CPU`
  pub fn active_label(&self) -> &'static str {
    match &self.native {
      Some(native) if native.accelerated() => self.label,
      _ => CPU_LABEL,
    }
  }

  pub fn release(&mut self) {
    if let Some(mut native) = self.native.take() {
      debug!("释放 {} 代理", self.label);
      native.close();
    }
  }
}

impl Drop for DelegateHandle {
  fn drop(&mut self) {
    self.release();
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuAccelerated {
  pub preference: InferencePreference,
  /// 允许量化模型（如 int8）在 GPU 上执行
  pub quantized_models_allowed: bool,
}

impl Default for GpuAccelerated {
  fn default() -> Self {
    Self {
      preference: InferencePreference::SustainedSpeed,
      quantized_models_allowed: true,
    }
  }
}

impl DelegateStrategy for GpuAccelerated {
  fn options(&self) -> DelegateOptions {
    DelegateOptions::Gpu {
      preference: self.preference,
      quantized_models_allowed: self.quantized_models_allowed,
    }
  }

  fn label(&self) -> &'static str {
    if self.quantized_models_allowed {
      "GPU_Quantized"
    } else {
      "GPU"
    }
  }
}

/// NNAPI 代理，算子不受支持时回落到 XNNPACK CPU 内核
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpuAccelerated {
  pub allow_fp16: bool,
  pub xnnpack_fallback: bool,
  pub fallback_threads: usize,
}

impl Default for NpuAccelerated {
  fn default() -> Self {
    Self {
      allow_fp16: true,
      xnnpack_fallback: true,
      fallback_threads: DEFAULT_THREADS,
    }
  }
}

impl DelegateStrategy for NpuAccelerated {
  fn options(&self) -> DelegateOptions {
    DelegateOptions::Npu {
      allow_fp16: self.allow_fp16,
      xnnpack_fallback: self.xnnpack_fallback,
      fallback_threads: self.fallback_threads,
    }
  }

  fn label(&self) -> &'static str {
    if self.xnnpack_fallback {
      "NNAPI_XNNPACK"
    } else {
      "NNAPI"
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuOnly {
  pub threads: usize,
}

impl Default for CpuOnly {
  fn default() -> Self {
    Self {
      threads: DEFAULT_THREADS,
    }
  }
}

impl DelegateStrategy for CpuOnly {
  fn options(&self) -> DelegateOptions {
    DelegateOptions::Cpu {
      threads: self.threads,
    }
  }

  fn label(&self) -> &'static str {
    CPU_LABEL
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::{StubEvent, StubRuntime};

  #[test]
  fn labels_follow_options() {
    assert_eq!(GpuAccelerated::default().label(), "GPU_Quantized");
    let plain_gpu = GpuAccelerated {
      quantized_models_allowed: false,
      ..Default::default()
    };
    assert_eq!(plain_gpu.label(), "GPU");
    assert_eq!(NpuAccelerated::default().label(), "NNAPI_XNNPACK");
    assert_eq!(CpuOnly::default().label(), "CPU");
  }

  #[test]
  fn gpu_requests_sustained_speed_and_quantized_models() {
    assert_eq!(
      GpuAccelerated::default().options(),
      DelegateOptions::Gpu {
        preference: InferencePreference::SustainedSpeed,
        quantized_models_allowed: true,
      }
    );
  }

  #[test]
  fn npu_enables_fp16_and_cpu_fallback() {
    let DelegateOptions::Npu {
      allow_fp16,
      xnnpack_fallback,
      ..
    } = NpuAccelerated::default().options()
    else {
      panic!("expected NPU options");
    };
    assert!(allow_fp16);
    assert!(xnnpack_fallback);
  }

  #[test]
  fn release_is_idempotent() {
    let runtime = StubRuntime::new();
    let strategy = GpuAccelerated::default();
    let mut handle = strategy.build(&runtime).unwrap();
    assert!(handle.is_live());
    assert_eq!(runtime.live_delegates(), 1);

    strategy.release(&mut handle);
    strategy.release(&mut handle);
    assert!(!handle.is_live());
    assert_eq!(runtime.live_delegates(), 0);
    drop(handle);

    let closes = runtime
      .events()
      .iter()
      .filter(|e| matches!(e, StubEvent::DelegateClosed { .. }))
      .count();
    assert_eq!(closes, 1);
  }

  #[test]
  fn dropping_a_handle_releases_it() {
    let runtime = StubRuntime::new();
    let handle = CpuOnly::default().build(&runtime).unwrap();
    assert_eq!(runtime.live_delegates(), 1);
    drop(handle);
    assert_eq!(runtime.live_delegates(), 0);
  }

  #[test]
  fn unavailable_accelerator_reports_cpu() {
    let runtime = StubRuntime::new().without_accelerator(DelegateKind::Gpu);
    let handle = GpuAccelerated::default().build(&runtime).unwrap();
    assert_eq!(handle.label(), "GPU_Quantized");
    assert_eq!(handle.active_label(), "CPU");
  }

  #[test]
  fn failing_delegate_surfaces_error() {
    let runtime = StubRuntime::new().with_failing_delegate(DelegateKind::Npu);
    let err = NpuAccelerated::default().build(&runtime).unwrap_err();
    assert!(matches!(err, DelegateError::Create { label: "NNAPI_XNNPACK", .. }));
  }

  #[test]
  fn kind_parses_host_names() {
    assert_eq!("gpu".parse::<DelegateKind>().unwrap(), DelegateKind::Gpu);
    assert_eq!("NNAPI".parse::<DelegateKind>().unwrap(), DelegateKind::Npu);
    assert_eq!("Cpu".parse::<DelegateKind>().unwrap(), DelegateKind::Cpu);
    assert!("tpu".parse::<DelegateKind>().is_err());
    assert_eq!(DelegateKind::Npu.strategy().label(), "NNAPI_XNNPACK");
  }
}
