// 该文件是 Xunlu （寻路） 项目的一部分。
// src/args.rs - 命令行参数配置
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::FromUrl;
use crate::asset::{AssetRoot, ModelLocation};
use crate::delegate::DelegateKind;
use crate::pipeline::{InferencePipeline, LoadStatus};
use crate::runtime::{Runtime, StubRuntime};
use crate::session::SessionConfig;

/// 未设置 RUST_LOG 时的日志级别
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// 读取 RUST_LOG 构建日志过滤器，未设置或无效时使用 info
pub fn log_filter() -> EnvFilter {
  filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
  directives
    .filter(|d| !d.trim().is_empty())
    .and_then(|d| EnvFilter::try_new(d).ok())
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeKind {
  /// 解析 JSON 清单的模拟运行时
  Stub,
  /// ONNX Runtime（需要 onnxruntime 特性）
  Ort,
}

impl Default for RuntimeKind {
  /// 启用 onnxruntime 特性时默认使用真实运行时
  fn default() -> Self {
    if cfg!(feature = "onnxruntime") {
      RuntimeKind::Ort
    } else {
      RuntimeKind::Stub
    }
  }
}

impl RuntimeKind {
  pub fn build(self) -> Result<Arc<dyn Runtime>> {
    match self {
      RuntimeKind::Stub => Ok(Arc::new(StubRuntime::new())),
      #[cfg(feature = "onnxruntime")]
      RuntimeKind::Ort => Ok(Arc::new(crate::runtime::OrtRuntime::new())),
      #[cfg(not(feature = "onnxruntime"))]
      RuntimeKind::Ort => bail!("未启用 onnxruntime 特性，无法使用 ort 运行时"),
    }
  }
}

/// 检测程序共用的参数
#[derive(Args, Debug, Clone)]
pub struct DetectArgs {
  /// 模型位置，asset:///best_int8.tflite 或 file:///path/model.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入图片文件
  #[arg(long, value_name = "FILE")]
  pub input: PathBuf,

  /// 推理代理
  #[arg(long, value_enum, default_value = "gpu")]
  pub delegate: DelegateKind,

  /// 资源根目录，模型位于其 public/ 子目录
  #[arg(long, value_name = "DIR", default_value = ".")]
  pub assets: PathBuf,

  /// 推理运行时
  #[arg(long, value_enum, default_value_t = RuntimeKind::default())]
  pub runtime: RuntimeKind,

  /// 模型输入边长
  #[arg(long, default_value = "320", value_name = "PIXELS")]
  pub input_size: u32,
}

impl DetectArgs {
  pub fn pipeline(&self) -> Result<InferencePipeline> {
    if self.input_size == 0 {
      bail!("输入边长必须大于 0");
    }
    Ok(InferencePipeline::with_config(
      self.runtime.build()?,
      AssetRoot::new(&self.assets),
      SessionConfig::default().with_input_size(self.input_size),
    ))
  }

  /// 按模型位置加载模型
  pub fn load(&self, pipeline: &InferencePipeline) -> Result<LoadStatus> {
    let status = match ModelLocation::from_url(&self.model)? {
      ModelLocation::Asset(path) => pipeline.load_model(&path, self.delegate.strategy())?,
      ModelLocation::File(path) => pipeline.load_model_file(&path, self.delegate.strategy())?,
    };
    Ok(status)
  }
}
