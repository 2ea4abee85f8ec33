// 该文件是 Xunlu （寻路） 项目的一部分。
// src/bin/simple_detect.rs - 单张图片检测
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use xunlu::{
  args::{DetectArgs, log_filter},
  bridge::DetectResponse,
};

/// Xunlu 单张图片检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub detect: DetectArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_env_filter(log_filter()).init();

  let args = Args::parse();

  info!("模型位置: {}", args.detect.model);
  info!("输入图片: {}", args.detect.input.display());
  info!("推理代理: {}", args.detect.delegate);

  let image = std::fs::read(&args.detect.input)
    .with_context(|| format!("读取图片失败: {}", args.detect.input.display()))?;

  let pipeline = args.detect.pipeline()?;
  let status = args.detect.load(&pipeline)?;
  info!("模型状态: {}，实际代理: {}", status.status, status.delegate);

  info!("开始推理...");
  let now = std::time::Instant::now();
  let result = pipeline.detect(&image)?;
  let elapsed = now.elapsed();
  info!("推理完成，耗时: {:.2?}", elapsed);

  let (data, shape) = result.into_parts();
  println!("{}", serde_json::to_string(&DetectResponse { data, shape })?);

  pipeline.teardown();
  Ok(())
}
