// 该文件是 Xunlu （寻路） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

pub const RGB_CHANNELS: usize = 3;

/// 缩放所用的插值滤波器，双线性，结果确定
const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("image decode error: {0}")]
  Decode(#[from] image::ImageError),
  #[error("invalid frame size {width}x{height}")]
  InvalidSize { width: u32, height: u32 },
  #[error("frame data length mismatch: expected {expected}, found {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// NHWC 排列的 RGB 帧，每通道 8 位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl RgbFrame {
  pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidSize { width, height });
    }
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 从压缩图像字节（JPEG/PNG/BMP/WebP）解码
  pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
    let image = image::load_from_memory(bytes)?.to_rgb8();
    debug!("解码图像: {}x{}", image.width(), image.height());
    Self::try_from(image)
  }

  /// 缩放到指定尺寸；尺寸相同时直接复制
  pub fn resize(&self, width: u32, height: u32) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidSize { width, height });
    }
    if width == self.width && height == self.height {
      return Ok(self.clone());
    }

    let image = self.to_rgb_image()?;
    let resized = image::imageops::resize(&image, width, height, RESIZE_FILTER);
    Self::try_from(resized)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
    let expected = RGB_CHANNELS * self.width as usize * self.height as usize;
    RgbImage::from_raw(self.width, self.height, self.data.to_vec()).ok_or(
      FrameError::LengthMismatch {
        expected,
        actual: self.data.len(),
      },
    )
  }
}

impl TryFrom<RgbImage> for RgbFrame {
  type Error = FrameError;

  fn try_from(image: RgbImage) -> Result<Self, Self::Error> {
    let (width, height) = image.dimensions();
    Self::from_raw(width, height, image.into_raw())
  }
}
