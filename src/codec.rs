// 该文件是 Xunlu （寻路） 项目的一部分。
// src/codec.rs - 张量编解码
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

//! 图像到输入张量的编码，以及输出字节到检测结果的解码。
//!
//! 输入始终为 NHWC、RGB 交错排列。输出一律按本机字节序的 float32 解释，
//! 检测头（框与分数）即使在量化网络中通常也输出 float32。

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::frame::{FrameError, RGB_CHANNELS, RgbFrame};

const FLOAT32_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementType {
  Float32,
  UInt8,
  /// 运行时报告的其他类型，保留原始名称用于日志
  Other(String),
}

impl ElementType {
  /// 实际写入输入缓冲区的类型，未识别类型退回 float32
  pub fn encoded_as(&self) -> ElementType {
    match self {
      ElementType::UInt8 => ElementType::UInt8,
      _ => ElementType::Float32,
    }
  }

  /// 编码后每个元素占用的字节数
  pub fn encoded_size(&self) -> usize {
    match self.encoded_as() {
      ElementType::UInt8 => 1,
      _ => FLOAT32_SIZE,
    }
  }

  pub fn is_recognized(&self) -> bool {
    !matches!(self, ElementType::Other(_))
  }
}

impl fmt::Display for ElementType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ElementType::Float32 => write!(f, "FLOAT32"),
      ElementType::UInt8 => write!(f, "UINT8"),
      ElementType::Other(name) => write!(f, "{}", name.to_uppercase()),
    }
  }
}

impl FromStr for ElementType {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s.to_ascii_lowercase().as_str() {
      "float32" | "f32" | "float" => ElementType::Float32,
      "uint8" | "u8" => ElementType::UInt8,
      other => ElementType::Other(other.to_string()),
    })
  }
}

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("input tensor must be NHWC with {RGB_CHANNELS} channels, found shape {0:?}")]
  UnsupportedInputShape(Vec<usize>),
  #[error("frame error: {0}")]
  Frame(#[from] FrameError),
}

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("invalid base64 payload: {0}")]
  Base64(#[from] base64::DecodeError),
  #[error("invalid image: {0}")]
  Image(#[from] FrameError),
  #[error("output buffer holds {actual} bytes, shape {shape:?} requires {expected}")]
  OutputLength {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
  },
  #[error("output shape {0:?} is too large")]
  ShapeOverflow(Vec<usize>),
}

/// 张量描述：元素类型与形状，会话期间不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
  pub element_type: ElementType,
  pub shape: Vec<usize>,
}

impl TensorDescriptor {
  pub fn new(element_type: ElementType, shape: impl Into<Vec<usize>>) -> Self {
    Self {
      element_type,
      shape: shape.into(),
    }
  }

  pub fn element_count(&self) -> Option<usize> {
    element_count(&self.shape)
  }

  /// 按编码类型计算的输入缓冲区字节数
  pub fn encoded_len(&self) -> Option<usize> {
    self
      .element_count()?
      .checked_mul(self.element_type.encoded_size())
  }

  /// NHWC 输入的 (宽, 高)
  pub fn spatial(&self) -> Result<(u32, u32), CodecError> {
    match self.shape.as_slice() {
      &[_, h, w, c] if c == RGB_CHANNELS && h > 0 && w > 0 => {
        let h = u32::try_from(h).map_err(|_| CodecError::UnsupportedInputShape(self.shape.clone()))?;
        let w = u32::try_from(w).map_err(|_| CodecError::UnsupportedInputShape(self.shape.clone()))?;
        Ok((w, h))
      }
      _ => Err(CodecError::UnsupportedInputShape(self.shape.clone())),
    }
  }
}

fn element_count(shape: &[usize]) -> Option<usize> {
  shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// 与某个输入描述严格对应的字节缓冲
#[derive(Debug, Clone)]
pub struct EncodedInput {
  element_type: ElementType,
  bytes: Box<[u8]>,
}

impl EncodedInput {
  pub fn element_type(&self) -> &ElementType {
    &self.element_type
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

/// 编码结果；`fallback` 非空表示遇到未识别的输入类型并退回了 float32
#[derive(Debug, Clone)]
pub struct Encoding {
  pub input: EncodedInput,
  pub fallback: Option<ElementType>,
}

/// 扁平的 float32 序列及其形状，`data.len() == product(shape)`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
  data: Vec<f32>,
  shape: Vec<usize>,
}

impl DetectionResult {
  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn into_parts(self) -> (Vec<f32>, Vec<usize>) {
    (self.data, self.shape)
  }
}

/// 将帧缩放到描述的空间尺寸并按其元素类型序列化
pub fn encode(frame: &RgbFrame, descriptor: &TensorDescriptor) -> Result<Encoding, CodecError> {
  let (width, height) = descriptor.spatial()?;
  let resized = frame.resize(width, height)?;
  let pixels = resized.as_nhwc();

  let fallback = if descriptor.element_type.is_recognized() {
    None
  } else {
    warn!(
      "未知的输入类型: {}，默认使用 Float32",
      descriptor.element_type
    );
    Some(descriptor.element_type.clone())
  };

  let element_type = descriptor.element_type.encoded_as();
  let bytes = match element_type {
    ElementType::UInt8 => pixels.to_vec(),
    _ => {
      let mut bytes = Vec::with_capacity(pixels.len() * FLOAT32_SIZE);
      for &value in pixels {
        bytes.extend_from_slice(&(value as f32 / 255.0).to_ne_bytes());
      }
      bytes
    }
  };

  Ok(Encoding {
    input: EncodedInput {
      element_type,
      bytes: bytes.into_boxed_slice(),
    },
    fallback,
  })
}

/// 将原始输出字节按 float32 解释为检测结果
pub fn decode(raw: &[u8], shape: &[usize]) -> Result<DetectionResult, DecodeError> {
  let expected = element_count(shape)
    .and_then(|n| n.checked_mul(FLOAT32_SIZE))
    .ok_or_else(|| DecodeError::ShapeOverflow(shape.to_vec()))?;

  if raw.len() != expected {
    return Err(DecodeError::OutputLength {
      shape: shape.to_vec(),
      expected,
      actual: raw.len(),
    });
  }

  let data = raw
    .chunks_exact(FLOAT32_SIZE)
    .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    .collect();

  Ok(DetectionResult {
    data,
    shape: shape.to_vec(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn solid_frame(width: u32, height: u32, color: [u8; 3]) -> RgbFrame {
    let data = color
      .iter()
      .copied()
      .cycle()
      .take(width as usize * height as usize * 3)
      .collect();
    RgbFrame::from_raw(width, height, data).unwrap()
  }

  fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
      .chunks_exact(4)
      .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
      .collect()
  }

  #[test]
  fn float32_encoding_normalizes_channels() {
    let frame = solid_frame(8, 8, [255, 0, 51]);
    let descriptor = TensorDescriptor::new(ElementType::Float32, [1, 4, 4, 3]);
    let encoding = encode(&frame, &descriptor).unwrap();

    assert!(encoding.fallback.is_none());
    assert_eq!(encoding.input.len(), 4 * 4 * 3 * 4);
    let values = f32s(encoding.input.as_bytes());
    assert_eq!(&values[..3], &[1.0, 0.0, 0.2]);
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
  }

  #[test]
  fn uint8_encoding_keeps_raw_bytes() {
    let frame = solid_frame(6, 6, [1, 2, 3]);
    let descriptor = TensorDescriptor::new(ElementType::UInt8, [1, 6, 6, 3]);
    let encoding = encode(&frame, &descriptor).unwrap();

    assert_eq!(encoding.input.element_type(), &ElementType::UInt8);
    assert_eq!(encoding.input.len(), 6 * 6 * 3);
    assert_eq!(&encoding.input.as_bytes()[..6], &[1, 2, 3, 1, 2, 3]);
  }

  #[test]
  fn unknown_type_falls_back_to_float32() {
    let frame = solid_frame(2, 2, [255, 255, 255]);
    let descriptor = TensorDescriptor::new(ElementType::Other("int8".into()), [1, 2, 2, 3]);
    let encoding = encode(&frame, &descriptor).unwrap();

    assert_eq!(encoding.fallback, Some(ElementType::Other("int8".into())));
    assert_eq!(encoding.input.element_type(), &ElementType::Float32);
    assert_eq!(encoding.input.len(), descriptor.encoded_len().unwrap());
    assert!(f32s(encoding.input.as_bytes()).iter().all(|&v| v == 1.0));
  }

  #[test]
  fn encoded_length_matches_descriptor() {
    let frame = solid_frame(17, 9, [9, 9, 9]);
    for element_type in [ElementType::Float32, ElementType::UInt8] {
      let descriptor = TensorDescriptor::new(element_type.clone(), [1, 320, 320, 3]);
      let encoding = encode(&frame, &descriptor).unwrap();
      assert_eq!(
        encoding.input.len(),
        320 * 320 * 3 * element_type.encoded_size()
      );
    }
  }

  #[test]
  fn encode_rejects_non_rgb_descriptor() {
    let frame = solid_frame(2, 2, [0, 0, 0]);
    let descriptor = TensorDescriptor::new(ElementType::Float32, [1, 3, 320, 320]);
    assert!(matches!(
      encode(&frame, &descriptor),
      Err(CodecError::UnsupportedInputShape(_))
    ));
  }

  #[test]
  fn decode_reads_native_float32() {
    let values = [0.5f32, -1.25, 3.0, 42.0, 0.0, 1.0];
    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let result = decode(&raw, &[1, 2, 3]).unwrap();
    assert_eq!(result.data(), &values);
    assert_eq!(result.shape(), &[1, 2, 3]);
  }

  #[test]
  fn decode_fails_only_on_length_mismatch() {
    let shape = [1, 5, 2100];
    let exact = vec![0u8; 4 * 5 * 2100];
    let result = decode(&exact, &shape).unwrap();
    assert_eq!(result.data().len(), 10500);

    for len in [0, 4 * 5 * 2100 - 1, 4 * 5 * 2100 + 4, 5 * 2100] {
      let err = decode(&vec![0u8; len], &shape).unwrap_err();
      assert!(matches!(err, DecodeError::OutputLength { actual, .. } if actual == len));
    }
  }

  #[test]
  fn decode_reports_overflowing_shape() {
    let err = decode(&[], &[usize::MAX, 2]).unwrap_err();
    assert!(matches!(err, DecodeError::ShapeOverflow(_)));
  }

  #[test]
  fn element_type_parses_runtime_names() {
    assert_eq!("FLOAT32".parse::<ElementType>().unwrap(), ElementType::Float32);
    assert_eq!("uint8".parse::<ElementType>().unwrap(), ElementType::UInt8);
    assert_eq!(
      "int8".parse::<ElementType>().unwrap(),
      ElementType::Other("int8".into())
    );
    assert_eq!(ElementType::Other("int8".into()).to_string(), "INT8");
  }
}
