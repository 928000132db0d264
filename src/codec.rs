// 该文件是 DeepMID 项目的一部分。
// src/codec.rs - 图像 Base64 JPEG 编码
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

use std::io::Cursor;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat, RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::debug;

use crate::upload::UploadedImage;

const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("JPEG 编码错误: {0}")]
  EncodeError(#[from] image::ImageError),
  #[error("Base64 解码错误: {0}")]
  Base64Error(#[from] base64::DecodeError),
  #[error("图像为空: {0}x{1}")]
  EmptyImage(u32, u32),
}

/// 能够编码为 JPEG 的图像表示
pub trait JpegEncode {
  fn encode_jpeg(&self) -> Result<Vec<u8>, CodecError>;
}

impl JpegEncode for RgbImage {
  fn encode_jpeg(&self) -> Result<Vec<u8>, CodecError> {
    let (width, height) = self.dimensions();
    if width == 0 || height == 0 {
      return Err(CodecError::EmptyImage(width, height));
    }

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).encode_image(self)?;
    Ok(buffer)
  }
}

impl JpegEncode for DynamicImage {
  fn encode_jpeg(&self) -> Result<Vec<u8>, CodecError> {
    // JPEG 不支持透明通道，统一转换为 RGB
    match self {
      DynamicImage::ImageRgb8(rgb) => rgb.encode_jpeg(),
      other => other.to_rgb8().encode_jpeg(),
    }
  }
}

impl JpegEncode for UploadedImage {
  fn encode_jpeg(&self) -> Result<Vec<u8>, CodecError> {
    let image = image::load_from_memory(self.bytes())?;
    image.encode_jpeg()
  }
}

/// Base64 编码后的 JPEG 图像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage(String);

impl EncodedImage {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn data_url(&self) -> String {
    format!("data:image/jpeg;base64,{}", self.0)
  }

  pub fn decode(&self) -> Result<DynamicImage, CodecError> {
    let bytes = STANDARD.decode(&self.0)?;
    let image = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg)?;
    Ok(image)
  }
}

impl std::fmt::Display for EncodedImage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

pub fn encode_base64<I: JpegEncode + ?Sized>(image: &I) -> Result<EncodedImage, CodecError> {
  let jpeg = image.encode_jpeg()?;
  debug!("JPEG 编码完成，大小: {:.2} KB", jpeg.len() as f64 / 1024.0);
  Ok(EncodedImage(STANDARD.encode(jpeg)))
}

/// 任意字节的 Base64 编码（用于直接上传文件内容）
pub fn encode_bytes(bytes: &[u8]) -> String {
  STANDARD.encode(bytes)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, CodecError> {
  Ok(STANDARD.decode(encoded)?)
}

/// 以 PNG 写入内存，供测试与示例生成上传数据
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CodecError> {
  let mut buffer = Vec::new();
  image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
  Ok(buffer)
}
