// 该文件是 DeepMID 项目的一部分。
// src/upload.rs - 上传图像与请求级临时文件
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

use std::io::Write;
use std::path::Path;

use image::{DynamicImage, ImageFormat, ImageReader};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum UploadError {
  #[error("不支持的图像格式: {0}（仅支持 jpg、jpeg、png）")]
  UnsupportedFormat(String),
  #[error("上传内容为空")]
  Empty,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  DecodeError(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
  Jpeg,
  Png,
}

impl UploadFormat {
  pub const ACCEPTED_EXTENSIONS: [&'static str; 3] = ["jpg", "jpeg", "png"];

  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_ascii_lowercase().as_str() {
      "jpg" | "jpeg" => Some(UploadFormat::Jpeg),
      "png" => Some(UploadFormat::Png),
      _ => None,
    }
  }

  pub fn extension(&self) -> &'static str {
    match self {
      UploadFormat::Jpeg => "jpg",
      UploadFormat::Png => "png",
    }
  }

  pub fn image_format(&self) -> ImageFormat {
    match self {
      UploadFormat::Jpeg => ImageFormat::Jpeg,
      UploadFormat::Png => ImageFormat::Png,
    }
  }
}

/// 一次分析动作对应的上传图像
#[derive(Debug, Clone)]
pub struct UploadedImage {
  bytes: Vec<u8>,
  format: UploadFormat,
}

impl UploadedImage {
  /// 根据文件名扩展名确定格式，没有扩展名时根据内容判断
  pub fn new(bytes: Vec<u8>, file_name: Option<&str>) -> Result<Self, UploadError> {
    if bytes.is_empty() {
      return Err(UploadError::Empty);
    }

    let declared = file_name
      .and_then(|name| Path::new(name).extension())
      .map(|ext| ext.to_string_lossy().into_owned());

    let format = match declared {
      Some(ext) => UploadFormat::from_extension(&ext).ok_or(UploadError::UnsupportedFormat(ext))?,
      None => match image::guess_format(&bytes) {
        Ok(ImageFormat::Jpeg) => UploadFormat::Jpeg,
        Ok(ImageFormat::Png) => UploadFormat::Png,
        Ok(other) => return Err(UploadError::UnsupportedFormat(format!("{other:?}"))),
        Err(_) => return Err(UploadError::UnsupportedFormat("unknown".to_string())),
      },
    };

    Ok(UploadedImage { bytes, format })
  }

  pub fn open(path: &Path) -> Result<Self, UploadError> {
    let bytes = std::fs::read(path)?;
    let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
    Self::new(bytes, name.as_deref())
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn format(&self) -> UploadFormat {
    self.format
  }

  pub fn decode(&self) -> Result<DynamicImage, UploadError> {
    // 扩展名可能与内容不符，以内容为准
    let image = ImageReader::new(std::io::Cursor::new(&self.bytes))
      .with_guessed_format()?
      .decode()?;
    Ok(image)
  }

  /// 写入请求级临时文件，文件在返回值被丢弃时删除
  pub fn persist_temp(&self, dir: Option<&Path>) -> Result<NamedTempFile, UploadError> {
    let suffix = format!(".{}", self.format.extension());
    let mut builder = tempfile::Builder::new();
    builder.prefix("deepmid-upload-").suffix(&suffix);
    let mut file = match dir {
      Some(dir) => builder.tempfile_in(dir)?,
      None => builder.tempfile()?,
    };
    file.write_all(&self.bytes)?;
    file.flush()?;
    debug!("上传图像已写入临时文件: {}", file.path().display());
    Ok(file)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::encode_png;
  use image::RgbImage;

  fn png_bytes() -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(RgbImage::new(4, 3))).unwrap()
  }

  #[test]
  fn test_format_from_declared_extension() {
    let upload = UploadedImage::new(png_bytes(), Some("chest.PNG")).unwrap();
    assert_eq!(upload.format(), UploadFormat::Png);
    let upload = UploadedImage::new(png_bytes(), Some("chest.jpeg")).unwrap();
    assert_eq!(upload.format(), UploadFormat::Jpeg);
  }

  #[test]
  fn test_format_sniffed_without_name() {
    let upload = UploadedImage::new(png_bytes(), None).unwrap();
    assert_eq!(upload.format(), UploadFormat::Png);
  }

  #[test]
  fn test_rejects_unsupported_extension() {
    let err = UploadedImage::new(png_bytes(), Some("scan.gif")).unwrap_err();
    assert!(matches!(err, UploadError::UnsupportedFormat(ext) if ext == "gif"));
  }

  #[test]
  fn test_rejects_empty_upload() {
    assert!(matches!(
      UploadedImage::new(Vec::new(), Some("a.png")),
      Err(UploadError::Empty)
    ));
  }

  #[test]
  fn test_decode_ignores_mismatched_extension() {
    let upload = UploadedImage::new(png_bytes(), Some("really-a-png.jpg")).unwrap();
    let image = upload.decode().unwrap();
    assert_eq!((image.width(), image.height()), (4, 3));
  }

  #[test]
  fn test_temp_file_removed_on_drop() {
    let dir = tempfile::TempDir::new().unwrap();
    let upload = UploadedImage::new(png_bytes(), Some("a.png")).unwrap();
    let temp = upload.persist_temp(Some(dir.path())).unwrap();
    let path = temp.path().to_path_buf();
    assert!(path.exists());
    assert_eq!(std::fs::read(&path).unwrap(), upload.bytes());
    drop(temp);
    assert!(!path.exists(), "temp file should be removed on drop");
  }
}
