// 该文件是 DeepMID 项目的一部分。
// src/annotate.rs - 检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{ImageReader, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::debug;

use crate::detector::Prediction;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 16;

static DEFAULT_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum AnnotateError {
  #[error("字体加载错误: {0}")]
  FontLoadError(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 在图像副本上绘制检测框与类别标签
#[derive(Clone)]
pub struct Annotator {
  font: FontArc,
  font_scale: PxScale,
  colors: Vec<Rgb<u8>>,
}

impl Default for Annotator {
  fn default() -> Self {
    let font = FontArc::try_from_slice(DEFAULT_FONT).expect("无法加载嵌入的字体文件");
    Self::with_font(font)
  }
}

impl std::fmt::Debug for Annotator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Annotator")
      .field("font_scale", &self.font_scale)
      .field("colors", &self.colors.len())
      .finish()
  }
}

impl Annotator {
  pub fn with_font(font: FontArc) -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    }
  }

  pub fn from_font_file(path: &Path) -> Result<Self, AnnotateError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data).map_err(|e| AnnotateError::FontLoadError(e.to_string()))?;
    Ok(Self::with_font(font))
  }

  /// 读取源图像并返回绘制后的副本，源文件不会被修改
  pub fn annotate_file(
    &self,
    path: &Path,
    predictions: &[Prediction],
  ) -> Result<RgbImage, AnnotateError> {
    let image = ImageReader::open(path)?
      .with_guessed_format()?
      .decode()?
      .to_rgb8();
    Ok(self.annotate(image, predictions))
  }

  pub fn annotate(&self, mut image: RgbImage, predictions: &[Prediction]) -> RgbImage {
    for prediction in predictions {
      self.draw_prediction(&mut image, prediction);
    }
    debug!("已绘制 {} 个检测框", predictions.len());
    image
  }

  fn color_for(&self, prediction: &Prediction) -> Rgb<u8> {
    // 没有类别编号时按类别名称取色，同类同色
    let index = match prediction.class_id {
      Some(id) => id as usize,
      None => prediction
        .class
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize)),
    };
    self.colors[index % self.colors.len()]
  }

  fn draw_prediction(&self, image: &mut RgbImage, prediction: &Prediction) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let [x_min, y_min, x_max, y_max] = prediction.corners();
    let x_min = (x_min.floor() as i32).clamp(0, w - 1);
    let y_min = (y_min.floor() as i32).clamp(0, h - 1);
    let x_max = (x_max.ceil() as i32).clamp(0, w - 1);
    let y_max = (y_max.ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color_for(prediction);

    // 绘制边框（加粗）
    for thickness in 0..BOX_THICKNESS {
      let width = (x_max - x_min - 2 * thickness + 1).max(0) as u32;
      let height = (y_max - y_min - 2 * thickness + 1).max(0) as u32;
      if width == 0 || height == 0 {
        break;
      }
      let rect = Rect::at(x_min + thickness, y_min + thickness).of_size(width, height);
      draw_hollow_rect_mut(image, rect, color);
    }

    // 标签放在边框上方，空间不足时放在框内
    let (text_width, text_height) = text_size(self.font_scale, &self.font, &prediction.class);
    let label_height = text_height as i32 + 2 * LABEL_TEXT_PADDING;
    let label_width = (text_width as i32 + 2 * LABEL_TEXT_PADDING).min(w - x_min);
    let label_y = if y_min >= label_height {
      y_min - label_height
    } else {
      y_min
    };

    if label_width <= 0 || label_height <= 0 {
      return;
    }

    let rect = Rect::at(x_min, label_y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      x_min + LABEL_TEXT_PADDING,
      label_y + LABEL_TEXT_PADDING,
      self.font_scale,
      &self.font,
      &prediction.class,
    );
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
