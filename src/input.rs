// 该文件是 Xunjian （巡检） 项目的一部分。
// src/input.rs - 图像来源解析
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

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use base64::{Engine, prelude::BASE64_STANDARD};
use image::{ImageReader, RgbImage};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// 以此前缀开头的来源视为内联图像
const INLINE_PREFIX: &str = "data:image";
/// 超过该长度（字符数）的来源同样视为内联图像
const INLINE_MIN_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum ImageError {
  #[error("图像记录缺少来源 (url/path)")]
  MissingSource,
  #[error("不支持的图像描述: {0}")]
  UnsupportedRef(String),
  #[error("base64 解码失败: {0}")]
  Base64(#[from] base64::DecodeError),
  #[error("图像解码失败: {0}")]
  Decode(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 配置中的单个图像条目
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
  Source(String),
  Record(ImageRecord),
  Other(Value),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageRecord {
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub path: Option<String>,
  #[serde(default)]
  pub url_or_path: Option<String>,
  #[serde(default)]
  pub filename: Option<String>,
}

impl ImageRecord {
  fn source(&self) -> Option<&str> {
    [&self.url, &self.path, &self.url_or_path]
      .into_iter()
      .flatten()
      .map(String::as_str)
      .find(|s| !s.is_empty())
  }
}

/// 解析后的图像来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
  /// 内联编码的图像（可能带有 data URL 头）
  Inline(String),
  /// 原样交给推理后端的文件路径
  Path(PathBuf),
}

impl ImageSource {
  /// 按来源字符串判定类别，这是启发式规则而非内容检查
  pub fn classify(source: &str) -> Self {
    if source.starts_with(INLINE_PREFIX) || source.chars().count() > INLINE_MIN_CHARS {
      ImageSource::Inline(source.to_string())
    } else {
      ImageSource::Path(PathBuf::from(source))
    }
  }

  pub fn is_inline(&self) -> bool {
    matches!(self, ImageSource::Inline(_))
  }

  /// 内联图像在此解码，文件路径保持不变
  pub fn load(self) -> Result<InputImage, ImageError> {
    match self {
      ImageSource::Inline(data) => decode_inline(&data).map(InputImage::Decoded),
      ImageSource::Path(path) => Ok(InputImage::Path(path)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
  pub index: usize,
  pub filename: String,
  pub source: ImageSource,
}

/// 解析第 `index` 个（从 0 开始）图像条目
pub fn resolve(index: usize, image: &ImageRef) -> Result<ResolvedImage, ImageError> {
  let (source, filename) = match image {
    ImageRef::Source(source) => (source.as_str(), None),
    ImageRef::Record(record) => {
      let source = record.source().ok_or(ImageError::MissingSource)?;
      (source, record.filename.clone())
    }
    ImageRef::Other(value) => return Err(ImageError::UnsupportedRef(value.to_string())),
  };

  Ok(ResolvedImage {
    index,
    filename: filename.unwrap_or_else(|| synthesized_filename(index)),
    source: ImageSource::classify(source),
  })
}

pub fn synthesized_filename(index: usize) -> String {
  format!("image_{}.jpg", index)
}

/// 解码内联图像；第一个逗号及其之前的内容（data URL 头）会被丢弃
pub fn decode_inline(data: &str) -> Result<RgbImage, ImageError> {
  let payload = match data.split_once(',') {
    Some((_, rest)) => rest,
    None => data,
  };
  let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
  let bytes = BASE64_STANDARD.decode(payload.as_bytes())?;
  debug!("内联图像大小: {} 字节", bytes.len());
  let image = image::load_from_memory(&bytes)?;
  Ok(image.to_rgb8())
}

/// 交给推理后端的图像：已解码的图像或文件路径
#[derive(Debug, Clone)]
pub enum InputImage {
  Decoded(RgbImage),
  Path(PathBuf),
}

impl InputImage {
  /// 需要像素数据的后端通过此方法取得 RGB 图像
  pub fn to_rgb(&self) -> Result<Cow<'_, RgbImage>, ImageError> {
    match self {
      InputImage::Decoded(image) => Ok(Cow::Borrowed(image)),
      InputImage::Path(path) => {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(Cow::Owned(image.to_rgb8()))
      }
    }
  }
}

impl fmt::Display for InputImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InputImage::Decoded(image) => write!(f, "内联图像 {}x{}", image.width(), image.height()),
      InputImage::Path(path) => write!(f, "{}", path.display()),
    }
  }
}
