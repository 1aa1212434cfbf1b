// 该文件是 Xunjian （巡检） 项目的一部分。
// src/model.rs - 模型
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

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::{
  FromModelPath,
  config::DEFAULT_IMGSZ,
  input::InputImage,
  train::{UltralyticsCli, UltralyticsError},
};

/// 需要先导出为 ONNX 的 Ultralytics 权重格式
#[cfg(feature = "model_onnx")]
const WEIGHTS_EXTENSIONS: [&str; 2] = ["pt", "pth"];

/// 类别编号到类别名称的映射
pub type ClassNames = BTreeMap<u32, String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferParams {
  pub confidence: f32,
  pub iou: f32,
  pub imgsz: u32,
}

/// 推理后端
///
/// 给定一张图像与阈值，返回检测框；`class_names` 为已加载模型的全局类别映射。
pub trait Model {
  type Error;

  fn class_names(&self) -> &ClassNames;
  fn infer(&mut self, input: &InputImage, params: &InferParams) -> Result<DetectResult, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，原图像素坐标
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

pub mod postprocess;

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::{OnnxYolo, OnnxYoloError};

#[cfg(feature = "model_rknn")]
mod yolo26;
#[cfg(feature = "model_rknn")]
pub use self::yolo26::{Yolo26, Yolo26Error};

#[derive(Error, Debug)]
pub enum ModelError {
  #[cfg(feature = "model_onnx")]
  #[error("ONNX 模型错误: {0}")]
  OnnxYoloError(#[from] OnnxYoloError),
  #[cfg(feature = "model_rknn")]
  #[error("RKNN 模型错误: {0}")]
  Yolo26Error(#[from] Yolo26Error),
  #[error("导出 ONNX 模型失败: {0}")]
  Export(#[from] UltralyticsError),
  #[error("不支持的模型格式: {0}")]
  UnsupportedFormat(String),
}

/// 按模型文件扩展名选择的后端
pub enum ModelWrapper {
  #[cfg(feature = "model_onnx")]
  Onnx(OnnxYolo),
  #[cfg(feature = "model_rknn")]
  Rknn(Yolo26),
}

impl ModelWrapper {
  /// 按扩展名加载模型
  ///
  /// `.pt`/`.pth` 权重先换成同名 ONNX 模型，没有时通过 `cli` 导出，`imgsz` 为导出输入尺寸。
  pub fn load(path: &Path, imgsz: u32, cli: &UltralyticsCli) -> Result<Self, ModelError> {
    let extension = path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(str::to_ascii_lowercase)
      .unwrap_or_default();
    info!("加载模型: {} (格式: {})", path.display(), extension);

    #[cfg(feature = "model_onnx")]
    {
      use crate::FromModelPathWithExtension;

      if extension == OnnxYolo::EXTENSION {
        return Ok(ModelWrapper::Onnx(OnnxYolo::from_model_path(path)?));
      }
      if WEIGHTS_EXTENSIONS.contains(&extension.as_str()) {
        let onnx = cli.export_onnx(path, imgsz)?;
        return Ok(ModelWrapper::Onnx(OnnxYolo::from_model_path(&onnx)?));
      }
    }
    #[cfg(feature = "model_rknn")]
    {
      use crate::FromModelPathWithExtension;

      if extension == Yolo26::EXTENSION {
        return Ok(ModelWrapper::Rknn(Yolo26::from_model_path(path)?));
      }
    }
    #[cfg(not(feature = "model_onnx"))]
    let _ = (imgsz, cli);

    Err(ModelError::UnsupportedFormat(format!(
      "{}（可用格式: {}）",
      path.display(),
      supported_extensions().join(", ")
    )))
  }
}

impl FromModelPath for ModelWrapper {
  type Error = ModelError;

  fn from_model_path(path: &Path) -> Result<Self, Self::Error> {
    Self::load(path, DEFAULT_IMGSZ, &UltralyticsCli::default())
  }
}

fn supported_extensions() -> Vec<&'static str> {
  #[allow(unused_mut)]
  let mut extensions = Vec::new();
  #[cfg(feature = "model_onnx")]
  extensions.extend([".onnx", ".pt", ".pth"]);
  #[cfg(feature = "model_rknn")]
  extensions.push(".rknn");
  extensions
}

impl Model for ModelWrapper {
  type Error = ModelError;

  fn class_names(&self) -> &ClassNames {
    match self {
      #[cfg(feature = "model_onnx")]
      ModelWrapper::Onnx(model) => model.class_names(),
      #[cfg(feature = "model_rknn")]
      ModelWrapper::Rknn(model) => model.class_names(),
    }
  }

  fn infer(&mut self, input: &InputImage, params: &InferParams) -> Result<DetectResult, Self::Error> {
    match self {
      #[cfg(feature = "model_onnx")]
      ModelWrapper::Onnx(model) => model.infer(input, params).map_err(ModelError::from),
      #[cfg(feature = "model_rknn")]
      ModelWrapper::Rknn(model) => model.infer(input, params).map_err(ModelError::from),
    }
  }
}
