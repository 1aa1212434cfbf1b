// 该文件是 Xunjian （巡检） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime YOLO 检测后端
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

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{ArrayView2, ArrayView3, Axis, s};
use ort::session::Session;
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  FromModelPath, FromModelPathWithExtension,
  input::{ImageError, InputImage},
  model::{
    ClassNames, DetectItem, DetectResult, InferParams, Model,
    postprocess::{non_max_suppression, parse_class_names},
  },
};

/// Ultralytics 导出模型在元数据中保存类别表的键
const NAMES_METADATA_KEY: &str = "names";
/// 输出每列前 4 个值为 (cx, cy, w, h)，其后为各类别得分
const BOX_VALUES: usize = 4;
/// 填充区域的灰度值，与 Ultralytics 预处理一致
const PAD_VALUE: u8 = 114;

#[derive(Error, Debug)]
pub enum OnnxYoloError {
  #[error("ONNX Runtime 错误: {0}")]
  Runtime(String),
  #[error("图像错误: {0}")]
  ImageError(#[from] ImageError),
  #[error("图像尺寸为空: {0}x{1}")]
  EmptyImage(u32, u32),
  #[error("无效的推理尺寸: {0}")]
  InvalidImageSize(u32),
  #[error("输出形状不符合预期: {0:?}")]
  UnexpectedShape(Vec<usize>),
  #[error("张量形状错误: {0}")]
  ShapeError(#[from] ndarray::ShapeError),
}

impl OnnxYoloError {
  fn runtime(err: impl std::fmt::Display) -> Self {
    OnnxYoloError::Runtime(err.to_string())
  }
}

/// 保持宽高比缩放并居中填充到 `imgsz × imgsz`
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Letterbox {
  ratio: f32,
  scaled_w: u32,
  scaled_h: u32,
  pad_x: u32,
  pad_y: u32,
  src_w: u32,
  src_h: u32,
}

impl Letterbox {
  pub(crate) fn new(src_w: u32, src_h: u32, imgsz: u32) -> Self {
    let ratio = (imgsz as f32 / src_w as f32).min(imgsz as f32 / src_h as f32);
    let scaled_w = ((src_w as f32 * ratio).round() as u32).clamp(1, imgsz);
    let scaled_h = ((src_h as f32 * ratio).round() as u32).clamp(1, imgsz);
    // 奇数余量时多出的一行/列放在右下
    let pad_x = ((imgsz - scaled_w) as f32 / 2.0 - 0.1).round().max(0.0) as u32;
    let pad_y = ((imgsz - scaled_h) as f32 / 2.0 - 0.1).round().max(0.0) as u32;
    Self {
      ratio,
      scaled_w,
      scaled_h,
      pad_x,
      pad_y,
      src_w,
      src_h,
    }
  }

  pub(crate) fn apply(&self, image: &RgbImage, imgsz: u32) -> RgbImage {
    let resized = imageops::resize(image, self.scaled_w, self.scaled_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(imgsz, imgsz, Rgb([PAD_VALUE; 3]));
    imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
    canvas
  }

  /// 网络输入坐标映射回原图像素，并限制在图像范围内
  fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
    (
      ((x - self.pad_x as f32) / self.ratio).clamp(0.0, self.src_w as f32),
      ((y - self.pad_y as f32) / self.ratio).clamp(0.0, self.src_h as f32),
    )
  }
}

/// 解码 `[4 + nc, N]` 输出：取最高类别得分，按置信度过滤，映射回原图后做 NMS
pub(crate) fn decode_output(
  view: ArrayView2<f32>,
  letterbox: &Letterbox,
  params: &InferParams,
) -> Vec<DetectItem> {
  let mut candidates = Vec::new();
  for column in view.axis_iter(Axis(1)) {
    let Some((class_id, score)) = column
      .slice(s![BOX_VALUES..])
      .iter()
      .copied()
      .enumerate()
      .max_by(|(_, a), (_, b)| a.total_cmp(b))
    else {
      continue;
    };

    if score < params.confidence {
      continue;
    }

    let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
    let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
    let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);

    candidates.push(DetectItem {
      class_id: class_id as u32,
      score,
      bbox: [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)],
    });
  }

  debug!("置信度过滤后候选框: {}", candidates.len());
  non_max_suppression(candidates, params.iou)
}

/// 取出 `[B, 4 + nc, N]` 输出中的第一批
pub(crate) fn first_batch<'a>(shape: &[i64], data: &'a [f32]) -> Result<ArrayView2<'a, f32>, OnnxYoloError> {
  let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
  if dims.len() != 3 || dims[0] == 0 || dims[1] <= BOX_VALUES {
    return Err(OnnxYoloError::UnexpectedShape(dims));
  }
  let view = ArrayView3::from_shape((dims[0], dims[1], dims[2]), data)?;
  Ok(view.index_axis_move(Axis(0), 0))
}

/// YOLOv8 及之后的 Ultralytics 检测模型（输出 `[1, 4 + nc, N]`）
pub struct OnnxYolo {
  session: Session,
  names: ClassNames,
}

impl FromModelPathWithExtension for OnnxYolo {
  const EXTENSION: &'static str = "onnx";
}

impl FromModelPath for OnnxYolo {
  type Error = OnnxYoloError;

  fn from_model_path(path: &Path) -> Result<Self, Self::Error> {
    info!("创建 ONNX Runtime 会话: {}", path.display());
    let session = Session::builder()
      .map_err(OnnxYoloError::runtime)?
      .commit_from_file(path)
      .map_err(OnnxYoloError::runtime)?;

    let names = match session
      .metadata()
      .and_then(|metadata| metadata.custom(NAMES_METADATA_KEY))
    {
      Ok(Some(raw)) => parse_class_names(&raw),
      Ok(None) => {
        warn!("模型元数据中没有类别表，类别名称将按编号生成");
        ClassNames::new()
      }
      Err(e) => {
        warn!("读取模型元数据失败: {}", e);
        ClassNames::new()
      }
    };
    debug!("模型类别: {:?}", names);

    Ok(Self { session, names })
  }
}

impl Model for OnnxYolo {
  type Error = OnnxYoloError;

  fn class_names(&self) -> &ClassNames {
    &self.names
  }

  fn infer(&mut self, input: &InputImage, params: &InferParams) -> Result<DetectResult, Self::Error> {
    if params.imgsz == 0 {
      return Err(OnnxYoloError::InvalidImageSize(params.imgsz));
    }
    let rgb = input.to_rgb()?;
    if rgb.width() == 0 || rgb.height() == 0 {
      return Err(OnnxYoloError::EmptyImage(rgb.width(), rgb.height()));
    }

    let imgsz = params.imgsz as usize;
    let letterbox = Letterbox::new(rgb.width(), rgb.height(), params.imgsz);
    let padded = letterbox.apply(&rgb, params.imgsz);

    // HWC u8 -> CHW f32
    let plane = imgsz * imgsz;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in padded.enumerate_pixels() {
      let idx = y as usize * imgsz + x as usize;
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    let shape = vec![1i64, 3, imgsz as i64, imgsz as i64];
    let tensor = Tensor::from_array((shape, data)).map_err(OnnxYoloError::runtime)?;

    debug!("执行模型推理");
    let outputs = self
      .session
      .run(ort::inputs![tensor])
      .map_err(OnnxYoloError::runtime)?;
    let (shape_out, data_out) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(OnnxYoloError::runtime)?;

    let view = first_batch(shape_out, data_out)?;
    let items = decode_output(view, &letterbox, params);
    debug!("检测到 {} 个物体", items.len());

    Ok(DetectResult::from(items))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array2;

  fn params(confidence: f32) -> InferParams {
    InferParams {
      confidence,
      iou: 0.45,
      imgsz: 100,
    }
  }

  /// 按列构造 `[4 + nc, N]` 输出
  fn output(columns: &[[f32; 6]]) -> Array2<f32> {
    let mut out = Array2::zeros((6, columns.len()));
    for (i, column) in columns.iter().enumerate() {
      for (row, value) in column.iter().enumerate() {
        out[[row, i]] = *value;
      }
    }
    out
  }

  #[test]
  fn letterbox_keeps_aspect_ratio() {
    let lb = Letterbox::new(200, 100, 100);
    assert_eq!(lb.ratio, 0.5);
    assert_eq!((lb.scaled_w, lb.scaled_h), (100, 50));
    assert_eq!((lb.pad_x, lb.pad_y), (0, 25));

    let square = Letterbox::new(640, 640, 640);
    assert_eq!((square.ratio, square.pad_x, square.pad_y), (1.0, 0, 0));
  }

  #[test]
  fn letterbox_pads_with_gray() {
    let image = RgbImage::from_pixel(200, 100, Rgb([0, 200, 0]));
    let lb = Letterbox::new(200, 100, 100);
    let padded = lb.apply(&image, 100);
    assert_eq!(padded.dimensions(), (100, 100));
    assert_eq!(padded.get_pixel(50, 10), &Rgb([PAD_VALUE; 3]));
    assert_eq!(padded.get_pixel(50, 50), &Rgb([0, 200, 0]));
    assert_eq!(padded.get_pixel(50, 90), &Rgb([PAD_VALUE; 3]));
  }

  #[test]
  fn decodes_columns_back_to_source_pixels() {
    let lb = Letterbox::new(200, 100, 100);
    let out = output(&[
      [50.0, 50.0, 20.0, 10.0, 0.1, 0.9],
      [30.0, 40.0, 10.0, 10.0, 0.3, 0.2],
      [98.0, 50.0, 20.0, 10.0, 0.7, 0.1],
    ]);

    let items = decode_output(out.view(), &lb, &params(0.5));
    assert_eq!(items.len(), 2);

    assert_eq!(items[0].class_id, 1);
    assert_eq!(items[0].score, 0.9);
    assert_eq!(items[0].bbox, [80.0, 40.0, 120.0, 60.0]);

    // 右侧越界部分被截断到图像宽度
    assert_eq!(items[1].class_id, 0);
    assert_eq!(items[1].score, 0.7);
    assert_eq!(items[1].bbox, [176.0, 40.0, 200.0, 60.0]);
  }

  #[test]
  fn out_of_frame_boxes_never_invert() {
    let lb = Letterbox::new(100, 100, 100);
    let out = output(&[
      [120.0, 50.0, 10.0, 10.0, 0.9, 0.0],
      [50.0, -30.0, 10.0, 10.0, 0.0, 0.9],
      [50.0, 50.0, -8.0, -6.0, 0.8, 0.0],
    ]);

    let items = decode_output(out.view(), &lb, &params(0.5));
    assert_eq!(items.len(), 3);
    for item in &items {
      let [x1, y1, x2, y2] = item.bbox;
      assert!(x1 <= x2 && y1 <= y2, "{:?}", item.bbox);
      assert!(x1 >= 0.0 && y1 >= 0.0 && x2 <= 100.0 && y2 <= 100.0, "{:?}", item.bbox);
    }
    assert_eq!(items[0].bbox, [100.0, 45.0, 100.0, 55.0]);
    assert_eq!(items[2].bbox, [46.0, 47.0, 54.0, 53.0]);
  }

  #[test]
  fn output_shape_is_checked() {
    let data = vec![0.0f32; 18];
    assert_eq!(first_batch(&[1, 6, 3], &data).unwrap().dim(), (6, 3));

    for shape in [&[0i64, 6, 3][..], &[1, 4, 3][..], &[6, 3][..], &[1, -1, 3][..]] {
      assert!(matches!(
        first_batch(shape, &[]),
        Err(OnnxYoloError::UnexpectedShape(_))
      ));
    }
    assert!(matches!(
      first_batch(&[1, 6, 4], &data),
      Err(OnnxYoloError::ShapeError(_))
    ));
  }

  #[test]
  fn confidence_threshold_is_inclusive() {
    let lb = Letterbox::new(100, 100, 100);
    let out = output(&[[10.0, 10.0, 4.0, 4.0, 0.5, 0.0]]);
    assert_eq!(decode_output(out.view(), &lb, &params(0.5)).len(), 1);
    assert!(decode_output(out.view(), &lb, &params(0.51)).is_empty());
  }
}
