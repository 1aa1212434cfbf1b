// 该文件是 Xunjian （巡检） 项目的一部分。
// src/detection.rs - 检测结果规范化
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

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ClassNames, DetectItem};

/// 严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Alto,
  Medio,
  Bajo,
}

impl Severity {
  pub const ALTO_MIN_CONFIDENCE: f32 = 0.8;
  pub const MEDIO_MIN_CONFIDENCE: f32 = 0.6;

  pub fn as_str(&self) -> &'static str {
    match self {
      Severity::Alto => "alto",
      Severity::Medio => "medio",
      Severity::Bajo => "bajo",
    }
  }

  /// 类别名称本身即为严重程度时（忽略大小写）直接采用
  pub fn from_label(class_name: &str) -> Option<Self> {
    match class_name.to_lowercase().as_str() {
      "alto" => Some(Severity::Alto),
      "medio" => Some(Severity::Medio),
      "bajo" => Some(Severity::Bajo),
      _ => None,
    }
  }

  pub fn from_confidence(confidence: f32) -> Self {
    if confidence >= Self::ALTO_MIN_CONFIDENCE {
      Severity::Alto
    } else if confidence >= Self::MEDIO_MIN_CONFIDENCE {
      Severity::Medio
    } else {
      Severity::Bajo
    }
  }

  /// 先按类别名称，再按置信度
  ///
  /// 类别名称优先意味着检测类别体系与严重程度体系被混用：用 alto/medio/bajo
  /// 作为类别训练的模型直接给出严重程度，其他模型退回到置信度分级。
  pub fn classify(class_name: &str, confidence: f32) -> Self {
    Self::from_label(class_name).unwrap_or_else(|| Self::from_confidence(confidence))
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 左上角原点，宽高形式的像素坐标框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl BBox {
  pub fn from_corners([x1, y1, x2, y2]: [f32; 4]) -> Self {
    Self {
      x: x1,
      y: y1,
      w: x2 - x1,
      h: y2 - y1,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub filename: String,
  pub class_id: u32,
  pub class_name: String,
  pub severity: Severity,
  pub confidence: f32,
  pub bbox: BBox,
}

pub fn class_name_for(class_id: u32, names: &ClassNames) -> String {
  names
    .get(&class_id)
    .cloned()
    .unwrap_or_else(|| format!("class_{}", class_id))
}

/// 将后端给出的单个检测框转换为规范检测记录
pub fn normalize(item: &DetectItem, filename: &str, names: &ClassNames) -> Detection {
  let class_name = class_name_for(item.class_id, names);
  let severity = Severity::classify(&class_name, item.score);

  Detection {
    filename: filename.to_string(),
    class_id: item.class_id,
    class_name,
    severity,
    confidence: item.score,
    bbox: BBox::from_corners(item.bbox),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn names() -> ClassNames {
    ClassNames::from([
      (0, "Alto".to_string()),
      (1, "corrosion".to_string()),
      (2, "bajo".to_string()),
    ])
  }

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id,
      score,
      bbox,
    }
  }

  #[test]
  fn corners_become_top_left_and_size() {
    let (x1, y1, x2, y2) = (12.25f32, 7.5f32, 100.125f32, 33.0f32);
    let d = normalize(&item(1, 0.5, [x1, y1, x2, y2]), "a.jpg", &names());
    assert_eq!(d.bbox.x, x1);
    assert_eq!(d.bbox.y, y1);
    assert_eq!(d.bbox.w, x2 - x1);
    assert_eq!(d.bbox.h, y2 - y1);
  }

  #[test]
  fn unknown_class_is_synthesized() {
    let d = normalize(&item(7, 0.9, [0.0; 4]), "a.jpg", &names());
    assert_eq!(d.class_name, "class_7");
    assert_eq!(d.severity, Severity::Alto);
  }

  #[test]
  fn severity_class_name_wins_over_confidence() {
    let d = normalize(&item(0, 0.1, [0.0; 4]), "a.jpg", &names());
    assert_eq!(d.class_name, "Alto");
    assert_eq!(d.severity, Severity::Alto);

    let d = normalize(&item(2, 0.99, [0.0; 4]), "a.jpg", &names());
    assert_eq!(d.severity, Severity::Bajo);
  }

  #[test]
  fn confidence_boundaries() {
    assert_eq!(Severity::classify("corrosion", 0.8), Severity::Alto);
    assert_eq!(Severity::classify("corrosion", 0.79999), Severity::Medio);
    assert_eq!(Severity::classify("corrosion", 0.6), Severity::Medio);
    assert_eq!(Severity::classify("corrosion", 0.59999), Severity::Bajo);
    assert_eq!(Severity::classify("corrosion", 1.0), Severity::Alto);
    assert_eq!(Severity::classify("corrosion", 0.0), Severity::Bajo);
  }

  #[test]
  fn confidence_is_reported_unaltered() {
    let d = normalize(&item(1, 0.734_512_3, [0.0; 4]), "a.jpg", &names());
    assert_eq!(d.confidence, 0.734_512_3);
    assert_eq!(d.severity, Severity::Medio);
  }

  #[test]
  fn serializes_in_wire_shape() {
    let d = normalize(&item(1, 0.5, [1.0, 2.0, 4.0, 6.0]), "pilar.jpg", &names());
    assert_eq!(
      serde_json::to_value(&d).unwrap(),
      json!({
        "filename": "pilar.jpg",
        "class_id": 1,
        "class_name": "corrosion",
        "severity": "bajo",
        "confidence": 0.5,
        "bbox": {"x": 1.0, "y": 2.0, "w": 3.0, "h": 4.0}
      })
    );
  }
}
