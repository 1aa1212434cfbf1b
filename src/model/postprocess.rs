// 该文件是 Xunjian （巡检） 项目的一部分。
// src/model/postprocess.rs - 检测框后处理
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

use std::cmp::Ordering;

use crate::model::{ClassNames, DetectItem};

/// 两个 [x_min, y_min, x_max, y_max] 框的交并比
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = iw * ih;
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别进行非极大值抑制，结果按置信度降序排列
pub fn non_max_suppression(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

  let mut kept: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == item.class_id && iou(&k.bbox, &item.bbox) > iou_threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

/// 解析 Ultralytics 导出模型元数据中的类别表，形如 `{0: 'alto', 1: 'medio'}`
pub fn parse_class_names(raw: &str) -> ClassNames {
  let mut names = ClassNames::new();
  let body = raw.trim().trim_start_matches('{').trim_end_matches('}');
  let mut rest = body;

  while let Some((key, tail)) = rest.split_once(':') {
    let key = key.trim().trim_start_matches(',').trim();
    let tail = tail.trim_start();
    let Some(quote) = tail.chars().next().filter(|c| *c == '\'' || *c == '"') else {
      break;
    };
    let Some((name, after)) = tail[1..].split_once(quote) else {
      break;
    };
    if let Ok(id) = key.parse::<u32>() {
      names.insert(id, name.to_string());
    }
    rest = after;
  }

  names
}
