// 该文件是 Xunjian （巡检） 项目的一部分。
// src/bin/detect.rs - 批量目标检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use xunjian::{
  config::read_config,
  model::{InferParams, ModelWrapper},
  output::InferenceResult,
  task::{JobError, run_inference},
  train::UltralyticsCli,
};

/// 读取 JSON 任务配置，对其中的图像逐张检测，并在 `__RESULT_JSON__` 行之后输出结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 任务配置 JSON，省略时从标准输入读取
  /// 字段: model, images, confidence (0.5), iou (0.45), imgsz (640)
  #[arg(value_name = "CONFIG")]
  pub config: Option<String>,

  /// Ultralytics 命令行程序，用于把 .pt/.pth 权重导出为 ONNX
  #[arg(long, default_value = "yolo", value_name = "PATH")]
  pub yolo_bin: PathBuf,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let cli = UltralyticsCli::new(args.yolo_bin);

  let result = read_config(args.config.as_deref())
    .map_err(JobError::from)
    .and_then(|value| {
      run_inference(value, |path: &Path, params: &InferParams| {
        ModelWrapper::load(path, params.imgsz, &cli)
      })
    });

  if let Err(err) = &result {
    eprintln!();
    eprintln!("检测过程中出错: {}", err);
    error!("{:?}", err);
  }

  let report = InferenceResult::from(result);
  report.emit(std::io::stdout().lock())?;
  std::process::exit(report.exit_code());
}
