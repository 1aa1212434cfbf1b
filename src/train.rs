// 该文件是 Xunjian （巡检） 项目的一部分。
// src/train.rs - 训练后端
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

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use thiserror::Error;
use tracing::{error, info};

use crate::config::TrainJobConfig;

/// 每次训练固定使用的运行参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainParams {
  /// 早停耐心（轮）
  pub patience: u32,
  pub save: bool,
  /// 检查点保存间隔（轮）
  pub save_period: u32,
  pub plots: bool,
  pub verbose: bool,
}

impl Default for TrainParams {
  fn default() -> Self {
    Self {
      patience: 50,
      save: true,
      save_period: 10,
      plots: true,
      verbose: true,
    }
  }
}

/// 训练后端：完成时权重写入 `{project}/{name}`
pub trait Trainer {
  type Error;
  fn train(&self, job: &TrainJobConfig, params: &TrainParams) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum UltralyticsError {
  #[error("无法执行 {program} (请确保已安装 ultralytics): {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },
  #[error("ultralytics 命令异常退出: {0}")]
  Failed(ExitStatus),
  #[error("导出完成但找不到 ONNX 模型: {}", .0.display())]
  MissingExport(PathBuf),
}

/// Ultralytics 命令行 (`yolo ...`)，用于训练与导出 ONNX 模型
#[derive(Debug, Clone)]
pub struct UltralyticsCli {
  program: PathBuf,
}

impl Default for UltralyticsCli {
  fn default() -> Self {
    Self::new("yolo")
  }
}

impl UltralyticsCli {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
    }
  }

  /// 导出权重对应的 ONNX 文件：与权重同目录、同名
  pub fn onnx_path(weights: &Path) -> PathBuf {
    weights.with_extension("onnx")
  }

  /// 取得权重对应的 ONNX 模型，没有现成文件时调用 `yolo export` 生成一次
  pub fn export_onnx(&self, weights: &Path, imgsz: u32) -> Result<PathBuf, UltralyticsError> {
    let onnx = Self::onnx_path(weights);
    if onnx.exists() {
      info!("使用已导出的 ONNX 模型: {}", onnx.display());
      return Ok(onnx);
    }

    self.run(&[
      "export".to_string(),
      format!("model={}", weights.display()),
      "format=onnx".to_string(),
      format!("imgsz={}", imgsz),
    ])?;

    if onnx.exists() {
      Ok(onnx)
    } else {
      Err(UltralyticsError::MissingExport(onnx))
    }
  }

  /// `key=value` 形式的命令行参数
  pub fn arguments(job: &TrainJobConfig, params: &TrainParams) -> Vec<String> {
    vec![
      "detect".to_string(),
      "train".to_string(),
      format!("model={}", job.model.display()),
      format!("data={}", job.data.display()),
      format!("epochs={}", job.epochs),
      format!("imgsz={}", job.imgsz),
      format!("batch={}", job.batch),
      format!("name={}", job.name),
      format!("project={}", job.project),
      format!("patience={}", params.patience),
      format!("save={}", python_bool(params.save)),
      format!("save_period={}", params.save_period),
      format!("plots={}", python_bool(params.plots)),
      format!("verbose={}", python_bool(params.verbose)),
    ]
  }
}

impl UltralyticsCli {
  fn run(&self, args: &[String]) -> Result<(), UltralyticsError> {
    info!("执行: {} {}", self.program.display(), args.join(" "));

    // 标准输出与错误输出直接继承，进度实时可见
    let status = Command::new(&self.program)
      .args(args)
      .status()
      .map_err(|source| UltralyticsError::Spawn {
        program: self.program.display().to_string(),
        source,
      })?;

    if status.success() {
      info!("ultralytics 命令正常退出");
      Ok(())
    } else {
      error!("ultralytics 命令异常退出: {}", status);
      Err(UltralyticsError::Failed(status))
    }
  }
}

fn python_bool(value: bool) -> &'static str {
  if value { "True" } else { "False" }
}

impl Trainer for UltralyticsCli {
  type Error = UltralyticsError;

  fn train(&self, job: &TrainJobConfig, params: &TrainParams) -> Result<(), Self::Error> {
    self.run(&Self::arguments(job, params))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn job() -> TrainJobConfig {
    TrainJobConfig::from_value(json!({"model": "yolo11n.pt", "data": "data/corrosion.yaml"})).unwrap()
  }

  #[test]
  fn fixed_params() {
    let params = TrainParams::default();
    assert_eq!(params.patience, 50);
    assert_eq!(params.save_period, 10);
    assert!(params.save && params.plots && params.verbose);
  }

  #[test]
  fn cli_arguments_carry_job_and_params() {
    let args = UltralyticsCli::arguments(&job(), &TrainParams::default());
    assert_eq!(&args[..2], ["detect", "train"]);
    for expected in [
      "model=yolo11n.pt",
      "data=data/corrosion.yaml",
      "epochs=100",
      "imgsz=640",
      "batch=16",
      "name=rust_detection",
      "project=./peso",
      "patience=50",
      "save=True",
      "save_period=10",
      "plots=True",
      "verbose=True",
    ] {
      assert!(args.iter().any(|a| a == expected), "缺少参数 {}", expected);
    }
  }

  #[test]
  fn missing_program_is_a_spawn_error() {
    let trainer = UltralyticsCli::new("/nonexistent/xunjian-yolo");
    let err = trainer.train(&job(), &TrainParams::default()).unwrap_err();
    assert!(matches!(err, UltralyticsError::Spawn { .. }));
  }

  #[test]
  fn existing_onnx_sibling_skips_export() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("best.pt");
    std::fs::write(&weights, b"pt").unwrap();
    std::fs::write(dir.path().join("best.onnx"), b"onnx").unwrap();

    // 程序不存在，若执行了导出会返回 Spawn 错误
    let cli = UltralyticsCli::new("/nonexistent/xunjian-yolo");
    assert_eq!(cli.export_onnx(&weights, 640).unwrap(), dir.path().join("best.onnx"));
  }

  #[test]
  fn export_without_program_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("best.pth");
    std::fs::write(&weights, b"pt").unwrap();

    let cli = UltralyticsCli::new("/nonexistent/xunjian-yolo");
    let err = cli.export_onnx(&weights, 640).unwrap_err();
    assert!(matches!(err, UltralyticsError::Spawn { .. }));
  }

  #[cfg(unix)]
  fn script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("yolo");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  #[cfg(unix)]
  #[test]
  fn export_runs_once_and_returns_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("best.pt");
    std::fs::write(&weights, b"pt").unwrap();
    let log = dir.path().join("calls.log");
    let program = script(
      dir.path(),
      &format!(
        r#"echo "$@" >> '{}'
for arg in "$@"; do
  case "$arg" in
    model=*) model="${{arg#model=}}" ;;
  esac
done
touch "${{model%.*}}.onnx""#,
        log.display()
      ),
    );

    let cli = UltralyticsCli::new(program);
    let onnx = cli.export_onnx(&weights, 320).unwrap();
    assert_eq!(onnx, dir.path().join("best.onnx"));
    assert!(onnx.exists());

    // 第二次直接复用已导出的文件
    cli.export_onnx(&weights, 320).unwrap();
    let calls = std::fs::read_to_string(&log).unwrap();
    assert_eq!(calls.lines().count(), 1);
    assert_eq!(
      calls.trim(),
      format!("export model={} format=onnx imgsz=320", weights.display())
    );
  }

  #[cfg(unix)]
  #[test]
  fn export_without_output_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("best.pt");
    std::fs::write(&weights, b"pt").unwrap();

    let cli = UltralyticsCli::new(script(dir.path(), "exit 0"));
    let err = cli.export_onnx(&weights, 640).unwrap_err();
    assert!(matches!(err, UltralyticsError::MissingExport(ref p) if p.ends_with("best.onnx")));
  }

  #[cfg(unix)]
  #[test]
  fn failing_export_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("best.pt");
    std::fs::write(&weights, b"pt").unwrap();

    let cli = UltralyticsCli::new(script(dir.path(), "exit 3"));
    let err = cli.export_onnx(&weights, 640).unwrap_err();
    assert!(matches!(err, UltralyticsError::Failed(status) if status.code() == Some(3)));
  }
}
