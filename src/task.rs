// 该文件是 Bakulan 项目的一部分。
// src/task.rs - 单张推理与实时推理任务
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

use std::{
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use anyhow::{Context, anyhow};
use image::RgbImage;
use tracing::{error, info, warn};

use crate::{
  adapter::{Adapter, AdapterState, Outcome},
  frame::Frame,
  output::Render,
  pipeline::{
    AdapterEvent, CaptureEvent, CaptureOptions, CaptureSession, FramePipeline, PipelineStats,
  },
  render::ResultRenderer,
};

pub trait Task<I, A, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, adapter: A, output: O) -> Result<Self::Output, Self::Error>;
}

/// 把一次推理结果写入渲染状态；零个检测结果清空叠加层
pub fn apply_outcome(renderer: &mut ResultRenderer, outcome: Outcome) {
  match outcome {
    Outcome::Classification(result) => renderer.set_classification(result),
    Outcome::Detection(result) if result.is_empty() => renderer.clear(),
    Outcome::Detection(result) => renderer.set_results(result),
  }
}

fn renderer_for<O: Render>(output: &O, image: &RgbImage) -> ResultRenderer {
  let (width, height) = output.view_size().unwrap_or_else(|| image.dimensions());
  ResultRenderer::new(width, height)
}

pub struct OneShotTask;

impl<I, A, O, RE> Task<I, A, O> for OneShotTask
where
  I: Iterator<Item = Frame>,
  A: Adapter,
  A::Output: Into<Outcome>,
  O: Render<Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Output = Outcome;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut adapter: A, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    if adapter.state() != AdapterState::Ready {
      adapter.set_up().context("模型初始化失败")?;
    }

    let frame = input.next().ok_or_else(|| anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let image = frame.to_upright_rgb_image();

    let now = Instant::now();
    let outcome: Outcome = adapter
      .detect(frame)
      .ok_or_else(|| anyhow!("适配器未就绪"))?
      .context("推理失败")?
      .into();
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    let mut renderer = renderer_for(&output, &image);
    apply_outcome(&mut renderer, outcome.clone());
    for line in renderer.text_lines() {
      info!("{}", line);
    }
    output.render_result(&image, &renderer)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(outcome)
  }
}

/// 消费线程收到的消息
#[derive(Debug)]
enum UiMessage {
  Event(AdapterEvent),
  Capture(CaptureEvent),
}

impl From<AdapterEvent> for UiMessage {
  fn from(event: AdapterEvent) -> Self {
    UiMessage::Event(event)
  }
}

impl From<CaptureEvent> for UiMessage {
  fn from(event: CaptureEvent) -> Self {
    UiMessage::Capture(event)
  }
}

fn apply_event(renderer: &mut ResultRenderer, event: AdapterEvent) {
  match event {
    AdapterEvent::Classified(result) => {
      info!("分类结果: {}", result.display_text().replace('\n', ", "));
      apply_outcome(renderer, Outcome::Classification(result));
    }
    AdapterEvent::Detected(result) => {
      info!("检测到 {} 个目标", result.len());
      apply_outcome(renderer, Outcome::Detection(result));
    }
    AdapterEvent::SetupFailed(e) => error!("模型初始化失败: {}", e),
    AdapterEvent::FrameFailed(e) => warn!("推理失败: {}", e),
  }
}

#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  preview: bool,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      preview: true,
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_preview(mut self, preview: bool) -> Self {
    self.preview = preview;
    self
  }
}

impl<I, A, O, RE> Task<I, A, O> for ContinuousTask
where
  I: Iterator<Item = Frame> + Send + 'static,
  A: Adapter + 'static,
  A::Output: Into<AdapterEvent>,
  O: Render<Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Output = PipelineStats;
  type Error = anyhow::Error;

  fn run_task(self, input: I, adapter: A, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel::<UiMessage>();

    let pipeline = FramePipeline::spawn(adapter, tx.clone()).context("无法启动推理线程")?;
    let capture = CaptureSession::spawn(
      input,
      pipeline.submitter(),
      tx,
      CaptureOptions::default()
        .with_frame_limit(self.frame_number)
        .with_preview(self.preview),
    )
    .context("无法启动采集线程")?;

    let stopper = capture.stopper();
    if let Err(e) = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stopper.stop();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    }) {
      warn!("无法注册中断信号处理: {}", e);
    }

    let mut renderer = ResultRenderer::new(0, 0);
    let mut last_image: Option<RgbImage> = None;
    let mut frame_index = 0usize;
    let mut now = Instant::now();

    for message in rx.iter() {
      match message {
        UiMessage::Event(event) => apply_event(&mut renderer, event),
        UiMessage::Capture(CaptureEvent::Preview(preview)) => {
          frame_index += 1;
          info!("处理第 {} 帧图像", frame_index);
          let image = preview.image();
          let (width, height) = output.view_size().unwrap_or_else(|| image.dimensions());
          renderer.set_view_size(width, height);
          output.render_result(image, &renderer)?;
          renderer.take_redraw();
          info!("渲染完成，耗时: {:.2?}", now.elapsed());
          now = Instant::now();
          last_image = Some(image.clone());
        }
        UiMessage::Capture(CaptureEvent::Ended(captured)) => {
          if self.frame_number.is_some_and(|n| captured >= n) {
            info!("达到指定帧数 {}, 退出任务循环", captured);
          } else {
            warn!("输入结束或中断信号接收，退出任务循环");
          }
          break;
        }
      }
    }

    capture.join();
    let stats = pipeline.finish();
    // 收尾：最后一帧的结果可能在采集结束后才到达
    for message in rx.try_iter() {
      if let UiMessage::Event(event) = message {
        apply_event(&mut renderer, event);
      }
    }
    if renderer.take_redraw()
      && let Some(image) = &last_image
    {
      output.render_result(image, &renderer)?;
    }

    info!(
      "任务完成，退出: 提交 {} 帧, 推理 {} 帧, 丢弃 {} 帧",
      stats.submitted, stats.analyzed, stats.dropped
    );
    Ok(stats)
  }
}
