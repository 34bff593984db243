// 该文件是 Bakulan 项目的一部分。
// src/pipeline.rs - 帧流水线：最新帧优先的推理调度与采集线程
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
  io,
  sync::{
    Arc, Condvar, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc::Sender,
  },
  thread::{self, JoinHandle},
};

use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::{
  adapter::{Adapter, AdapterState, Outcome},
  frame::Frame,
  model::{ClassificationResult, DetectResult},
};

/// 预览帧最多积压的数量，超过后采集端跳过预览
pub const MAX_PENDING_PREVIEWS: usize = 2;

struct SlotState<T> {
  value: Option<T>,
  closed: bool,
}

/// 容量为 1 的覆盖式槽位：新值替换尚未取走的旧值
pub struct LatestSlot<T> {
  state: Mutex<SlotState<T>>,
  ready: Condvar,
}

impl<T> Default for LatestSlot<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> LatestSlot<T> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(SlotState {
        value: None,
        closed: false,
      }),
      ready: Condvar::new(),
    }
  }

  /// 放入新值并返回被替换的旧值；槽位关闭后原样退回
  pub fn put(&self, value: T) -> Result<Option<T>, T> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.closed {
      return Err(value);
    }
    let replaced = state.value.replace(value);
    self.ready.notify_one();
    Ok(replaced)
  }

  /// 阻塞直到有值；槽位关闭且为空后返回 None
  pub fn take(&self) -> Option<T> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
      if let Some(value) = state.value.take() {
        return Some(value);
      }
      if state.closed {
        return None;
      }
      state = self
        .ready
        .wait(state)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  /// 关闭槽位，返回尚未取走的值
  pub fn close(&self) -> Option<T> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.closed = true;
    self.ready.notify_all();
    state.value.take()
  }

  /// 拒绝新值，但保留尚未取走的值
  pub fn seal(&self) {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.closed = true;
    self.ready.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .closed
  }
}

/// 适配器产生的事件，送往消费端（UI 线程）
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
  SetupFailed(String),
  Classified(ClassificationResult),
  Detected(DetectResult),
  FrameFailed(String),
}

impl From<ClassificationResult> for AdapterEvent {
  fn from(result: ClassificationResult) -> Self {
    AdapterEvent::Classified(result)
  }
}

impl From<DetectResult> for AdapterEvent {
  fn from(result: DetectResult) -> Self {
    AdapterEvent::Detected(result)
  }
}

impl From<Outcome> for AdapterEvent {
  fn from(outcome: Outcome) -> Self {
    match outcome {
      Outcome::Classification(result) => AdapterEvent::Classified(result),
      Outcome::Detection(result) => AdapterEvent::Detected(result),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
  pub submitted: usize,
  pub analyzed: usize,
  pub dropped: usize,
}

#[derive(Default)]
struct Counters {
  submitted: AtomicUsize,
  analyzed: AtomicUsize,
  dropped: AtomicUsize,
}

impl Counters {
  fn snapshot(&self) -> PipelineStats {
    PipelineStats {
      submitted: self.submitted.load(Ordering::Relaxed),
      analyzed: self.analyzed.load(Ordering::Relaxed),
      dropped: self.dropped.load(Ordering::Relaxed),
    }
  }
}

/// 向流水线提交帧的句柄，可在采集线程中使用
#[derive(Clone)]
pub struct FrameSubmitter {
  slot: Arc<LatestSlot<Frame>>,
  counters: Arc<Counters>,
}

impl FrameSubmitter {
  /// 提交一帧；若已有帧等待，旧帧被丢弃并归还帧池。流水线关闭后返回 false
  pub fn submit(&self, frame: Frame) -> bool {
    match self.slot.put(frame) {
      Ok(replaced) => {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = replaced {
          self.counters.dropped.fetch_add(1, Ordering::Relaxed);
          debug!("丢弃未处理的帧 {}x{}", old.width(), old.height());
        }
        true
      }
      Err(_) => false,
    }
  }
}

/// 为单个适配器服务的推理线程
pub struct FramePipeline {
  submitter: FrameSubmitter,
  worker: Option<JoinHandle<()>>,
}

impl FramePipeline {
  pub fn spawn<A, T>(mut adapter: A, consumer: Sender<T>) -> io::Result<Self>
  where
    A: Adapter + 'static,
    A::Output: Into<AdapterEvent>,
    T: From<AdapterEvent> + Send + 'static,
  {
    let submitter = FrameSubmitter {
      slot: Arc::new(LatestSlot::new()),
      counters: Arc::new(Counters::default()),
    };
    let slot = submitter.slot.clone();
    let counters = submitter.counters.clone();

    let worker = thread::Builder::new()
      .name("bakulan-analyzer".into())
      .spawn(move || {
        let setup = match adapter.state() {
          AdapterState::Uninitialized => adapter.set_up().err(),
          _ => adapter.setup_error().cloned(),
        };
        if let Some(e) = setup {
          error!("适配器不可用: {}", e);
          let _ = consumer.send(T::from(AdapterEvent::SetupFailed(e.to_string())));
        }

        while let Some(frame) = slot.take() {
          let event: AdapterEvent = match adapter.detect(frame) {
            None => continue,
            Some(Ok(output)) => output.into(),
            Some(Err(e)) => {
              warn!("单帧推理失败: {}", e);
              AdapterEvent::FrameFailed(e.to_string())
            }
          };
          counters.analyzed.fetch_add(1, Ordering::Relaxed);
          if consumer.send(T::from(event)).is_err() {
            debug!("消费端已关闭, 丢弃推理结果");
          }
        }
        info!("推理线程退出");
      })?;

    Ok(Self {
      submitter,
      worker: Some(worker),
    })
  }

  pub fn submit(&self, frame: Frame) -> bool {
    self.submitter.submit(frame)
  }

  pub fn submitter(&self) -> FrameSubmitter {
    self.submitter.clone()
  }

  pub fn stats(&self) -> PipelineStats {
    self.submitter.counters.snapshot()
  }

  /// 停止接收新帧，等待正在进行的推理完成后回收线程
  pub fn shutdown(mut self) -> PipelineStats {
    self.stop();
    self.stats()
  }

  /// 停止接收新帧，并等待已提交的最后一帧处理完毕
  pub fn finish(mut self) -> PipelineStats {
    self.submitter.slot.seal();
    self.join_worker();
    self.stats()
  }

  fn stop(&mut self) {
    if let Some(pending) = self.submitter.slot.close() {
      self.submitter.counters.dropped.fetch_add(1, Ordering::Relaxed);
      drop(pending);
    }
    self.join_worker();
  }

  fn join_worker(&mut self) {
    if let Some(worker) = self.worker.take()
      && worker.join().is_err()
    {
      error!("推理线程异常退出");
    }
  }
}

impl Drop for FramePipeline {
  fn drop(&mut self) {
    self.stop();
  }
}

/// 送往消费端的预览帧；释放时归还预览配额
pub struct PreviewFrame {
  image: RgbImage,
  pending: Arc<AtomicUsize>,
}

impl PreviewFrame {
  pub fn image(&self) -> &RgbImage {
    &self.image
  }
}

impl Drop for PreviewFrame {
  fn drop(&mut self) {
    self.pending.fetch_sub(1, Ordering::AcqRel);
  }
}

impl std::fmt::Debug for PreviewFrame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PreviewFrame")
      .field("dimensions", &self.image.dimensions())
      .finish()
  }
}

#[derive(Debug)]
pub enum CaptureEvent {
  Preview(PreviewFrame),
  /// 输入源耗尽或被停止，携带已采集的帧数
  Ended(usize),
}

#[derive(Clone)]
pub struct CaptureStopper(Arc<AtomicBool>);

impl CaptureStopper {
  pub fn stop(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

/// 采集线程：从输入源拉取帧，转发预览并提交给流水线
pub struct CaptureSession {
  stopper: CaptureStopper,
  handle: Option<JoinHandle<usize>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureOptions {
  frame_limit: Option<usize>,
  preview: bool,
}

impl CaptureOptions {
  pub fn with_frame_limit(mut self, frame_limit: Option<usize>) -> Self {
    self.frame_limit = frame_limit;
    self
  }

  pub fn with_preview(mut self, preview: bool) -> Self {
    self.preview = preview;
    self
  }
}

impl CaptureSession {
  pub fn spawn<I, T>(
    input: I,
    submitter: FrameSubmitter,
    consumer: Sender<T>,
    options: CaptureOptions,
  ) -> io::Result<Self>
  where
    I: Iterator<Item = Frame> + Send + 'static,
    T: From<CaptureEvent> + Send + 'static,
  {
    let stopper = CaptureStopper(Arc::new(AtomicBool::new(false)));
    let stop = stopper.clone();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = thread::Builder::new()
      .name("bakulan-capture".into())
      .spawn(move || {
        let mut captured = 0;
        for frame in input {
          if stop.is_stopped() {
            info!("采集已停止");
            break;
          }
          captured += 1;

          if options.preview {
            if pending.load(Ordering::Acquire) < MAX_PENDING_PREVIEWS {
              pending.fetch_add(1, Ordering::AcqRel);
              let preview = PreviewFrame {
                image: frame.to_upright_rgb_image(),
                pending: pending.clone(),
              };
              if consumer.send(T::from(CaptureEvent::Preview(preview))).is_err() {
                warn!("消费端已关闭, 停止采集");
                break;
              }
            } else {
              debug!("预览积压, 跳过第 {} 帧预览", captured);
            }
          }

          if !submitter.submit(frame) {
            info!("流水线已关闭, 停止采集");
            break;
          }
          if options.frame_limit.is_some_and(|n| captured >= n) {
            info!("达到指定帧数 {}, 停止采集", captured);
            break;
          }
        }
        let _ = consumer.send(T::from(CaptureEvent::Ended(captured)));
        captured
      })?;

    Ok(Self {
      stopper,
      handle: Some(handle),
    })
  }

  pub fn stopper(&self) -> CaptureStopper {
    self.stopper.clone()
  }

  /// 停止采集并返回已采集的帧数
  pub fn join(mut self) -> usize {
    self.stopper.stop();
    match self.handle.take().map(JoinHandle::join) {
      Some(Ok(captured)) => captured,
      Some(Err(_)) => {
        error!("采集线程异常退出");
        0
      }
      None => 0,
    }
  }
}

impl Drop for CaptureSession {
  fn drop(&mut self) {
    self.stopper.stop();
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::mpsc::{self, Receiver},
    time::Duration,
  };

  use image::Rgb;

  use super::*;
  use crate::{
    adapter::{ClassificationAdapter, testing::MockBackend},
    frame::{FramePool, PixelFormat, Rotation},
    model::{Category, InferenceError, InferenceOptions, ModelLoadError, UnavailableBackend},
  };

  const TIMEOUT: Duration = Duration::from_secs(5);

  /// 每次推理先报告帧编号，然后等待放行
  struct GatedAdapter {
    started: Sender<u8>,
    gate: Receiver<()>,
  }

  impl Adapter for GatedAdapter {
    type Output = ClassificationResult;

    fn set_up(&mut self) -> Result<(), ModelLoadError> {
      Ok(())
    }

    fn detect(&mut self, frame: Frame) -> Option<Result<Self::Output, InferenceError>> {
      let id = frame.as_bytes()[0];
      drop(frame);
      self.started.send(id).unwrap();
      self.gate.recv_timeout(TIMEOUT).unwrap();
      let options = InferenceOptions::new("m.onnx");
      Some(Ok(ClassificationResult::from_categories(
        vec![Category::new(id.to_string(), 1.0)],
        &options,
      )))
    }

    fn state(&self) -> AdapterState {
      AdapterState::Ready
    }

    fn setup_error(&self) -> Option<&ModelLoadError> {
      None
    }
  }

  fn frame(id: u8) -> Frame {
    Frame::from_rgb_image(RgbImage::from_pixel(1, 1, Rgb([id; 3])), Rotation::Deg0)
  }

  fn label_of(event: &AdapterEvent) -> String {
    match event {
      AdapterEvent::Classified(result) => result.top().unwrap().label.clone(),
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn slot_keeps_only_latest_value() {
    let slot = LatestSlot::new();
    assert_eq!(slot.put(1), Ok(None));
    assert_eq!(slot.put(2), Ok(Some(1)));
    assert_eq!(slot.take(), Some(2));
    assert_eq!(slot.put(3), Ok(None));
    assert_eq!(slot.close(), Some(3));
    assert!(slot.is_closed());
    assert_eq!(slot.put(4), Err(4));
    assert_eq!(slot.take(), None);
  }

  #[test]
  fn sealed_slot_drains_last_value() {
    let slot = LatestSlot::new();
    slot.put(1).unwrap();
    slot.seal();
    assert_eq!(slot.put(2), Err(2));
    assert_eq!(slot.take(), Some(1));
    assert_eq!(slot.take(), None);
  }

  #[test]
  fn slot_take_wakes_on_put() {
    let slot = Arc::new(LatestSlot::new());
    let reader = {
      let slot = slot.clone();
      thread::spawn(move || slot.take())
    };
    thread::sleep(Duration::from_millis(20));
    slot.put(7).unwrap();
    assert_eq!(reader.join().unwrap(), Some(7));
  }

  #[test]
  fn latest_frame_wins_while_busy() {
    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let (events_tx, events_rx) = mpsc::channel::<AdapterEvent>();
    let adapter = GatedAdapter {
      started: started_tx,
      gate: gate_rx,
    };
    let pipeline = FramePipeline::spawn(adapter, events_tx).unwrap();

    assert!(pipeline.submit(frame(1)));
    assert_eq!(started_rx.recv_timeout(TIMEOUT).unwrap(), 1);

    // 第一帧处理中，后续帧只保留最新的一帧
    let pool = FramePool::new(1);
    let second = pool
      .fill(1, 1, PixelFormat::Rgb8, Rotation::Deg0, &[2, 2, 2])
      .unwrap();
    assert!(pipeline.submit(second));
    assert!(pipeline.submit(frame(3)));
    assert_eq!(pool.available(), 1);

    gate_tx.send(()).unwrap();
    assert_eq!(started_rx.recv_timeout(TIMEOUT).unwrap(), 3);
    gate_tx.send(()).unwrap();

    let first = events_rx.recv_timeout(TIMEOUT).unwrap();
    let next = events_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(label_of(&first), "1");
    assert_eq!(label_of(&next), "3");

    let stats = pipeline.shutdown();
    assert_eq!(
      stats,
      PipelineStats {
        submitted: 3,
        analyzed: 2,
        dropped: 1
      }
    );
    assert!(started_rx.try_recv().is_err());
  }

  #[test]
  fn setup_failure_is_reported_once() {
    let adapter =
      ClassificationAdapter::new(InferenceOptions::new("m.onnx"), Arc::new(UnavailableBackend));
    let (events_tx, events_rx) = mpsc::channel::<AdapterEvent>();
    let pipeline = FramePipeline::spawn(adapter, events_tx).unwrap();

    pipeline.submit(frame(1));
    pipeline.submit(frame(2));
    let stats = pipeline.shutdown();

    let events: Vec<AdapterEvent> = events_rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], AdapterEvent::SetupFailed(_)));
    assert_eq!(stats.analyzed, 0);
  }

  #[test]
  fn frame_failure_keeps_pipeline_running() {
    let (backend, _) = MockBackend::classifier(vec![Category::new("cat", 0.92)]);
    if let Some(session) = backend.classifier.lock().unwrap().as_mut() {
      session.fail_next = true;
    }
    let adapter = ClassificationAdapter::new(InferenceOptions::new("m.onnx"), backend);
    let (events_tx, events_rx) = mpsc::channel::<AdapterEvent>();
    let pipeline = FramePipeline::spawn(adapter, events_tx).unwrap();

    pipeline.submit(frame(1));
    let failed = events_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(failed, AdapterEvent::FrameFailed(_)));

    pipeline.submit(frame(2));
    let classified = events_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(label_of(&classified), "cat");
    pipeline.shutdown();
  }

  #[test]
  fn capture_forwards_previews_and_frames() {
    let (backend, _) = MockBackend::classifier(vec![Category::new("cat", 0.92)]);
    let adapter = ClassificationAdapter::new(InferenceOptions::new("m.onnx"), backend);
    let (events_tx, _events_rx) = mpsc::channel::<AdapterEvent>();
    let pipeline = FramePipeline::spawn(adapter, events_tx).unwrap();

    let (capture_tx, capture_rx) = mpsc::channel::<CaptureEvent>();
    let input = (1..=5).map(|_| Frame::from_rgb_image(RgbImage::new(4, 2), Rotation::Deg90));
    let capture = CaptureSession::spawn(
      input,
      pipeline.submitter(),
      capture_tx,
      CaptureOptions::default()
        .with_preview(true)
        .with_frame_limit(Some(3)),
    )
    .unwrap();

    let mut previews = Vec::new();
    let ended = loop {
      match capture_rx.recv_timeout(TIMEOUT).unwrap() {
        CaptureEvent::Preview(preview) => previews.push(preview),
        CaptureEvent::Ended(count) => break count,
      }
    };
    assert_eq!(ended, 3);
    assert_eq!(capture.join(), 3);
    // 未被消费的预览最多积压两帧
    assert!(previews.len() <= MAX_PENDING_PREVIEWS);
    assert_eq!(previews[0].image().dimensions(), (2, 4));

    let stats = pipeline.shutdown();
    assert_eq!(stats.submitted, 3);
  }
}
