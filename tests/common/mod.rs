//! Shared fakes for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use moodcam::camera::{MediaDevice, MediaStream};
use moodcam::detection::{DetectionAdapter, ExpressionModel};
use moodcam::error::{MoodcamError, Result};
use moodcam::models::{BoundingBox, ExpressionVector, FaceDetection, FacingMode, Frame};
use moodcam::notify::{Notice, Notifier};
use moodcam::store::{Capture, CaptureId, DeleteOutcome, MemoryBackend, OwnerId, PersistenceBackend};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FRAME_SIZE: u32 = 8;

pub fn frame() -> Frame {
    Frame::new(vec![128; (FRAME_SIZE * FRAME_SIZE * 3) as usize], FRAME_SIZE, FRAME_SIZE)
}

pub fn face(expressions: ExpressionVector) -> FaceDetection {
    FaceDetection::new(BoundingBox::new(1.0, 1.0, 4.0, 4.0), expressions)
}

/// Model whose inference takes `delay` and returns the configured faces
pub struct FakeModel {
    fail_load: bool,
    delay: Duration,
    faces: Mutex<Vec<FaceDetection>>,
    fail_infer: AtomicBool,
    pub loads: AtomicUsize,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeModel {
    pub fn new() -> Self {
        Self {
            fail_load: false,
            delay: Duration::ZERO,
            faces: Mutex::new(Vec::new()),
            fail_infer: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_faces(&self, faces: Vec<FaceDetection>) {
        *self.faces.lock().unwrap() = faces;
    }

    pub fn set_fail_infer(&self, fail: bool) {
        self.fail_infer.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExpressionModel for FakeModel {
    async fn load(&self) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(MoodcamError::ModelLoad("missing weights".to_string()));
        }
        Ok(())
    }

    async fn infer(&self, _frame: &Frame) -> Result<Vec<FaceDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_infer.load(Ordering::SeqCst) {
            return Err(MoodcamError::DetectionCycle("corrupt frame".to_string()));
        }
        Ok(self.faces.lock().unwrap().clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Acquired(FacingMode),
    Stopped(FacingMode),
}

/// Media device that records acquisitions and stops and counts live tracks
#[derive(Default)]
pub struct FakeDevice {
    pub events: Arc<Mutex<Vec<DeviceEvent>>>,
    pub live_tracks: Arc<AtomicUsize>,
    fail_for: Mutex<Option<FacingMode>>,
    blank: bool,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams that never produce a decodable frame
    pub fn blank() -> Self {
        Self {
            blank: true,
            ..Self::default()
        }
    }

    pub fn fail_for(&self, facing: FacingMode) {
        *self.fail_for.lock().unwrap() = Some(facing);
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevice for FakeDevice {
    async fn acquire(&self, facing: FacingMode) -> Result<Box<dyn MediaStream>> {
        if *self.fail_for.lock().unwrap() == Some(facing) {
            return Err(MoodcamError::CameraAccess("permission denied".to_string()));
        }
        self.events.lock().unwrap().push(DeviceEvent::Acquired(facing));
        self.live_tracks.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            facing,
            live: true,
            blank: self.blank,
            events: self.events.clone(),
            live_tracks: self.live_tracks.clone(),
        }))
    }
}

/// Not stopped on drop, so a leaked stream shows up in `live_tracks`
struct FakeStream {
    facing: FacingMode,
    live: bool,
    blank: bool,
    events: Arc<Mutex<Vec<DeviceEvent>>>,
    live_tracks: Arc<AtomicUsize>,
}

impl MediaStream for FakeStream {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if !self.live {
            return Ok(None);
        }
        if self.blank {
            return Ok(Some(Frame::new(Vec::new(), 0, 0)));
        }
        Ok(Some(frame()))
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.live_tracks.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(DeviceEvent::Stopped(self.facing));
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

pub fn adapter(model: Arc<FakeModel>) -> Arc<DetectionAdapter> {
    Arc::new(DetectionAdapter::new(model))
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// In-memory backend that can be told to fail creates or deletes
#[derive(Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    pub fail_creates: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for FailingBackend {
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Capture>> {
        self.inner.list_by_owner(owner).await
    }

    async fn create(&self, owner: &OwnerId, capture: Capture) -> Result<Capture> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(MoodcamError::Persistence("backend offline".to_string()));
        }
        self.inner.create(owner, capture).await
    }

    async fn delete_by_ids(&self, owner: &OwnerId, ids: &[CaptureId]) -> Result<DeleteOutcome> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(MoodcamError::Persistence("backend offline".to_string()));
        }
        self.inner.delete_by_ids(owner, ids).await
    }
}
