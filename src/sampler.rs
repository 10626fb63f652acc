// Frame sampler: periodic detection loop over a live camera stream

use crate::camera::{MediaDevice, MediaStream};
use crate::detection::DetectionAdapter;
use crate::emotion::{per_face, EmotionSnapshot};
use crate::error::{MoodcamError, Result};
use crate::models::{ExpressionVector, FaceDetection, FacingMode, Frame};
use crate::overlay::{self, OverlayPlan};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Default interval between detection ticks
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(200);

const UPDATE_CHANNEL_CAPACITY: usize = 16;
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Lifecycle of a detection session. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Starting,
    Running,
    Stopped,
}

/// Published after every completed detection cycle
#[derive(Clone, Debug)]
pub struct LiveUpdate {
    pub facing: FacingMode,
    pub expressions: Vec<ExpressionVector>,
    /// One ranked panel per detected face
    pub faces: Vec<EmotionSnapshot>,
    pub overlay: OverlayPlan,
}

/// A frame grabbed for capture, with the expressions that were live at the time
#[derive(Clone, Debug)]
pub struct StillFrame {
    pub frame: Frame,
    pub expressions: Vec<ExpressionVector>,
    pub facing: FacingMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    /// Ticks that arrived while a cycle was still outstanding
    pub dropped_ticks: u64,
    /// Ticks with no decodable frame
    pub skipped_frames: u64,
    /// Cycles whose detection degraded to an empty result
    pub failed_cycles: u64,
}

/// Requests handled by a running session
#[derive(Debug)]
pub enum SessionCommand {
    SwitchCamera(oneshot::Sender<Result<FacingMode>>),
    Grab(oneshot::Sender<Result<StillFrame>>),
    Stats(oneshot::Sender<SamplerStats>),
    Stop,
}

/// One outstanding detection call
pub type PendingDetection = Pin<Box<dyn Future<Output = Vec<FaceDetection>> + Send>>;

/// Owns the camera stream and drives detection at a fixed period.
///
/// At most one detection call is outstanding; ticks arriving while one is
/// pending are dropped, never queued. The stream is stopped on every exit
/// path, including drop.
pub struct DetectionSession {
    state: SamplerState,
    facing: FacingMode,
    expressions: Vec<ExpressionVector>,
    processing: bool,
    stream: Option<Box<dyn MediaStream>>,
    device: Arc<dyn MediaDevice>,
    adapter: Arc<DetectionAdapter>,
    period: Duration,
    updates: broadcast::Sender<LiveUpdate>,
    stats: SamplerStats,
    in_flight_dims: (u32, u32),
}

impl DetectionSession {
    pub fn new(device: Arc<dyn MediaDevice>, adapter: Arc<DetectionAdapter>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: SamplerState::Idle,
            facing: FacingMode::default(),
            expressions: Vec::new(),
            processing: false,
            stream: None,
            device,
            adapter,
            period: DEFAULT_SAMPLE_PERIOD,
            updates,
            stats: SamplerStats::default(),
            in_flight_dims: (0, 0),
        }
    }

    pub fn with_facing(mut self, facing: FacingMode) -> Self {
        self.facing = facing;
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Expression vectors from the most recently completed cycle
    pub fn expressions(&self) -> &[ExpressionVector] {
        &self.expressions
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            failed_cycles: self.adapter.failed_cycles(),
            ..self.stats
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.updates.subscribe()
    }

    /// Acquires the camera and loads the model concurrently.
    ///
    /// Either failure ends the session in `Stopped`; a stream acquired
    /// before the model failed is stopped again.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            SamplerState::Running => return Ok(()),
            SamplerState::Stopped => return Err(MoodcamError::SessionClosed),
            SamplerState::Idle | SamplerState::Starting => {}
        }
        self.state = SamplerState::Starting;
        info!("Starting detection session with {} camera", self.facing);

        let device = self.device.clone();
        let adapter = self.adapter.clone();
        let (acquired, loaded) = tokio::join!(device.acquire(self.facing), adapter.initialize());

        let mut stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                error!("Camera unavailable: {}", e);
                self.teardown();
                return Err(e);
            }
        };
        if let Err(e) = loaded {
            stream.stop();
            self.teardown();
            return Err(e);
        }

        self.stream = Some(stream);
        self.state = SamplerState::Running;
        info!("Detection session running every {:?}", self.period);
        Ok(())
    }

    /// Handles one tick. Returns the detection call to await, or `None` when
    /// the tick is dropped or the frame is not ready.
    pub fn begin_cycle(&mut self) -> Option<PendingDetection> {
        if self.state != SamplerState::Running {
            return None;
        }
        if self.processing {
            self.stats.dropped_ticks += 1;
            trace!("Tick dropped: detection still outstanding");
            return None;
        }

        let stream = self.stream.as_mut()?;
        let frame = match stream.read_frame() {
            Ok(Some(frame)) if frame.is_decodable() => frame,
            Ok(_) => {
                self.stats.skipped_frames += 1;
                trace!("Tick skipped: no decodable frame yet");
                return None;
            }
            Err(e) => {
                self.stats.skipped_frames += 1;
                warn!("Failed to read frame: {}", e);
                return None;
            }
        };

        self.processing = true;
        self.stats.cycles_started += 1;
        self.in_flight_dims = frame.dimensions();
        let adapter = self.adapter.clone();
        Some(Box::pin(async move { adapter.detect(&frame).await }))
    }

    /// Applies a finished detection call. Results arriving after teardown
    /// are discarded.
    pub fn complete_cycle(&mut self, detections: Vec<FaceDetection>) {
        self.processing = false;
        if self.state != SamplerState::Running {
            debug!("Discarding detection result for stopped session");
            return;
        }
        self.stats.cycles_completed += 1;

        self.expressions = detections.iter().map(|d| d.expressions).collect();
        let (width, height) = self.in_flight_dims;
        let update = LiveUpdate {
            facing: self.facing,
            faces: per_face(&self.expressions),
            overlay: overlay::render(width, height, &detections, self.facing),
            expressions: self.expressions.clone(),
        };
        // no subscribers is fine
        let _ = self.updates.send(update);
    }

    /// Swaps to the opposite camera. The old stream is fully stopped before
    /// the new one is requested; failure to acquire ends the session.
    pub async fn switch_camera(&mut self) -> Result<FacingMode> {
        if self.state != SamplerState::Running {
            return Err(MoodcamError::SessionClosed);
        }
        if let Some(mut old) = self.stream.take() {
            old.stop();
        }

        self.facing = self.facing.opposite();
        match self.device.acquire(self.facing).await {
            Ok(stream) => {
                self.stream = Some(stream);
                info!("Switched to {} camera", self.facing);
                Ok(self.facing)
            }
            Err(e) => {
                error!("Failed to switch to {} camera: {}", self.facing, e);
                self.teardown();
                Err(e)
            }
        }
    }

    /// Grabs the current frame together with the latest expressions
    pub fn grab_still(&mut self) -> Result<StillFrame> {
        if self.state != SamplerState::Running {
            return Err(MoodcamError::CaptureNotReady(
                "detection session is not running".to_string(),
            ));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MoodcamError::CaptureNotReady("no camera stream".to_string()))?;

        match stream
            .read_frame()
            .map_err(|e| MoodcamError::CaptureNotReady(e.to_string()))?
        {
            Some(frame) if frame.is_decodable() => Ok(StillFrame {
                frame,
                expressions: self.expressions.clone(),
                facing: self.facing,
            }),
            _ => Err(MoodcamError::CaptureNotReady(
                "camera has not produced a frame yet".to_string(),
            )),
        }
    }

    /// Stops the stream and ends the session. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        if self.state != SamplerState::Stopped {
            info!("Detection session stopped");
        }
        self.state = SamplerState::Stopped;
        self.processing = false;
        self.expressions.clear();
    }

    /// Runs the session until `Stop`, the command channel closes or a
    /// camera switch fails.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> Result<SamplerStats> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending: Option<PendingDetection> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(cycle) = self.begin_cycle() {
                        pending = Some(cycle);
                    }
                }
                detections = poll_pending(&mut pending), if pending.is_some() => {
                    self.complete_cycle(detections);
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::SwitchCamera(reply)) => {
                        let result = self.switch_camera().await;
                        let failed = result.is_err();
                        let _ = reply.send(result);
                        if failed {
                            break;
                        }
                    }
                    Some(SessionCommand::Grab(reply)) => {
                        let _ = reply.send(self.grab_still());
                    }
                    Some(SessionCommand::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(SessionCommand::Stop) | None => break,
                },
            }
        }

        self.teardown();
        let stats = self.stats();
        info!(
            "Session finished: {} cycle(s) completed, {} tick(s) dropped",
            stats.cycles_completed, stats.dropped_ticks
        );
        Ok(stats)
    }

    /// Spawns the session loop onto the current runtime
    pub fn spawn(self) -> SessionHandle {
        let (commands, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let updates = self.updates.clone();
        let task = tokio::spawn(self.run(rx));
        SessionHandle {
            commands,
            updates,
            task,
        }
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn poll_pending(pending: &mut Option<PendingDetection>) -> Vec<FaceDetection> {
    match pending.as_mut() {
        Some(cycle) => {
            let detections = cycle.await;
            *pending = None;
            detections
        }
        None => std::future::pending().await,
    }
}

/// Client side of a spawned [`DetectionSession`]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    updates: broadcast::Sender<LiveUpdate>,
    task: JoinHandle<Result<SamplerStats>>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MoodcamError::SessionClosed)?;
        rx.await.map_err(|_| MoodcamError::SessionClosed)
    }

    pub async fn switch_camera(&self) -> Result<FacingMode> {
        self.request(SessionCommand::SwitchCamera).await?
    }

    pub async fn grab(&self) -> Result<StillFrame> {
        self.request(SessionCommand::Grab).await?
    }

    pub async fn stats(&self) -> Result<SamplerStats> {
        self.request(SessionCommand::Stats).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves once the session loop has exited
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    /// Stops the session and waits for teardown
    pub async fn stop(self) -> Result<SamplerStats> {
        // the loop may already be gone after a failed switch
        let _ = self.commands.send(SessionCommand::Stop).await;
        self.join().await
    }

    /// Waits for the session to end on its own
    pub async fn join(self) -> Result<SamplerStats> {
        self.task.await.map_err(|e| {
            error!("Detection session task failed: {}", e);
            MoodcamError::SessionClosed
        })?
    }
}
