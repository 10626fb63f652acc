// Camera module: media device seam, nokhwa webcam backend and still-image source

use crate::error::{MoodcamError, Result};
use crate::models::{FacingMode, Frame};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A device that can hand out live streams for a facing mode
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Requests a stream; permission and device failures are `CameraAccess` errors
    async fn acquire(&self, facing: FacingMode) -> Result<Box<dyn MediaStream>>;
}

/// A live stream of frames
pub trait MediaStream: Send {
    /// Returns the current frame, or `None` while the source is not yet
    /// producing decodable frames
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Stops every track of the stream. Idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

/// Serves a fixed image as a live stream; used for headless runs and demos
pub struct StillImageDevice {
    front: PathBuf,
    back: Option<PathBuf>,
}

impl StillImageDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            front: path.into(),
            back: None,
        }
    }

    /// Serves a different image for the back-facing "camera"
    pub fn with_back(mut self, path: impl Into<PathBuf>) -> Self {
        self.back = Some(path.into());
        self
    }

    fn path_for(&self, facing: FacingMode) -> &Path {
        match (facing, &self.back) {
            (FacingMode::Back, Some(back)) => back,
            _ => &self.front,
        }
    }
}

#[async_trait]
impl MediaDevice for StillImageDevice {
    async fn acquire(&self, facing: FacingMode) -> Result<Box<dyn MediaStream>> {
        let path = self.path_for(facing);
        let image = image::open(path).map_err(|e| {
            MoodcamError::CameraAccess(format!("cannot open still source {}: {e}", path.display()))
        })?;
        info!(
            "Still source {} opened for {} camera ({}x{})",
            path.display(),
            facing,
            image.width(),
            image.height()
        );
        Ok(Box::new(StillImageStream {
            frame: Frame::from_rgb_image(image.to_rgb8()),
            live: true,
        }))
    }
}

struct StillImageStream {
    frame: Frame,
    live: bool,
}

impl MediaStream for StillImageStream {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.live.then(|| self.frame.clone()))
    }

    fn stop(&mut self) {
        if self.live {
            debug!("Still source stopped");
        }
        self.live = false;
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

/// Capture threads that were told to stop but not joined yet.
///
/// `MediaStream::stop` runs on the detection loop's thread, so it only signals
/// the worker and parks its handle here; the joins happen on the blocking pool.
#[cfg(any(feature = "camera", test))]
#[derive(Clone, Default)]
struct RetiredWorkers {
    handles: std::sync::Arc<std::sync::Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

#[cfg(any(feature = "camera", test))]
impl RetiredWorkers {
    fn retire(&self, handle: std::thread::JoinHandle<()>) {
        match self.handles.lock() {
            Ok(mut handles) => handles.push(handle),
            Err(_) => tracing::warn!("Retired worker list poisoned; detaching camera thread"),
        }
    }

    fn take(&self) -> Vec<std::thread::JoinHandle<()>> {
        self.handles
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default()
    }

    /// Joins every retired worker without blocking the async thread
    async fn drain(&self) {
        let handles = self.take();
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        let joined = tokio::task::spawn_blocking(move || {
            handles.into_iter().map(|h| h.join()).filter(|r| r.is_err()).count()
        })
        .await;
        match joined {
            Ok(0) => debug!("Joined {} retired camera thread(s)", count),
            Ok(panicked) => {
                tracing::error!("{} camera thread(s) panicked during shutdown", panicked)
            }
            Err(e) => tracing::error!("Joining camera threads failed: {}", e),
        }
    }

    /// Blocking join for teardown paths that are no longer driven by the loop
    #[cfg(feature = "camera")]
    fn join_all(&self) {
        for handle in self.take() {
            if handle.join().is_err() {
                tracing::error!("Camera thread panicked during shutdown");
            }
        }
    }
}

#[cfg(feature = "camera")]
pub use native::{CameraSettings, NokhwaDevice};

#[cfg(feature = "camera")]
mod native {
    use super::{MediaDevice, MediaStream, RetiredWorkers};
    use crate::error::{MoodcamError, Result};
    use crate::models::{FacingMode, Frame};
    use async_trait::async_trait;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
    use nokhwa::Camera;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tracing::{error, info, warn};

    /// Requested capture format and the device index behind each facing mode
    #[derive(Clone, Copy, Debug)]
    pub struct CameraSettings {
        pub front_index: u32,
        pub back_index: u32,
        pub width: u32,
        pub height: u32,
        pub fps: u32,
    }

    /// Webcam device backed by nokhwa.
    ///
    /// nokhwa cameras are not `Send`, so each stream owns a capture thread that
    /// publishes the latest decoded frame.
    pub struct NokhwaDevice {
        settings: CameraSettings,
        retired: RetiredWorkers,
    }

    impl NokhwaDevice {
        pub fn new(settings: CameraSettings) -> Self {
            Self {
                settings,
                retired: RetiredWorkers::default(),
            }
        }

        /// Lists available camera devices
        pub fn list_devices() -> Result<Vec<String>> {
            let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto).map_err(|e| {
                MoodcamError::CameraAccess(format!("Failed to query cameras: {e}"))
            })?;

            Ok(devices
                .iter()
                .map(|info| info.human_name().to_string())
                .collect())
        }

        fn open_camera(settings: CameraSettings, index: u32) -> Result<Camera> {
            let requested_format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                nokhwa::utils::CameraFormat::new(
                    nokhwa::utils::Resolution::new(settings.width, settings.height),
                    nokhwa::utils::FrameFormat::YUYV,
                    settings.fps,
                ),
            ));

            let mut camera = Camera::new(CameraIndex::Index(index), requested_format)?;
            camera.open_stream()?;
            Ok(camera)
        }
    }

    #[async_trait]
    impl MediaDevice for NokhwaDevice {
        async fn acquire(&self, facing: FacingMode) -> Result<Box<dyn MediaStream>> {
            let index = match facing {
                FacingMode::Front => self.settings.front_index,
                FacingMode::Back => self.settings.back_index,
            };
            // the previous stream's thread must release the device first
            self.retired.drain().await;

            let settings = self.settings;
            let latest: Arc<Mutex<Option<Frame>>> = Arc::new(Mutex::new(None));
            let running = Arc::new(AtomicBool::new(true));
            let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

            let worker = {
                let latest = latest.clone();
                let running = running.clone();
                std::thread::spawn(move || {
                    let mut camera = match Self::open_camera(settings, index) {
                        Ok(camera) => {
                            let _ = ready_tx.send(Ok(()));
                            camera
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let frame_duration =
                        Duration::from_millis(1000 / u64::from(settings.fps.max(1)));

                    while running.load(Ordering::Acquire) {
                        match camera.frame().and_then(|f| f.decode_image::<RgbFormat>()) {
                            Ok(buffer) => {
                                let (width, height) = (buffer.width(), buffer.height());
                                let frame = Frame::new(buffer.into_raw(), width, height);
                                if let Ok(mut slot) = latest.lock() {
                                    *slot = Some(frame);
                                }
                            }
                            Err(e) => {
                                warn!("Failed to capture frame: {}", e);
                                std::thread::sleep(frame_duration);
                            }
                        }
                    }

                    if let Err(e) = camera.stop_stream() {
                        error!("Error stopping camera stream: {}", e);
                    }
                })
            };

            let opened = tokio::task::spawn_blocking(move || ready_rx.recv())
                .await
                .map_err(|e| MoodcamError::CameraAccess(format!("camera thread failed: {e}")))?
                .map_err(|_| MoodcamError::CameraAccess("camera thread exited".to_string()))?;

            if let Err(e) = opened {
                self.retired.retire(worker);
                self.retired.drain().await;
                error!("Failed to open camera {} ({}): {}", index, facing, e);
                return Err(e);
            }

            info!("Camera {} opened for {} facing mode", index, facing);
            Ok(Box::new(NokhwaStream {
                latest,
                running,
                worker: Some(worker),
                retired: self.retired.clone(),
            }))
        }
    }

    impl Drop for NokhwaDevice {
        fn drop(&mut self) {
            self.retired.join_all();
        }
    }

    struct NokhwaStream {
        latest: Arc<Mutex<Option<Frame>>>,
        running: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
        retired: RetiredWorkers,
    }

    impl MediaStream for NokhwaStream {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            if !self.is_live() {
                return Ok(None);
            }
            let slot = self
                .latest
                .lock()
                .map_err(|_| MoodcamError::CaptureNotReady("frame buffer poisoned".to_string()))?;
            Ok(slot.clone())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(worker) = self.worker.take() {
                self.retired.retire(worker);
            }
        }

        fn is_live(&self) -> bool {
            self.worker.is_some()
        }
    }

    impl Drop for NokhwaStream {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    #[tokio::test]
    async fn retiring_a_worker_does_not_wait_for_it() {
        let retired = RetiredWorkers::default();
        let finished = Arc::new(AtomicBool::new(false));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = {
            let finished = finished.clone();
            std::thread::spawn(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                finished.store(true, Ordering::SeqCst);
            })
        };

        retired.retire(worker);
        assert!(!finished.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        retired.drain().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(retired.take().is_empty());
    }

    #[tokio::test]
    async fn still_device_serves_frames_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        RgbImage::from_pixel(4, 3, Rgb([10, 20, 30])).save(&path).unwrap();

        let device = StillImageDevice::new(&path);
        let mut stream = device.acquire(FacingMode::Front).await.unwrap();
        let frame = stream.read_frame().unwrap().unwrap();
        assert_eq!(frame.dimensions(), (4, 3));
        assert!(frame.is_decodable());

        stream.stop();
        assert!(!stream.is_live());
        assert!(stream.read_frame().unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_still_source_is_camera_access_error() {
        let device = StillImageDevice::new("/nonexistent/still.png");
        assert!(matches!(
            device.acquire(FacingMode::Back).await,
            Err(MoodcamError::CameraAccess(_))
        ));
    }
}
