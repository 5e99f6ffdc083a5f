//! OpenCV-backed video sources.

use anyhow::anyhow;
use chrono::Utc;
use opencv::{
    core::{MatTraitConstManual, Vector},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    source::{CaptureSettings, SourceDescriptor, VideoSource, VideoSourceOpener},
    types::{CaptureError, Frame},
};

/// Opens local devices through V4L and network streams through FFmpeg.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvOpener;

impl VideoSourceOpener for OpenCvOpener {
    fn open(
        &self,
        source: &SourceDescriptor,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn VideoSource>, CaptureError> {
        let cap = open_video_capture(source, settings)?;
        Ok(Box::new(OpenCvSource {
            cap,
            frame: Mat::default(),
        }))
    }
}

struct OpenCvSource {
    cap: VideoCapture,
    frame: Mat,
}

impl VideoSource for OpenCvSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || self.frame.empty() {
            return Ok(None);
        }

        let width = self.frame.cols();
        let height = self.frame.rows();
        let channels = u8::try_from(self.frame.channels())
            .map_err(|_| CaptureError::Other(anyhow!("unsupported channel count")))?;

        let data = if self.frame.is_continuous() {
            self.frame
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec()
        } else {
            self.frame
                .try_clone()
                .map_err(|e| CaptureError::Other(e.into()))?
                .data_bytes()
                .map_err(|e| CaptureError::Other(e.into()))?
                .to_vec()
        };

        Ok(Some(Frame {
            data,
            width,
            height,
            channels,
            timestamp_ms: Utc::now().timestamp_millis(),
        }))
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("video-ingest: failed to release capture: {err}");
        }
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(
    source: &SourceDescriptor,
    settings: &CaptureSettings,
) -> Result<VideoCapture, CaptureError> {
    match source {
        SourceDescriptor::Device(index) => {
            for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
                match VideoCapture::new(*index, backend) {
                    Ok(mut cap) => {
                        if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                            configure_device(&mut cap, settings);
                            return Ok(cap);
                        }
                    }
                    Err(err) => {
                        debug!(
                            "video-ingest: failed to open device #{index} with backend {backend}: {err}"
                        );
                    }
                }
            }
        }
        SourceDescriptor::Stream(uri) => {
            let params = Vector::<i32>::from_slice(&[
                videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
                settings.stream_timeout_ms,
                videoio::CAP_PROP_READ_TIMEOUT_MSEC,
                settings.stream_timeout_ms,
            ]);
            for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
                match VideoCapture::from_file_with_params(uri, backend, &params) {
                    Ok(mut cap) => {
                        if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                            let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, settings.buffer_size as f64);
                            return Ok(cap);
                        }
                    }
                    Err(err) => {
                        debug!("video-ingest: failed to open {source} with backend {backend}: {err}");
                    }
                }
            }
        }
    }

    Err(CaptureError::Open {
        uri: source.label(),
    })
}

/// Apply common capture settings (queue depth, fps, preferred pixel format).
fn configure_device(cap: &mut VideoCapture, settings: &CaptureSettings) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, settings.buffer_size as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, settings.fps);
}
