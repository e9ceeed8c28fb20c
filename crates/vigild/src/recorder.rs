//! Evidence recording.
//!
//! At most one stream is open at a time. Frames are encoded by a pluggable
//! [`VideoBackend`]; the default pipes raw RGB24 into an `ffmpeg` child.

use chrono::{DateTime, Local};
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use thiserror::Error;

/// Frame rate written into every recording.
pub const RECORDING_FPS: u32 = 20;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("a recording is already open: {0}")]
    AlreadyOpen(PathBuf),
    #[error("recording handle is not the active stream")]
    StaleHandle,
    #[error("frame is {actual_width}x{actual_height}, stream is {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("output not writable: {path}: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start encoder {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("encoder exited with {0}")]
    EncoderFailed(std::process::ExitStatus),
}

/// An open encoded video stream.
pub trait VideoStream {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecorderError>;
    /// Flush and release. Called exactly once.
    fn finish(&mut self) -> Result<(), RecorderError>;
}

/// Factory for video streams.
pub trait VideoBackend {
    fn open(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoStream + Send>, RecorderError>;
}

/// Encodes MPEG-4 Part 2 MP4 through an external `ffmpeg` process.
pub struct FfmpegBackend {
    program: PathBuf,
}

impl FfmpegBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl VideoBackend for FfmpegBackend {
    fn open(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoStream + Send>, RecorderError> {
        // Surface an unwritable target here rather than as a late ffmpeg exit.
        File::create(path).map_err(|source| RecorderError::NotWritable {
            path: path.to_path_buf(),
            source,
        })?;

        let mut child = Command::new(&self.program)
            .args(["-y", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(fps.to_string())
            .args(["-i", "-", "-c:v", "mpeg4", "-q:v", "5"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| {
                // Do not leave an empty recording behind.
                let _ = std::fs::remove_file(path);
                RecorderError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            })?;

        let stdin = child.stdin.take();
        tracing::debug!(path = %path.display(), pid = child.id(), "ffmpeg encoder started");
        Ok(Box::new(FfmpegStream { child, stdin }))
    }
}

struct FfmpegStream {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl VideoStream for FfmpegStream {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), RecorderError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            RecorderError::Write(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        })?;
        stdin.write_all(frame.as_raw()).map_err(RecorderError::Write)
    }

    fn finish(&mut self) -> Result<(), RecorderError> {
        // Closing stdin signals end of input.
        drop(self.stdin.take());
        let status = self.child.wait().map_err(RecorderError::Write)?;
        if status.success() {
            Ok(())
        } else {
            Err(RecorderError::EncoderFailed(status))
        }
    }
}

/// Token for the currently open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingHandle(u64);

struct ActiveRecording {
    handle: RecordingHandle,
    path: PathBuf,
    width: u32,
    height: u32,
    frames: u64,
    stream: Box<dyn VideoStream + Send>,
}

/// Owns the single open recording, if any.
pub struct Recorder {
    backend: Box<dyn VideoBackend + Send>,
    output_dir: PathBuf,
    active: Option<ActiveRecording>,
    next_handle: u64,
}

impl Recorder {
    pub fn new(backend: Box<dyn VideoBackend + Send>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            output_dir: output_dir.into(),
            active: None,
            next_handle: 0,
        }
    }

    /// `blacklisted_detection_<YYYYMMDD_HHMMSS>.mp4` under the output directory.
    pub fn target_path(&self, timestamp: DateTime<Local>) -> PathBuf {
        self.output_dir.join(format!(
            "blacklisted_detection_{}.mp4",
            timestamp.format("%Y%m%d_%H%M%S")
        ))
    }

    pub fn open(
        &mut self,
        width: u32,
        height: u32,
        timestamp: DateTime<Local>,
    ) -> Result<RecordingHandle, RecorderError> {
        if let Some(active) = &self.active {
            return Err(RecorderError::AlreadyOpen(active.path.clone()));
        }

        std::fs::create_dir_all(&self.output_dir).map_err(|source| RecorderError::NotWritable {
            path: self.output_dir.clone(),
            source,
        })?;
        let path = self.target_path(timestamp);
        let stream = self.backend.open(&path, width, height, RECORDING_FPS)?;

        let handle = RecordingHandle(self.next_handle);
        self.next_handle += 1;
        tracing::info!(path = %path.display(), width, height, fps = RECORDING_FPS, "recording opened");
        self.active = Some(ActiveRecording {
            handle,
            path,
            width,
            height,
            frames: 0,
            stream,
        });
        Ok(handle)
    }

    pub fn append(&mut self, handle: RecordingHandle, frame: &RgbImage) -> Result<(), RecorderError> {
        let active = self.active_mut(handle)?;
        if frame.dimensions() != (active.width, active.height) {
            return Err(RecorderError::SizeMismatch {
                width: active.width,
                height: active.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }
        active.stream.write_frame(frame)?;
        active.frames += 1;
        Ok(())
    }

    pub fn close(&mut self, handle: RecordingHandle) -> Result<PathBuf, RecorderError> {
        self.active_mut(handle)?;
        match self.active.take() {
            Some(active) => Self::finish(active),
            None => Err(RecorderError::StaleHandle),
        }
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn active_mut(&mut self, handle: RecordingHandle) -> Result<&mut ActiveRecording, RecorderError> {
        match &mut self.active {
            Some(active) if active.handle == handle => Ok(active),
            _ => Err(RecorderError::StaleHandle),
        }
    }

    fn finish(mut active: ActiveRecording) -> Result<PathBuf, RecorderError> {
        active.stream.finish()?;
        tracing::info!(path = %active.path.display(), frames = active.frames, "recording closed");
        Ok(active.path)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = Self::finish(active) {
                tracing::error!(error = %e, "failed to finalize recording");
            }
        }
    }
}
