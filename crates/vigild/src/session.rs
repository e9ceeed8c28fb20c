//! Per-frame detection pipeline and the alert state machine.
//!
//! A [`Session`] owns every piece of mutable run state: the detectors, the
//! recorder, the event log and the alert state. It lives on the capture
//! thread and is driven one frame at a time by [`run`].

use crate::alerts::{Alert, AlertNotifier};
use crate::annotator::FrameAnnotator;
use crate::config::{RecordingConfig, RecordingPolicy};
use crate::display::{Display, DisplayControl};
use crate::events::{Event, EventSink, Severity};
use crate::recorder::{Recorder, RecorderError, RecordingHandle};
use chrono::{DateTime, Local};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use vigil_core::{FaceError, FaceMatcher, FaceObservation, Identity, WeaponDetection, WeaponDetector, WeaponError};
use vigil_hw::{Frame, FrameSource};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("weapon detection failed: {0}")]
    Weapon(#[from] WeaponError),
    #[error("face recognition failed: {0}")]
    Face(#[from] FaceError),
    #[error("recording failed: {0}")]
    Recorder(#[from] RecorderError),
    #[error("inference thread panicked")]
    InferencePanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Idle,
    Recording {
        handle: RecordingHandle,
        /// Capture time of the latest frame with a blacklist match.
        last_match: DateTime<Local>,
    },
}

/// Why the capture loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    CameraLost,
    Interrupted,
    DisplayClosed,
}

pub struct Session {
    faces: FaceMatcher,
    weapons: Box<dyn WeaponDetector + Send>,
    annotator: FrameAnnotator,
    recorder: Recorder,
    events: Box<dyn EventSink + Send>,
    notifier: Box<dyn AlertNotifier + Send>,
    recording: RecordingConfig,
    parallel: bool,
    state: AlertState,
}

impl Session {
    pub fn new(
        faces: FaceMatcher,
        weapons: Box<dyn WeaponDetector + Send>,
        recorder: Recorder,
        events: Box<dyn EventSink + Send>,
        notifier: Box<dyn AlertNotifier + Send>,
    ) -> Self {
        Self {
            faces,
            weapons,
            annotator: FrameAnnotator::without_labels(),
            recorder,
            events,
            notifier,
            recording: RecordingConfig::default(),
            parallel: false,
            state: AlertState::Idle,
        }
    }

    pub fn with_annotator(mut self, annotator: FrameAnnotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_recording(mut self, recording: RecordingConfig) -> Self {
        self.recording = recording;
        self
    }

    /// Run weapon inference on a scoped worker thread alongside face inference.
    pub fn with_parallel_inference(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[cfg(test)]
    fn state(&self) -> AlertState {
        self.state
    }

    pub fn log(&mut self, severity: Severity, message: impl Into<String>) {
        self.events.record(Event::now(severity, message));
    }

    /// Process one frame and return the annotated image.
    pub fn process(&mut self, frame: &Frame) -> Result<RgbImage, SessionError> {
        let (weapons, faces) = self.infer(&frame.image)?;

        if !weapons.is_empty() {
            let list: Vec<String> = weapons.iter().map(ToString::to_string).collect();
            self.log(Severity::Info, format!("Weapons detected: {}", list.join(", ")));
        }

        let mut matched = false;
        for face in &faces {
            match &face.identity {
                Identity::Blacklisted(name) => {
                    matched = true;
                    self.on_blacklisted(name, frame)?;
                }
                Identity::Unknown => self.log(Severity::Info, "Unknown person detected."),
                Identity::Known(name) => {
                    self.log(Severity::Info, format!("Known person detected: {name}"))
                }
            }
        }
        if !matched {
            self.expire_recording(frame.captured_at)?;
        }

        let annotated = self.annotator.annotate(&frame.image, &weapons, &faces);
        if let AlertState::Recording { handle, .. } = self.state {
            if let Err(e) = self.recorder.append(handle, &annotated) {
                self.log(Severity::Error, format!("Failed to write recording: {e}"));
                return Err(e.into());
            }
        }
        Ok(annotated)
    }

    fn infer(
        &mut self,
        image: &RgbImage,
    ) -> Result<(Vec<WeaponDetection>, Vec<FaceObservation>), SessionError> {
        if !self.parallel {
            let weapons = self.weapons.detect(image)?;
            let faces = self.faces.observe(image)?;
            return Ok((weapons, faces));
        }

        let detector = &mut self.weapons;
        let matcher = &mut self.faces;
        std::thread::scope(|s| -> Result<_, SessionError> {
            let worker = s.spawn(move || detector.detect(image));
            let faces = matcher.observe(image);
            let weapons = worker.join().map_err(|_| SessionError::InferencePanicked)?;
            Ok((weapons?, faces?))
        })
    }

    fn on_blacklisted(&mut self, name: &str, frame: &Frame) -> Result<(), SessionError> {
        if let AlertState::Recording { handle, .. } = self.state {
            self.state = AlertState::Recording {
                handle,
                last_match: frame.captured_at,
            };
            self.log(Severity::Warning, format!("Blacklisted person detected: {name}"));
            return Ok(());
        }

        self.notifier.notify(Alert {
            name: name.to_string(),
            at: frame.captured_at,
        });
        self.log(Severity::Warning, format!("Blacklisted person detected: {name}"));
        match self
            .recorder
            .open(frame.width(), frame.height(), frame.captured_at)
        {
            Ok(handle) => {
                self.state = AlertState::Recording {
                    handle,
                    last_match: frame.captured_at,
                };
                Ok(())
            }
            Err(e) => {
                self.log(Severity::Error, format!("Failed to start recording: {e}"));
                Err(e.into())
            }
        }
    }

    /// Under the quiet-window policy, close a recording that has gone too
    /// long without a match.
    fn expire_recording(&mut self, now: DateTime<Local>) -> Result<(), SessionError> {
        if self.recording.policy != RecordingPolicy::QuietWindow {
            return Ok(());
        }
        let AlertState::Recording { handle, last_match } = self.state else {
            return Ok(());
        };
        let quiet = (now - last_match).num_seconds();
        if quiet < 0 || (quiet as u64) < self.recording.quiet_secs {
            return Ok(());
        }

        self.state = AlertState::Idle;
        let path = match self.recorder.close(handle) {
            Ok(path) => path,
            Err(e) => {
                self.log(Severity::Error, format!("Failed to finalize recording: {e}"));
                return Err(e.into());
            }
        };
        self.log(
            Severity::Info,
            format!(
                "Recording stopped after {quiet}s without a blacklist match: {}",
                path.display()
            ),
        );
        Ok(())
    }

    /// Close any open recording and flush the event log.
    pub fn release(&mut self) {
        if let AlertState::Recording { handle, .. } = self.state {
            self.state = AlertState::Idle;
            if let Err(e) = self.recorder.close(handle) {
                self.log(Severity::Error, format!("Failed to finalize recording: {e}"));
            }
        }
        self.events.flush();
    }

    pub fn shutdown(&mut self) {
        self.log(Severity::Info, "Program terminated successfully.");
        self.release();
    }
}

/// Drive `session` with frames from `source` until the camera fails, `stop`
/// is set or the display asks to quit.
///
/// A lost camera is a normal end of run. Detector and recorder failures are
/// returned after the recording has been finalized.
pub fn run(
    source: &mut dyn FrameSource,
    session: &mut Session,
    display: &mut dyn Display,
    stop: &AtomicBool,
) -> Result<RunOutcome, SessionError> {
    let outcome = loop {
        if stop.load(Ordering::Relaxed) {
            session.log(Severity::Info, "Interrupted; shutting down.");
            break RunOutcome::Interrupted;
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "frame capture failed");
                session.log(Severity::Error, "Failed to read frame from camera.");
                break RunOutcome::CameraLost;
            }
        };

        let annotated = match session.process(&frame) {
            Ok(annotated) => annotated,
            Err(e) => {
                // Recorder failures are logged where they occur.
                if !matches!(e, SessionError::Recorder(_)) {
                    session.log(Severity::Error, format!("Detection failed: {e}"));
                }
                session.release();
                return Err(e);
            }
        };

        if let DisplayControl::Quit(reason) = display.show(&annotated) {
            session.log(Severity::Info, reason);
            break RunOutcome::DisplayClosed;
        }
    };

    session.shutdown();
    Ok(outcome)
}
