//! Live preview surface.

use image::RgbImage;

/// What the loop should do after a frame was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayControl {
    Continue,
    /// Stop the loop. The reason is recorded as an event.
    Quit(&'static str),
}

pub trait Display {
    fn show(&mut self, frame: &RgbImage) -> DisplayControl;
}

/// Discards frames. Used when no window is available.
#[derive(Debug, Default)]
pub struct Headless;

impl Display for Headless {
    fn show(&mut self, _frame: &RgbImage) -> DisplayControl {
        DisplayControl::Continue
    }
}

#[cfg(feature = "highgui")]
pub use window::Window;

#[cfg(feature = "highgui")]
mod window {
    use super::{Display, DisplayControl};
    use image::RgbImage;
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use opencv::prelude::*;
    use opencv::highgui;

    const QUIT_KEY: i32 = b'q' as i32;

    /// OpenCV highgui window. Closing the window or pressing `q` quits.
    pub struct Window {
        name: String,
        shown: bool,
    }

    impl Window {
        pub fn open(name: &str) -> opencv::Result<Self> {
            highgui::named_window(name, highgui::WINDOW_AUTOSIZE)?;
            Ok(Self {
                name: name.to_string(),
                shown: false,
            })
        }

        fn to_bgr(frame: &RgbImage) -> opencv::Result<Mat> {
            let mut mat = Mat::new_rows_cols_with_default(
                frame.height() as i32,
                frame.width() as i32,
                CV_8UC3,
                Scalar::all(0.0),
            )?;
            let dst = mat.data_bytes_mut()?;
            for (out, px) in dst.chunks_exact_mut(3).zip(frame.as_raw().chunks_exact(3)) {
                out[0] = px[2];
                out[1] = px[1];
                out[2] = px[0];
            }
            Ok(mat)
        }

        fn step(&mut self, frame: &RgbImage) -> opencv::Result<DisplayControl> {
            // A window closed by the user reports itself invisible.
            if self.shown
                && highgui::get_window_property(&self.name, highgui::WND_PROP_VISIBLE)? < 1.0
            {
                return Ok(DisplayControl::Quit("Camera window closed by user."));
            }
            highgui::imshow(&self.name, &Self::to_bgr(frame)?)?;
            self.shown = true;
            if highgui::wait_key(1)? & 0xff == QUIT_KEY {
                return Ok(DisplayControl::Quit("User pressed 'q' to exit."));
            }
            Ok(DisplayControl::Continue)
        }
    }

    impl Display for Window {
        fn show(&mut self, frame: &RgbImage) -> DisplayControl {
            match self.step(frame) {
                Ok(control) => control,
                Err(e) => {
                    tracing::warn!(error = %e, "display failed");
                    DisplayControl::Quit("Display failed.")
                }
            }
        }
    }

    impl Drop for Window {
        fn drop(&mut self) {
            let _ = highgui::destroy_window(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_never_quits() {
        let mut display = Headless;
        assert_eq!(display.show(&RgbImage::new(2, 2)), DisplayControl::Continue);
    }
}
