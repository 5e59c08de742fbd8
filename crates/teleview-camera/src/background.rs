//! Per-pixel background model for depth frames.
//!
//! Training folds a number of depth frames with a per-pixel minimum; the
//! result is the closest surface ever seen at each pixel. During streaming
//! the depth decoder asks the model to blank every pixel at or beyond its
//! trained background, which cuts a static room out of the stream.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CameraError, Result};

/// The depth value marking an invalid (or removed) pixel.
pub const INVALID_DEPTH: u16 = 0x07ff;

/// Extension appended to background file prefixes.
const FILE_SUFFIX: &str = "background";

/// Callback invoked once when a requested background capture completes.
pub type BackgroundCaptureCallback = Box<dyn FnOnce() + Send>;

/// Minimum-depth background with removal configuration.
///
/// Owned by the camera, shared with its depth decoding thread under a
/// mutex. All operations are cheap relative to a frame period.
pub struct BackgroundModel {
    width: usize,
    height: usize,
    /// Per-pixel minimum depth; empty until trained or loaded.
    frame: Vec<u16>,
    /// Remaining frames of an in-progress capture.
    frames_remaining: u32,
    /// Whether the next absorbed frame replaces the current background.
    replace_on_next: bool,
    remove: bool,
    fuzz: i16,
    on_complete: Option<BackgroundCaptureCallback>,
}

impl BackgroundModel {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            frame: Vec::new(),
            frames_remaining: 0,
            replace_on_next: false,
            remove: false,
            fuzz: 0,
            on_complete: None,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Whether a background is available for removal.
    pub fn trained(&self) -> bool {
        !self.frame.is_empty()
    }

    pub fn set_remove(&mut self, remove: bool) {
        self.remove = remove;
    }

    pub fn remove_enabled(&self) -> bool {
        self.remove
    }

    pub fn set_fuzz(&mut self, fuzz: i16) {
        self.fuzz = fuzz;
    }

    pub fn fuzz(&self) -> i16 {
        self.fuzz
    }

    /// Begin capturing `frames` depth frames into the background.
    ///
    /// With `replace` the first absorbed frame resets the model; otherwise
    /// new samples fold into the existing background.
    pub fn start_capture(
        &mut self,
        frames: u32,
        replace: bool,
        on_complete: Option<BackgroundCaptureCallback>,
    ) {
        self.frames_remaining = frames;
        self.replace_on_next = replace;
        self.on_complete = on_complete;
        if frames > 0 {
            info!(frames, replace, "starting background capture");
        }
    }

    /// Whether a capture is in progress.
    pub fn capturing(&self) -> bool {
        self.frames_remaining > 0
    }

    /// Fold one decoded depth frame into an in-progress capture.
    ///
    /// Called by the depth decoder for every frame while
    /// [`capturing`](Self::capturing) is true. Invokes the completion
    /// callback exactly once when the counter reaches zero.
    pub fn absorb(&mut self, raw: &[u16]) {
        if self.frames_remaining == 0 || raw.len() != self.width * self.height {
            return;
        }
        if self.replace_on_next || self.frame.is_empty() {
            self.frame.clear();
            self.frame.resize(self.width * self.height, INVALID_DEPTH);
            self.replace_on_next = false;
        }
        for (bg, &sample) in self.frame.iter_mut().zip(raw.iter()) {
            if sample < *bg {
                *bg = sample;
            }
        }
        self.frames_remaining -= 1;
        if self.frames_remaining == 0 {
            debug!("background capture complete");
            if let Some(callback) = self.on_complete.take() {
                callback();
            }
        }
    }

    /// Treat every pixel beyond `depth` as background.
    ///
    /// With `replace`, or when no background exists, the whole plane is set
    /// to `depth`; otherwise the plane folds into the existing background.
    pub fn set_max_depth(&mut self, depth: u16, replace: bool) {
        if replace || self.frame.is_empty() {
            self.frame.clear();
            self.frame.resize(self.width * self.height, depth);
        } else {
            for bg in self.frame.iter_mut() {
                if depth < *bg {
                    *bg = depth;
                }
            }
        }
    }

    /// Blank every pixel at or beyond the trained background.
    ///
    /// The test is `raw + fuzz >= background`, whatever the sign of `fuzz`:
    /// positive fuzz removes pixels slightly in front of the background,
    /// negative fuzz keeps pixels slightly behind it.
    pub fn filter(&self, map: &mut [u16]) {
        if !self.remove || self.frame.is_empty() {
            return;
        }
        let fuzz = i32::from(self.fuzz);
        for (pixel, &bg) in map.iter_mut().zip(self.frame.iter()) {
            if i32::from(*pixel) + fuzz >= i32::from(bg) {
                *pixel = INVALID_DEPTH;
            }
        }
    }

    /// Direct access to the background plane (empty if untrained).
    pub fn plane(&self) -> &[u16] {
        &self.frame
    }

    /// Save the background to `<prefix>.background`.
    pub fn save(&self, prefix: &Path) -> Result<()> {
        if self.frame.is_empty() {
            return Err(CameraError::invalid_state(
                "no background to save; capture or load one first",
            ));
        }
        let path = with_suffix(prefix);
        let mut writer = BufWriter::new(File::create(&path)?);
        self.save_to(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), "saved background");
        Ok(())
    }

    /// Write the background in the on-disk layout.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.width as u32).to_le_bytes())?;
        writer.write_all(&(self.height as u32).to_le_bytes())?;
        for &pixel in &self.frame {
            writer.write_all(&pixel.to_le_bytes())?;
        }
        Ok(())
    }

    /// Load a background from `<prefix>.background`.
    pub fn load(&mut self, prefix: &Path) -> Result<()> {
        let path = with_suffix(prefix);
        let mut reader = BufReader::new(File::open(&path)?);
        self.load_from(&mut reader, &path.display().to_string())?;
        info!(path = %path.display(), "loaded background");
        Ok(())
    }

    /// Load a background from an already-open reader.
    pub fn load_from<R: Read>(&mut self, reader: &mut R, origin: &str) -> Result<()> {
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let width = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let height = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if width != self.width || height != self.height {
            return Err(CameraError::BackgroundFormat {
                path: origin.to_string(),
                message: format!(
                    "file is {}x{}, camera is {}x{}",
                    width, height, self.width, self.height
                ),
            });
        }

        let mut pixels = vec![0u8; width * height * 2];
        reader.read_exact(&mut pixels)?;
        self.frame.clear();
        self.frame.extend(
            pixels
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]])),
        );
        Ok(())
    }
}

fn with_suffix(prefix: &Path) -> PathBuf {
    let mut path = prefix.as_os_str().to_os_string();
    path.push(".");
    path.push(FILE_SUFFIX);
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn training_keeps_per_pixel_minimum() {
        let mut model = BackgroundModel::new(2, 2);
        model.start_capture(3, true, None);
        model.absorb(&[100, 900, INVALID_DEPTH, 500]);
        model.absorb(&[200, 800, INVALID_DEPTH, 600]);
        model.absorb(&[150, 850, INVALID_DEPTH, 400]);
        assert!(!model.capturing());
        assert_eq!(model.plane(), &[100, 800, INVALID_DEPTH, 400]);
    }

    #[test]
    fn completion_callback_fires_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let mut model = BackgroundModel::new(1, 1);
        model.start_capture(
            2,
            true,
            Some(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        );
        model.absorb(&[10]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        model.absorb(&[20]);
        model.absorb(&[30]); // past the end; must not re-fire
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_blank_at_or_beyond_background() {
        let mut model = BackgroundModel::new(4, 1);
        model.start_capture(1, true, None);
        model.absorb(&[1000, 1000, 1000, 1000]);
        model.set_remove(true);

        let mut map = [950, 1050, 1000, 10];
        model.filter(&mut map);
        assert_eq!(map, [950, INVALID_DEPTH, INVALID_DEPTH, 10]);
    }

    #[test]
    fn fuzz_shifts_the_cut_both_ways() {
        let mut model = BackgroundModel::new(2, 1);
        model.start_capture(1, true, None);
        model.absorb(&[1000, 1000]);
        model.set_remove(true);

        // Positive fuzz removes pixels in front of the background.
        model.set_fuzz(60);
        let mut map = [950, 930];
        model.filter(&mut map);
        assert_eq!(map, [INVALID_DEPTH, 930]);

        // Negative fuzz keeps pixels past the background.
        model.set_fuzz(-10);
        let mut map = [1005, 1015];
        model.filter(&mut map);
        assert_eq!(map, [1005, INVALID_DEPTH]);
    }

    #[test]
    fn max_depth_folds_into_existing_background() {
        let mut model = BackgroundModel::new(2, 1);
        model.set_max_depth(1100, false);
        assert_eq!(model.plane(), &[1100, 1100]);

        model.start_capture(1, false, None);
        model.absorb(&[500, 1500]);
        assert_eq!(model.plane(), &[500, 1100]);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cam0");

        let mut model = BackgroundModel::new(3, 2);
        model.start_capture(1, true, None);
        model.absorb(&[1, 2, 3, 4, 5, INVALID_DEPTH]);
        model.save(&prefix).unwrap();

        let mut restored = BackgroundModel::new(3, 2);
        restored.load(&prefix).unwrap();
        assert_eq!(restored.plane(), model.plane());
    }

    #[test]
    fn load_rejects_mismatched_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cam0");

        let mut model = BackgroundModel::new(2, 2);
        model.set_max_depth(500, true);
        model.save(&prefix).unwrap();

        let mut other = BackgroundModel::new(4, 4);
        assert!(matches!(
            other.load(&prefix),
            Err(CameraError::BackgroundFormat { .. })
        ));
    }
}
