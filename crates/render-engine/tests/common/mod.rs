#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use reelout_common::DeliveryResult;
use reelout_render_engine::{EncoderSetting, MuxBackend, MuxSession, StreamParams};
use reelout_render_model::Bitmap;

/// Mux backend that keeps encoded frames in memory.
#[derive(Clone, Default)]
pub struct MemoryMux {
    frames: Arc<Mutex<Vec<(i64, f32)>>>,
    codecs: Arc<Mutex<Vec<String>>>,
    trailer_written: Arc<AtomicBool>,
}

impl MemoryMux {
    /// `(pts, first sample)` of every frame received.
    pub fn frames(&self) -> Vec<(i64, f32)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn codecs(&self) -> Vec<String> {
        self.codecs.lock().unwrap().clone()
    }

    pub fn trailer_written(&self) -> bool {
        self.trailer_written.load(Ordering::SeqCst)
    }
}

impl MuxBackend for MemoryMux {
    fn name(&self) -> &str {
        "memory"
    }

    fn create_session(&self) -> DeliveryResult<Box<dyn MuxSession>> {
        Ok(Box::new(self.clone()))
    }
}

impl MuxSession for MemoryMux {
    fn add_stream(&mut self, _params: &StreamParams) -> DeliveryResult<()> {
        Ok(())
    }

    fn open_codec(&mut self, setting: &EncoderSetting) -> DeliveryResult<()> {
        self.codecs.lock().unwrap().push(setting.codec_name.clone());
        Ok(())
    }

    fn alloc_frame_buffers(&mut self) -> DeliveryResult<()> {
        Ok(())
    }

    fn open_io(&mut self, _path: &Path) -> DeliveryResult<()> {
        Ok(())
    }

    fn write_header(&mut self) -> DeliveryResult<()> {
        Ok(())
    }

    fn send_frame(&mut self, frame: Option<(&Bitmap, i64)>) -> DeliveryResult<()> {
        if let Some((bitmap, pts)) = frame {
            self.frames.lock().unwrap().push((pts, bitmap.sample(0, 0, 0)));
        }
        Ok(())
    }

    fn receive_packets(&mut self) -> DeliveryResult<usize> {
        Ok(0)
    }

    fn write_trailer(&mut self) -> DeliveryResult<()> {
        self.trailer_written.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {}
}

/// Fresh directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let dir = std::env::temp_dir().join(format!(
        "reelout-{name}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Records every progress value reported.
pub fn progress_log() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) + Send + Sync) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (log, move |value| sink.lock().unwrap().push(value))
}

pub fn assert_monotonic_to_max(values: &[u32]) {
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {values:?}");
    assert_eq!(values.last(), Some(&reelout_render_engine::MAX_RENDER_PROGRESS));
}
