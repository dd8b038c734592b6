use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::export;
use crate::media_item::{MediaItem, NO_HARDWARE_DECODE, OptionTrust};
use crate::preparser::{
    DecodedFrame, OnEnded, PreparseEngine, PreparseTypes, Preparser, PreparserCfg, ThumbnailArg,
};

/// Why a `generate` call produced no thumbnail. Collapsed to `false` at the
/// facade; kept so the log line says which step gave up.
#[derive(Debug, Error)]
enum GenerateError {
    #[error("media locator did not resolve")]
    InvalidLocator,
    #[error("preparser rejected the request")]
    Rejected,
    #[error("no frame delivered (engine timeout or cancellation)")]
    NoFrame,
    #[error("frame export failed: {0}")]
    Export(anyhow::Error),
    #[error("failed to open destination: {0}")]
    OpenDest(#[source] std::io::Error),
    #[error("failed to write destination: {0}")]
    WriteDest(#[source] std::io::Error),
}

/// One in-flight request: the completion flag and the frame handed over by
/// the engine callback. Lives in the generator's single slot; the ticket
/// ties callbacks to the call that registered them.
struct Pending {
    ticket: u64,
    done: bool,
    frame: Option<DecodedFrame>,
}

#[derive(Default)]
struct WaitState {
    slot: Mutex<Option<Pending>>,
    cond: Condvar,
}

/// Synchronous thumbnail facade over the asynchronous preparsing engine.
///
/// One request slot: `generate` blocks the calling thread until the
/// engine's completion callback fires or `stop` cancels the wait. Calls on
/// one instance must be serialized by the caller; the slot is not widened
/// internally.
pub struct ThumbnailGenerator<E: PreparseEngine = Preparser> {
    engine: E,
    wait: Arc<WaitState>,
    tickets: AtomicU64,
    jpeg_quality: u8,
}

impl ThumbnailGenerator<Preparser> {
    /// Build a generator backed by the bundled engine, restricted to the
    /// thumbnail capability with the configured per-request timeout.
    ///
    /// This is the only fallible step; a generator that failed to construct
    /// does not exist.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let engine = Preparser::new(PreparserCfg {
            types: PreparseTypes::THUMBNAIL,
            timeout: config.engine_timeout(),
            workers: config.effective_engine_workers(),
        })?;
        Ok(Self::with_engine(engine, config.jpeg_quality))
    }
}

impl<E: PreparseEngine> ThumbnailGenerator<E> {
    /// Wrap an existing engine. The handle is owned exclusively and shuts
    /// down when the generator drops.
    pub fn with_engine(engine: E, jpeg_quality: u8) -> Self {
        Self {
            engine,
            wait: Arc::new(WaitState::default()),
            tickets: AtomicU64::new(0),
            jpeg_quality,
        }
    }

    /// Produce a thumbnail for `mrl` at the normalized `position` and write
    /// it to `dest`, bounded by `width` x `height` with the aspect ratio
    /// preserved.
    ///
    /// Returns `true` only when the file was written in full. On `false`
    /// the state of `dest` is undefined; no partial-file cleanup happens
    /// here.
    pub fn generate(
        &self,
        media_id: &str,
        mrl: &str,
        width: u32,
        height: u32,
        position: f32,
        dest: &Path,
    ) -> bool {
        match self.try_generate(mrl, width, height, position, dest) {
            Ok(()) => {
                debug!(%media_id, ?dest, "Thumbnail written");
                true
            }
            Err(error) => {
                warn!(%media_id, mrl, %error, "Thumbnail generation failed");
                false
            }
        }
    }

    fn try_generate(
        &self,
        mrl: &str,
        width: u32,
        height: u32,
        position: f32,
        dest: &Path,
    ) -> Result<(), GenerateError> {
        let Some(mut item) = MediaItem::new(mrl) else {
            return Err(GenerateError::InvalidLocator);
        };
        // Deterministic, reproducible decode path; trusted so the engine
        // honors it.
        item.add_option(NO_HARDWARE_DECODE, OptionTrust::Trusted);

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        let arg = ThumbnailArg {
            position,
            fast_seek: true,
            hw_dec: false,
        };

        let frame = {
            let mut slot = self.wait.slot.lock().expect("thumbnail slot lock poisoned");
            *slot = Some(Pending {
                ticket,
                done: false,
                frame: None,
            });

            // The slot stays locked across submission so a concurrent
            // stop() either observes this request or none at all.
            if self
                .engine
                .submit_thumbnail(&item, arg, self.on_ended(ticket))
                .is_none()
            {
                *slot = None;
                return Err(GenerateError::Rejected);
            }

            while slot.as_ref().is_some_and(|pending| !pending.done) {
                slot = self
                    .wait
                    .cond
                    .wait(slot)
                    .expect("thumbnail slot lock poisoned");
            }
            slot.take().and_then(|pending| pending.frame)
        };

        let frame = frame.ok_or(GenerateError::NoFrame)?;
        let encoded = export::export_jpeg(frame, width, height, true, self.jpeg_quality)
            .map_err(GenerateError::Export)?;

        let mut file = File::create(dest).map_err(GenerateError::OpenDest)?;
        file.write_all(&encoded).map_err(GenerateError::WriteDest)?;
        Ok(())
    }

    fn on_ended(&self, ticket: u64) -> OnEnded {
        let wait = Arc::downgrade(&self.wait);
        Box::new(move |frame| {
            let Some(wait) = wait.upgrade() else {
                return;
            };
            let mut slot = wait.slot.lock().expect("thumbnail slot lock poisoned");
            match slot.as_mut() {
                Some(pending) if pending.ticket == ticket && !pending.done => {
                    pending.done = true;
                    pending.frame = frame;
                }
                // Cleared, superseded, or already cancelled: the frame is
                // dropped here.
                _ => debug!(ticket, "Late preparse callback ignored"),
            }
            wait.cond.notify_all();
        })
    }

    /// Cancel whatever request is in flight on this instance.
    ///
    /// The blocked `generate` call observes no frame and returns `false`;
    /// the engine's own callback, if it still fires, is ignored. Safe to
    /// call from any thread, idempotent, a no-op when nothing is in flight.
    pub fn stop(&self) {
        let mut slot = self.wait.slot.lock().expect("thumbnail slot lock poisoned");
        if let Some(pending) = slot.as_mut() {
            pending.done = true;
        }
        self.wait.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    enum Script {
        /// Decline the submission.
        Reject,
        /// Accept, then fire the callback with the payload after a delay.
        Deliver(Option<DecodedFrame>, Duration),
        /// Accept and withhold the callback until fired manually.
        Hold,
    }

    #[derive(Default)]
    struct FakeEngine {
        script: Mutex<VecDeque<Script>>,
        held: Mutex<Vec<OnEnded>>,
    }

    impl FakeEngine {
        fn scripted(steps: Vec<Script>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                held: Mutex::new(Vec::new()),
            }
        }

        fn fire_held(&self, frame: Option<DecodedFrame>) {
            for callback in self.held.lock().unwrap().drain(..) {
                callback(frame.clone());
            }
        }
    }

    impl PreparseEngine for FakeEngine {
        fn submit_thumbnail(
            &self,
            _item: &MediaItem,
            _arg: ThumbnailArg,
            on_ended: OnEnded,
        ) -> Option<crate::preparser::RequestId> {
            match self.script.lock().unwrap().pop_front() {
                None | Some(Script::Reject) => None,
                Some(Script::Deliver(frame, delay)) => {
                    thread::spawn(move || {
                        thread::sleep(delay);
                        on_ended(frame);
                    });
                    Some(1)
                }
                Some(Script::Hold) => {
                    self.held.lock().unwrap().push(on_ended);
                    Some(2)
                }
            }
        }
    }

    fn test_frame() -> DecodedFrame {
        let (width, height) = (64, 48);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push((x * 4) as u8);
                data.push((y * 5) as u8);
                data.push(200);
            }
        }
        DecodedFrame {
            width,
            height,
            data,
        }
    }

    fn generator(steps: Vec<Script>) -> ThumbnailGenerator<FakeEngine> {
        ThumbnailGenerator::with_engine(FakeEngine::scripted(steps), 80)
    }

    #[test]
    fn test_delivered_frame_becomes_a_jpeg_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m1.jpg");
        let generator = generator(vec![Script::Deliver(
            Some(test_frame()),
            Duration::from_millis(10),
        )]);

        assert!(generator.generate("m1", "/media/clip.mp4", 32, 32, 0.5, &dest));

        let bytes = std::fs::read(&dest).unwrap();
        assert_eq!(
            image::guess_format(&bytes).unwrap(),
            image::ImageFormat::Jpeg
        );
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert!(decoded.width() <= 32 && decoded.height() <= 32);
        // 64x48 source fit into 32x32 keeps 4:3
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn test_rejected_submission_fails_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m2.jpg");
        let generator = generator(vec![Script::Reject]);

        let started = Instant::now();
        assert!(!generator.generate("m2", "/media/clip.mp4", 32, 32, 0.5, &dest));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!dest.exists());
    }

    #[test]
    fn test_callback_without_frame_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m3.jpg");
        let generator = generator(vec![Script::Deliver(None, Duration::from_millis(10))]);

        assert!(!generator.generate("m3", "/media/clip.mp4", 32, 32, 0.5, &dest));
        assert!(!dest.exists());
    }

    #[test]
    fn test_invalid_locator_fails_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m4.jpg");
        let generator = generator(vec![Script::Deliver(
            Some(test_frame()),
            Duration::from_millis(10),
        )]);

        assert!(!generator.generate("m4", "", 32, 32, 0.5, &dest));
        assert!(!dest.exists());
        // the scripted step was never consumed
        assert_eq!(generator.engine.script.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unwritable_destination_fails_after_export() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing-parent").join("m5.jpg");
        let generator = generator(vec![Script::Deliver(
            Some(test_frame()),
            Duration::from_millis(10),
        )]);

        assert!(!generator.generate("m5", "/media/clip.mp4", 32, 32, 0.5, &dest));
        assert!(!dest.exists());
    }

    #[test]
    fn test_stop_unblocks_inflight_generate_and_instance_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let held_dest = dir.path().join("m6.jpg");
        let retry_dest = dir.path().join("m7.jpg");
        let generator = Arc::new(generator(vec![
            Script::Hold,
            Script::Deliver(Some(test_frame()), Duration::from_millis(10)),
        ]));

        let worker = {
            let generator = generator.clone();
            let dest = held_dest.clone();
            thread::spawn(move || generator.generate("m6", "/media/clip.mp4", 32, 32, 0.5, &dest))
        };

        // Let the call register its slot and reach the wait, then cancel it.
        let deadline = Instant::now() + Duration::from_secs(2);
        while generator.wait.slot.lock().unwrap().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        generator.stop();

        assert!(!worker.join().unwrap());
        assert!(!held_dest.exists());

        // The instance is reusable after cancellation.
        assert!(generator.generate("m7", "/media/clip.mp4", 32, 32, 0.5, &retry_dest));

        // The engine callback for the cancelled request may still fire
        // late; it must be a no-op.
        generator.engine.fire_held(Some(test_frame()));
        assert!(!held_dest.exists());
    }

    #[test]
    fn test_stop_when_idle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("m8.jpg");
        let generator = generator(vec![Script::Deliver(
            Some(test_frame()),
            Duration::from_millis(10),
        )]);

        generator.stop();
        generator.stop();

        assert!(generator.generate("m8", "/media/clip.mp4", 32, 32, 0.5, &dest));
    }
}
