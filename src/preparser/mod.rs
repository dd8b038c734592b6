mod decoder;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::media_item::MediaItem;

/// A decoded video frame in packed RGB24, stride already stripped.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Identifier for an accepted preparse request.
pub type RequestId = u64;

/// Seek behavior for a thumbnail request.
#[derive(Clone, Copy, Debug)]
pub struct ThumbnailArg {
    /// Normalized position in [0, 1].
    pub position: f32,
    /// Land on the nearest preceding keyframe instead of the exact frame.
    pub fast_seek: bool,
    /// Allow hardware decoding. The bundled engine always decodes in
    /// software and ignores `true`.
    pub hw_dec: bool,
}

/// One-shot completion callback. Invoked with `None` when no frame could be
/// delivered (decode failure, timeout, or engine tear-down).
pub type OnEnded = Box<dyn FnOnce(Option<DecodedFrame>) + Send + 'static>;

/// The submission contract the thumbnail generator consumes.
pub trait PreparseEngine: Send + Sync + 'static {
    /// Submit an asynchronous thumbnail request.
    ///
    /// `Some(id)` means `on_ended` will be invoked exactly once, eventually.
    /// `None` means the request was rejected and `on_ended` will never run.
    /// Implementations must not invoke `on_ended` synchronously from this
    /// call; callers may hold locks the callback also takes.
    fn submit_thumbnail(
        &self,
        item: &MediaItem,
        arg: ThumbnailArg,
        on_ended: OnEnded,
    ) -> Option<RequestId>;
}

/// Capability mask for a `Preparser` instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparseTypes(u32);

impl PreparseTypes {
    pub const THUMBNAIL: Self = Self(1);
    pub const METADATA: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Error)]
pub enum PreparserError {
    #[error("preparser needs at least one capability")]
    NoCapabilities,
    #[error("preparser needs at least one worker thread")]
    NoWorkers,
    #[error("preparser timeout must be non-zero")]
    ZeroTimeout,
    #[error("codec backend initialization failed: {0}")]
    Backend(#[from] ffmpeg_next::Error),
}

#[derive(Clone, Copy, Debug)]
pub struct PreparserCfg {
    pub types: PreparseTypes,
    /// Per-request deadline; the completion callback fires with no frame
    /// once it elapses.
    pub timeout: Duration,
    pub workers: usize,
}

impl Default for PreparserCfg {
    fn default() -> Self {
        Self {
            types: PreparseTypes::THUMBNAIL,
            timeout: Duration::from_secs(3),
            workers: *DEFAULT_WORKERS,
        }
    }
}

pub(crate) static DEFAULT_WORKERS: LazyLock<usize> = LazyLock::new(|| {
    let num = num_cpus::get().clamp(1, 4);
    info!(num, "Sizing preparser worker pool");
    num
});

/// Shared per-request state. The decode worker and the timeout reaper both
/// reach the callback through here; whoever takes it first delivers the
/// result, the loser's outcome is dropped.
struct RequestShared {
    deadline: Instant,
    on_ended: Mutex<Option<OnEnded>>,
}

impl RequestShared {
    fn finish(&self, frame: Option<DecodedFrame>) {
        let callback = self
            .on_ended
            .lock()
            .expect("preparse callback lock poisoned")
            .take();
        if let Some(callback) = callback {
            callback(frame);
        }
    }
}

struct Request {
    id: RequestId,
    item: MediaItem,
    arg: ThumbnailArg,
    shared: Arc<RequestShared>,
}

#[derive(Default)]
struct ReaperState {
    pending: BTreeMap<(Instant, RequestId), Arc<RequestShared>>,
    shutdown: bool,
}

/// Deadline supervisor: wakes at the earliest pending deadline and fires
/// the no-frame callback for every overdue request.
#[derive(Default)]
struct Reaper {
    state: Mutex<ReaperState>,
    cond: Condvar,
}

impl Reaper {
    fn register(&self, id: RequestId, shared: Arc<RequestShared>) {
        let mut state = self.state.lock().expect("reaper lock poisoned");
        state.pending.insert((shared.deadline, id), shared);
        self.cond.notify_one();
    }

    fn deregister(&self, id: RequestId, deadline: Instant) {
        let mut state = self.state.lock().expect("reaper lock poisoned");
        state.pending.remove(&(deadline, id));
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().expect("reaper lock poisoned");
        state.shutdown = true;
        self.cond.notify_one();
    }

    fn run(self: Arc<Self>) {
        let mut state = self.state.lock().expect("reaper lock poisoned");
        loop {
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            while let Some((&(deadline, _), _)) = state.pending.first_key_value() {
                if deadline > now {
                    break;
                }
                let ((_, id), shared) = state.pending.pop_first().expect("checked non-empty");
                drop(state);
                warn!(request_id = id, "Preparse request timed out");
                shared.finish(None);
                state = self.state.lock().expect("reaper lock poisoned");
            }

            state = match state.pending.first_key_value().map(|(&(d, _), _)| d) {
                Some(next) => {
                    let wait = next.saturating_duration_since(Instant::now());
                    self.cond
                        .wait_timeout(state, wait)
                        .expect("reaper lock poisoned")
                        .0
                }
                None => self.cond.wait(state).expect("reaper lock poisoned"),
            };
        }

        // Complete whatever is still pending so no waiter can hang.
        let leftovers = std::mem::take(&mut state.pending);
        drop(state);
        for ((_, id), shared) in leftovers {
            debug!(request_id = id, "Completing pending request on shutdown");
            shared.finish(None);
        }
    }
}

/// Worker-pool engine decoding one frame per accepted request.
///
/// Dropping the engine closes the queue, completes every outstanding
/// callback, and joins the threads; a drop may therefore block until the
/// decode in progress returns.
pub struct Preparser {
    tx: async_channel::Sender<Request>,
    reaper: Arc<Reaper>,
    next_id: AtomicU64,
    types: PreparseTypes,
    timeout: Duration,
    threads: Vec<JoinHandle<()>>,
}

impl Preparser {
    pub fn new(cfg: PreparserCfg) -> Result<Self, PreparserError> {
        if cfg.types.is_empty() {
            return Err(PreparserError::NoCapabilities);
        }
        if cfg.workers == 0 {
            return Err(PreparserError::NoWorkers);
        }
        if cfg.timeout.is_zero() {
            return Err(PreparserError::ZeroTimeout);
        }
        ffmpeg_next::init()?;

        let reaper = Arc::new(Reaper::default());
        let (tx, rx) = async_channel::unbounded::<Request>();

        let mut threads = Vec::with_capacity(cfg.workers + 1);
        let reaper_handle = reaper.clone();
        threads.push(
            std::thread::Builder::new()
                .name("preparse-reaper".into())
                .spawn(move || reaper_handle.run())
                .expect("failed to spawn preparser reaper"),
        );
        for index in 0..cfg.workers {
            let rx = rx.clone();
            let reaper = reaper.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("preparse-worker-{index}"))
                    .spawn(move || run_worker(index, rx, reaper))
                    .expect("failed to spawn preparser worker"),
            );
        }

        debug!(workers = cfg.workers, timeout = ?cfg.timeout, "Preparser started");
        Ok(Self {
            tx,
            reaper,
            next_id: AtomicU64::new(1),
            types: cfg.types,
            timeout: cfg.timeout,
            threads,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl PreparseEngine for Preparser {
    fn submit_thumbnail(
        &self,
        item: &MediaItem,
        arg: ThumbnailArg,
        on_ended: OnEnded,
    ) -> Option<RequestId> {
        if !self.types.contains(PreparseTypes::THUMBNAIL) {
            warn!(mrl = %item.mrl(), "Thumbnail request on a preparser without the capability");
            return None;
        }
        if !(0.0..=1.0).contains(&arg.position) {
            warn!(position = arg.position, "Rejecting out-of-range seek position");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(RequestShared {
            deadline: Instant::now() + self.timeout,
            on_ended: Mutex::new(Some(on_ended)),
        });

        self.reaper.register(id, shared.clone());
        let request = Request {
            id,
            item: item.clone(),
            arg,
            shared: shared.clone(),
        };
        if self.tx.send_blocking(request).is_err() {
            // Queue closed mid-shutdown; the contract for a rejected
            // submission is that the callback never runs.
            self.reaper.deregister(id, shared.deadline);
            return None;
        }

        debug!(request_id = id, mrl = %item.mrl(), "Thumbnail request queued");
        Some(id)
    }
}

impl Drop for Preparser {
    fn drop(&mut self) {
        self.tx.close();
        self.reaper.shutdown();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn run_worker(index: usize, rx: async_channel::Receiver<Request>, reaper: Arc<Reaper>) {
    while let Ok(Request {
        id,
        item,
        arg,
        shared,
    }) = rx.recv_blocking()
    {
        if Instant::now() >= shared.deadline {
            // Already overdue; the reaper owns this one.
            continue;
        }
        if shared
            .on_ended
            .lock()
            .expect("preparse callback lock poisoned")
            .is_none()
        {
            // Callback already consumed (timeout or shutdown sweep).
            continue;
        }

        debug!(request_id = id, worker = index, mrl = %item.mrl(), "Decoding thumbnail frame");
        let frame = match decoder::fetch_frame(&item, arg) {
            Ok(frame) => Some(frame),
            Err(error) => {
                warn!(request_id = id, mrl = %item.mrl(), ?error, "Frame decode failed");
                None
            }
        };

        reaper.deregister(id, shared.deadline);
        shared.finish(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_item::MediaItem;
    use std::sync::mpsc;

    fn thumbnail_cfg(timeout: Duration) -> PreparserCfg {
        PreparserCfg {
            types: PreparseTypes::THUMBNAIL,
            timeout,
            workers: 1,
        }
    }

    fn any_arg() -> ThumbnailArg {
        ThumbnailArg {
            position: 0.5,
            fast_seek: true,
            hw_dec: false,
        }
    }

    #[test]
    fn test_construction_is_validated() {
        let cfg = PreparserCfg {
            types: PreparseTypes::empty(),
            ..Default::default()
        };
        assert!(matches!(
            Preparser::new(cfg),
            Err(PreparserError::NoCapabilities)
        ));

        let cfg = PreparserCfg {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(Preparser::new(cfg), Err(PreparserError::NoWorkers)));

        let cfg = PreparserCfg {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            Preparser::new(cfg),
            Err(PreparserError::ZeroTimeout)
        ));
    }

    #[test]
    fn test_capability_mask_rejects_thumbnail_requests() {
        let cfg = PreparserCfg {
            types: PreparseTypes::METADATA,
            timeout: Duration::from_secs(3),
            workers: 1,
        };
        let engine = Preparser::new(cfg).unwrap();
        let item = MediaItem::new("/nonexistent/clip.mp4").unwrap();

        let id = engine.submit_thumbnail(&item, any_arg(), Box::new(|_| panic!("must not run")));
        assert!(id.is_none());
    }

    #[test]
    fn test_out_of_range_position_is_rejected() {
        let engine = Preparser::new(thumbnail_cfg(Duration::from_secs(3))).unwrap();
        let item = MediaItem::new("/nonexistent/clip.mp4").unwrap();

        let mut arg = any_arg();
        arg.position = 1.5;
        assert!(
            engine
                .submit_thumbnail(&item, arg, Box::new(|_| panic!("must not run")))
                .is_none()
        );
    }

    #[test]
    fn test_decode_failure_completes_with_no_frame() {
        let engine = Preparser::new(thumbnail_cfg(Duration::from_secs(3))).unwrap();
        let item = MediaItem::new("/nonexistent/clip.mp4").unwrap();

        let (tx, rx) = mpsc::channel();
        let id = engine.submit_thumbnail(
            &item,
            any_arg(),
            Box::new(move |frame| tx.send(frame.is_some()).unwrap()),
        );
        assert!(id.is_some());

        let delivered = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("callback never fired");
        assert!(!delivered);
    }

    #[test]
    fn test_request_ids_are_distinct() {
        let engine = Preparser::new(thumbnail_cfg(Duration::from_secs(3))).unwrap();
        let item = MediaItem::new("/nonexistent/clip.mp4").unwrap();

        let first = engine
            .submit_thumbnail(&item, any_arg(), Box::new(|_| ()))
            .unwrap();
        let second = engine
            .submit_thumbnail(&item, any_arg(), Box::new(|_| ()))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_reaper_fires_overdue_requests() {
        let reaper = Arc::new(Reaper::default());
        let runner = reaper.clone();
        let thread = std::thread::spawn(move || runner.run());

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(RequestShared {
            deadline: Instant::now() + Duration::from_millis(50),
            on_ended: Mutex::new(Some(Box::new(move |frame: Option<DecodedFrame>| {
                tx.send(frame.is_some()).unwrap();
            }) as OnEnded)),
        });
        reaper.register(7, shared);

        let delivered = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("reaper never fired");
        assert!(!delivered);

        reaper.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_shutdown_completes_pending_callbacks() {
        let reaper = Arc::new(Reaper::default());
        let runner = reaper.clone();
        let thread = std::thread::spawn(move || runner.run());

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(RequestShared {
            deadline: Instant::now() + Duration::from_secs(3600),
            on_ended: Mutex::new(Some(Box::new(move |frame: Option<DecodedFrame>| {
                tx.send(frame.is_some()).unwrap();
            }) as OnEnded)),
        });
        reaper.register(11, shared);

        reaper.shutdown();
        thread.join().unwrap();

        let delivered = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("shutdown never completed the callback");
        assert!(!delivered);
    }
}
