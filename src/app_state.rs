use crate::config::Config;
use crate::thumbnail::ThumbnailGenerator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;

const MEDIA_DIR: &str = "media";
const THUMBNAILS_DIR: &str = "thumbnails";

async fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace.join(MEDIA_DIR)).await?;
    tokio::fs::create_dir_all(workspace.join(THUMBNAILS_DIR)).await?;
    Ok(())
}

#[derive(Default)]
pub struct GeneratorStats {
    pub generated: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_served: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<ThumbnailGenerator>,
    /// `generate` is not reentrant per instance; every caller goes through
    /// this gate.
    pub generate_gate: Arc<TokioMutex<()>>,
    pub stats: Arc<GeneratorStats>,

    media_dir: PathBuf,
    thumbnails_dir: PathBuf,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let workspace = PathBuf::from(&config.workspace);
        init_workspace(&workspace).await?;

        let generator = Arc::new(ThumbnailGenerator::new(config)?);
        info!(
            workers = config.effective_engine_workers(),
            timeout_secs = config.timeout_secs,
            "Thumbnail generator ready"
        );

        Ok(Self {
            generator,
            generate_gate: Arc::new(TokioMutex::new(())),
            stats: Arc::new(GeneratorStats::default()),

            media_dir: workspace.join(MEDIA_DIR),
            thumbnails_dir: workspace.join(THUMBNAILS_DIR),
        })
    }

    pub fn media_dir(&self) -> &Path {
        self.media_dir.as_path()
    }

    pub fn thumbnails_dir(&self) -> &Path {
        self.thumbnails_dir.as_path()
    }

    /// Resolve a request locator: absolute paths and scheme-carrying MRLs
    /// pass through, bare names are looked up in the media directory.
    pub fn resolve_mrl(&self, mrl: &str) -> String {
        if mrl.starts_with('/') || mrl.contains("://") {
            mrl.to_string()
        } else {
            self.media_dir.join(mrl).to_string_lossy().into_owned()
        }
    }
}
