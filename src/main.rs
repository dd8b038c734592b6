use ffmpeg_next as ffmpeg;
use thumbnail_service::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    ffmpeg::init().expect("Failed to initialize ffmpeg");

    let config = Config::load().expect("Failed to load configuration");
    thumbnail_service::run(config).await;
}
