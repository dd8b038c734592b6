use anyhow::{Context as _, anyhow, bail};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{Rescale, codec, format, frame, media, rescale};
use tracing::{debug, trace, warn};

use super::{DecodedFrame, ThumbnailArg};
use crate::media_item::{MediaItem, NO_HARDWARE_DECODE};

/// Open `item`, seek to the requested fraction of its duration, and return
/// the first decodable frame as packed RGB24 at native size.
pub(super) fn fetch_frame(item: &MediaItem, arg: ThumbnailArg) -> anyhow::Result<DecodedFrame> {
    let path = item
        .location()
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 media path"))?;

    let mut open_opts = ffmpeg_next::Dictionary::new();
    open_opts.set("probesize", "5000000"); // Read 5 MB data to probe
    open_opts.set("analyzeduration", "10000000"); // Read 10 s data to analyze

    let mut ictx = format::input_with_dictionary(path, open_opts)
        .with_context(|| format!("failed to open input {}", item.mrl()))?;

    let (stream_index, time_base, parameters) = {
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("no video stream in {}", item.mrl()))?;
        (stream.index(), stream.time_base(), stream.parameters())
    };

    // This engine only does software decoding; the trusted item option is
    // what callers use to insist on it.
    if item.has_trusted_option(NO_HARDWARE_DECODE) || !arg.hw_dec {
        trace!(mrl = %item.mrl(), "software decode path");
    }

    let codec_ctx = codec::context::Context::from_parameters(parameters)?;
    let mut decoder = codec_ctx.decoder().video()?;

    // Fast seek lands on the keyframe at or before the target; precise seek
    // then decodes forward until the target timestamp.
    let duration = ictx.duration();
    let target = if duration > 0 {
        (duration as f64 * f64::from(arg.position.clamp(0.0, 1.0))) as i64
    } else {
        0
    };
    if target > 0 {
        ictx.seek(target, ..target)
            .with_context(|| format!("seek to position {} failed", arg.position))?;
    }
    let target_pts = (target > 0).then(|| target.rescale(rescale::TIME_BASE, time_base));

    let mut decoded = frame::Video::empty();
    let mut source = None;

    'packets: for (stream, packet) in ictx.packets() {
        if stream.index() != stream_index {
            continue;
        }
        if decoder.send_packet(&packet).is_err() {
            warn!(mrl = %item.mrl(), "Video decoder rejected a packet, skipping");
            continue;
        }
        while decoder.receive_frame(&mut decoded).is_ok() {
            if !arg.fast_seek
                && let Some(target) = target_pts
                && decoded.pts().is_some_and(|pts| pts < target)
            {
                trace!(pts = ?decoded.pts(), target, "frame before precise-seek target, skipping");
                continue;
            }
            source = Some(std::mem::replace(&mut decoded, frame::Video::empty()));
            break 'packets;
        }
    }

    // Short streams may need the decoder drained before the first frame
    // comes out.
    if source.is_none() {
        let _ = decoder.send_eof();
        if decoder.receive_frame(&mut decoded).is_ok() {
            source = Some(std::mem::replace(&mut decoded, frame::Video::empty()));
        }
    }

    let source = source.ok_or_else(|| anyhow!("no decodable frame in {}", item.mrl()))?;
    if source.width() == 0 || source.height() == 0 {
        bail!("decoder produced an empty frame for {}", item.mrl());
    }

    let mut scaler = Scaler::get(
        source.format(),
        source.width(),
        source.height(),
        Pixel::RGB24,
        source.width(),
        source.height(),
        Flags::BILINEAR,
    )?;
    let mut rgb = frame::Video::empty();
    scaler.run(&source, &mut rgb)?;

    // data(0) is stride-padded; copy row by row
    let width = rgb.width();
    let height = rgb.height();
    let stride = rgb.stride(0);
    let row_len = width as usize * 3;
    let plane = rgb.data(0);
    let mut data = Vec::with_capacity(row_len * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        data.extend_from_slice(&plane[start..start + row_len]);
    }

    debug!(width, height, mrl = %item.mrl(), "Decoded thumbnail source frame");
    Ok(DecodedFrame {
        width,
        height,
        data,
    })
}
