//! Image → WebP sticker conversion.
//!
//! The image is scaled to fit a 512×512 transparent canvas, encoded as WebP,
//! and tagged with an EXIF chunk holding the sticker-pack JSON that chat
//! clients read for the pack name and publisher.

use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbaImage};
use knight_core::{
    error::KnightError,
    event::{ChatMessage, MediaKind, MediaRef, OutgoingMessage},
    traits::Transport,
};
use rand::RngCore;
use serde_json::json;
use std::io::Cursor;
use tracing::warn;

pub const STICKER_SIZE: u32 = 512;

/// TIFF header with one IFD entry (tag 0x5741) pointing at the JSON payload.
const EXIF_HEADER: [u8; 22] = [
    0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01, 0x00, 0x41, 0x57, 0x07, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00,
];
const EXIF_LEN_OFFSET: usize = 14;

const VP8X_FLAG_ALPHA: u8 = 0x10;
const VP8X_FLAG_EXIF: u8 = 0x08;

/// Pack metadata embedded in every sticker.
#[derive(Debug, Clone)]
pub struct StickerMeta {
    pub packname: String,
    pub author: String,
}

const NO_MEDIA: &str =
    "Please reply to an image or video to create a sticker, or send an image or video with the command.";
const VIDEO_UNSUPPORTED: &str = "Video stickers are not supported yet. Please use an image.";
const DOWNLOAD_FAILED: &str = "Failed to download the media. Please try again.";
const CONVERT_FAILED: &str = "An error occurred while creating the sticker. Please try again.";

/// Media the command should convert: quoted media first, then the message's own.
fn pick_media(message: &ChatMessage) -> Option<&MediaRef> {
    message
        .quoted
        .as_ref()
        .and_then(|q| q.media.as_ref())
        .or(message.media.as_ref())
        .filter(|m| matches!(m.kind, MediaKind::Image | MediaKind::Video))
}

pub(super) async fn handle(
    transport: &dyn Transport,
    message: &ChatMessage,
    meta: &StickerMeta,
) -> Result<(), KnightError> {
    let chat = message.chat_id.as_str();
    let reply = |text: &str| OutgoingMessage::text(chat, text).quoting(&message.id);

    let Some(media) = pick_media(message) else {
        return transport.send(reply(NO_MEDIA)).await;
    };
    if media.kind == MediaKind::Video {
        return transport.send(reply(VIDEO_UNSUPPORTED)).await;
    }

    let bytes = match transport.download_media(media).await {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => return transport.send(reply(DOWNLOAD_FAILED)).await,
        Err(e) => {
            warn!("sticker: download failed: {e}");
            return transport.send(reply(DOWNLOAD_FAILED)).await;
        }
    };

    let meta = meta.clone();
    let converted = tokio::task::spawn_blocking(move || make_sticker(&bytes, &meta))
        .await
        .map_err(|e| KnightError::Handler(format!("sticker task failed: {e}")))
        .and_then(|r| r);
    match converted {
        Ok(webp) => transport.send(OutgoingMessage::sticker(chat, webp)).await,
        Err(e) => {
            warn!("sticker: conversion failed: {e}");
            transport.send(reply(CONVERT_FAILED)).await
        }
    }
}

/// Convert raw image bytes into a tagged WebP sticker.
pub fn make_sticker(image_bytes: &[u8], meta: &StickerMeta) -> Result<Vec<u8>, KnightError> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| KnightError::Handler(format!("unsupported image: {e}")))?;
    let canvas = fit_to_canvas(&img, STICKER_SIZE);

    let mut webp = Vec::new();
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut Cursor::new(&mut webp), ImageFormat::WebP)
        .map_err(|e| KnightError::Handler(format!("webp encoding failed: {e}")))?;

    let exif = sticker_exif(meta);
    set_webp_exif(&webp, STICKER_SIZE, STICKER_SIZE, &exif)
}

/// Scale `img` to fit inside a `size`×`size` transparent canvas, centered.
pub fn fit_to_canvas(img: &DynamicImage, size: u32) -> RgbaImage {
    let scaled = img.resize(size, size, FilterType::Lanczos3).to_rgba8();
    let mut canvas = RgbaImage::new(size, size);
    let x = (size - scaled.width()) / 2;
    let y = (size - scaled.height()) / 2;
    image::imageops::overlay(&mut canvas, &scaled, i64::from(x), i64::from(y));
    canvas
}

/// EXIF blob carrying the sticker-pack JSON.
pub fn sticker_exif(meta: &StickerMeta) -> Vec<u8> {
    let mut pack_id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut pack_id);
    let payload = json!({
        "sticker-pack-id": hex::encode(pack_id),
        "sticker-pack-name": meta.packname,
        "sticker-pack-publisher": meta.author,
        "emojis": ["🤖"],
    })
    .to_string();

    let mut exif = EXIF_HEADER.to_vec();
    let len = payload.len() as u32;
    exif[EXIF_LEN_OFFSET..EXIF_LEN_OFFSET + 4].copy_from_slice(&len.to_le_bytes());
    exif.extend_from_slice(payload.as_bytes());
    exif
}

/// One RIFF chunk: fourcc and payload.
struct Chunk<'a> {
    fourcc: [u8; 4],
    data: &'a [u8],
}

fn parse_chunks(webp: &[u8]) -> Result<Vec<Chunk<'_>>, KnightError> {
    let bad = |why: &str| KnightError::Handler(format!("malformed webp: {why}"));
    if webp.len() < 12 || &webp[0..4] != b"RIFF" || &webp[8..12] != b"WEBP" {
        return Err(bad("missing RIFF/WEBP header"));
    }

    let mut chunks = Vec::new();
    let mut pos = 12;
    while pos + 8 <= webp.len() {
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&webp[pos..pos + 4]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&webp[pos + 4..pos + 8]);
        let size = u32::from_le_bytes(size) as usize;
        let start = pos + 8;
        let end = start.checked_add(size).ok_or_else(|| bad("chunk size overflow"))?;
        if end > webp.len() {
            return Err(bad("truncated chunk"));
        }
        chunks.push(Chunk {
            fourcc,
            data: &webp[start..end],
        });
        pos = end + (size & 1);
    }
    if chunks.is_empty() {
        return Err(bad("no chunks"));
    }
    Ok(chunks)
}

fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
}

fn vp8x_payload(flags: u8, width: u32, height: u32) -> [u8; 10] {
    let mut payload = [0u8; 10];
    payload[0] = flags;
    payload[4..7].copy_from_slice(&(width - 1).to_le_bytes()[..3]);
    payload[7..10].copy_from_slice(&(height - 1).to_le_bytes()[..3]);
    payload
}

/// Rewrite a WebP file in the extended (VP8X) layout with `exif` attached.
///
/// Any existing EXIF chunk is replaced.
pub fn set_webp_exif(webp: &[u8], width: u32, height: u32, exif: &[u8]) -> Result<Vec<u8>, KnightError> {
    if width == 0 || height == 0 {
        return Err(KnightError::Handler("empty canvas".into()));
    }
    let chunks = parse_chunks(webp)?;

    let mut body = Vec::with_capacity(webp.len() + exif.len() + 32);
    body.extend_from_slice(b"WEBP");
    match chunks.first() {
        Some(first) if &first.fourcc == b"VP8X" && first.data.len() >= 10 => {
            let mut header = [0u8; 10];
            header.copy_from_slice(&first.data[..10]);
            header[0] |= VP8X_FLAG_EXIF;
            push_chunk(&mut body, b"VP8X", &header);
            for chunk in chunks.iter().skip(1).filter(|c| &c.fourcc != b"EXIF") {
                push_chunk(&mut body, &chunk.fourcc, chunk.data);
            }
        }
        _ => {
            let mut flags = VP8X_FLAG_EXIF;
            if chunks.iter().any(|c| &c.fourcc == b"VP8L" || &c.fourcc == b"ALPH") {
                flags |= VP8X_FLAG_ALPHA;
            }
            push_chunk(&mut body, b"VP8X", &vp8x_payload(flags, width, height));
            for chunk in chunks.iter().filter(|c| &c.fourcc != b"EXIF") {
                push_chunk(&mut body, &chunk.fourcc, chunk.data);
            }
        }
    }
    push_chunk(&mut body, b"EXIF", exif);

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
