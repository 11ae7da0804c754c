//! Streaming Matroska framing for raw RGBA frames piped into `ffmpeg`.
//!
//! Plain `rawvideo` input only knows a constant rate, so every frame is wrapped in its own
//! cluster carrying the frame's timestamp (microsecond timestamp scale). The segment has
//! unknown size, which the matroska demuxer accepts on a pipe.

use crate::foundation::core::{Fps, Size, Timestamp};

const EBML: u32 = 0x1A45_DFA3;
const EBML_VERSION: u32 = 0x4286;
const EBML_READ_VERSION: u32 = 0x42F7;
const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const DOC_TYPE: u32 = 0x4282;
const DOC_TYPE_VERSION: u32 = 0x4287;
const DOC_TYPE_READ_VERSION: u32 = 0x4285;

const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
const MUXING_APP: u32 = 0x4D80;
const WRITING_APP: u32 = 0x5741;

const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_UID: u32 = 0x73C5;
const TRACK_TYPE: u32 = 0x83;
const FLAG_LACING: u32 = 0x9C;
const CODEC_ID: u32 = 0x86;
const DEFAULT_DURATION: u32 = 0x23_E383;
const VIDEO: u32 = 0xE0;
const PIXEL_WIDTH: u32 = 0xB0;
const PIXEL_HEIGHT: u32 = 0xBA;
const COLOUR_SPACE: u32 = 0x2E_B524;

const CLUSTER: u32 = 0x1F43_B675;
const CLUSTER_TIMESTAMP: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

/// Nanoseconds per timestamp tick: one tick is one microsecond, like [`Timestamp`].
const NS_PER_TICK: u64 = 1_000;
/// Unknown-size marker (8-byte vint, all value bits set).
const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
/// Track 1, relative timestamp 0, keyframe.
const BLOCK_HEADER: [u8; 4] = [0x81, 0x00, 0x00, 0x80];

fn put_id(buf: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    buf.extend_from_slice(&bytes[skip..]);
}

/// Element sizes always use the 8-byte form so headers can be sized up front.
fn put_size(buf: &mut Vec<u8>, len: u64) {
    let bytes = len.to_be_bytes();
    buf.push(0x01);
    buf.extend_from_slice(&bytes[1..]);
}

fn put_uint(buf: &mut Vec<u8>, id: u32, v: u64) {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    put_id(buf, id);
    put_size(buf, (8 - skip) as u64);
    buf.extend_from_slice(&bytes[skip..]);
}

fn put_bytes(buf: &mut Vec<u8>, id: u32, data: &[u8]) {
    put_id(buf, id);
    put_size(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn put_master(buf: &mut Vec<u8>, id: u32, children: impl FnOnce(&mut Vec<u8>)) {
    let mut inner = Vec::new();
    children(&mut inner);
    put_bytes(buf, id, &inner);
}

/// EBML header, open segment, segment info and the single RGBA video track.
pub(crate) fn stream_header(size: Size, fps: Fps) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    put_master(&mut buf, EBML, |b| {
        put_uint(b, EBML_VERSION, 1);
        put_uint(b, EBML_READ_VERSION, 1);
        put_uint(b, EBML_MAX_ID_LENGTH, 4);
        put_uint(b, EBML_MAX_SIZE_LENGTH, 8);
        put_bytes(b, DOC_TYPE, b"matroska");
        put_uint(b, DOC_TYPE_VERSION, 4);
        put_uint(b, DOC_TYPE_READ_VERSION, 2);
    });

    put_id(&mut buf, SEGMENT);
    buf.extend_from_slice(&UNKNOWN_SIZE);

    put_master(&mut buf, INFO, |b| {
        put_uint(b, TIMESTAMP_SCALE, NS_PER_TICK);
        put_bytes(b, MUXING_APP, b"burnin");
        put_bytes(b, WRITING_APP, b"burnin");
    });

    let frame_ns = (fps.frame_duration_secs() * 1e9).round() as u64;
    put_master(&mut buf, TRACKS, |b| {
        put_master(b, TRACK_ENTRY, |t| {
            put_uint(t, TRACK_NUMBER, 1);
            put_uint(t, TRACK_UID, 1);
            put_uint(t, TRACK_TYPE, 1);
            put_uint(t, FLAG_LACING, 0);
            put_bytes(t, CODEC_ID, b"V_UNCOMPRESSED");
            put_uint(t, DEFAULT_DURATION, frame_ns);
            put_master(t, VIDEO, |v| {
                put_uint(v, PIXEL_WIDTH, u64::from(size.width));
                put_uint(v, PIXEL_HEIGHT, u64::from(size.height));
                put_bytes(v, COLOUR_SPACE, b"RGBA");
            });
        });
    });
    buf
}

/// Cluster and block headers for one frame of `frame_len` bytes; the pixels follow directly.
pub(crate) fn frame_prefix(pts: Timestamp, frame_len: usize) -> Vec<u8> {
    let mut timestamp = Vec::with_capacity(10);
    put_uint(&mut timestamp, CLUSTER_TIMESTAMP, pts.0.max(0) as u64);

    let block_len = (BLOCK_HEADER.len() + frame_len) as u64;
    // Block element: 1-byte id + 8-byte size + payload.
    let cluster_len = timestamp.len() as u64 + 1 + 8 + block_len;

    let mut buf = Vec::with_capacity(32);
    put_id(&mut buf, CLUSTER);
    put_size(&mut buf, cluster_len);
    buf.extend_from_slice(&timestamp);
    put_id(&mut buf, SIMPLE_BLOCK);
    put_size(&mut buf, block_len);
    buf.extend_from_slice(&BLOCK_HEADER);
    buf
}
