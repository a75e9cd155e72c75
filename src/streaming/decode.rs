//! Decode contract between the frame loop and background workers
//!
//! A request carries an immutable locator and a format tag; a response
//! carries decoded attribute buffers or a [`DecodeError`]. Workers never see
//! octree or residency state.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::octree::{NodeKey, NodeId, PointCloudId};

/// Data format of a node payload; one worker pool exists per format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFormat {
    /// Fixed-size little-endian records, see [`BinaryPoint`]
    Binary,
    /// [`DecodeFormat::Binary`] payload wrapped in size-prepended LZ4
    BinaryLz4,
    Las,
    Laz,
    EptBinary,
    EptLaz,
}

impl DecodeFormat {
    /// File extension used when a manifest node names no file
    pub fn extension(self) -> &'static str {
        match self {
            DecodeFormat::Binary | DecodeFormat::EptBinary => "bin",
            DecodeFormat::BinaryLz4 => "bin.lz4",
            DecodeFormat::Las => "las",
            DecodeFormat::Laz | DecodeFormat::EptLaz => "laz",
        }
    }
}

/// Where a node's encoded payload lives
#[derive(Clone, Debug)]
pub enum Locator {
    /// File on disk, read by the worker
    File(PathBuf),
    /// Payload already in memory
    Memory(Arc<[u8]>),
}

impl Locator {
    /// Fetch the encoded bytes. Runs on a worker thread.
    pub fn read(&self) -> Result<Cow<'_, [u8]>, DecodeError> {
        match self {
            Locator::File(path) => std::fs::read(path)
                .map(Cow::Owned)
                .map_err(|e| DecodeError::Io(format!("{}: {}", path.display(), e))),
            Locator::Memory(bytes) => Ok(Cow::Borrowed(&bytes[..])),
        }
    }
}

/// Per-point attribute kinds carried next to positions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PointAttribute {
    /// RGBA, 4 bytes per point
    Color,
    /// u16 per point
    Intensity,
    /// u8 per point
    Classification,
    /// 3 x f32 per point
    Normal,
}

/// Raw bytes of one attribute for every point of a node
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeBuffer {
    pub attribute: PointAttribute,
    pub bytes: Vec<u8>,
}

/// Decoded node payload; positions are in the point cloud's object space
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedBuffers {
    pub positions: Vec<[f32; 3]>,
    pub attributes: Vec<AttributeBuffer>,
}

impl DecodedBuffers {
    pub fn point_count(&self) -> usize {
        self.positions.len()
    }

    pub fn attribute(&self, attribute: PointAttribute) -> Option<&AttributeBuffer> {
        self.attributes.iter().find(|a| a.attribute == attribute)
    }

    /// Approximate host memory held by the buffers
    pub fn byte_size(&self) -> usize {
        self.positions.len() * std::mem::size_of::<[f32; 3]>()
            + self.attributes.iter().map(|a| a.bytes.len()).sum::<usize>()
    }
}

/// Failure code returned by a decode worker; never fatal to a frame
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read payload: {0}")]
    Io(String),

    #[error("payload of {len} bytes is not a multiple of the {stride}-byte record size")]
    Truncated { len: usize, stride: usize },

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("decode worker panicked")]
    WorkerPanicked,

    #[error("worker pool closed")]
    PoolClosed,
}

/// A decode executor. Instances are leased from a per-format pool, so a
/// decoder may keep scratch state between tasks.
pub trait Decoder: Send {
    fn decode(&mut self, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError>;
}

/// Message sent to a worker pool
#[derive(Clone, Debug)]
pub struct DecodeRequest {
    pub key: NodeKey,
    /// Identifies this dispatch; responses with an older ticket are stale
    pub ticket: u64,
    pub locator: Locator,
    pub format: DecodeFormat,
}

/// Message sent back to the frame loop
#[derive(Debug)]
pub struct DecodeResponse {
    pub key: NodeKey,
    pub ticket: u64,
    pub result: Result<DecodedBuffers, DecodeError>,
}

impl DecodeResponse {
    pub fn cloud(&self) -> PointCloudId {
        self.key.cloud
    }

    pub fn node(&self) -> NodeId {
        self.key.node
    }
}

/// On-disk record of the binary format
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BinaryPoint {
    pub position: [f32; 3],
    pub color: [u8; 4],
}

const BINARY_STRIDE: usize = std::mem::size_of::<BinaryPoint>();

/// Decoder for [`DecodeFormat::Binary`]
#[derive(Debug, Default)]
pub struct BinaryDecoder;

impl Decoder for BinaryDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
        decode_binary(bytes)
    }
}

/// Decoder for [`DecodeFormat::BinaryLz4`]
#[derive(Debug, Default)]
pub struct Lz4BinaryDecoder;

impl Decoder for Lz4BinaryDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| DecodeError::Decompress(e.to_string()))?;
        decode_binary(&raw)
    }
}

fn decode_binary(bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
    if bytes.len() % BINARY_STRIDE != 0 {
        return Err(DecodeError::Truncated { len: bytes.len(), stride: BINARY_STRIDE });
    }

    let count = bytes.len() / BINARY_STRIDE;
    let mut positions = Vec::with_capacity(count);
    let mut colors = Vec::with_capacity(count * 4);

    for record in bytes.chunks_exact(BINARY_STRIDE) {
        let point: BinaryPoint = bytemuck::pod_read_unaligned(record);
        positions.push(point.position);
        colors.extend_from_slice(&point.color);
    }

    Ok(DecodedBuffers {
        positions,
        attributes: vec![AttributeBuffer { attribute: PointAttribute::Color, bytes: colors }],
    })
}

/// Encode points in the binary format
pub fn encode_binary(points: &[BinaryPoint]) -> Vec<u8> {
    bytemuck::cast_slice(points).to_vec()
}

/// Encode points in the LZ4-wrapped binary format
pub fn encode_binary_lz4(points: &[BinaryPoint]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(&encode_binary(points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> Vec<BinaryPoint> {
        (0..10)
            .map(|i| BinaryPoint {
                position: [i as f32, 2.0 * i as f32, -(i as f32)],
                color: [i as u8, 255, 0, 255],
            })
            .collect()
    }

    #[test]
    fn test_binary_decode() {
        let bytes = encode_binary(&sample_points());
        assert_eq!(bytes.len(), 10 * 16);

        let decoded = BinaryDecoder.decode(&bytes).unwrap();
        assert_eq!(decoded.point_count(), 10);
        assert_eq!(decoded.positions[3], [3.0, 6.0, -3.0]);

        let colors = decoded.attribute(PointAttribute::Color).unwrap();
        assert_eq!(&colors.bytes[12..16], &[3, 255, 0, 255]);
    }

    #[test]
    fn test_lz4_matches_plain() {
        let points = sample_points();
        let plain = BinaryDecoder.decode(&encode_binary(&points)).unwrap();
        let packed = Lz4BinaryDecoder.decode(&encode_binary_lz4(&points)).unwrap();
        assert_eq!(plain, packed);
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = encode_binary(&sample_points());
        bytes.pop();
        let err = BinaryDecoder.decode(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { stride: 16, .. }));
    }

    #[test]
    fn test_corrupt_lz4() {
        let err = Lz4BinaryDecoder.decode(&[10, 0, 0, 0, 0xff]).unwrap_err();
        assert!(matches!(err, DecodeError::Decompress(_)));
    }

    #[test]
    fn test_memory_locator_read() {
        let locator = Locator::Memory(Arc::from(vec![1u8, 2, 3]));
        assert_eq!(&*locator.read().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_missing_file_locator() {
        let locator = Locator::File(PathBuf::from("/definitely/not/here.bin"));
        assert!(matches!(locator.read(), Err(DecodeError::Io(_))));
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        let decoded = BinaryDecoder.decode(&[]).unwrap();
        assert_eq!(decoded.point_count(), 0);
        assert_eq!(decoded.byte_size(), 0);
    }
}
