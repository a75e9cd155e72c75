//! Residency and asynchronous loading of node payloads

pub mod decode;
pub mod pool;
pub mod pipeline;
pub mod cache;

pub use decode::{
    BinaryDecoder, BinaryPoint, DecodeError, DecodeFormat, DecodeRequest, DecodeResponse,
    DecodedBuffers, Decoder, Locator, Lz4BinaryDecoder, PointAttribute,
    encode_binary, encode_binary_lz4,
};
pub use pool::{DecoderFactory, WorkerLease, WorkerPool};
pub use pipeline::LoadPipeline;
pub use cache::ResidencyCache;
