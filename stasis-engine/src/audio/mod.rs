//! Audio processing pipeline
//!
//! Decoding, resampling, speed change, and device output. All audio inside
//! the engine is interleaved stereo f32 at 44100 Hz; the decoder layer
//! normalizes every source to that format.

pub mod chunk;
pub mod decoder;
pub mod output;
pub mod resample;
pub mod speed;
pub mod transcode;

pub use chunk::{amp_to_db, db_to_amp, PcmChunk};
pub use decoder::{ChunkStream, Direction};
pub use output::{AudioSink, CpalSink, MemorySink};
pub use speed::{change_speed, cutoff_for_speed, LowPassFilter};
pub use transcode::TranscodeCache;
