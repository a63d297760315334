//! Millisecond/frame timing conversions
//!
//! The engine processes audio in fixed-duration chunks at a single internal
//! sample rate. Positions are reported to clients in milliseconds and tracked
//! internally in frames; these helpers keep the two representations consistent.
//!
//! A *frame* is one sample per channel. All conversions here are
//! channel-agnostic.

/// Internal engine sample rate in Hz. Every source is normalized to this rate
/// at decode time.
pub const ENGINE_RATE: u32 = 44_100;

/// Chunk duration in milliseconds. One chunk is the engine's unit of work and
/// its cancellation latency: external commands take effect on the next chunk
/// boundary.
pub const CHUNK_MS: u64 = 50;

/// Convert a millisecond duration to a frame count at the given rate.
///
/// Uses truncating arithmetic: `frames = ms × rate ÷ 1000`. For the engine
/// rate and chunk size this is exact (50 ms × 44 100 Hz = 2 205 frames).
pub fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    ms * sample_rate as u64 / 1000
}

/// Convert a frame count to milliseconds at the given rate, rounded to the
/// nearest millisecond.
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    (frames * 1000 + sample_rate as u64 / 2) / sample_rate as u64
}

/// Frames per chunk at the given rate.
pub fn chunk_frames(sample_rate: u32) -> u64 {
    ms_to_frames(CHUNK_MS, sample_rate)
}

/// Number of chunks needed to cover `frames` frames. The final chunk may be
/// shorter than a full chunk; zero frames need zero chunks.
pub fn num_chunks(frames: u64, sample_rate: u32) -> u64 {
    let per_chunk = chunk_frames(sample_rate);
    frames.div_ceil(per_chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_to_frames_engine_rate() {
        assert_eq!(ms_to_frames(0, ENGINE_RATE), 0);
        assert_eq!(ms_to_frames(1000, ENGINE_RATE), 44_100);
        assert_eq!(ms_to_frames(CHUNK_MS, ENGINE_RATE), 2_205);
    }

    #[test]
    fn test_frames_to_ms_rounds() {
        assert_eq!(frames_to_ms(44_100, ENGINE_RATE), 1000);
        // 22 frames at 44.1kHz is ~0.4989 ms, rounds to 0
        assert_eq!(frames_to_ms(22, ENGINE_RATE), 0);
        // 23 frames is ~0.5215 ms, rounds to 1
        assert_eq!(frames_to_ms(23, ENGINE_RATE), 1);
    }

    #[test]
    fn test_round_trip_chunk_aligned() {
        for chunks in [1u64, 7, 100, 1234] {
            let frames = chunks * chunk_frames(ENGINE_RATE);
            let ms = frames_to_ms(frames, ENGINE_RATE);
            assert_eq!(ms_to_frames(ms, ENGINE_RATE), frames);
        }
    }

    #[test]
    fn test_num_chunks_ceiling() {
        let per_chunk = chunk_frames(ENGINE_RATE);
        assert_eq!(num_chunks(0, ENGINE_RATE), 0);
        assert_eq!(num_chunks(1, ENGINE_RATE), 1);
        assert_eq!(num_chunks(per_chunk, ENGINE_RATE), 1);
        assert_eq!(num_chunks(per_chunk + 1, ENGINE_RATE), 2);
        assert_eq!(num_chunks(per_chunk * 10, ENGINE_RATE), 10);
    }

    #[test]
    fn test_thirty_second_track_chunk_count() {
        // 30s at the engine rate is 1,323,000 frames, exactly 600 chunks
        let frames = ms_to_frames(30_000, ENGINE_RATE);
        assert_eq!(num_chunks(frames, ENGINE_RATE), 600);
    }
}
