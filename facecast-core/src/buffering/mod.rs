//! Audio buffering.
//!
//! Two buffers with different jobs:
//!
//! - [`ring::AudioRingBuffer`] is the pipeline's growable accumulator. Arbitrary
//!   length pushes go in, fixed-size overlapping windows come out.
//! - The SPSC ring created by [`create_audio_sink`] is a lock-free
//!   `ringbuf::HeapRb<f32>` whose producer half is handed to whoever captures
//!   audio for a live [`FaceEngine`](crate::engine::FaceEngine). Its
//!   `push_slice` is wait-free, so it is safe to call from an audio callback.

pub mod chunk;
pub mod ring;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the audio source.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the engine worker.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Live sink capacity: 2^20 f32 samples ≈ 65 s at 16 kHz.
pub const SINK_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_audio_sink() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(SINK_CAPACITY).split()
}
