//! Audio device I/O.

pub mod stream;

pub use stream::{DuplexAudioStream, StreamState};
