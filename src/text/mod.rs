pub mod breathing;
pub mod chunker;
pub mod normalizer;

pub use breathing::BreathingIntensity;
pub use chunker::{chunk_text, ChunkStrategy, PlannedChunk, DEFAULT_MAX_CHARS};
pub use normalizer::{normalize, CleaningOptions, CodeBlockRule};
