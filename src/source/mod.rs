pub mod fingerprint;
pub mod normalizer;
pub mod reader;
pub mod timestamp;

pub use normalizer::{LogEvent, LogLevel, Normalizer};
pub use reader::{
    find_rotated_sibling, rotated_suffix_date, Discontinuity, LineReader, RawLine, ReaderError,
};
pub use timestamp::{TimestampError, TimestampExtractor};
