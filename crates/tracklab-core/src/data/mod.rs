//! User-facing value types and the parser that turns them into typed metrics.

pub mod media;
pub(crate) mod parser;
pub mod value;

pub use media::{Array, ArrayData, Audio, Image, MediaBuffer, Text};
pub use parser::MAX_LIST_LEN;
pub use value::{Line, LineValue, LogData, Value};
