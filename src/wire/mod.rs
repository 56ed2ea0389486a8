//! The LTX binary wire protocol: value codec, message types, and the
//! incremental frame parser.

pub mod framer;
pub mod message;
pub mod value;

pub use framer::{Framer, FramerError, FrameResult, INPUT_BUFFER_CAPACITY};
pub use message::{Message, MessageError, MAX_SLOT_ID, SLOT_COUNT};
