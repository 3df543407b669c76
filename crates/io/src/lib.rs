//! BDN.IO - byte buffers and binary serialization.
//!
//! This crate provides the chunked input/output buffers every connection
//! owns and the reader/writer pair the wire payload codecs are built on.

mod error;
mod input_buffer;
mod output_buffer;
mod reader;
mod serializable;
mod writer;

pub use error::{IoError, IoResult};
pub use input_buffer::InputBuffer;
pub use output_buffer::OutputBuffer;
pub use reader::MemoryReader;
pub use serializable::{Serializable, SerializableExt};
pub use writer::BinaryWriter;
