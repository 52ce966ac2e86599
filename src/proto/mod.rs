//! Wire-level types: sequence numbers, values, messages and the stream codec.

mod codec;
mod message;
mod sequence_number;
mod value;

pub use codec::*;
pub use message::*;
pub use sequence_number::*;
pub use value::*;

#[cfg(test)]
mod codec_test;
