use std::io;

/// Encodes a message into a frame.
pub trait Serialize<'a> {
    /// Writes the owned part of the frame into `buf` and returns the trailing
    /// bytes that can be written straight from the original memory, if any.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
