use std::io;

/// Decodes a message from a frame, borrowing from the frame where possible.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
