use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    max_frame: Option<usize>,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance, with no frame size limit.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self { rx, max_frame: None }
    }

    /// Limits the length of the next frames, `None` lifts the limit.
    ///
    /// A frame announcing more bytes is rejected before anything is allocated
    /// for it.
    pub fn set_max_frame(&mut self, max_frame: Option<usize>) {
        self.max_frame = max_frame;
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// The buffer is made of 8 byte words so that any numeric payload that
    /// follows the frame header is aligned for every supported scalar type.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///           `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// The decoded message, `InvalidData` if the frame is over the size limit
    /// or malformed, or any io error of the reader.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<u64>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = usize::try_from(LenType::from_be_bytes(size_buf))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        if let Some(max) = self.max_frame.filter(|&max| len > max) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes is over the {max} bytes limit"),
            ));
        }

        let words = len.div_ceil(size_of::<u64>());
        buf.clear();
        buf.resize(words, 0);

        let view: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let slice = &mut view[..len];
        self.rx.read_exact(slice).await?;

        T::deserialize(slice)
    }
}
