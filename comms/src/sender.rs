//! The sending end of the framed protocol.

use std::{borrow::Cow, io};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    LEN_TYPE_SIZE, LenType, Scalar, Serialize,
    msg::{Command, Msg, Payload},
};

/// The sending end handle of the communication.
///
/// Every frame is written as a big endian length followed by the encoded
/// message. The owned part of the message is staged in a reused buffer, a
/// numeric payload goes to the writer straight from the caller's slice.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    /// Creates a new `OnoSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` as a single frame.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An io error if encoding or writing failed.
    pub async fn send<'a, M: Serialize<'a>>(&mut self, msg: &'a M) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let trailing = msg.serialize(buf)?;
        let len = buf.len() - LEN_TYPE_SIZE + trailing.map_or(0, <[u8]>::len);
        buf[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());

        tx.write_all(buf).await?;
        if let Some(bytes) = trailing {
            tx.write_all(bytes).await?;
        }

        tx.flush().await
    }

    /// Sends a parameter or gradient buffer.
    pub async fn send_data<T: Scalar>(&mut self, payload: Payload<'_, T>) -> io::Result<()> {
        self.send(&Msg::Data(payload)).await
    }

    /// Sends a control command.
    ///
    /// Control frames don't carry a scalar tag, `T` only picks the encoder.
    pub async fn send_command<T: Scalar>(&mut self, cmd: Command) -> io::Result<()> {
        self.send(&Msg::<T>::Control(cmd)).await
    }

    /// Tells the peer the group is being torn down and why.
    pub async fn send_err<T: Scalar>(&mut self, reason: &str) -> io::Result<()> {
        self.send(&Msg::<T>::Err(Cow::Borrowed(reason))).await
    }

    /// Announces the disconnection and closes the writing half.
    pub async fn disconnect<T: Scalar>(&mut self) -> io::Result<()> {
        self.send_command::<T>(Command::Disconnect).await?;
        self.tx.shutdown().await
    }
}
