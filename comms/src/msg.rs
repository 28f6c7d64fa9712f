use std::{borrow::Cow, io};

use crate::{Deserialize, Scalar, ScalarKind, Serialize};

type Header = u64;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: u8 = 0;
const CONTROL_KIND: u8 = 1;
const PARAMS_KIND: u8 = 2;
const GRAD_KIND: u8 = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a, T> {
    /// Model parameters, used by broadcasts and by reduced results.
    Params(&'a [T]),
    /// A worker's gradient contribution to a reduction.
    Grad(&'a [T]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message a follower sends to the coordinator.
    Join {
        rank: usize,
        world_size: usize,
        scalar: ScalarKind,
    },
    /// The coordinator accepted every follower, the group is formed.
    Ready,
    Disconnect,
}

/// The application layer message for the collective protocol.
#[derive(Debug, PartialEq)]
pub enum Msg<'a, T> {
    Control(Command),
    Data(Payload<'a, T>),
    Err(Cow<'a, str>),
}

impl<T> Msg<'_, T> {
    fn buf_is_too_small<U>(size: usize) -> io::Result<U> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<U>(byte: u8) -> io::Result<U> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind byte {byte}"),
        ))
    }

    /// A short name of the message kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Err(_) => "err",
            Msg::Data(Payload::Grad(_)) => "data/gradient",
            Msg::Data(Payload::Params(_)) => "data/params",
        }
    }
}

/// Length of the frame holding a data payload of `count` elements.
pub fn data_frame_len<T: Scalar>(count: usize) -> usize {
    HEADER_SIZE + count * T::KIND.size()
}

fn header(kind: u8, scalar: u8) -> [u8; HEADER_SIZE] {
    (((scalar as Header) << 8) | kind as Header).to_be_bytes()
}

impl<'a, T: Scalar> Serialize<'a> for Msg<'a, T> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&header(ERR_KIND, 0));
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&header(CONTROL_KIND, 0));
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Params(params) => (PARAMS_KIND, *params),
                    Payload::Grad(grad) => (GRAD_KIND, *grad),
                };

                buf.extend_from_slice(&header(kind, T::KIND.tag()));
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a, T: Scalar> Deserialize<'a> for Msg<'a, T> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (head, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut raw = [0; HEADER_SIZE];
        raw.copy_from_slice(head);
        let header = Header::from_be_bytes(raw);

        let kind = (header & 0xff) as u8;
        let scalar = ((header >> 8) & 0xff) as u8;

        match kind {
            ERR_KIND => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            PARAMS_KIND | GRAD_KIND => {
                if ScalarKind::from_tag(scalar) != Some(T::KIND) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Expected {} payload, got scalar tag {scalar}", T::KIND),
                    ));
                }

                let rest: &'a [u8] = rest;
                let nums = bytemuck::try_cast_slice(rest).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}"))
                })?;

                let payload = if kind == PARAMS_KIND {
                    Payload::Params(nums)
                } else {
                    Payload::Grad(nums)
                };

                Ok(Self::Data(payload))
            }
            byte => Self::invalid_kind_byte(byte),
        }
    }
}
