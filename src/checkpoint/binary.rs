//! Flat binary artifacts.
//!
//! Every artifact starts with an 8 byte magic, a u32 version and the scalar tag
//! padded to 8 bytes. Integers are little endian u64s, strings are length
//! prefixed and numeric sections are `count` scalars in host byte order.

use std::path::PathBuf;

use comms::{Scalar, ScalarKind};

use super::{ModelArtifact, SolverState};
use crate::{
    error::{Result, SolverErr},
    net::ParamBlob,
};

const MODEL_MAGIC: &[u8; 8] = b"SLVMODEL";
const STATE_MAGIC: &[u8; 8] = b"SLVSTATE";
const VERSION: u32 = 1;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new<T: Scalar>(magic: &[u8; 8]) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(magic);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&[T::KIND.tag(), 0, 0, 0]);
        Self { buf }
    }

    fn u64(&mut self, value: usize) {
        self.buf.extend_from_slice(&(value as u64).to_le_bytes());
    }

    fn str(&mut self, value: &str) {
        self.u64(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn nums<T: Scalar>(&mut self, nums: &[T]) {
        self.u64(nums.len());
        self.buf.extend_from_slice(bytemuck::cast_slice(nums));
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new<T: Scalar>(buf: &'a [u8], magic: &[u8; 8]) -> Result<Self> {
        let mut reader = Self { buf, pos: 0 };

        if reader.take(8)? != magic {
            return Err(malformed("bad magic"));
        }

        let mut version = [0; 4];
        version.copy_from_slice(reader.take(4)?);
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(malformed(&format!("unsupported version {version}")));
        }

        let tag = reader.take(4)?[0];
        if ScalarKind::from_tag(tag) != Some(T::KIND) {
            return Err(malformed(&format!(
                "written with scalar tag {tag}, expected {}",
                T::KIND
            )));
        }

        Ok(reader)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| malformed("truncated artifact"))?;

        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u64(&mut self) -> Result<usize> {
        let mut raw = [0; 8];
        raw.copy_from_slice(self.take(8)?);
        usize::try_from(u64::from_le_bytes(raw)).map_err(|_| malformed("length overflow"))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("non utf-8 string"))
    }

    fn nums<T: Scalar>(&mut self) -> Result<Vec<T>> {
        let count = self.u64()?;
        let size = T::KIND.size();
        let bytes = self.take(count.checked_mul(size).ok_or_else(|| malformed("length overflow"))?)?;
        Ok(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned::<T>).collect())
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(malformed("trailing bytes"));
        }
        Ok(())
    }
}

fn malformed(reason: &str) -> SolverErr {
    SolverErr::Checkpoint(format!("malformed binary artifact: {reason}"))
}

pub(super) fn encode_model<T: Scalar>(iter: usize, blobs: &[ParamBlob<T>], with_diff: bool) -> Vec<u8> {
    let mut w = Writer::new::<T>(MODEL_MAGIC);
    w.u64(iter);
    w.u64(with_diff as usize);
    w.u64(blobs.len());

    for blob in blobs {
        w.str(&blob.name);
        w.nums(&blob.data);
        if with_diff {
            w.nums(&blob.diff);
        }
    }

    w.buf
}

pub(super) fn decode_model<T: Scalar>(buf: &[u8]) -> Result<ModelArtifact<T>> {
    let mut r = Reader::new::<T>(buf, MODEL_MAGIC)?;
    let iter = r.u64()?;
    let with_diff = r.u64()? != 0;
    let count = r.u64()?;

    let mut blobs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name = r.string()?;
        let data = r.nums()?;
        let diff = if with_diff { r.nums()? } else { Vec::new() };
        blobs.push(ParamBlob { name, data, diff });
    }

    r.finish()?;
    Ok(ModelArtifact { iter, blobs })
}

pub(super) fn encode_state<T: Scalar>(state: &SolverState<T>) -> Vec<u8> {
    let mut w = Writer::new::<T>(STATE_MAGIC);
    w.u64(state.iter);
    w.u64(state.current_step);
    w.str(&state.learned_net.to_string_lossy());
    w.u64(state.history.len());

    for buf in &state.history {
        w.nums(buf);
    }

    w.buf
}

pub(super) fn decode_state<T: Scalar>(buf: &[u8]) -> Result<SolverState<T>> {
    let mut r = Reader::new::<T>(buf, STATE_MAGIC)?;
    let iter = r.u64()?;
    let current_step = r.u64()?;
    let learned_net = PathBuf::from(r.string()?);
    let count = r.u64()?;

    let mut history = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        history.push(r.nums()?);
    }

    r.finish()?;
    Ok(SolverState {
        iter,
        current_step,
        learned_net,
        history,
    })
}
