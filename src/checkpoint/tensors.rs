//! Keyed tensor artifacts, stored as safetensors containers.
//!
//! Blob order and every counter live in the header metadata, tensors are keyed
//! by position so duplicated blob names are kept apart.

use std::{collections::HashMap, path::PathBuf};

use comms::{Scalar, ScalarKind};
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use super::{ModelArtifact, SolverState};
use crate::{
    error::{Result, SolverErr},
    net::ParamBlob,
};

const KIND_KEY: &str = "artifact";
const MODEL_KIND: &str = "model";
const STATE_KIND: &str = "solver_state";

fn dtype<T: Scalar>() -> Dtype {
    match T::KIND {
        ScalarKind::F32 => Dtype::F32,
        ScalarKind::F64 => Dtype::F64,
    }
}

fn malformed(reason: impl AsRef<str>) -> SolverErr {
    SolverErr::Checkpoint(format!("malformed tensor artifact: {}", reason.as_ref()))
}

fn data_key(i: usize) -> String {
    format!("{i}/data")
}

fn diff_key(i: usize) -> String {
    format!("{i}/diff")
}

fn history_key(i: usize) -> String {
    format!("history/{i}")
}

fn view<T: Scalar>(nums: &[T]) -> Result<TensorView<'_>> {
    Ok(TensorView::new(
        dtype::<T>(),
        vec![nums.len()],
        bytemuck::cast_slice(nums),
    )?)
}

/// Reads the metadata header of a container, checking what kind of artifact it holds.
fn metadata(buf: &[u8], kind: &str) -> Result<HashMap<String, String>> {
    let (_, header) = SafeTensors::read_metadata(buf)?;
    let metadata = header
        .metadata()
        .clone()
        .ok_or_else(|| malformed("missing metadata"))?;

    match metadata.get(KIND_KEY) {
        Some(found) if found == kind => Ok(metadata),
        found => Err(malformed(format!("expected a {kind} artifact, found {found:?}"))),
    }
}

fn field<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| malformed(format!("missing {key}")))
}

fn counter(metadata: &HashMap<String, String>, key: &str) -> Result<usize> {
    field(metadata, key)?
        .parse()
        .map_err(|_| malformed(format!("{key} is not a counter")))
}

fn read_nums<T: Scalar>(tensors: &SafeTensors<'_>, key: &str) -> Result<Vec<T>> {
    let tensor = tensors.tensor(key)?;
    if tensor.dtype() != dtype::<T>() {
        return Err(malformed(format!(
            "{key} holds {:?}, expected {:?}",
            tensor.dtype(),
            dtype::<T>()
        )));
    }

    let size = T::KIND.size();
    Ok(tensor
        .data()
        .chunks_exact(size)
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect())
}

pub(super) fn encode_model<T: Scalar>(
    iter: usize,
    blobs: &[ParamBlob<T>],
    with_diff: bool,
) -> Result<Vec<u8>> {
    let mut tensors = Vec::with_capacity(blobs.len() * 2);
    for (i, blob) in blobs.iter().enumerate() {
        tensors.push((data_key(i), view(&blob.data)?));
        if with_diff {
            tensors.push((diff_key(i), view(&blob.diff)?));
        }
    }

    let names: Vec<&str> = blobs.iter().map(|blob| blob.name.as_str()).collect();
    let names = serde_json::to_string(&names).map_err(|e| malformed(e.to_string()))?;
    let metadata = HashMap::from([
        (KIND_KEY.to_string(), MODEL_KIND.to_string()),
        ("iter".to_string(), iter.to_string()),
        ("with_diff".to_string(), with_diff.to_string()),
        ("blobs".to_string(), names),
    ]);

    Ok(safetensors::serialize(tensors, &Some(metadata))?)
}

pub(super) fn decode_model<T: Scalar>(buf: &[u8]) -> Result<ModelArtifact<T>> {
    let metadata = metadata(buf, MODEL_KIND)?;
    let iter = counter(&metadata, "iter")?;
    let with_diff = field(&metadata, "with_diff")? == "true";
    let names: Vec<String> = serde_json::from_str(field(&metadata, "blobs")?)
        .map_err(|e| malformed(format!("bad blob list: {e}")))?;

    let tensors = SafeTensors::deserialize(buf)?;
    let blobs = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let data = read_nums(&tensors, &data_key(i))?;
            let diff = if with_diff {
                read_nums(&tensors, &diff_key(i))?
            } else {
                Vec::new()
            };
            Ok(ParamBlob { name, data, diff })
        })
        .collect::<Result<_>>()?;

    Ok(ModelArtifact { iter, blobs })
}

pub(super) fn encode_state<T: Scalar>(state: &SolverState<T>) -> Result<Vec<u8>> {
    let tensors = state
        .history
        .iter()
        .enumerate()
        .map(|(i, buf)| Ok((history_key(i), view(buf)?)))
        .collect::<Result<Vec<_>>>()?;

    let metadata = HashMap::from([
        (KIND_KEY.to_string(), STATE_KIND.to_string()),
        ("iter".to_string(), state.iter.to_string()),
        ("current_step".to_string(), state.current_step.to_string()),
        (
            "learned_net".to_string(),
            state.learned_net.to_string_lossy().into_owned(),
        ),
        ("history".to_string(), state.history.len().to_string()),
    ]);

    Ok(safetensors::serialize(tensors, &Some(metadata))?)
}

pub(super) fn decode_state<T: Scalar>(buf: &[u8]) -> Result<SolverState<T>> {
    let metadata = metadata(buf, STATE_KIND)?;
    let tensors = SafeTensors::deserialize(buf)?;

    let history = (0..counter(&metadata, "history")?)
        .map(|i| read_nums(&tensors, &history_key(i)))
        .collect::<Result<_>>()?;

    Ok(SolverState {
        iter: counter(&metadata, "iter")?,
        current_step: counter(&metadata, "current_step")?,
        learned_net: PathBuf::from(field(&metadata, "learned_net")?),
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_keeps_order_and_duplicated_names() {
        let mut first = ParamBlob::new("fc/weight", vec![1.0_f64, 2.0, 3.0]);
        first.diff = vec![-1.0, -2.0, -3.0];
        let model = ModelArtifact {
            iter: 1000,
            blobs: vec![
                first,
                ParamBlob::new("shared", vec![4.0]),
                ParamBlob::new("shared", vec![5.0, 6.0]),
            ],
        };

        let bytes = encode_model(model.iter, &model.blobs, true).unwrap();
        let decoded: ModelArtifact<f64> = decode_model(&bytes).unwrap();
        assert_eq!(decoded, model);

        let bytes = encode_model(model.iter, &model.blobs, false).unwrap();
        let decoded: ModelArtifact<f64> = decode_model(&bytes).unwrap();
        assert_eq!(decoded.blobs[2].data, vec![5.0, 6.0]);
        assert!(decoded.blobs.iter().all(|blob| blob.diff.is_empty()));
    }

    #[test]
    fn state_keeps_counters_and_history() {
        let state = SolverState {
            iter: 7,
            current_step: 3,
            learned_net: PathBuf::from("out/lenet_iter_7.caffemodel.h5"),
            history: vec![vec![0.25_f32; 4], vec![1.5]],
        };

        let decoded: SolverState<f32> = decode_state(&encode_state(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn artifacts_are_not_interchangeable() {
        let state = SolverState::<f32> {
            iter: 1,
            current_step: 0,
            learned_net: PathBuf::from("a"),
            history: Vec::new(),
        };

        let bytes = encode_state(&state).unwrap();
        assert!(decode_model::<f32>(&bytes).is_err());

        let model = ModelArtifact {
            iter: 1,
            blobs: vec![ParamBlob::new("w", vec![1.0_f32])],
        };
        let bytes = encode_model(model.iter, &model.blobs, false).unwrap();
        assert!(decode_model::<f64>(&bytes).is_err());
    }
}
