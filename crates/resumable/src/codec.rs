//! Snapshot codec.
//!
//! Snapshots are encoded as self-describing JSON. Decoding yields a generic
//! [`Value`] tree with no schema applied: unknown keys pass through and
//! missing keys are left for the caller to default. Tensors use the ndarray
//! serde form `{"v": 1, "dim": [..], "data": [..]}`, except that non-finite
//! elements are written as the strings `"NaN"`, `"inf"` and `"-inf"`.

use std::path::Path;

use serde_json::Value;

use crate::checkpoint::Snapshot;
use crate::run::StateDict;
use crate::store::ArtifactStore;
use crate::{CheckpointError, Result};

/// Encode a full snapshot.
pub fn encode(snapshot: &Snapshot) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(snapshot)
}

/// Encode a bare parameter mapping (the deployment artifact).
pub fn encode_state_dict(state: &StateDict) -> serde_json::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    state_dict::serialize(state, &mut serde_json::Serializer::new(&mut bytes))?;
    Ok(bytes)
}

/// Decode a parameter mapping from a value tree.
pub fn state_dict_from_value(value: Value) -> serde_json::Result<StateDict> {
    state_dict::deserialize(value)
}

/// Decode bytes into an unvalidated value tree.
pub fn decode(bytes: &[u8]) -> serde_json::Result<Value> {
    serde_json::from_slice(bytes)
}

/// Read and decode the artifact at `path`.
pub fn read_value(store: &dyn ArtifactStore, path: &Path) -> Result<Value> {
    let bytes = store.read(path)?;
    decode(&bytes).map_err(|source| CheckpointError::Codec {
        path: path.to_path_buf(),
        source,
    })
}

/// Encode `snapshot` and atomically write it to every path in `paths`.
pub fn write_snapshot<P: AsRef<Path>>(
    store: &dyn ArtifactStore,
    snapshot: &Snapshot,
    paths: &[P],
) -> Result<()> {
    let Some(first) = paths.first() else {
        return Ok(());
    };

    let bytes = encode(snapshot).map_err(|source| CheckpointError::Codec {
        path: first.as_ref().to_path_buf(),
        source,
    })?;

    for path in paths {
        store.write_atomic(path.as_ref(), &bytes)?;
    }
    Ok(())
}

/// Serde adapter for [`StateDict`] that keeps non-finite elements.
///
/// Use with `#[serde(with = "crate::codec::state_dict")]`.
pub mod state_dict {
    use std::collections::BTreeMap;

    use ndarray::{ArrayD, IxDyn};
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::run::{StateDict, Tensor};

    const NAN: &str = "NaN";
    const INF: &str = "inf";
    const NEG_INF: &str = "-inf";

    struct Element(f32);

    impl Serialize for Element {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let x = self.0;
            if x.is_finite() {
                serializer.serialize_f32(x)
            } else if x.is_nan() {
                serializer.serialize_str(NAN)
            } else if x > 0.0 {
                serializer.serialize_str(INF)
            } else {
                serializer.serialize_str(NEG_INF)
            }
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawElement {
        Number(f32),
        Tag(String),
    }

    impl RawElement {
        fn into_f32(self) -> Result<f32, String> {
            match self {
                Self::Number(x) => Ok(x),
                Self::Tag(tag) => match tag.as_str() {
                    NAN => Ok(f32::NAN),
                    INF => Ok(f32::INFINITY),
                    NEG_INF => Ok(f32::NEG_INFINITY),
                    other => Err(format!("unknown tensor element {:?}", other)),
                },
            }
        }
    }

    #[derive(Serialize)]
    struct TensorRef<'a> {
        v: u8,
        dim: &'a [usize],
        data: Vec<Element>,
    }

    impl<'a> TensorRef<'a> {
        fn new(tensor: &'a Tensor) -> Self {
            Self {
                v: 1,
                dim: tensor.shape(),
                data: tensor.iter().map(|&x| Element(x)).collect(),
            }
        }
    }

    #[derive(Deserialize)]
    struct RawTensor {
        #[allow(dead_code)]
        #[serde(default)]
        v: u8,
        dim: Vec<usize>,
        data: Vec<RawElement>,
    }

    impl RawTensor {
        fn into_tensor(self) -> Result<Tensor, String> {
            let data = self
                .data
                .into_iter()
                .map(RawElement::into_f32)
                .collect::<Result<Vec<_>, _>>()?;
            ArrayD::from_shape_vec(IxDyn(&self.dim), data).map_err(|e| e.to_string())
        }
    }

    pub fn serialize<S: Serializer>(state: &StateDict, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(state.len()))?;
        for (name, tensor) in state {
            map.serialize_entry(name, &TensorRef::new(tensor))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StateDict, D::Error> {
        BTreeMap::<String, RawTensor>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, raw)| {
                raw.into_tensor()
                    .map(|tensor| (name.clone(), tensor))
                    .map_err(|e| D::Error::custom(format!("tensor {}: {}", name, e)))
            })
            .collect()
    }
}
