//! Structural description of remote-eligible units and their identities.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    F32,
    F64,
    I32,
    I64,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One operation of an extracted graph with its static parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpNode {
    pub op: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl OpNode {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.insert(key.into(), value.to_string());
        self
    }
}

/// A contiguous, pure tensor computation handed over by the graph extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphUnit {
    pub ops: Vec<OpNode>,
    pub inputs: Vec<TensorSpec>,
}

impl GraphUnit {
    pub fn new(ops: Vec<OpNode>, inputs: Vec<TensorSpec>) -> Self {
        Self { ops, inputs }
    }

    /// Structural fingerprint. Tensor values never take part; how much of the
    /// input signature does depends on `strictness`.
    pub fn fingerprint(&self, strictness: IdentityStrictness) -> UnitFingerprint {
        #[derive(Serialize)]
        struct InputKey<'a> {
            dtype: DType,
            #[serde(skip_serializing_if = "Option::is_none")]
            shape: Option<&'a [usize]>,
            rank: usize,
        }

        #[derive(Serialize)]
        struct Canonical<'a> {
            ops: &'a [OpNode],
            inputs: Vec<InputKey<'a>>,
        }

        let canonical = Canonical {
            ops: &self.ops,
            inputs: self
                .inputs
                .iter()
                .map(|spec| InputKey {
                    dtype: spec.dtype,
                    shape: match strictness {
                        IdentityStrictness::Strict => Some(spec.shape.as_slice()),
                        IdentityStrictness::Permissive => None,
                    },
                    rank: spec.rank(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        UnitFingerprint(sha256(&bytes))
    }
}

/// How much of the input signature participates in unit identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStrictness {
    /// Any change of an input shape creates a new unit.
    #[default]
    Strict,
    /// Same operations, dtypes and ranks reuse the unit whatever the dimension sizes.
    Permissive,
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitFingerprint(pub [u8; 32]);

impl fmt::Display for UnitFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for UnitFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitFingerprint(")?;
        write_hex(f, &self.0[..6])?;
        write!(f, ")")
    }
}

/// SHA-256 of an uploaded payload; the remote blob store is keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest(pub [u8; 32]);

impl ContentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        ContentDigest(sha256(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest(")?;
        write_hex(f, &self.0[..6])?;
        write!(f, ")")
    }
}

/// Identity handed out by the unit registry, printed as `Graph #N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Graph #{}", self.0)
    }
}

/// A graph unit after identity assignment.
#[derive(Debug, Clone)]
pub struct ComputationUnit {
    pub id: UnitId,
    pub fingerprint: UnitFingerprint,
    pub graph: Arc<GraphUnit>,
}

/// Shapes of the concrete inputs for one occurrence. Values stay local.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputsDescriptor {
    pub tensors: Vec<TensorSpec>,
}

impl InputsDescriptor {
    pub fn new(tensors: Vec<TensorSpec>) -> Self {
        Self { tensors }
    }

    pub fn total_elements(&self) -> usize {
        self.tensors.iter().map(TensorSpec::element_count).sum()
    }
}

impl From<&GraphUnit> for InputsDescriptor {
    fn from(graph: &GraphUnit) -> Self {
        Self {
            tensors: graph.inputs.clone(),
        }
    }
}

/// What gets uploaded ahead of compilation: the structure plus the example
/// input signature needed to rebuild it remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitPayload {
    pub unit: GraphUnit,
    pub example_inputs: InputsDescriptor,
}

impl UnitPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn digest(&self) -> ContentDigest {
        ContentDigest::of(&self.to_bytes())
    }
}
