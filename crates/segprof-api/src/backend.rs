use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Remote instance types that can be leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hardware {
    #[serde(rename = "r6i.large")]
    R6iLarge,
    #[serde(rename = "g4dn.xlarge")]
    G4dnXlarge,
}

impl Hardware {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hardware::R6iLarge => "r6i.large",
            Hardware::G4dnXlarge => "g4dn.xlarge",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Hardware::G4dnXlarge)
    }

    /// Human readable processor family, printed next to backend totals.
    pub fn description(&self) -> &'static str {
        match self {
            Hardware::R6iLarge => "Intel Ice Lake",
            Hardware::G4dnXlarge => "Nvidia T4",
        }
    }
}

/// Acceleration libraries the remote service can compile for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccelLibrary {
    #[serde(rename = "onnxrt-cpu")]
    OnnxrtCpu,
    #[serde(rename = "onnxrt-cuda")]
    OnnxrtCuda,
    #[serde(rename = "onnxrt-tensorrt")]
    OnnxrtTensorrt,
}

impl AccelLibrary {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccelLibrary::OnnxrtCpu => "onnxrt-cpu",
            AccelLibrary::OnnxrtCuda => "onnxrt-cuda",
            AccelLibrary::OnnxrtTensorrt => "onnxrt-tensorrt",
        }
    }
}

/// A (hardware, acceleration library) pair, written `hardware/library`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId {
    pub hardware: Hardware,
    pub library: AccelLibrary,
}

/// The closed set of pairs the remote service supports.
pub const BACKEND_CATALOG: [BackendId; 3] = [
    BackendId {
        hardware: Hardware::R6iLarge,
        library: AccelLibrary::OnnxrtCpu,
    },
    BackendId {
        hardware: Hardware::G4dnXlarge,
        library: AccelLibrary::OnnxrtCuda,
    },
    BackendId {
        hardware: Hardware::G4dnXlarge,
        library: AccelLibrary::OnnxrtTensorrt,
    },
];

/// One CPU-class and one GPU-class backend.
pub fn default_backends() -> Vec<BackendId> {
    vec![BACKEND_CATALOG[0], BACKEND_CATALOG[1]]
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported backend '{requested}'; supported backends: {}", supported_list())]
pub struct UnsupportedBackend {
    pub requested: String,
}

fn supported_list() -> String {
    BACKEND_CATALOG
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl BackendId {
    /// Builds a backend only if the pair is part of the catalog.
    pub fn new(hardware: Hardware, library: AccelLibrary) -> Result<Self, UnsupportedBackend> {
        let candidate = BackendId { hardware, library };
        if BACKEND_CATALOG.contains(&candidate) {
            Ok(candidate)
        } else {
            Err(UnsupportedBackend {
                requested: candidate.to_string(),
            })
        }
    }

    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<BackendId>, UnsupportedBackend> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hardware.as_str(), self.library.as_str())
    }
}

impl FromStr for BackendId {
    type Err = UnsupportedBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        BACKEND_CATALOG
            .iter()
            .copied()
            .find(|b| b.to_string().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnsupportedBackend {
                requested: trimmed.to_string(),
            })
    }
}

impl Serialize for BackendId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackendId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
