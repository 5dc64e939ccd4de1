use crate::common::*;

/// Whether a pass over the data updates the model or only scores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Eval,
}

impl Phase {
    pub fn is_train(&self) -> bool {
        matches!(self, Self::Train)
    }

    /// The stream key used for seed derivation.
    pub fn key(&self) -> u64 {
        match self {
            Self::Train => 0,
            Self::Eval => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Eval => f.write_str("test"),
        }
    }
}
