use crate::block::{BlockId, GlobalKey};
use std::fmt;

#[derive(Debug)]
pub enum MergeError {
    /// Block or boundary data missing or malformed.
    Input(String),
    /// A union touched a background key.
    BackgroundUnion(GlobalKey, GlobalKey),
    /// A key outside the known block layout.
    InvalidKey(GlobalKey),
    RegistryFrozen,
    NotAssigned,
    MissingMapping { block: BlockId, label: u32 },
    CorruptCheckpoint(String),
    CheckpointMismatch(String),
    Config(String),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Io(std::io::Error),
    Other(String),
}

impl MergeError {
    /// Errors that indicate a bug upstream of the registry and must abort the run.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            MergeError::BackgroundUnion(..) | MergeError::InvalidKey(_) | MergeError::RegistryFrozen
        )
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Input(e) => write!(f, "Input error: {}", e),
            MergeError::BackgroundUnion(a, b) => {
                write!(f, "Contract violation: union with background ({} ~ {})", a, b)
            }
            MergeError::InvalidKey(k) => write!(f, "Contract violation: unknown key {}", k),
            MergeError::RegistryFrozen => write!(f, "Contract violation: registry is frozen"),
            MergeError::NotAssigned => {
                write!(f, "Global labels have not been assigned; run the pools phase first")
            }
            MergeError::MissingMapping { block, label } => {
                write!(f, "No global label for local label {} in block {}", label, block)
            }
            MergeError::CorruptCheckpoint(e) => write!(f, "Corrupt checkpoint: {}", e),
            MergeError::CheckpointMismatch(e) => write!(f, "Checkpoint does not match block layout: {}", e),
            MergeError::Config(e) => write!(f, "Config error: {}", e),
            MergeError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MergeError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            MergeError::Io(e) => write!(f, "IO error: {}", e),
            MergeError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<bincode::error::EncodeError> for MergeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MergeError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for MergeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MergeError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for MergeError {
    fn from(err: std::io::Error) -> Self {
        MergeError::Io(err)
    }
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        MergeError::Config(err.to_string())
    }
}

impl From<String> for MergeError {
    fn from(err: String) -> Self {
        MergeError::Other(err)
    }
}

impl From<&str> for MergeError {
    fn from(err: &str) -> Self {
        MergeError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violations() {
        let a = GlobalKey::new(0, 0);
        let b = GlobalKey::new(1, 3);
        assert!(MergeError::BackgroundUnion(a, b).is_contract_violation());
        assert!(MergeError::InvalidKey(b).is_contract_violation());
        assert!(!MergeError::Input("missing".into()).is_contract_violation());
        assert!(!MergeError::MissingMapping { block: 1, label: 2 }.is_contract_violation());
    }
}
