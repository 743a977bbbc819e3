use colony_core::{ConfigError, CoreError};
use colony_mesh::MeshError;
use thiserror::Error;

use crate::state::SimulationState;

pub type EnvResult<T> = Result<T, EnvError>;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SimulationState,
        to: SimulationState,
    },

    #[error("Trail store error: {0}")]
    Trail(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        EnvError::Core(CoreError::Serialization(err))
    }
}
