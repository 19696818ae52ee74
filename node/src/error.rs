//! Node-level error kinds (spec §7): the observer's own orchestration
//! failures, layered over whatever the engine crate's ports report.

use thiserror::Error;

use engine::EngineError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("observer loop failed: {0}")]
    ObserverFailed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
