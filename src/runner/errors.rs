use crate::{bus::BusError, transaction::InvalidSchema};

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] InvalidSchema),

    #[error(transparent)]
    Bus(#[from] BusError),
}
