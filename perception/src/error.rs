use std::{io, time::Duration};

use thiserror::Error;

use crate::models::ClassKey;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("candidate {index} of class {class} has no usable position")]
    MissingPosition { class: ClassKey, index: usize },
    #[error("{call} did not complete within {deadline:?} after {attempts} attempts: {last_error}")]
    Timeout {
        call: &'static str,
        attempts: u32,
        deadline: Duration,
        last_error: String,
    },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("bounded call runtime failed to start")]
    Runtime(#[from] io::Error),
}
