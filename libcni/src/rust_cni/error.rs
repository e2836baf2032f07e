// Copyright (c) 2024 https://github.com/divinerapier/cni-rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CNIError {
    #[error("I/O error: {0}")]
    Io(Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to execute plugin: {0}")]
    ExecuteError(String),

    #[error("{0} not found in {1}")]
    NotFound(String, String),

    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("failed to decode CNI data: {0}")]
    VarDecode(String),
}
