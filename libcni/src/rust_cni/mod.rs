// Copyright (c) 2024 https://github.com/divinerapier/cni-rs
pub mod error;
pub mod exec;
pub mod result;
pub mod types;
