// Copyright (c) 2024 https://github.com/divinerapier/cni-rs
pub mod result100;

use json::JsonValue;

use crate::rust_cni::error::CNIError;

pub type ResultCNI<T> = Result<T, Box<CNIError>>;

#[typetag::serde]
pub trait APIResult {
    fn version(&self) -> String;
    fn get_as_version(&self, version: String) -> ResultCNI<Box<dyn APIResult>>;
    fn print(&self) -> ResultCNI<()>;
    fn print_to(&self, w: Box<dyn std::io::Write>) -> ResultCNI<()>;
    fn get_json(&self) -> JsonValue;
    fn clone_box(&self) -> Box<dyn APIResult>;
}

impl Clone for Box<dyn APIResult> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
