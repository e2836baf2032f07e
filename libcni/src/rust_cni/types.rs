// Copyright (c) 2024 https://github.com/divinerapier/cni-rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: ipnetwork::IpNetwork,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<std::net::IpAddr>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DNS {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}
