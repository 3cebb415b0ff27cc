//! Resource volumes charged against the limiter

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outbound API calls
pub const REQUESTS: &str = "requests";
/// Prompt plus completion tokens
pub const TOKENS: &str = "tokens";
/// Generated images
pub const IMAGES: &str = "images";

/// Units of each resource one operation consumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(BTreeMap<String, u64>);

impl Volume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add units of a resource, summing with any existing amount
    pub fn with(mut self, resource: &str, units: u64) -> Self {
        *self.0.entry(resource.to_string()).or_insert(0) += units;
        self
    }

    /// Volume of a single chat completion call
    pub fn completion(tokens: u64) -> Self {
        Self::new().with(REQUESTS, 1).with(TOKENS, tokens)
    }

    pub fn get(&self, resource: &str) -> u64 {
        self.0.get(resource).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl<'a> FromIterator<(&'a str, u64)> for Volume {
    fn from_iter<I: IntoIterator<Item = (&'a str, u64)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Volume::new(), |volume, (resource, units)| volume.with(resource, units))
    }
}
