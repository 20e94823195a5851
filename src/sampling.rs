// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SamplerError {
    #[error("invalid sample rate {0:?}, expected a number between 0 and 1")]
    InvalidRate(String),
}

/// Decides whether a single request gets an access log record.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Sampler {
    #[default]
    Always,
    Never,
    /// Keep each request with independent probability `p`.
    Rate(f64),
}

impl Sampler {
    pub fn should_sample(&self) -> bool {
        match *self {
            Sampler::Always => true,
            Sampler::Never => false,
            Sampler::Rate(p) if p >= 1.0 => true,
            Sampler::Rate(p) if p <= 0.0 => false,
            Sampler::Rate(p) => rand::random::<f64>() < p,
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sampler::Always => write!(f, "always"),
            Sampler::Never => write!(f, "never"),
            Sampler::Rate(p) => write!(f, "rate({})", p),
        }
    }
}

/// Parses the textual sample rate used in gateway configuration: an empty
/// value or `1` samples everything, `0` samples nothing, anything in between
/// is a probability.
impl FromStr for Sampler {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Sampler::Always);
        }
        match s.to_ascii_lowercase().as_str() {
            "always" => return Ok(Sampler::Always),
            "never" => return Ok(Sampler::Never),
            _ => {}
        }

        let p: f64 = s
            .parse()
            .map_err(|_| SamplerError::InvalidRate(s.to_string()))?;
        if p.is_nan() || !(0.0..=1.0).contains(&p) {
            return Err(SamplerError::InvalidRate(s.to_string()));
        }
        if p == 0.0 {
            Ok(Sampler::Never)
        } else if p == 1.0 {
            Ok(Sampler::Always)
        } else {
            Ok(Sampler::Rate(p))
        }
    }
}

impl<'de> Deserialize<'de> for Sampler {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(p) => p.to_string().parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Immutable sampler lookup table, rebuilt with every configuration update.
#[derive(Clone, Debug, Default)]
pub struct SamplerTable {
    routes: HashMap<String, Sampler>,
    global: Option<Sampler>,
}

impl SamplerTable {
    pub fn new(routes: HashMap<String, Sampler>, global: Option<Sampler>) -> Self {
        Self { routes, global }
    }

    pub fn resolve(&self, route: &str) -> Sampler {
        self.routes
            .get(route)
            .copied()
            .or(self.global)
            .unwrap_or(Sampler::Always)
    }
}
