//! Job parameters and the job-instance identity derived from them.

use core::fmt;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Long(n) => write!(f, "{n}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Date(d) => f.write_str(&d.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    /// Identifying parameters take part in the job instance identity.
    pub identifying: bool,
}

/// Ordered set of named parameters for one job run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue, identifying: bool) -> Self {
        self.parameters
            .insert(name.into(), JobParameter { value, identifying });
        self
    }

    pub fn with_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, ParameterValue::String(value.into()), true)
    }

    pub fn with_long(self, name: impl Into<String>, value: i64) -> Self {
        self.with(name, ParameterValue::Long(value), true)
    }

    pub fn with_double(self, name: impl Into<String>, value: f64) -> Self {
        self.with(name, ParameterValue::Double(value), true)
    }

    pub fn with_date(self, name: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.with(name, ParameterValue::Date(value), true)
    }

    pub fn get(&self, name: &str) -> Option<&JobParameter> {
        self.parameters.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Only the identifying parameters.
    pub fn identifying(&self) -> JobParameters {
        JobParameters {
            parameters: self
                .parameters
                .iter()
                .filter(|(_, p)| p.identifying)
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// Hex SHA-256 of the identifying parameters rendered as `name=value;` in
    /// key order. Two parameter sets with the same key belong to the same job
    /// instance.
    pub fn job_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, parameter) in self.parameters.iter().filter(|(_, p)| p.identifying) {
            hasher.update(format!("{name}={};", parameter.value).as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
