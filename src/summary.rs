//! Structured results of testing a model description

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Where the error occurred, e.g. `["weights", "onnx"]`
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDetail {
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

impl ValidationDetail {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Passed,
            errors: Vec::new(),
        }
    }

    pub fn failed(name: impl Into<String>, errors: Vec<ErrorEntry>) -> Self {
        Self {
            name: name.into(),
            status: Status::Failed,
            errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

impl InstalledPackage {
    /// This crate
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub name: String,
    pub status: Status,
    pub details: Vec<ValidationDetail>,
    #[serde(default)]
    pub env: Vec<InstalledPackage>,
}

impl ValidationSummary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::Passed,
            details: Vec::new(),
            env: vec![InstalledPackage::current()],
        }
    }

    /// Append `detail`; a failed detail fails the whole summary
    pub fn add_detail(&mut self, detail: ValidationDetail) {
        if detail.status == Status::Failed {
            self.status = Status::Failed;
        }
        self.details.push(detail);
    }

    pub fn passed(&self) -> bool {
        self.status == Status::Passed
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.name, self.status)?;
        for detail in &self.details {
            writeln!(f, "  [{}] {}", detail.status, detail.name)?;
            for error in &detail.errors {
                writeln!(f, "    {}: {}", error.loc.join("."), error.msg)?;
            }
        }
        Ok(())
    }
}
