use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Outcome of a completed build, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    Aborted,
    NotBuilt,
}

impl BuildResult {
    pub const ALL: [BuildResult; 5] = [
        BuildResult::Success,
        BuildResult::Unstable,
        BuildResult::Failure,
        BuildResult::Aborted,
        BuildResult::NotBuilt,
    ];

    // Lower is better.
    fn ordinal(self) -> u8 {
        match self {
            BuildResult::Success => 0,
            BuildResult::Unstable => 1,
            BuildResult::Failure => 2,
            BuildResult::Aborted => 3,
            BuildResult::NotBuilt => 4,
        }
    }

    pub fn is_better_or_equal(self, other: BuildResult) -> bool {
        self.ordinal() <= other.ordinal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::Failure => "FAILURE",
            BuildResult::Aborted => "ABORTED",
            BuildResult::NotBuilt => "NOT_BUILT",
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let norm = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "SUCCESS" | "STABLE" => Ok(BuildResult::Success),
            "UNSTABLE" => Ok(BuildResult::Unstable),
            "FAILURE" | "FAILED" => Ok(BuildResult::Failure),
            "ABORTED" => Ok(BuildResult::Aborted),
            "NOT_BUILT" => Ok(BuildResult::NotBuilt),
            _ => Err(Error::config(format!(
                "unknown build result '{}' (expected SUCCESS/UNSTABLE/FAILURE/ABORTED/NOT_BUILT)",
                s.trim()
            ))),
        }
    }
}

/// Minimum build quality a build must reach before its workspace is archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Criterion {
    /// Most recent completed build, whatever the result.
    #[default]
    Any,
    /// Most recent stable or unstable build.
    #[serde(rename = "Not Failed")]
    NotFailed,
    /// Most recent stable build.
    Successful,
}

impl Criterion {
    pub fn threshold(self) -> BuildResult {
        threshold_for(self)
    }

    /// A build that has no result yet is still running and counts as qualifying.
    pub fn accepts(self, result: Option<BuildResult>) -> bool {
        match result {
            Some(r) => qualifies(r, self.threshold()),
            None => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Criterion::Any => "Any",
            Criterion::NotFailed => "Not Failed",
            Criterion::Successful => "Successful",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criterion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let norm = s
            .trim()
            .to_ascii_lowercase()
            .replace(['-', '_'], " ");
        match norm.as_str() {
            "any" => Ok(Criterion::Any),
            "not failed" | "notfailed" => Ok(Criterion::NotFailed),
            "successful" | "success" => Ok(Criterion::Successful),
            _ => Err(Error::config(format!(
                "unknown criteria '{}' (expected Any, Not Failed or Successful)",
                s.trim()
            ))),
        }
    }
}

pub fn threshold_for(criterion: Criterion) -> BuildResult {
    match criterion {
        Criterion::Any => BuildResult::NotBuilt,
        Criterion::NotFailed => BuildResult::Unstable,
        Criterion::Successful => BuildResult::Success,
    }
}

pub fn qualifies(result: BuildResult, threshold: BuildResult) -> bool {
    result.is_better_or_equal(threshold)
}
