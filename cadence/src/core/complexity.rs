//! Complexity tiers and the refine configuration they imply.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::FocusArea;

/// Lower bound for any refine run, including explicit overrides.
pub const MIN_ITERATIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Micro,
    Small,
    #[default]
    Medium,
    Large,
    Enterprise,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Micro => "MICRO",
            Self::Small => "SMALL",
            Self::Medium => "MEDIUM",
            Self::Large => "LARGE",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    /// Parse a tier name, falling back to `Medium` for unknown input.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    pub fn refine_plan(self) -> RefinePlan {
        use FocusArea::{EdgeCases, Gaps, Integration, Quality, Security};
        let (max_iterations, focus_areas) = match self {
            Self::Micro => (5, vec![Gaps, Quality]),
            Self::Small => (5, vec![Gaps, Quality, EdgeCases]),
            Self::Medium => (6, vec![Gaps, Quality, Integration, EdgeCases]),
            Self::Large => (8, vec![Gaps, Quality, Integration, EdgeCases, Security]),
            Self::Enterprise => (10, FocusArea::ALL.to_vec()),
        };
        RefinePlan {
            complexity: self,
            max_iterations,
            focus_areas,
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MICRO" => Ok(Self::Micro),
            "SMALL" => Ok(Self::Small),
            "MEDIUM" => Ok(Self::Medium),
            "LARGE" => Ok(Self::Large),
            "ENTERPRISE" => Ok(Self::Enterprise),
            other => Err(format!("unknown complexity tier '{other}'")),
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Iteration count and reviewer focus areas for one refine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefinePlan {
    pub complexity: Complexity,
    pub max_iterations: u32,
    /// One review producer per entry.
    pub focus_areas: Vec<FocusArea>,
}

impl RefinePlan {
    pub fn reviewer_count(&self) -> usize {
        self.focus_areas.len()
    }

    /// Apply an explicit iteration override, clamped to [`MIN_ITERATIONS`].
    pub fn with_max_iterations(mut self, max_iterations: Option<u32>) -> Self {
        if let Some(n) = max_iterations {
            self.max_iterations = n.max(MIN_ITERATIONS);
        }
        self
    }
}
