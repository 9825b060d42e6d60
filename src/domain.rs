use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Identifier families observed in study lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyFamily {
    /// Curated GEO series (`GSE…`).
    GeoSeries,
    /// Archive study (`SRP…`, `ERP…`, `DRP…`).
    ArchiveStudy,
    /// BioProject (`PRJNA…`, `PRJEB…`, `PRJDB…`).
    BioProject,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StudyAccession(String);

impl StudyAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn family(&self) -> StudyFamily {
        let value = self.0.as_str();
        if has_numeric_suffix(value, "GSE") {
            StudyFamily::GeoSeries
        } else if ["SRP", "ERP", "DRP"]
            .iter()
            .any(|prefix| has_numeric_suffix(value, prefix))
        {
            StudyFamily::ArchiveStudy
        } else if ["PRJNA", "PRJEB", "PRJDB"]
            .iter()
            .any(|prefix| has_numeric_suffix(value, prefix))
        {
            StudyFamily::BioProject
        } else {
            StudyFamily::Other
        }
    }
}

impl fmt::Display for StudyAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyAccession {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !is_path_safe_token(&normalized) {
            return Err(KiraError::InvalidStudyAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// One sequencing run. The value doubles as a directory name under `fastq/`, so
/// only ASCII alphanumerics are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunAccession(String);

impl RunAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunAccession {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if !is_path_safe_token(&normalized) {
            return Err(KiraError::InvalidRunAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleAccession(String);

impl SampleAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleAccession {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if !is_path_safe_token(&normalized) {
            return Err(KiraError::InvalidSampleAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

fn is_path_safe_token(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}

fn has_numeric_suffix(value: &str, prefix: &str) -> bool {
    value
        .strip_prefix(prefix)
        .map(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false)
}
