use tracing::{info, warn};

use crate::domain::{RunAccession, StudyAccession};
use crate::error::KiraError;
use crate::layout::Layout;
use crate::metadata::MetadataTable;
use crate::query::MetadataQueryClient;

#[derive(Debug, Clone)]
pub struct Resolution {
    pub table: MetadataTable,
    pub runs: Vec<RunAccession>,
    /// Set when the archive could not answer for this study.
    pub error: Option<String>,
}

impl Resolution {
    fn failed(study: &StudyAccession, error: &KiraError) -> Self {
        Self {
            table: MetadataTable::empty(study.clone()),
            runs: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Turns study accessions into run accessions, keeping a copy of each study's
/// technical metadata under `technical_metadata/`.
pub struct AccessionResolver<C: MetadataQueryClient> {
    client: C,
    layout: Layout,
}

impl<C: MetadataQueryClient> AccessionResolver<C> {
    pub fn new(client: C, layout: Layout) -> Self {
        Self { client, layout }
    }

    /// Never fails: a study the archive cannot answer for resolves to no runs.
    pub fn resolve(&self, study: &StudyAccession) -> Resolution {
        match self.try_resolve(study) {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(study = study.as_str(), error = %err, "study resolution failed");
                Resolution::failed(study, &err)
            }
        }
    }

    fn try_resolve(&self, study: &StudyAccession) -> Result<Resolution, KiraError> {
        let table = self.client.study_metadata(study)?;
        table.persist(&self.layout.technical_metadata_path(study))?;
        let runs = table.run_accessions();
        info!(
            study = study.as_str(),
            rows = table.records().len(),
            runs = runs.len(),
            "study resolved"
        );
        Ok(Resolution {
            table,
            runs,
            error: None,
        })
    }

    /// Resolves every study in order and returns the aggregate run list,
    /// duplicates across studies included.
    pub fn resolve_all(&self, studies: &[StudyAccession]) -> (Vec<Resolution>, Vec<RunAccession>) {
        let resolutions = studies
            .iter()
            .map(|study| self.resolve(study))
            .collect::<Vec<_>>();
        let runs = resolutions
            .iter()
            .flat_map(|resolution| resolution.runs.iter().cloned())
            .collect();
        (resolutions, runs)
    }
}
