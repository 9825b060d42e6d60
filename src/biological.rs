use std::path::{Path, PathBuf};

use camino::Utf8Path;

use crate::error::KiraError;
use crate::tools::{find_in_path, run_cmd};

pub const DEFAULT_SCRIPT: &str = "/usr/local/src/gsm2metadata.R";

/// External R script that writes one `<sample>_metadata.csv` per GEO sample of
/// the listed series, reading from a GEOmetadb snapshot.
#[derive(Debug, Clone)]
pub struct BiologicalMetadataScript {
    rscript: Option<PathBuf>,
    script: PathBuf,
}

impl BiologicalMetadataScript {
    pub fn new(rscript: Option<PathBuf>, script: PathBuf) -> Self {
        Self {
            rscript: rscript.or_else(|| find_in_path("Rscript")),
            script,
        }
    }

    pub fn args(&self, study_list: &Path, output_dir: &Utf8Path, geo_db: &Path) -> Vec<String> {
        vec![
            self.script.to_string_lossy().to_string(),
            "--input".to_string(),
            study_list.to_string_lossy().to_string(),
            "--output".to_string(),
            output_dir.to_string(),
            "--db".to_string(),
            geo_db.to_string_lossy().to_string(),
        ]
    }

    pub fn run(
        &self,
        study_list: &Path,
        output_dir: &Utf8Path,
        geo_db: &Path,
    ) -> Result<(), KiraError> {
        let rscript = self
            .rscript
            .as_ref()
            .ok_or_else(|| KiraError::MissingTool("Rscript".to_string()))?;
        run_cmd(rscript, &self.args(study_list, output_dir, geo_db))
            .map_err(KiraError::BiologicalScript)
    }
}
