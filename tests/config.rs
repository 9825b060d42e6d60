use std::fs;
use std::path::PathBuf;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_sra_pipeline::config::{CliOverrides, Config, ConfigLoader, PipelineConfig};
use kira_sra_pipeline::error::KiraError;

fn resolve(config: Config, cli: CliOverrides) -> Result<PipelineConfig, KiraError> {
    ConfigLoader::resolve(
        config,
        PathBuf::from("studies.txt"),
        Utf8PathBuf::from("out"),
        cli,
    )
}

#[test]
fn load_config_file_with_tool_paths() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-sra.json");
    fs::write(
        &path,
        r#"{
            "workers": 6,
            "fetch_threads": 8,
            "scan_columns": ["sample_alias"],
            "tools": { "pigz": "/opt/bin/pigz" }
        }"#,
    )
    .unwrap();

    let config = ConfigLoader::load(path.to_str()).unwrap();
    let resolved = resolve(config, CliOverrides::default()).unwrap();
    assert_eq!(resolved.workers, 6);
    assert_eq!(resolved.fetch_threads, 8);
    assert_eq!(resolved.compress_threads, 4);
    assert_eq!(resolved.scan_columns, vec!["sample_alias".to_string()]);
    assert_eq!(resolved.tools.pigz, Some(PathBuf::from("/opt/bin/pigz")));
    assert_eq!(resolved.tools.fasterq_dump, None);
}

#[test]
fn explicit_missing_config_is_an_error() {
    let err = ConfigLoader::load(Some("/nonexistent/kira-sra.json")).unwrap_err();
    assert_matches!(err, KiraError::ConfigRead(_));
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-sra.json");
    fs::write(&path, "{ workers: ").unwrap();
    let err = ConfigLoader::load(path.to_str()).unwrap_err();
    assert_matches!(err, KiraError::ConfigParse(_));
}

#[test]
fn zero_workers_rejected() {
    let err = resolve(
        Config::default(),
        CliOverrides {
            workers: Some(0),
            ..CliOverrides::default()
        },
    )
    .unwrap_err();
    assert_matches!(err, KiraError::ConfigParse(_));
}

#[test]
fn zero_test_limit_means_full_mode() {
    let resolved = resolve(
        Config::default(),
        CliOverrides {
            test_limit: Some(0),
            ..CliOverrides::default()
        },
    )
    .unwrap();
    assert_eq!(resolved.row_limit, None);
}

#[test]
fn invalid_sample_prefix_rejected() {
    let config: Config = serde_json::from_str(r#"{"sample_prefix": "GS(M"}"#).unwrap();
    let err = resolve(config, CliOverrides::default()).unwrap_err();
    assert_matches!(err, KiraError::InvalidPattern(_));
}
