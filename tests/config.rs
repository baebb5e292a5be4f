use assert_matches::assert_matches;
use camino::Utf8Path;

use kira_xnat_uploader::config::{
    Config, ConfigLoader, XnatSection, default_config, write_config,
};
use kira_xnat_uploader::error::KiraError;

#[test]
fn init_output_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kira-xu.json");
    write_config(&path, &default_config(), false).unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.xnat.server.as_deref(), Some("http://localhost:8080"));
    assert_eq!(resolved.xnat.skip_image_types, vec!["DOSE_INFO"]);

    let (label, captured) = resolved
        .matcher
        .match_path(Utf8Path::new("JoeBlow-1234/scans/20120301/T1/img.dcm"))
        .unwrap();
    assert_eq!(label, "DICOM");
    assert_eq!(captured["ID"], "1234");
    assert_eq!(captured["Directory"], "T1");
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kira-xu.json");
    write_config(&path, &default_config(), false).unwrap();
    assert_matches!(
        write_config(&path, &default_config(), false),
        Err(KiraError::Config(_))
    );
    assert!(write_config(&path, &default_config(), true).is_ok());
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    assert_matches!(
        ConfigLoader::resolve(Some("/no/such/kira-xu.json")),
        Err(KiraError::ConfigRead(_))
    );
}

#[test]
fn malformed_json_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kira-xu.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(KiraError::ConfigParse(_))
    );
}

#[test]
fn mapping_to_unknown_value_is_rejected() {
    let mut mappings = indexmap::IndexMap::new();
    mappings.insert("Subject".to_string(), vec!["ID".to_string()]);
    mappings.insert("Session".to_string(), vec!["Date".to_string()]);
    mappings.insert("Dataset".to_string(), vec!["File".to_string()]);
    let mut paths = indexmap::IndexMap::new();
    paths.insert(
        "A".to_string(),
        vec!["{ID}".to_string(), "{File}".to_string()],
    );
    let config = Config {
        schema_version: None,
        paths,
        mappings,
        xnat: XnatSection::default(),
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(KiraError::Config(reason)) if reason.contains("Date")
    );
}

#[test]
fn misplaced_double_wildcard_is_rejected() {
    let mut config = default_config();
    config.paths.insert(
        "Bad".to_string(),
        vec!["**".to_string(), "{ID}".to_string()],
    );
    assert_matches!(ConfigLoader::resolve_config(config), Err(KiraError::Recipe(_)));
}

#[test]
fn recipes_keep_configuration_order() {
    let json = r#"{
        "paths": {
            "Specific": ["{ID}", "series_{Series}", "{File}"],
            "Generic": ["{ID}", "{Series}", "{File}"]
        },
        "mappings": {"Subject": ["ID"], "Session": ["ID"], "Dataset": ["Series"]}
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    let (label, captured) = resolved
        .matcher
        .match_path(Utf8Path::new("42/series_3/x.dcm"))
        .unwrap();
    assert_eq!(label, "Specific");
    assert_eq!(captured["Series"], "3");
    let (label, _) = resolved
        .matcher
        .match_path(Utf8Path::new("42/other/x.dcm"))
        .unwrap();
    assert_eq!(label, "Generic");
}
