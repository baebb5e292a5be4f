use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;
use crate::matcher::{HierarchyMapping, Matcher};
use crate::recipe::Recipe;

pub const DEFAULT_CONFIG_FILE: &str = "kira-xu.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    /// Recipe label to one template per path level, tried in order.
    #[serde(default)]
    pub paths: IndexMap<String, Vec<String>>,
    /// Hierarchy field to the source keys concatenated into it.
    #[serde(default)]
    pub mappings: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub xnat: XnatSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct XnatSection {
    #[serde(default, alias = "Project")]
    pub project: Option<String>,
    #[serde(default, alias = "Server")]
    pub server: Option<String>,
    #[serde(default, alias = "AllowFields")]
    pub allow_fields: Vec<String>,
    #[serde(default, alias = "SkipImageTypes")]
    pub skip_image_types: Vec<String>,
    #[serde(default, alias = "StrictScanIds")]
    pub strict_scan_ids: bool,
}

#[derive(Debug, Clone)]
pub struct XnatSettings {
    pub project: Option<String>,
    pub server: Option<String>,
    pub skip_image_types: Vec<String>,
    pub strict_scan_ids: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub matcher: Matcher,
    pub xnat: XnatSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig(config_path));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(KiraError::Config(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let recipes = config
            .paths
            .iter()
            .map(|(label, templates)| {
                let recipe = Recipe::compile(templates.as_slice()).map_err(|err| match err {
                    KiraError::Recipe(reason) => KiraError::Recipe(format!("{label}: {reason}")),
                    other => other,
                })?;
                Ok((label.clone(), recipe))
            })
            .collect::<Result<IndexMap<_, _>, KiraError>>()?;
        let mapping = HierarchyMapping::from_map(&config.mappings)?;
        let matcher = Matcher::new(recipes, mapping, &config.xnat.allow_fields)?;

        let project = config.xnat.project.filter(|p| !p.trim().is_empty());
        let server = config
            .xnat
            .server
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        Ok(ResolvedConfig {
            schema_version,
            matcher,
            xnat: XnatSettings {
                project,
                server,
                skip_image_types: config.xnat.skip_image_types,
                strict_scan_ids: config.xnat.strict_scan_ids,
            },
        })
    }
}

/// Writes `config` as pretty JSON. An existing file is only replaced with
/// `force`.
pub fn write_config(path: &Path, config: &Config, force: bool) -> Result<(), KiraError> {
    if path.exists() && !force {
        return Err(KiraError::Config(format!(
            "{} already exists, use --force to replace it",
            path.display()
        )));
    }
    let mut content = serde_json::to_string_pretty(config)
        .map_err(|err| KiraError::ConfigParse(err.to_string()))?;
    content.push('\n');
    fs::write(path, content).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Starter configuration written by `init`.
pub fn default_config() -> Config {
    let strings = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    let mut paths = IndexMap::new();
    paths.insert(
        "DICOM".to_string(),
        strings(&["{SubjectName}-{ID}", "**", "{YYYY}{MM}{DD}", "{Directory}", "{Filename}"]),
    );
    let mut mappings = IndexMap::new();
    mappings.insert("Subject".to_string(), strings(&["ID"]));
    mappings.insert("Session".to_string(), strings(&["YYYY", "MM", "DD"]));
    mappings.insert("Dataset".to_string(), strings(&["Directory"]));
    Config {
        schema_version: Some(1),
        paths,
        mappings,
        xnat: XnatSection {
            project: Some("Test001".to_string()),
            server: Some("http://localhost:8080".to_string()),
            allow_fields: strings(&["AccessionNumber"]),
            skip_image_types: strings(&["DOSE_INFO"]),
            strict_scan_ids: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_config_resolves() {
        let resolved = ConfigLoader::resolve_config(default_config()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.xnat.project.as_deref(), Some("Test001"));
        assert!(resolved.matcher.params().contains(&"Directory".to_string()));
        assert!(
            resolved
                .matcher
                .extract_fields()
                .contains(&"AccessionNumber".to_string())
        );
    }

    #[test]
    fn bad_template_is_a_recipe_error() {
        let mut config = default_config();
        config
            .paths
            .insert("Broken".to_string(), vec!["{ID}-{ID}".to_string()]);
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(KiraError::Recipe(reason)) if reason.starts_with("Broken")
        );
    }

    #[test]
    fn original_key_names_are_accepted() {
        let json = r#"{
            "paths": {"A": ["{ID}", "{File}"]},
            "mappings": {"Subject": ["ID"], "Session": ["DICOM:StudyDate"], "Dataset": ["File"]},
            "xnat": {"Project": "P1", "Server": "https://xnat.example.org/", "SkipImageTypes": ["LOCALIZER"]}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.xnat.project.as_deref(), Some("P1"));
        assert_eq!(resolved.xnat.server.as_deref(), Some("https://xnat.example.org"));
        assert_eq!(resolved.xnat.skip_image_types, vec!["LOCALIZER"]);
    }
}
