use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use crate::error::{KiraError, MappingError};
use crate::extract::{EXTRACT_FIELDS, ExtractedValues, MetadataExtractor};
use crate::recipe::{Captures, Recipe};
use crate::record::{FileMatch, Hierarchy, Status};

pub const HIERARCHY: [&str; 3] = ["Subject", "Session", "Dataset"];

/// Mapping keys with this prefix read extracted metadata instead of path captures.
pub const EXTRACTED_PREFIX: &str = "DICOM:";

pub const RECORD_COLUMNS: [&str; 6] = [
    "Recipe",
    "File",
    "Filename",
    "Upload",
    "Status",
    "SessionLabel",
];

/// Source keys concatenated into each hierarchy field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyMapping {
    pub subject: Vec<String>,
    pub session: Vec<String>,
    pub dataset: Vec<String>,
}

impl HierarchyMapping {
    pub fn from_map(mappings: &IndexMap<String, Vec<String>>) -> Result<Self, KiraError> {
        for key in mappings.keys() {
            if !HIERARCHY.contains(&key.as_str()) {
                return Err(KiraError::Config(format!(
                    "unknown mapping {key}, expected one of {HIERARCHY:?}"
                )));
            }
        }
        let field = |name: &str| -> Result<Vec<String>, KiraError> {
            match mappings.get(name) {
                Some(keys) if !keys.is_empty() => Ok(keys.clone()),
                _ => Err(KiraError::Config(format!(
                    "must have mappings for each of {HIERARCHY:?}, {name} is missing"
                ))),
            }
        };
        Ok(Self {
            subject: field("Subject")?,
            session: field("Session")?,
            dataset: field("Dataset")?,
        })
    }

    pub fn fields(&self) -> [(&'static str, &[String]); 3] {
        [
            ("Subject", self.subject.as_slice()),
            ("Session", self.session.as_slice()),
            ("Dataset", self.dataset.as_slice()),
        ]
    }
}

/// Labeled recipes plus the mapping onto the archive hierarchy.
#[derive(Debug, Clone)]
pub struct Matcher {
    recipes: IndexMap<String, Recipe>,
    mapping: HierarchyMapping,
    params: Vec<String>,
    extract_fields: Vec<String>,
    headers: Vec<String>,
}

impl Matcher {
    pub fn new(
        recipes: IndexMap<String, Recipe>,
        mapping: HierarchyMapping,
        allow_fields: &[String],
    ) -> Result<Self, KiraError> {
        if recipes.is_empty() {
            return Err(KiraError::Config("no path recipes configured".to_string()));
        }
        let mut params: Vec<String> = Vec::new();
        for recipe in recipes.values() {
            for param in recipe.params() {
                if !params.contains(&param) {
                    params.push(param);
                }
            }
        }

        let mut extract_fields: Vec<String> = EXTRACT_FIELDS.iter().map(|f| f.to_string()).collect();
        for field in allow_fields {
            if !extract_fields.contains(field) {
                extract_fields.push(field.clone());
            }
        }

        for (name, keys) in mapping.fields() {
            for key in keys {
                let known = match key.strip_prefix(EXTRACTED_PREFIX) {
                    Some(field) => extract_fields.iter().any(|f| f == field),
                    None => params.contains(key),
                };
                if !known {
                    return Err(KiraError::Config(format!(
                        "value {key} in mapping for {name} not defined in a recipe"
                    )));
                }
            }
        }

        let headers = RECORD_COLUMNS
            .iter()
            .chain(HIERARCHY.iter())
            .map(|h| h.to_string())
            .chain(extract_fields.iter().cloned())
            .chain(params.iter().cloned())
            .collect();

        Ok(Self {
            recipes,
            mapping,
            params,
            extract_fields,
            headers,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn extract_fields(&self) -> &[String] {
        &self.extract_fields
    }

    pub fn mapping(&self) -> &HierarchyMapping {
        &self.mapping
    }

    /// First recipe, in configuration order, that matches the relative path.
    pub fn match_path(&self, relative: &Utf8Path) -> Option<(&str, Captures)> {
        self.recipes.iter().find_map(|(label, recipe)| {
            recipe
                .match_path(relative)
                .map(|values| (label.as_str(), values))
        })
    }

    pub fn map_values(
        &self,
        captured: &Captures,
        extracted: &ExtractedValues,
    ) -> Result<Hierarchy, MappingError> {
        let resolve = |name: &str, keys: &[String]| -> Result<String, MappingError> {
            let mut value = String::new();
            for key in keys {
                let part = match key.strip_prefix(EXTRACTED_PREFIX) {
                    Some(field) => match extracted.get(field) {
                        Some(Some(found)) => found.as_str(),
                        Some(None) => return Err(MappingError::Null(key.clone())),
                        None => return Err(MappingError::Missing(key.clone())),
                    },
                    None => captured
                        .get(key)
                        .map(String::as_str)
                        .ok_or_else(|| MappingError::Missing(key.clone()))?,
                };
                value.push_str(&part.replace(' ', "_"));
            }
            if value.is_empty() {
                return Err(MappingError::Null(name.to_string()));
            }
            Ok(value)
        };
        Ok(Hierarchy {
            subject: resolve("Subject", &self.mapping.subject)?,
            session: resolve("Session", &self.mapping.session)?,
            dataset: resolve("Dataset", &self.mapping.dataset)?,
        })
    }

    /// Matches `file` (found under `root`), extracts its metadata and maps it
    /// onto the hierarchy. Failures are recorded on the returned record.
    pub fn match_file(
        &self,
        root: &Utf8Path,
        file: Utf8PathBuf,
        extractor: &dyn MetadataExtractor,
    ) -> FileMatch {
        let relative = file.strip_prefix(root).unwrap_or(file.as_path()).to_path_buf();
        let mut record = FileMatch::new(file);

        let Some((label, captured)) = self.match_path(&relative) else {
            record.mark_unmatched("Unmatched");
            return record;
        };
        record.label = Some(label.to_string());
        record.values = captured;

        let extracted = match extractor.extract(&record.file, &self.extract_fields) {
            Ok(values) => values,
            Err(err) => {
                tracing::debug!(file = %record.file, %err, "extraction rejected file");
                record.mark_unmatched(err.to_string());
                return record;
            }
        };
        record.extracted = extracted
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect();

        match self.map_values(&record.values, &extracted) {
            Ok(hierarchy) => {
                record.hierarchy = Some(hierarchy);
                record.selected = true;
                record.status = Status::Matched;
            }
            Err(err) => {
                tracing::debug!(file = %record.file, %err, "could not map values");
                record.mark_unmatched(err.to_string());
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::extract::NullExtractor;

    fn mapping(subject: &[&str], session: &[&str], dataset: &[&str]) -> HierarchyMapping {
        let owned = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect();
        HierarchyMapping {
            subject: owned(subject),
            session: owned(session),
            dataset: owned(dataset),
        }
    }

    fn matcher() -> Matcher {
        let mut recipes = IndexMap::new();
        recipes.insert(
            "Basic".to_string(),
            Recipe::compile(&["{Name}-{ID}", "{YYYY}{MM}{DD}", "{Filename}"]).unwrap(),
        );
        Matcher::new(
            recipes,
            mapping(&["ID"], &["YYYY", "MM", "DD"], &["Filename"]),
            &["AccessionNumber".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn headers_follow_declared_fields() {
        let matcher = matcher();
        let headers = matcher.headers();
        assert_eq!(&headers[..6], &RECORD_COLUMNS.map(String::from));
        assert_eq!(&headers[6..9], &HIERARCHY.map(String::from));
        assert_eq!(headers[15], "AccessionNumber");
        assert_eq!(headers.last().map(String::as_str), Some("Filename"));
    }

    #[test]
    fn mapping_must_reference_known_values() {
        let mut recipes = IndexMap::new();
        recipes.insert("A".to_string(), Recipe::compile(&["{ID}", "{File}"]).unwrap());
        let err = Matcher::new(recipes.clone(), mapping(&["ID"], &["Date"], &["File"]), &[]).unwrap_err();
        assert_matches!(err, KiraError::Config(_));
        let err = Matcher::new(recipes.clone(), mapping(&["ID"], &["DICOM:Nope"], &["File"]), &[]).unwrap_err();
        assert_matches!(err, KiraError::Config(_));
        assert!(Matcher::new(recipes, mapping(&["ID"], &["DICOM:StudyDate"], &["File"]), &[]).is_ok());
    }

    #[test]
    fn mapping_requires_every_level() {
        let mut map = IndexMap::new();
        map.insert("Subject".to_string(), vec!["ID".to_string()]);
        map.insert("Session".to_string(), vec!["Date".to_string()]);
        assert_matches!(HierarchyMapping::from_map(&map), Err(KiraError::Config(_)));
        map.insert("Dataset".to_string(), vec!["File".to_string()]);
        map.insert("Project".to_string(), vec!["File".to_string()]);
        assert_matches!(HierarchyMapping::from_map(&map), Err(KiraError::Config(_)));
    }

    #[test]
    fn map_values_concatenates_and_replaces_spaces() {
        let matcher = matcher();
        let captured: Captures = [
            ("ID", "12 34"),
            ("YYYY", "2012"),
            ("MM", "03"),
            ("DD", "01"),
            ("Filename", "a.dcm"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let hierarchy = matcher.map_values(&captured, &ExtractedValues::new()).unwrap();
        assert_eq!(hierarchy.subject, "12_34");
        assert_eq!(hierarchy.session, "20120301");
        assert_eq!(hierarchy.dataset, "a.dcm");
    }

    #[test]
    fn map_values_reports_missing_and_null() {
        let mut recipes = IndexMap::new();
        recipes.insert("A".to_string(), Recipe::compile(&["{ID}", "{File}"]).unwrap());
        let matcher = Matcher::new(recipes, mapping(&["ID"], &["DICOM:StudyDate"], &["File"]), &[]).unwrap();
        let captured: Captures = [("ID", "1"), ("File", "f")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let err = matcher.map_values(&captured, &ExtractedValues::new()).unwrap_err();
        assert_eq!(err, MappingError::Missing("DICOM:StudyDate".to_string()));

        let mut extracted = ExtractedValues::new();
        extracted.insert("StudyDate".to_string(), None);
        let err = matcher.map_values(&captured, &extracted).unwrap_err();
        assert_eq!(err, MappingError::Null("DICOM:StudyDate".to_string()));
    }

    #[test]
    fn empty_hierarchy_values_are_rejected() {
        let mut recipes = IndexMap::new();
        recipes.insert("A".to_string(), Recipe::compile(&["{A}-{B}", "{File}"]).unwrap());
        let matcher = Matcher::new(recipes, mapping(&["A"], &["B"], &["File"]), &[]).unwrap();

        let record = matcher.match_file(Utf8Path::new("/in"), Utf8PathBuf::from("/in/-/f.dcm"), &NullExtractor);
        assert_eq!(record.status, Status::Unmatched);
        assert!(!record.selected);
        assert!(record.hierarchy.is_none());
        assert_eq!(record.error.as_deref(), Some("value Subject is empty"));

        let record = matcher.match_file(Utf8Path::new("/in"), Utf8PathBuf::from("/in/s-/f.dcm"), &NullExtractor);
        assert_eq!(record.error.as_deref(), Some("value Session is empty"));
    }

    #[test]
    fn match_file_strips_root() {
        let matcher = matcher();
        let root = Utf8Path::new("/archive/incoming");
        let record = matcher.match_file(
            root,
            Utf8PathBuf::from("/archive/incoming/JoeBlow-1234/20120301/test.dcm"),
            &NullExtractor,
        );
        assert_eq!(record.label.as_deref(), Some("Basic"));
        assert_eq!(record.status, Status::Matched);
        assert!(record.selected);
        assert_eq!(record.subject(), Some("1234"));
        assert_eq!(record.session(), Some("20120301"));
        assert_eq!(record.dataset(), Some("test.dcm"));
    }

    #[test]
    fn match_file_marks_unmatched() {
        let matcher = matcher();
        let record = matcher.match_file(
            Utf8Path::new("/in"),
            Utf8PathBuf::from("/in/JoeBlow-1234/notadate/test.dcm"),
            &NullExtractor,
        );
        assert_eq!(record.status, Status::Unmatched);
        assert_eq!(record.error.as_deref(), Some("Unmatched"));
        assert!(!record.selected);
        assert!(record.label.is_none());
    }
}
