use std::collections::BTreeMap;

use camino::Utf8Path;

use crate::error::KiraError;

/// Content fields every record carries in its row, ahead of configured extras.
pub const EXTRACT_FIELDS: [&str; 6] = [
    "Modality",
    "StudyDescription",
    "StudyDate",
    "SeriesNumber",
    "Manufacturer",
    "ManufacturerModelName",
];

const SCREEN_FIELDS: [&str; 3] = ["Modality", "ImageType", "EncapsulatedDocument"];

/// Field name to value; `None` marks a field the file carries without a value.
pub type ExtractedValues = BTreeMap<String, Option<String>>;

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, file: &Utf8Path, fields: &[String]) -> Result<ExtractedValues, KiraError>;
}

impl<E: MetadataExtractor + ?Sized> MetadataExtractor for &E {
    fn extract(&self, file: &Utf8Path, fields: &[String]) -> Result<ExtractedValues, KiraError> {
        (**self).extract(file, fields)
    }
}

/// Extracts nothing. Used when recipes and mappings rely on paths alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullExtractor;

impl MetadataExtractor for NullExtractor {
    fn extract(&self, _file: &Utf8Path, _fields: &[String]) -> Result<ExtractedValues, KiraError> {
        Ok(ExtractedValues::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScreenRules {
    pub skip_image_types: Vec<String>,
}

/// Wraps an extractor and refuses files that must never be archived as
/// images: structured reports, encapsulated documents and skipped image types.
pub struct Screened<E> {
    inner: E,
    rules: ScreenRules,
}

impl<E: MetadataExtractor> Screened<E> {
    pub fn new(inner: E, rules: ScreenRules) -> Self {
        Self { inner, rules }
    }
}

impl<E: MetadataExtractor> MetadataExtractor for Screened<E> {
    fn extract(&self, file: &Utf8Path, fields: &[String]) -> Result<ExtractedValues, KiraError> {
        let mut requested = fields.to_vec();
        for field in SCREEN_FIELDS {
            if !requested.iter().any(|f| f == field) {
                requested.push(field.to_string());
            }
        }
        let mut values = self.inner.extract(file, &requested)?;
        screen(&values, &self.rules)?;
        values.retain(|key, _| fields.iter().any(|f| f == key));
        Ok(values)
    }
}

/// Applies the content rules to extracted values. An empty map means the
/// extractor knows nothing about file contents, so nothing is screened.
pub fn screen(values: &ExtractedValues, rules: &ScreenRules) -> Result<(), KiraError> {
    if values.is_empty() {
        return Ok(());
    }
    if matches!(values.get("EncapsulatedDocument"), Some(Some(_))) {
        return Err(KiraError::Extraction(
            "DICOM has an encapsulated document".to_string(),
        ));
    }
    let modality = values
        .get("Modality")
        .and_then(|value| value.as_deref())
        .map(str::trim)
        .unwrap_or_default();
    if modality.is_empty() {
        return Err(KiraError::Extraction("DICOM has no modality".to_string()));
    }
    if modality == "SR" {
        return Err(KiraError::Extraction(
            "DICOM is an SR (structured report)".to_string(),
        ));
    }
    if let Some(Some(image_type)) = values.get("ImageType") {
        let skipped = image_type
            .split(['\\', ','])
            .map(str::trim)
            .find(|part| rules.skip_image_types.iter().any(|skip| skip == part));
        if let Some(part) = skipped {
            return Err(KiraError::Extraction(format!(
                "DICOM image type {part} is skipped"
            )));
        }
    }
    Ok(())
}
