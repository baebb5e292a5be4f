//! Path recipes.
//!
//! A recipe is an ordered list of templates, one per path segment. Inside a
//! template `{Name}` captures text up to the next literal character, while a
//! name made of one repeated character (`{YYYY}`, `{MM}`) captures exactly
//! that many digits. The templates `*` and `**` skip one, or any number of,
//! path segments without capturing anything.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path};
use regex::Regex;

use crate::error::KiraError;

pub const ANY_ONE: &str = "*";
pub const ANY_MANY: &str = "**";

/// Parameter name to captured text.
pub type Captures = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub delimiter: String,
    pub numeric: bool,
}

impl Segment {
    /// Number of digits a numeric parameter captures.
    pub fn width(&self) -> usize {
        self.name.chars().count()
    }
}

/// A compiled template for a single path segment.
#[derive(Debug, Clone)]
pub struct SegmentPattern {
    template: String,
    prefix: String,
    segments: Vec<Segment>,
    regex: Regex,
}

impl SegmentPattern {
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Literal text before the first parameter.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|segment| segment.name.as_str())
    }

    pub fn captures(&self, value: &str) -> Option<Captures> {
        let caps = self.regex.captures(value)?;
        let mut values = Captures::new();
        for (i, segment) in self.segments.iter().enumerate() {
            let text = caps.get(i + 1).map(|m| m.as_str()).unwrap_or_default();
            values.insert(segment.name.clone(), text.to_string());
        }
        Some(values)
    }
}

impl FromStr for SegmentPattern {
    type Err = KiraError;

    fn from_str(template: &str) -> Result<Self, Self::Err> {
        if template.contains('*') {
            return Err(KiraError::Recipe(format!(
                "'{template}': wildcards must occupy a whole path segment"
            )));
        }
        let (prefix, segments) = parse_template(template)?;

        let mut pattern = String::from("^");
        pattern.push_str(&regex::escape(&prefix));
        for segment in &segments {
            if segment.numeric {
                let _ = write!(pattern, "([0-9]{{{}}})", segment.width());
            } else if let Some(next) = segment.delimiter.chars().next() {
                let _ = write!(pattern, "([^{}]*?)", regex::escape(&next.to_string()));
            } else {
                pattern.push_str("(.*)");
            }
            pattern.push_str(&regex::escape(&segment.delimiter));
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|err| KiraError::Recipe(format!("'{template}': {err}")))?;
        Ok(Self {
            template: template.to_string(),
            prefix,
            segments,
            regex,
        })
    }
}

fn parse_template(template: &str) -> Result<(String, Vec<Segment>), KiraError> {
    let unbalanced = || KiraError::Recipe(format!("'{template}': unbalanced braces"));

    let (prefix, mut rest) = match template.find('{') {
        Some(pos) => (&template[..pos], &template[pos..]),
        None => (template, ""),
    };
    if prefix.contains('}') {
        return Err(unbalanced());
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut seen = HashSet::new();
    while !rest.is_empty() {
        let close = rest.find('}').ok_or_else(unbalanced)?;
        let name = &rest[1..close];
        if name.contains('{') {
            return Err(unbalanced());
        }
        if name.is_empty() {
            return Err(KiraError::Recipe(format!(
                "'{template}': empty parameter name"
            )));
        }
        if !seen.insert(name) {
            return Err(KiraError::Recipe(format!(
                "'{template}': repeated parameter {name}"
            )));
        }
        let after = &rest[close + 1..];
        let (delimiter, remainder) = match after.find('{') {
            Some(pos) => (&after[..pos], &after[pos..]),
            None => (after, ""),
        };
        if delimiter.contains('}') {
            return Err(unbalanced());
        }
        segments.push(Segment {
            name: name.to_string(),
            delimiter: delimiter.to_string(),
            numeric: is_numeric_name(name),
        });
        rest = remainder;
    }
    Ok((prefix.to_string(), segments))
}

fn is_numeric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => chars.all(|ch| ch == first),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Pattern(SegmentPattern),
    AnyOne,
    AnyMany,
}

impl Step {
    pub fn compile(template: &str) -> Result<Self, KiraError> {
        match template {
            ANY_ONE => Ok(Step::AnyOne),
            ANY_MANY => Ok(Step::AnyMany),
            other => Ok(Step::Pattern(other.parse()?)),
        }
    }

    pub fn params(&self) -> Vec<&str> {
        match self {
            Step::Pattern(pattern) => pattern.params().collect(),
            Step::AnyOne | Step::AnyMany => Vec::new(),
        }
    }
}

/// An ordered list of steps matched against the segments of a relative path.
#[derive(Debug, Clone)]
pub struct Recipe {
    steps: Vec<Step>,
}

impl Recipe {
    pub fn compile<S: AsRef<str>>(templates: &[S]) -> Result<Self, KiraError> {
        if templates.is_empty() {
            return Err(KiraError::Recipe("recipe has no templates".to_string()));
        }
        let steps = templates
            .iter()
            .map(|template| Step::compile(template.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let last = steps.len() - 1;
        for (i, step) in steps.iter().enumerate() {
            if !matches!(step, Step::AnyMany) {
                continue;
            }
            if i == 0 {
                return Err(KiraError::Recipe("** at start of recipe".to_string()));
            }
            if i == last {
                return Err(KiraError::Recipe("** at end of recipe".to_string()));
            }
            if matches!(steps[i + 1], Step::AnyMany) {
                return Err(KiraError::Recipe("adjacent ** in recipe".to_string()));
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Parameter names in order of first appearance.
    pub fn params(&self) -> Vec<String> {
        let mut params: Vec<String> = Vec::new();
        for step in &self.steps {
            for name in step.params() {
                if !params.iter().any(|p| p == name) {
                    params.push(name.to_string());
                }
            }
        }
        params
    }

    pub fn match_segments(&self, segments: &[&str]) -> Option<Captures> {
        match_steps(&self.steps, segments)
    }

    pub fn match_path(&self, path: &Utf8Path) -> Option<Captures> {
        let segments = path_segments(path);
        self.match_segments(&segments)
    }
}

pub fn path_segments(path: &Utf8Path) -> Vec<&str> {
    path.components()
        .filter_map(|component| match component {
            Utf8Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn match_steps(steps: &[Step], segments: &[&str]) -> Option<Captures> {
    let (step, tail) = match (steps.split_first(), segments.split_first()) {
        (None, None) => return Some(Captures::new()),
        (None, Some(_)) | (Some(_), None) => return None,
        (Some((step, rest)), Some(_)) => (step, rest),
    };
    match step {
        Step::AnyOne => match_steps(tail, &segments[1..]),
        // Earliest split wins: hand the segments to the rest of the recipe
        // first, and only swallow one more when that fails.
        Step::AnyMany => match_steps(tail, segments).or_else(|| match_steps(steps, &segments[1..])),
        Step::Pattern(pattern) => {
            let rest = match_steps(tail, &segments[1..])?;
            let mut values = pattern.captures(segments[0])?;
            values.extend(rest);
            Some(values)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn recipe(templates: &[&str]) -> Recipe {
        Recipe::compile(templates).unwrap()
    }

    #[test]
    fn numeric_params_match_exact_digits() {
        let pattern: SegmentPattern = "{YYYY}{MM}{DD}".parse().unwrap();
        let values = pattern.captures("20220524").unwrap();
        assert_eq!(values["YYYY"], "2022");
        assert_eq!(values["MM"], "05");
        assert_eq!(values["DD"], "24");
        assert!(pattern.captures("2022052").is_none());
        assert!(pattern.captures("202205245").is_none());
        assert!(pattern.captures("2022O524").is_none());
    }

    #[test]
    fn text_params_stop_at_delimiter() {
        let pattern: SegmentPattern = "{SURNAME}-{GIVENNAME}-{YYYY}{MM}{DD}.txt".parse().unwrap();
        let values = pattern.captures("Duck-Donald-19300831.txt").unwrap();
        assert_eq!(values["SURNAME"], "Duck");
        assert_eq!(values["GIVENNAME"], "Donald");
        assert_eq!(values["YYYY"], "1930");
        assert_eq!(values["MM"], "08");
        assert_eq!(values["DD"], "31");
    }

    #[test]
    fn trailing_param_is_greedy() {
        let pattern: SegmentPattern = "{Name}-{Rest}".parse().unwrap();
        let values = pattern.captures("Joe-Blow-1234").unwrap();
        assert_eq!(values["Name"], "Joe");
        assert_eq!(values["Rest"], "Blow-1234");
    }

    #[test]
    fn literal_text_is_escaped() {
        let pattern: SegmentPattern = "scan({ID}).dcm".parse().unwrap();
        assert_eq!(pattern.prefix(), "scan(");
        assert_eq!(pattern.captures("scan(12).dcm").unwrap()["ID"], "12");
        assert!(pattern.captures("scan(12)xdcm").is_none());
    }

    #[test]
    fn literal_only_template() {
        let pattern: SegmentPattern = "DICOM".parse().unwrap();
        assert!(pattern.captures("DICOM").unwrap().is_empty());
        assert!(pattern.captures("DICOMDIR").is_none());
    }

    #[test]
    fn repeated_param_is_rejected() {
        let err = "{A}-{B}-{A}".parse::<SegmentPattern>().unwrap_err();
        assert_matches!(err, KiraError::Recipe(_));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for template in ["{Name", "Name}", "{}", "{A{B}}", "x*", "{A}**"] {
            let err = Step::compile(template).unwrap_err();
            assert_matches!(err, KiraError::Recipe(_), "template {template}");
        }
    }

    #[test]
    fn misplaced_globstar_is_rejected() {
        for templates in [
            vec!["**", "{Filename}"],
            vec!["{Subject}", "**"],
            vec!["{Subject}", "**", "**", "{Filename}"],
        ] {
            let err = Recipe::compile(templates.as_slice()).unwrap_err();
            assert_matches!(err, KiraError::Recipe(_));
        }
    }

    #[test]
    fn params_listed_in_order() {
        let recipe = recipe(&["{Name}-{ID}", "*", "{YYYY}{MM}{DD}", "{Filename}"]);
        assert_eq!(
            recipe.params(),
            vec!["Name", "ID", "YYYY", "MM", "DD", "Filename"]
        );
    }

    #[test]
    fn path_must_be_fully_consumed() {
        let recipe = recipe(&["{Subject}", "{Filename}"]);
        assert!(recipe.match_segments(&["a", "b"]).is_some());
        assert!(recipe.match_segments(&["a"]).is_none());
        assert!(recipe.match_segments(&["a", "b", "c"]).is_none());
    }

    #[test]
    fn single_wildcard_consumes_exactly_one() {
        let recipe = recipe(&["{Subject}", "*", "{Filename}"]);
        let values = recipe.match_segments(&["s", "skip", "f.dcm"]).unwrap();
        assert_eq!(values.len(), 2);
        assert!(recipe.match_segments(&["s", "f.dcm"]).is_none());
        assert!(recipe.match_segments(&["s", "a", "b", "f.dcm"]).is_none());
    }

    #[test]
    fn later_captures_win_on_collision() {
        let recipe = recipe(&["{Part}", "{Part}.dcm"]);
        let values = recipe.match_segments(&["outer", "inner.dcm"]).unwrap();
        assert_eq!(values["Part"], "inner");
    }

    #[test]
    fn globstar_prefers_shortest_span() {
        let recipe = recipe(&["{Top}", "**", "{Dir}", "{Filename}"]);
        let values = recipe.match_segments(&["t", "a", "b", "c", "f"]).unwrap();
        assert_eq!(values["Dir"], "c");
    }

    #[test]
    fn path_segments_skip_root_and_dots() {
        let path = Utf8Path::new("/data/./JoeBlow-1234/test.dcm");
        assert_eq!(path_segments(path), vec!["data", "JoeBlow-1234", "test.dcm"]);
    }
}
