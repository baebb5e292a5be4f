use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use kira_xnat_uploader::error::KiraError;
use kira_xnat_uploader::extract::NullExtractor;
use kira_xnat_uploader::ledger::Ledger;
use kira_xnat_uploader::matcher::{HierarchyMapping, Matcher};
use kira_xnat_uploader::recipe::Recipe;
use kira_xnat_uploader::record::Status;

fn matcher(extra: &[&str]) -> Matcher {
    let mut recipes = IndexMap::new();
    recipes.insert(
        "Basic".to_string(),
        Recipe::compile(&["{Name}-{ID}", "{YYYYMMDD}", "{Filename}"]).unwrap(),
    );
    let mapping = HierarchyMapping {
        subject: vec!["ID".to_string()],
        session: vec!["YYYYMMDD".to_string()],
        dataset: vec!["Filename".to_string()],
    };
    let extra: Vec<String> = extra.iter().map(|f| f.to_string()).collect();
    Matcher::new(recipes, mapping, &extra).unwrap()
}

fn scratch() -> (tempfile::TempDir, Ledger) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("list.jsonl")).unwrap();
    (dir, Ledger::new(path))
}

#[test]
fn records_survive_a_save_and_load() {
    let matcher = matcher(&[]);
    let (_dir, ledger) = scratch();

    let mut matched = matcher.match_file(
        Utf8Path::new("/in"),
        Utf8PathBuf::from("/in/Joe Blow-1234/20120301/test.dcm"),
        &NullExtractor,
    );
    matched.session_label = Some("1234_OT1".to_string());
    matched.mark_failed("digest mismatch: a: b");
    matched
        .extracted
        .insert("Modality".to_string(), "CT".to_string());
    let unmatched = matcher.match_file(
        Utf8Path::new("/in"),
        Utf8PathBuf::from("/in/loose.txt"),
        &NullExtractor,
    );
    let records = vec![matched, unmatched];

    ledger.save(&records, &matcher).unwrap();
    let loaded = ledger.load(&matcher).unwrap();
    assert_eq!(loaded, records);
    assert_eq!(loaded[0].status, Status::Failed);
    assert_eq!(loaded[0].error.as_deref(), Some("digest mismatch: a: b"));
    assert_eq!(loaded[0].values["Name"], "Joe Blow");
    assert!(loaded[1].hierarchy.is_none());
}

#[test]
fn first_line_is_the_header() {
    let matcher = matcher(&["AccessionNumber"]);
    let (_dir, ledger) = scratch();
    ledger.save(&[], &matcher).unwrap();

    let content = fs::read_to_string(ledger.path()).unwrap();
    let header: Vec<String> = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(header, matcher.headers());
    assert_eq!(header[..3], ["Recipe", "File", "Filename"]);
    assert!(header.contains(&"AccessionNumber".to_string()));
}

#[test]
fn header_must_match_configuration() {
    let (_dir, ledger) = scratch();
    ledger.save(&[], &matcher(&[])).unwrap();
    assert_matches!(
        ledger.load(&matcher(&["AccessionNumber"])),
        Err(KiraError::Ledger(reason)) if reason.contains("different configuration")
    );
}

#[test]
fn short_rows_are_rejected() {
    let matcher = matcher(&[]);
    let (_dir, ledger) = scratch();
    ledger.save(&[], &matcher).unwrap();
    let mut content = fs::read_to_string(ledger.path()).unwrap();
    content.push_str("[\"Basic\",\"/in/x\"]\n");
    fs::write(ledger.path(), content).unwrap();
    assert_matches!(ledger.load(&matcher), Err(KiraError::Ledger(reason)) if reason.contains("line 2"));
}

#[test]
fn saving_replaces_the_previous_list() {
    let matcher = matcher(&[]);
    let (_dir, ledger) = scratch();
    let record = matcher.match_file(
        Utf8Path::new("/in"),
        Utf8PathBuf::from("/in/Joe-1/20120301/a.dcm"),
        &NullExtractor,
    );
    ledger.save(&[record.clone(), record], &matcher).unwrap();
    ledger.save(&[], &matcher).unwrap();
    assert!(ledger.load(&matcher).unwrap().is_empty());
}
