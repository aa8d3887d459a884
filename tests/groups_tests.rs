//! Host group resolution against real groups files

mod common;

use common::{groups_file, strings};
use fanout::{groups, FanoutError, GroupsFile};

const OCTOPUS_GROUPS: &str = r#"#!/usr/bin/env bash
# Groups for the test cluster

export one="10.0.0.1"
export two="10.0.0.2"
export three='10.0.0.3'

export first="$one"
export rest="$two $three"
export all="$first
$rest"

unexported="10.9.9.9"
"#;

#[test]
fn test_interpolated_groups_resolve() {
    let f = groups_file(OCTOPUS_GROUPS);
    assert_eq!(
        groups::resolve(&strings(&["all"]), f.path()).unwrap(),
        strings(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])
    );
    assert_eq!(
        groups::resolve(&strings(&["rest", "first"]), f.path()).unwrap(),
        strings(&["10.0.0.2", "10.0.0.3", "10.0.0.1"])
    );
}

#[test]
fn test_duplicates_across_groups_are_kept() {
    let f = groups_file(OCTOPUS_GROUPS);
    assert_eq!(
        groups::resolve(&strings(&["one", "all"]), f.path()).unwrap(),
        strings(&["10.0.0.1", "10.0.0.1", "10.0.0.2", "10.0.0.3"])
    );
}

#[test]
fn test_plain_assignments_are_groups() {
    let f = groups_file(OCTOPUS_GROUPS);
    let names = GroupsFile::new(f.path()).valid_groups().unwrap();
    assert!(names.contains("unexported"));
    assert_eq!(
        groups::resolve(&strings(&["unexported"]), f.path()).unwrap(),
        strings(&["10.9.9.9"])
    );
}

#[test]
fn test_listing_is_sorted_and_complete() {
    let f = groups_file(OCTOPUS_GROUPS);
    let names: Vec<String> = GroupsFile::new(f.path()).valid_groups().unwrap().into_iter().collect();
    assert_eq!(
        names,
        strings(&["all", "first", "one", "rest", "three", "two", "unexported"])
    );
}

#[test]
fn test_unparsable_group_file_is_an_expansion_error() {
    // Defines the group, then leaves a quote open
    let f = groups_file("web=\"10.0.0.1\"\nbroken='10.0.0.2\n");
    let err = groups::resolve(&strings(&["web"]), f.path()).unwrap_err();
    assert!(
        matches!(err, FanoutError::ShellExpansionFailed { ref groups, .. } if groups == &strings(&["web"])),
        "unexpected error: {err}"
    );
    assert!(err.is_resolution());
}

#[test]
fn test_whitespace_only_group_resolves_to_nothing() {
    let f = groups_file("empty=\"  \n  \"\n");
    assert!(groups::resolve(&strings(&["empty"]), f.path()).unwrap().is_empty());
}

#[test]
fn test_lines_that_fail_at_runtime_are_skipped() {
    let f = groups_file("web=\"10.0.0.1 10.0.0.2\"\n0bad=x\nfalse\nexport 0a='y'\ndb=\"$web 10.0.1.1\"\n");
    let file = GroupsFile::new(f.path());
    let names: Vec<String> = file.valid_groups().unwrap().into_iter().collect();
    assert_eq!(names, strings(&["db", "web"]));
    assert_eq!(
        file.resolve(&strings(&["web"])).unwrap(),
        strings(&["10.0.0.1", "10.0.0.2"])
    );
    assert_eq!(
        file.resolve(&strings(&["db"])).unwrap(),
        strings(&["10.0.0.1", "10.0.0.2", "10.0.1.1"])
    );
}
