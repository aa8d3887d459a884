//! Property-based tests for fanout
//!
//! These tests verify:
//! - Group resolution order and all-or-nothing failure
//! - Error counting across arbitrary host failure patterns
//! - The open-file ceiling under arbitrary copy loads
//! - Exit status clamping

mod common;

use common::{groups_file, strings, FakeTransport};
use fanout::{exit_status, groups, CommandRunner, Dispatcher, FileCopier, FilePermits};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// Group Resolution Properties
// =============================================================================

fn address_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        (1u8..=254, 0u8..=255).prop_map(|(a, b)| format!("10.0.{a}.{b}")),
        "[a-z][a-z0-9-]{0,10}(\\.example\\.com)?",
    ]
}

/// Group values, each a list of addresses
fn groups_strategy() -> impl Strategy<Value = Vec<Vec<String>>> {
    prop::collection::vec(prop::collection::vec(address_strategy(), 0..5), 1..5)
}

proptest! {
    // Each case shells out to bash several times
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Requested groups resolve to their addresses in request order,
    /// whatever mix of spaces and newlines separates them
    #[test]
    fn resolution_preserves_order(values in groups_strategy(), newline_sep in any::<bool>()) {
        let sep = if newline_sep { "\n" } else { " " };
        let mut contents = String::new();
        let mut names = Vec::new();
        for (i, addrs) in values.iter().enumerate() {
            let name = format!("g{i}");
            contents.push_str(&format!("{}=\"{}{}\"\n", name, sep, addrs.join(sep)));
            names.push(name);
        }
        let f = groups_file(&contents);

        // Request in reverse to make sure file order does not leak through
        names.reverse();
        let expected: Vec<String> = values.iter().rev().flatten().cloned().collect();
        prop_assert_eq!(groups::resolve(&names, f.path()).unwrap(), expected);
    }

    /// Any request containing an undefined group fails outright
    #[test]
    fn unknown_group_fails_atomically(
        defined in prop::collection::btree_set("[a-z]{1,6}", 1..4),
        missing in "[A-Z]{1,6}",
    ) {
        let contents: String = defined.iter().map(|g| format!("{g}=\"10.0.0.1\"\n")).collect();
        let f = groups_file(&contents);

        let mut request: Vec<String> = defined.iter().cloned().collect();
        request.insert(request.len() / 2, missing);
        prop_assert!(groups::resolve(&request, f.path()).is_err());
    }
}

// =============================================================================
// Dispatch Properties
// =============================================================================

proptest! {
    /// The error count equals the number of hosts that could not be reached
    /// or whose command failed; hostname failures never count
    #[test]
    fn error_count_matches_failures(
        n in 1usize..40,
        unreachable in prop::collection::btree_set(0usize..40, 0..10),
        no_hostname in prop::collection::btree_set(0usize..40, 0..10),
        failing in prop::collection::btree_set(0usize..40, 0..10),
        max_hosts in 1usize..16,
    ) {
        let hosts: Vec<String> = (0..n).map(|i| format!("h{i}")).collect();
        let pick = |set: &BTreeSet<usize>| -> Vec<String> {
            set.iter().filter(|&&i| i < n).map(|i| format!("h{i}")).collect()
        };
        let transport = FakeTransport {
            unreachable: pick(&unreachable),
            no_hostname: pick(&no_hostname),
            failing_command: pick(&failing),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(transport.clone())).with_max_hosts(max_hosts);

        let mut reported = 0;
        let errors = dispatcher.dispatch(&hosts, &CommandRunner::new("true"), |_| reported += 1);

        let expected: BTreeSet<usize> = unreachable
            .union(&failing)
            .copied()
            .filter(|&i| i < n)
            .collect();
        prop_assert_eq!(reported, n);
        prop_assert_eq!(errors, expected.len());
        for (i, host) in hosts.iter().enumerate() {
            let want = if unreachable.contains(&i) { 0 } else { 1 };
            prop_assert_eq!(transport.closes(host), want);
        }
    }
}

// =============================================================================
// Copy Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Open local files never exceed the permit capacity
    #[test]
    fn open_files_bounded_by_permits(files in 1usize..30, capacity in 1usize..6) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir(&root).unwrap();
        for i in 0..files {
            std::fs::write(root.join(format!("f{i}")), i.to_string()).unwrap();
        }

        let permits = Arc::new(FilePermits::new(capacity));
        let copier = FileCopier::new(vec![root.display().to_string()], "/dst", true, permits.clone());
        let transport = FakeTransport::default();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));

        let errors = dispatcher.dispatch(&strings(&["a", "b", "c"]), &copier, |_| {});
        prop_assert_eq!(errors, 0);
        prop_assert!(permits.peak() <= capacity);
        prop_assert_eq!(permits.in_use(), 0);
        prop_assert_eq!(transport.recorded.lock().unwrap().files.len(), files * 3);
    }
}

// =============================================================================
// Exit Status Properties
// =============================================================================

proptest! {
    #[test]
    fn exit_status_is_a_valid_code(n in any::<usize>()) {
        let code = exit_status(n);
        prop_assert!((0..=255).contains(&code));
        if n <= 255 {
            prop_assert_eq!(code as usize, n);
        } else {
            prop_assert_eq!(code, 255);
        }
    }
}
