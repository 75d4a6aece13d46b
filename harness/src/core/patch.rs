//! Unified-diff inspection helpers.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static TEST_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^diff --git a/((?:.*/)*(?:test_.*|tests_.*|.*_test|.*_tests|test|tests)\.py) b/")
        .expect("test file regex should be valid")
});

/// Test files modified (not deleted) by a patch, sorted.
///
/// A file counts once a hunk header is seen for it. Paths listed in
/// `black_list` are skipped.
pub fn extract_modified_test_files(patch: &str, black_list: &[String]) -> Vec<String> {
    let mut modified = BTreeSet::new();
    let mut current: Option<&str> = None;
    let mut deleted = false;

    for line in patch.lines() {
        if line.starts_with("diff --git") {
            current = TEST_FILE_RE
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str())
                .filter(|path| !black_list.iter().any(|b| b == path));
            deleted = false;
        } else if line.starts_with("+++ /dev/null") {
            deleted = true;
        } else if line.starts_with("@@")
            && !deleted
            && let Some(path) = current
        {
            modified.insert(path.to_string());
        }
    }

    modified.into_iter().collect()
}
