//! Conventional-commit message derived from working tree changes.

use std::path::Path;

use crate::core::types::ChangeEntry;

/// Build a short conventional-commit subject for `changes`.
///
/// Only additions → `feat(<scope>): add …`; deletions without additions →
/// `refactor(<scope>): remove …`; anything modified → `feat(<scope>): update …`.
/// The scope is the first directory shared by every path, else the first
/// file's stem.
pub fn commit_message(changes: &[ChangeEntry]) -> String {
    if changes.is_empty() {
        return "chore: no changes".to_string();
    }

    let added = changes.iter().any(|c| is_added(&c.code));
    let deleted = changes.iter().any(|c| c.code.contains('D'));
    let modified = changes
        .iter()
        .any(|c| !is_added(&c.code) && !c.code.contains('D'));

    let (kind, verb) = match (added, modified, deleted) {
        (true, false, false) => ("feat", "add"),
        (false, _, true) if !modified => ("refactor", "remove"),
        (_, true, _) => ("feat", "update"),
        _ => ("chore", "update"),
    };

    let scope = common_scope(changes);
    let object = match changes {
        [single] => file_name(&single.path),
        many => format!("{} files", many.len()),
    };
    format!("{kind}({scope}): {verb} {object}")
}

fn is_added(code: &str) -> bool {
    code == "??" || code.contains('A')
}

fn common_scope(changes: &[ChangeEntry]) -> String {
    let first_dirs: Vec<Option<&str>> = changes
        .iter()
        .map(|c| {
            let mut parts = c.path.split('/');
            let head = parts.next();
            parts.next().and(head)
        })
        .collect();
    if let Some(Some(dir)) = first_dirs.first()
        && first_dirs.iter().all(|d| *d == Some(*dir))
    {
        return (*dir).to_string();
    }
    Path::new(&changes[0].path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "misc".to_string())
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
