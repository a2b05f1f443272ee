//! Tables the engine reads and writes.

use uuid::Uuid;

use crate::protocol::TableSchema;

/// One row per document: `{string_id, path, doctype, users, deleted, ...}`.
pub const SYNCSTRINGS: &str = "syncstrings";

/// One row per patch: `(string_id, time, user_id) -> {patch, snapshot?}`.
pub const PATCHES: &str = "patches";

pub fn syncstrings() -> TableSchema {
    TableSchema::new(SYNCSTRINGS, ["string_id"])
}

pub fn patches() -> TableSchema {
    TableSchema::new(PATCHES, ["string_id", "time", "user_id"])
}

/// Deterministic document id for `path` inside a project.
pub fn string_id(project_id: &str, path: &str) -> String {
    let name = format!("{project_id}/{path}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_id_is_stable_per_path() {
        assert_eq!(string_id("p", "a.txt"), string_id("p", "a.txt"));
        assert_ne!(string_id("p", "a.txt"), string_id("p", "b.txt"));
        assert_ne!(string_id("p", "a.txt"), string_id("q", "a.txt"));
    }
}
