//! Flat text documents.

use serde::{Deserialize, Serialize};
use similar::{DiffTag, TextDiff};

use crate::doc::{DocError, SyncDoc};
use crate::document::{DocType, Document, DocumentError};
use crate::patch::PatchId;

/// One replacement, positioned in characters of the text it was made from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub start: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delete: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub insert: String,
}

pub type TextPatch = Vec<Hunk>;

/// Text documents take no content options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringOptions {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringDocument(String);

impl StringDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len_chars(&self) -> usize {
        self.0.chars().count()
    }
}

impl From<&str> for StringDocument {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl Document for StringDocument {
    type Patch = TextPatch;
    type Options = StringOptions;

    const DOCTYPE: DocType = DocType::String;

    fn empty(_: &StringOptions) -> Self {
        Self::default()
    }

    fn from_str(text: &str, _: &StringOptions) -> Result<Self, DocumentError> {
        Ok(Self::new(text))
    }

    fn to_str(&self) -> String {
        self.0.clone()
    }

    fn make_patch(&self, target: &Self) -> TextPatch {
        let old: Vec<char> = self.0.chars().collect();
        let new: Vec<char> = target.0.chars().collect();
        let diff = TextDiff::from_chars(self.0.as_str(), target.0.as_str());
        diff.ops()
            .iter()
            .map(|op| op.as_tag_tuple())
            .filter(|(tag, _, _)| *tag != DiffTag::Equal)
            .map(|(_, old_range, new_range)| Hunk {
                start: old_range.start,
                delete: old[old_range].iter().collect(),
                insert: new[new_range].iter().collect(),
            })
            .collect()
    }

    /// Hunks land at their shifted position when the text to delete is
    /// still there, otherwise at the nearest occurrence of it. If it is gone
    /// entirely only the insertion is applied.
    fn apply_patch(&self, patch: &TextPatch) -> Self {
        let mut text: Vec<char> = self.0.chars().collect();
        let mut shift: isize = 0;
        for hunk in patch {
            let delete: Vec<char> = hunk.delete.chars().collect();
            let insert: Vec<char> = hunk.insert.chars().collect();
            // Remote hunks may carry any start; saturate rather than overflow.
            let start = isize::try_from(hunk.start).unwrap_or(isize::MAX);
            let expected = start.saturating_add(shift).clamp(0, text.len() as isize) as usize;
            let (at, removed) = match locate(&text, &delete, expected) {
                Some(at) => (at, delete.len()),
                None => (expected, 0),
            };
            let inserted = insert.len();
            text.splice(at..at + removed, insert);
            shift = ((at + inserted) as isize)
                .saturating_sub(start.saturating_add(delete.len() as isize));
        }
        Self(text.into_iter().collect())
    }

    fn is_noop(patch: &TextPatch) -> bool {
        patch.is_empty()
    }
}

/// Position of `needle` closest to `expected`, earliest on ties.
fn locate(text: &[char], needle: &[char], expected: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(expected);
    }
    if text.get(expected..expected + needle.len()) == Some(needle) {
        return Some(expected);
    }
    text.windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(at, _)| at)
        .min_by_key(|at| at.abs_diff(expected))
}

/// Synchronized flat text, stored with doctype `{"type": "string"}`.
pub type SyncString = SyncDoc<StringDocument>;

impl SyncDoc<StringDocument> {
    /// Current text.
    pub fn text(&self) -> String {
        self.to_str()
    }

    /// Replace the whole text, committing the difference as one patch.
    pub async fn set_text(&self, text: &str) -> Result<Option<PatchId>, DocError> {
        self.set_doc(StringDocument::new(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(base: &str, patch: &TextPatch) -> String {
        StringDocument::new(base).apply_patch(patch).to_str()
    }

    #[test]
    fn test_patch_reproduces_target() {
        let base = StringDocument::new("the quick brown fox");
        let target = StringDocument::new("the slow brown cat!");
        let patch = base.make_patch(&target);
        assert_eq!(base.apply_patch(&patch), target);
    }

    #[test]
    fn test_identical_text_gives_noop() {
        let doc = StringDocument::new("same");
        assert!(StringDocument::is_noop(&doc.make_patch(&doc)));
    }

    #[test]
    fn test_multibyte_characters() {
        let base = StringDocument::new("naïve café");
        let target = StringDocument::new("naïve résumé café");
        let patch = base.make_patch(&target);
        assert_eq!(base.apply_patch(&patch), target);
        assert_eq!(target.len_chars(), 17);
    }

    #[test]
    fn test_patch_follows_moved_text() {
        let patch = StringDocument::new("hello world").make_patch(&StringDocument::new("hello"));
        assert_eq!(apply(">> hello world", &patch), ">> hello");
    }

    #[test]
    fn test_missing_deletion_still_inserts() {
        let patch = vec![Hunk {
            start: 2,
            delete: "zz".into(),
            insert: "Q".into(),
        }];
        assert_eq!(apply("abcd", &patch), "abQcd");
    }

    #[test]
    fn test_out_of_range_start_is_clamped() {
        let patch = vec![
            Hunk {
                start: usize::MAX,
                delete: "zz".into(),
                insert: "!".into(),
            },
            Hunk {
                start: 0,
                delete: String::new(),
                insert: ">".into(),
            },
        ];
        assert_eq!(apply("abc", &patch), ">abc!");
    }

    #[test]
    fn test_concurrent_inserts_fold_deterministically() {
        let empty = StringDocument::default();
        let a = empty.make_patch(&StringDocument::new("A"));
        let b = empty.make_patch(&StringDocument::new("B"));
        let ab = empty.apply_patch(&a).apply_patch(&b);
        let again = empty.apply_patch(&a).apply_patch(&b);
        assert_eq!(ab, again);
        assert_eq!(ab.as_str(), "BA");
    }

    #[test]
    fn test_patch_json_shape() {
        let patch = StringDocument::new("ab").make_patch(&StringDocument::new("aXb"));
        let encoded = serde_json::to_value(&patch).unwrap();
        assert_eq!(encoded, serde_json::json!([{"start": 1, "insert": "X"}]));
    }
}
