//! Registry key paths.
//!
//! Key paths compare case-insensitively and short root aliases (`HKLM`,
//! `HKCU`, ...) are rewritten to their canonical `HKEY_*` names on
//! construction, so a normalized [`KeyPath`] can be used both as a map key and
//! as the anchor the line reassembler searches for.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Short root aliases and the canonical root names they stand for.
pub const ROOT_ALIASES: &[(&str, &str)] = &[
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKU", "HKEY_USERS"),
    ("HKCC", "HKEY_CURRENT_CONFIG"),
];

/// A hierarchical registry location, e.g. `HKEY_CURRENT_USER\Software\Foo`.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "String", into = "String"))]
pub struct KeyPath(String);

impl KeyPath {
    /// Creates a key path, normalizing the root alias and trailing separators.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(normalize(path.as_ref()))
    }

    /// Returns the normalized path text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the canonical root name (`HKEY_*`) of this path.
    pub fn root(&self) -> &str {
        self.0.split('\\').next().unwrap_or_default()
    }

    /// Returns true if the path starts with one of the five canonical roots.
    pub fn has_known_root(&self) -> bool {
        let root = self.root();
        ROOT_ALIASES
            .iter()
            .any(|(_, canonical)| canonical.eq_ignore_ascii_case(root))
    }

    /// Returns true if `other` is this key or one of its descendants.
    pub fn is_ancestor_of(&self, other: &KeyPath) -> bool {
        let (mine, theirs) = (folded(&self.0), folded(&other.0));
        theirs == mine || theirs.starts_with(&format!("{}\\", mine))
    }

    fn folded(&self) -> String {
        folded(&self.0)
    }
}

fn folded(s: &str) -> String {
    s.to_lowercase()
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('\\');
    let (root, rest) = match trimmed.split_once('\\') {
        Some((root, rest)) => (root, Some(rest)),
        None => (trimmed, None),
    };

    let root = ROOT_ALIASES
        .iter()
        .find_map(|(alias, canonical)| {
            if alias.eq_ignore_ascii_case(root) || canonical.eq_ignore_ascii_case(root) {
                Some(*canonical)
            } else {
                None
            }
        })
        .unwrap_or(root);

    match rest {
        Some(rest) => format!("{}\\{}", root, rest),
        None => root.to_string(),
    }
}

impl PartialEq for KeyPath {
    fn eq(&self, other: &Self) -> bool {
        self.folded() == other.folded()
    }
}

impl Eq for KeyPath {}

impl Hash for KeyPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

impl PartialOrd for KeyPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(&other.folded())
    }
}

impl fmt::Debug for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPath({:?})", self.0)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for KeyPath {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<KeyPath> for String {
    fn from(k: KeyPath) -> Self {
        k.0
    }
}

impl AsRef<str> for KeyPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
