//! core type-safe wrappers around git primitives for the storage layer.

use std::fmt;

use git2::Oid;
use serde::{Deserialize, Serialize};

/// This makes sure we don't accidentally pass a tree ID where a commit ID
/// is expected. The inner Oid is only accessible within the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// parse CommitId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a tree entry, as reported by listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Blob,
    Tree,
}

/// Replace every character that may not appear in a ref token with `_`.
///
/// Allowed characters are ASCII alphanumerics and `.,_-`.
pub fn sanitize_ref_token(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | ',' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn checked_token(name: &str, namespace: &str) -> Result<String, InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    let token = sanitize_ref_token(name);
    if !git2::Reference::is_valid_name(&format!("{}{}", namespace, token)) {
        return Err(InvalidNameError::InvalidRef(token));
    }
    Ok(token)
}

/// A sanitized branch name.
///
/// Construction never fails for ordinary text: disallowed characters are
/// replaced. Only names git itself still refuses (empty, `..`, a leading
/// `.`, a `.lock` suffix) are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchName(String);

impl BranchName {
    /// the distinguished default branch
    pub const MASTER: &'static str = "master";

    const NAMESPACE: &'static str = "refs/heads/";

    /// create a new BranchName, sanitizing the input
    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidNameError> {
        checked_token(name.as_ref(), Self::NAMESPACE).map(Self)
    }

    pub fn master() -> Self {
        Self(Self::MASTER.to_string())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// full ref path, e.g. `refs/heads/master`
    pub fn as_ref_path(&self) -> String {
        format!("{}{}", Self::NAMESPACE, self.0)
    }

    /// parse a full ref path back into a branch name
    pub(crate) fn from_ref_path(path: &str) -> Option<Self> {
        path.strip_prefix(Self::NAMESPACE)
            .map(|name| Self(name.to_string()))
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for BranchName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A sanitized tag name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagName(String);

impl TagName {
    const NAMESPACE: &'static str = "refs/tags/";

    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidNameError> {
        checked_token(name.as_ref(), Self::NAMESPACE).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_ref_path(&self) -> String {
        format!("{}{}", Self::NAMESPACE, self.0)
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author/committer identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// create a new signature
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for store operations
    pub fn gitds() -> Self {
        Self::new("GitDS", "gitds@localhost")
    }

    /// identity from `user.name` / `user.email` in a git config, if both are set
    pub fn from_git_config(config: &git2::Config) -> Option<Self> {
        let name = config.get_string("user.name").ok()?;
        let email = config.get_string("user.email").ok()?;
        if name.is_empty() || email.is_empty() {
            return None;
        }
        Some(Self::new(name, email))
    }

    /// convert to git2::Signature
    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::gitds()
    }
}

impl fmt::Display for GitSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// error type for unusable ref names (branches, tags)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    InvalidRef(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::InvalidRef(name) => write!(f, "'{}' is not a valid ref name", name),
        }
    }
}

impl std::error::Error for InvalidNameError {}
