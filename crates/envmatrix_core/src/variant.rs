//! Variant descriptors and instrumentation methods.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One dependency-version combination under test.
///
/// Identity is the index within the ordered environment list. A missing or blank manifest means the variant is
/// skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDescriptor {
    pub index: usize,
    /// Optional human label, usable as an environment filter.
    pub name: Option<String>,
    /// Dependency manifest text (e.g. the body of a Gemfile).
    pub manifest: Option<String>,
}

impl VariantDescriptor {
    pub fn new(index: usize, manifest: Option<String>) -> Self {
        Self {
            index,
            name: None,
            manifest,
        }
    }

    /// Attach a label to the variant.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether this variant contributes no pass/fail outcome at all.
    pub fn is_skipped(&self) -> bool {
        self.manifest.as_deref().is_none_or(|m| m.trim().is_empty())
    }

    /// Manifest text, or the empty string for skipped variants.
    pub fn manifest_text(&self) -> &str {
        self.manifest.as_deref().unwrap_or("")
    }

    /// Label used in reports: the name when present, otherwise the index.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.index, name),
            None => self.index.to_string(),
        }
    }
}

/// An alternate strategy the code under test uses to hook into its dependencies.
///
/// The whole variant matrix is repeated once per declared method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentationMethod(String);

impl InstrumentationMethod {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
