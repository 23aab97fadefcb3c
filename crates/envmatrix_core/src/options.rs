//! Per-invocation run options.
//!
//! `RunOptions` is built once at CLI entry and then only read. It is serialized into the options blob handed to
//! every child process, so the child reconstructs exactly the configuration the parent ran with.

use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::variant::VariantDescriptor;

/// Restricts execution to a single variant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnvFilter {
    #[default]
    All,
    Index(usize),
    Name(String),
}

impl EnvFilter {
    pub fn matches(&self, variant: &VariantDescriptor) -> bool {
        match self {
            EnvFilter::All => true,
            EnvFilter::Index(index) => variant.index == *index,
            EnvFilter::Name(name) => variant.name.as_deref() == Some(name.as_str()),
        }
    }
}

impl FromStr for EnvFilter {
    type Err = Infallible;

    /// Numbers select by index, anything else by variant name. Empty or `all` selects everything.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(EnvFilter::All);
        }
        Ok(match s.parse::<usize>() {
            Ok(index) => EnvFilter::Index(index),
            Err(_) => EnvFilter::Name(s.to_string()),
        })
    }
}

/// Immutable configuration bag for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub verbose: bool,
    /// Debug mode forces serial execution and live output.
    pub debug: bool,
    /// Seed forwarded to the test framework for test ordering.
    pub seed: Option<u64>,
    /// Restricts which individual test cases run inside the child.
    pub name_filter: Option<String>,
    /// Use the resolved-lock cache.
    pub use_cache: bool,
    pub env_filter: EnvFilter,
    /// Restricts which instrumentation permutations run.
    pub method_filter: Option<String>,
    /// Run variants one at a time regardless of the suite's declaration.
    pub serialize: bool,
    /// Stop starting new variants once a pair has failed.
    pub fail_fast: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            debug: false,
            seed: None,
            name_filter: None,
            use_cache: true,
            env_filter: EnvFilter::All,
            method_filter: None,
            serialize: false,
            fail_fast: false,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_name_filter(mut self, filter: Option<String>) -> Self {
        self.name_filter = filter;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_env_filter(mut self, filter: EnvFilter) -> Self {
        self.env_filter = filter;
        self
    }

    pub fn with_method_filter(mut self, filter: Option<String>) -> Self {
        self.method_filter = filter;
        self
    }

    pub fn with_serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Whether these options alone force the serial strategy.
    pub fn forces_serial(&self) -> bool {
        self.serialize || self.debug
    }
}
