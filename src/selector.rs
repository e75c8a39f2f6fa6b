//! Resolve user-supplied patterns against one domain listing.

use crate::error::VmsError;
use crate::hypervisor::DomainInfo;

/// Pattern selecting every domain.
pub const ALL: &str = "all";

const GLOB_CHARS: &[char] = &['*', '?', '['];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Exact(String),
    Glob(glob::Pattern),
}

impl Selector {
    pub fn parse(pattern: &str) -> Result<Self, VmsError> {
        if pattern == ALL {
            return Ok(Selector::All);
        }
        if is_glob(pattern) {
            return Ok(Selector::Glob(compile(pattern)?));
        }
        Ok(Selector::Exact(pattern.to_string()))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Exact(exact) => exact == name,
            Selector::Glob(glob) => glob.matches(name),
        }
    }

    /// Matching domains in listing order.
    ///
    /// An exact name that is not listed is an error; a glob matching nothing
    /// is just an empty selection.
    pub fn resolve(&self, domains: &[DomainInfo]) -> Result<Vec<DomainInfo>, VmsError> {
        let selected: Vec<DomainInfo> = domains
            .iter()
            .filter(|d| self.matches(&d.name))
            .cloned()
            .collect();

        if let Selector::Exact(name) = self
            && selected.is_empty()
        {
            return Err(VmsError::NotFound { name: name.clone() });
        }
        Ok(selected)
    }
}

/// Whether `pattern` uses glob syntax rather than naming one thing.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(GLOB_CHARS)
}

/// Compile a shell-style glob.
pub fn compile(pattern: &str) -> Result<glob::Pattern, VmsError> {
    glob::Pattern::new(pattern).map_err(|e| VmsError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Resolve a single pattern.
pub fn resolve(pattern: &str, domains: &[DomainInfo]) -> Result<Vec<DomainInfo>, VmsError> {
    Selector::parse(pattern)?.resolve(domains)
}

/// Resolve several patterns into their union, in listing order and without
/// duplicates. No patterns at all selects every domain.
pub fn resolve_patterns<S: AsRef<str>>(
    patterns: &[S],
    domains: &[DomainInfo],
) -> Result<Vec<DomainInfo>, VmsError> {
    if patterns.is_empty() {
        return Ok(domains.to_vec());
    }

    let mut selectors = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let selector = Selector::parse(pattern.as_ref())?;
        if let Selector::Exact(name) = &selector
            && !domains.iter().any(|d| &d.name == name)
        {
            return Err(VmsError::NotFound { name: name.clone() });
        }
        selectors.push(selector);
    }

    Ok(domains
        .iter()
        .filter(|d| selectors.iter().any(|s| s.matches(&d.name)))
        .cloned()
        .collect())
}
