//! Test registry and name filtering.
//!
//! The registry is an ordered list of test names plus a name → [`TestCase`]
//! lookup, the same shape the suite generator emits. The two halves are
//! allowed to disagree: a name without an implementation is reported as
//! missing rather than treated as a failure.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::context::{TestContext, TestResult};

/// Signature of a test body.
pub type TestFn = fn(&mut TestContext) -> TestResult;

/// One registered test.
#[derive(Clone, Copy)]
pub struct TestCase {
    /// Unique name within the registry.
    pub name: &'static str,
    /// Requires exclusive use of the scheduler (no concurrent peers).
    pub serialize: bool,
    /// One-line description shown by `--list`.
    pub summary: &'static str,
    /// The procedure itself.
    pub body: TestFn,
}

impl TestCase {
    pub const fn new(name: &'static str, body: TestFn) -> Self {
        Self {
            name,
            serialize: false,
            summary: "",
            body,
        }
    }

    #[must_use]
    pub const fn serialized(mut self) -> Self {
        self.serialize = true;
        self
    }

    #[must_use]
    pub const fn with_summary(mut self, summary: &'static str) -> Self {
        self.summary = summary;
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("serialize", &self.serialize)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of tests.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    order: Vec<String>,
    cases: HashMap<String, TestCase>,
}

impl Registry {
    /// Registry whose order is the order of `cases`.
    pub fn new(cases: impl IntoIterator<Item = TestCase>) -> Self {
        let mut registry = Self::default();
        for case in cases {
            if !registry.cases.contains_key(case.name) {
                registry.order.push(case.name.to_string());
            }
            registry.cases.insert(case.name.to_string(), case);
        }
        registry
    }

    /// Registry from an explicit name order and a separate set of implementations.
    pub fn from_parts(
        order: impl IntoIterator<Item = impl Into<String>>,
        cases: impl IntoIterator<Item = TestCase>,
    ) -> Self {
        Self {
            order: order.into_iter().map(Into::into).collect(),
            cases: cases
                .into_iter()
                .map(|case| (case.name.to_string(), case))
                .collect(),
        }
    }

    /// Registered names, in order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.cases.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tests matching `filter`, in registry order.
    pub fn select(&self, filter: &TestFilter) -> Selection {
        let mut selection = Selection::default();
        for name in self.order.iter().filter(|name| filter.matches(name)) {
            match self.cases.get(name) {
                Some(case) => selection.cases.push(*case),
                None => selection.missing.push(name.clone()),
            }
        }
        selection
    }
}

/// Result of filtering a registry.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Runnable tests, in registry order.
    pub cases: Vec<TestCase>,
    /// Matching names that have no implementation.
    pub missing: Vec<String>,
}

/// Error building a [`TestFilter`].
#[derive(Debug, thiserror::Error)]
#[error("Bad test pattern {pattern:?}: {source}")]
pub struct FilterError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Case-insensitive name filter. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct TestFilter {
    patterns: Vec<Regex>,
}

impl TestFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, FilterError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&format!("(?i){pattern}")).map_err(|source| FilterError {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Filter that matches every test.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether any patterns were supplied.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(_: &mut TestContext) -> TestResult {
        Ok(())
    }

    fn registry() -> Registry {
        Registry::from_parts(
            ["Pod001", "Pod002", "ReplicaSet001", "Ghost001"],
            [
                TestCase::new("Pod001", pass),
                TestCase::new("Pod002", pass).serialized(),
                TestCase::new("ReplicaSet001", pass),
            ],
        )
    }

    #[test]
    fn test_empty_filter_selects_all_in_order() {
        let selection = registry().select(&TestFilter::all());
        let names: Vec<_> = selection.cases.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Pod001", "Pod002", "ReplicaSet001"]);
        assert_eq!(selection.missing, vec!["Ghost001"]);
    }

    #[test]
    fn test_filter_is_case_insensitive_and_any_match() {
        let filter = TestFilter::new(&["^pod00[2]$", "replica"]).unwrap();
        let selection = registry().select(&filter);
        let names: Vec<_> = selection.cases.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Pod002", "ReplicaSet001"]);
        assert!(selection.missing.is_empty());
        assert!(selection.cases[0].serialize);
    }

    #[test]
    fn test_filter_reports_missing_implementation() {
        let filter = TestFilter::new(&["ghost"]).unwrap();
        let selection = registry().select(&filter);
        assert!(selection.cases.is_empty());
        assert_eq!(selection.missing, vec!["Ghost001"]);
    }

    #[test]
    fn test_bad_pattern() {
        let err = TestFilter::new(&["pod("]).unwrap_err();
        assert_eq!(err.pattern, "pod(");
        assert!(err.to_string().starts_with("Bad test pattern"));
    }

    #[test]
    fn test_new_keeps_first_position_for_duplicates() {
        let registry = Registry::new([
            TestCase::new("A1", pass),
            TestCase::new("A2", pass),
            TestCase::new("A1", pass).serialized(),
        ]);
        assert_eq!(registry.names(), &["A1".to_string(), "A2".to_string()]);
        assert!(registry.get("A1").unwrap().serialize);
        assert_eq!(registry.len(), 2);
    }
}
