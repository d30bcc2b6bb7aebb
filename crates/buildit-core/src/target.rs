//! Build targets and target groups.
//!
//! A target names a worker population (one architecture/environment
//! combination). Groups such as `mainline` expand to several targets.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, Result};

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The set of targets the fleet recognizes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetRegistry {
    targets: BTreeSet<Target>,
    groups: BTreeMap<String, Vec<Target>>,
}

impl TargetRegistry {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(|t| Target::new(t)).collect(),
            groups: BTreeMap::new(),
        }
    }

    /// Register a named group. Every member must already be a known target.
    pub fn add_group<I, S>(&mut self, name: impl Into<String>, members: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let members: Vec<Target> = members.into_iter().map(|m| Target::new(m)).collect();
        if let Some(unknown) = members.iter().find(|m| !self.targets.contains(*m)) {
            return Err(Error::InvalidTarget(format!(
                "group '{}' references unknown target '{}'",
                name, unknown
            )));
        }
        self.groups.insert(name, members);
        Ok(())
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.targets.contains(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    /// Resolve a single target name, failing with `InvalidTarget` if unknown.
    pub fn resolve(&self, name: &str) -> Result<Target> {
        let target = Target::from(name);
        if self.contains(&target) {
            Ok(target)
        } else {
            Err(Error::InvalidTarget(name.to_string()))
        }
    }

    /// Expand target and group names into a sorted, de-duplicated target list.
    pub fn expand<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Target>> {
        let mut out = BTreeSet::new();
        for name in names {
            let name = name.as_ref();
            if let Some(members) = self.groups.get(name) {
                out.extend(members.iter().cloned());
            } else {
                out.insert(self.resolve(name)?);
            }
        }
        if out.is_empty() {
            return Err(Error::InvalidTarget("no targets given".to_string()));
        }
        Ok(out.into_iter().collect())
    }
}
