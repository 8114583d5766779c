//! Invalidation plan generation.
//!
//! Expands changed resource types into the ordered, deduplicated set of
//! resource types to purge, and the URL patterns those types own.

use std::collections::HashSet;
use std::fmt;

use hostpilot_realtime_types::ResourceType;

use super::graph::ResourceGraph;

/// Resource types to visit for one invalidation pass.
///
/// Each resource appears at most once; order is first-seen, roots before
/// their dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    resources: Vec<ResourceType>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InvalidationPlan {")?;
        for (index, resource) in self.resources.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, " {resource}")?;
        }
        f.write_str(" }")
    }
}

impl InvalidationPlan {
    /// Plan for a single changed resource.
    ///
    /// Dependents are expanded one level, exactly as declared.
    pub fn for_resource(
        graph: &ResourceGraph,
        resource: ResourceType,
        skip_dependencies: bool,
    ) -> Self {
        let mut plan = Self::default();
        let mut seen = HashSet::new();
        plan.push(&mut seen, resource);
        if !skip_dependencies {
            for dependent in graph.dependencies_of(resource) {
                plan.push(&mut seen, *dependent);
            }
        }
        plan
    }

    /// Union of the given resources and their declared dependents.
    pub fn for_resources(graph: &ResourceGraph, resources: &[ResourceType]) -> Self {
        let mut plan = Self::default();
        let mut seen = HashSet::new();
        for resource in resources {
            plan.push(&mut seen, *resource);
            for dependent in graph.dependencies_of(*resource) {
                plan.push(&mut seen, *dependent);
            }
        }
        plan
    }

    fn push(&mut self, seen: &mut HashSet<ResourceType>, resource: ResourceType) {
        if seen.insert(resource) {
            self.resources.push(resource);
        }
    }

    pub fn resources(&self) -> &[ResourceType] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Every URL pattern owned by a planned resource, deduplicated.
    pub fn patterns<'g>(&self, graph: &'g ResourceGraph) -> Vec<&'g str> {
        let mut seen = HashSet::new();
        self.resources
            .iter()
            .flat_map(|resource| graph.patterns_for(*resource))
            .map(String::as_str)
            .filter(|pattern| seen.insert(*pattern))
            .collect()
    }
}
