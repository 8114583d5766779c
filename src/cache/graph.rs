//! Resource dependency graph and URL-pattern table.
//!
//! Both tables are plain data so tests can substitute a smaller graph. The
//! dependency lists are expanded exactly one level at invalidation time; a
//! resource whose dependents have dependents of their own must list the full
//! closure itself.

use std::collections::HashMap;

use hostpilot_realtime_types::ResourceType;

/// Which resource types cascade from which, and which cache keys belong to each.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    dependencies: HashMap<ResourceType, Vec<ResourceType>>,
    patterns: HashMap<ResourceType, Vec<String>>,
}

impl ResourceGraph {
    /// A graph with no dependencies and no patterns.
    pub fn empty() -> Self {
        Self {
            dependencies: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    /// The compiled-in production tables.
    pub fn standard() -> Self {
        use ResourceType::*;

        Self::empty()
            .with_resource(
                Task,
                &[Dashboard, Finance],
                &[
                    "/api/tasks",
                    "/api/fast/tasks",
                    "/api/ultra-fast-tasks",
                    "/api/dashboard",
                    "/api/finance",
                    "/api/finance/analytics",
                ],
            )
            .with_resource(
                Property,
                &[Dashboard, Finance, Booking],
                &[
                    "/api/properties",
                    "/api/fast/properties",
                    "/api/dashboard",
                    "/api/finance",
                    "/api/finance/analytics",
                ],
            )
            .with_resource(
                Booking,
                &[Dashboard, Finance],
                &[
                    "/api/bookings",
                    "/api/booking-revenue",
                    "/api/dashboard",
                    "/api/finance",
                    "/api/finance/analytics",
                ],
            )
            .with_resource(
                Finance,
                &[Dashboard],
                &[
                    "/api/finance",
                    "/api/finance/analytics",
                    "/api/booking-revenue",
                    "/api/dashboard",
                ],
            )
            .with_resource(
                Document,
                &[Dashboard],
                &["/api/property-documents", "/api/documents"],
            )
            .with_resource(
                Utility,
                &[Dashboard, Finance],
                &[
                    "/api/utilities",
                    "/api/utility-bills",
                    "/api/finance",
                    "/api/finance/analytics",
                ],
            )
            .with_resource(Service, &[], &["/api/addon-services", "/api/services"])
            .with_resource(
                ServiceBooking,
                &[Dashboard, Finance],
                &[
                    "/api/service-bookings",
                    "/api/finance",
                    "/api/finance/analytics",
                ],
            )
            .with_resource(Staff, &[Dashboard], &["/api/staff", "/api/staff-members"])
            .with_resource(Owner, &[], &["/api/owners", "/api/owner"])
            .with_resource(
                Settings,
                &[Dashboard, Finance, Property, Booking],
                &[
                    "/api/system-settings",
                    "/api/currency",
                    "/api/finance",
                    "/api/finance/analytics",
                ],
            )
            .with_resource(Inventory, &[], &["/api/inventory"])
            .with_resource(Vendor, &[], &["/api/vendors"])
            .with_resource(Dashboard, &[], &["/api/dashboard"])
    }

    /// Declare the dependents and URL patterns of one resource type,
    /// replacing any previous declaration.
    pub fn with_resource(
        mut self,
        resource: ResourceType,
        dependents: &[ResourceType],
        patterns: &[&str],
    ) -> Self {
        self.dependencies.insert(resource, dependents.to_vec());
        self.patterns.insert(
            resource,
            patterns.iter().map(|pattern| pattern.to_string()).collect(),
        );
        self
    }

    /// Declared dependents of `resource`, in declaration order.
    pub fn dependencies_of(&self, resource: ResourceType) -> &[ResourceType] {
        self.dependencies
            .get(&resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// URL substrings identifying cache entries of `resource`.
    pub fn patterns_for(&self, resource: ResourceType) -> &[String] {
        self.patterns
            .get(&resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Edges `(resource, missing)` where `missing` is reachable from
    /// `resource` in two hops but is not one of its declared dependents.
    ///
    /// One-level expansion never reaches such resources, so a non-empty
    /// result means the table is not pre-flattened.
    pub fn unflattened_edges(&self) -> Vec<(ResourceType, ResourceType)> {
        let mut missing = Vec::new();
        for resource in ResourceType::ALL {
            let direct = self.dependencies_of(resource);
            for dependent in direct {
                for transitive in self.dependencies_of(*dependent) {
                    if *transitive != resource
                        && !direct.contains(transitive)
                        && !missing.contains(&(resource, *transitive))
                    {
                        missing.push((resource, *transitive));
                    }
                }
            }
        }
        missing
    }
}

impl Default for ResourceGraph {
    fn default() -> Self {
        Self::standard()
    }
}
