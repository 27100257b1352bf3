//! Request-scoped query parameters
//!
//! Tenant, project, time-window and environment scoping for one build. All
//! fields are immutable for the lifetime of the build; the default conditions
//! derived from them can never be removed by user filters.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

/// A project the caller has actively selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Stable numeric id
    pub id: u64,
    /// Human-facing slug
    pub slug: String,
}

impl Project {
    /// Create a project reference
    pub fn new(id: u64, slug: impl Into<String>) -> Self {
        Self {
            id,
            slug: slug.into(),
        }
    }
}

/// Parameters scoping a single query build
#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Tenant/organization id (required by the tag-indexed backend)
    pub organization_id: Option<u64>,
    /// Actively selected projects, in selection order
    pub projects: Vec<Project>,
    /// Inclusive window start
    pub start: DateTime<Utc>,
    /// Exclusive window end
    pub end: DateTime<Utc>,
    /// Requested environments; an empty string entry means "no environment"
    pub environments: Vec<String>,
}

impl QueryParams {
    /// Create parameters, validating `start < end`
    pub fn new(
        organization_id: Option<u64>,
        projects: Vec<Project>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidParams(format!(
                "start {} must precede end {}",
                start, end
            )));
        }
        Ok(Self {
            organization_id,
            projects,
            start,
            end,
            environments: Vec::new(),
        })
    }

    /// Set the requested environment names
    pub fn with_environments(mut self, environments: Vec<String>) -> Self {
        self.environments = environments;
        self
    }

    /// Project ids in selection order
    pub fn project_ids(&self) -> Vec<u64> {
        self.projects.iter().map(|p| p.id).collect()
    }

    /// Look up a project by slug within the active selection
    pub fn project_by_slug(&self, slug: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.slug == slug)
    }

    /// Whether an id is in the active project selection
    pub fn contains_project_id(&self, id: u64) -> bool {
        self.projects.iter().any(|p| p.id == id)
    }
}
