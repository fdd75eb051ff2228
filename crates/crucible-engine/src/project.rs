//! Registered projects: the engine-side definition a task is built from.

use crucible_core::ids::ProjectId;
use crucible_core::label::Label;
use crucible_core::result::BuildResult;
use crucible_core::task::{ResourceList, TaskRunner};
use crucible_matrix::{MatrixAggregator, MatrixProject};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What kind of build a project produces.
pub enum ProjectKind {
    Freestyle {
        runner: Arc<dyn TaskRunner>,
    },
    Matrix {
        matrix: MatrixProject,
        /// Runs one configuration; the parent coordinator is built by
        /// the engine around it.
        configuration_runner: Arc<dyn TaskRunner>,
        aggregators: Vec<Arc<dyn MatrixAggregator>>,
    },
}

/// A project registered with the engine.
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub label: Option<Label>,
    pub enabled: bool,
    pub concurrent_build: bool,
    pub non_blocking: bool,
    /// `None` falls back to the engine's configured default.
    pub quiet_period: Option<Duration>,
    pub estimated_duration: Option<Duration>,
    pub resources: ResourceList,
    /// Wait while a transitive upstream project is building or queued.
    pub block_on_upstream: bool,
    pub block_on_downstream: bool,
    /// Upstream projects that trigger this one, with the result each
    /// must meet or beat.
    pub upstream: Vec<(ProjectId, BuildResult)>,
    pub kind: ProjectKind,
}

impl Project {
    pub fn freestyle(name: impl Into<String>, runner: Arc<dyn TaskRunner>) -> Self {
        Self::new(name, ProjectKind::Freestyle { runner })
    }

    pub fn matrix(
        name: impl Into<String>,
        matrix: MatrixProject,
        configuration_runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self::new(
            name,
            ProjectKind::Matrix {
                matrix,
                configuration_runner,
                aggregators: Vec::new(),
            },
        )
    }

    fn new(name: impl Into<String>, kind: ProjectKind) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            label: None,
            enabled: true,
            concurrent_build: false,
            non_blocking: false,
            quiet_period: None,
            estimated_duration: None,
            resources: ResourceList::default(),
            block_on_upstream: false,
            block_on_downstream: false,
            upstream: Vec::new(),
            kind,
        }
    }

    pub fn with_label(mut self, label: Label) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_quiet_period(mut self, quiet: Duration) -> Self {
        self.quiet_period = Some(quiet);
        self
    }

    pub fn with_resources(mut self, resources: ResourceList) -> Self {
        self.resources = resources;
        self
    }

    /// Declare an upstream trigger: when `upstream` completes with a
    /// result at least as good as `threshold`, this project is scheduled.
    pub fn triggered_by(mut self, upstream: ProjectId, threshold: BuildResult) -> Self {
        self.upstream.push((upstream, threshold));
        self
    }

    pub fn blocking_on_upstream(mut self) -> Self {
        self.block_on_upstream = true;
        self
    }

    pub fn blocking_on_downstream(mut self) -> Self {
        self.block_on_downstream = true;
        self
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("label", &self.label)
            .field("enabled", &self.enabled)
            .field("concurrent_build", &self.concurrent_build)
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}
