//! Database-driven deployment.
//! The provider polls a deployments view, fetches each app's artifact, builds a
//! context around it and installs it into the `DeploymentManager`, which is
//! what the engine routes requests through.

mod artifact;
mod context;
mod descriptor;
mod manager;
mod provider;
mod view;

pub use artifact::{ArtifactFetcher, DEFAULT_MAX_ARTIFACT_BYTES};
pub use context::{AppRequest, ArchiveContextFactory, ContextFactory, WebApp};
pub use descriptor::{normalize_context_path, AppDescriptor, ArtifactRef, Revision};
pub use manager::{DeploymentManager, LiveContext, RequestGuard};
pub use provider::{AppProvider, PollReport, ProviderSettings};
pub use view::{ViewClient, ViewPoll, ViewSnapshot};
