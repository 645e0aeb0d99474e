pub mod metrics;
pub mod model_deployment;
pub mod policy;

pub use metrics::{
    LabelSelector, MetricSpec, MetricTarget, MetricTargetType, ResourceName,
};
pub use model_deployment::{
    AuthConfig, ModelDeployment, ModelDeploymentSpec, ModelDeploymentStatus,
    OAuthConfig, OffloadingBehavior, OffloadingConfig, PolicyRef,
    PolicyRefType, RemoteBackend, ServiceReference, SupportedScheme,
    WorkloadReference,
};
pub use policy::{Policy, PolicySpec, PolicyStatus};
