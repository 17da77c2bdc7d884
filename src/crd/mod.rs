//! The resource model: `Sandbox`, `WarmPool`, `WarmPod`,
//! `RuntimeEnvironment`, `SandboxProfile`, plus the shared value types they
//! compose from. All five are `kube::CustomResource`s under group
//! `llmsafespace.dev/v1`.

pub mod common;
pub mod runtime_environment;
pub mod sandbox;
pub mod sandbox_profile;
pub mod warmpod;
pub mod warmpool;

pub use common::*;
pub use runtime_environment::{RuntimeEnvironment, RuntimeEnvironmentSpec, RuntimeEnvironmentStatus};
pub use sandbox::{Sandbox, SandboxPhase, SandboxSpec, SandboxStatus};
pub use sandbox_profile::{SandboxProfile, SandboxProfileSpec};
pub use warmpod::{WarmPod, WarmPodPhase, WarmPodSpec, WarmPodStatus};
pub use warmpool::{WarmPool, WarmPoolSpec, WarmPoolStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn all_five_crds_generate_valid_yaml() {
        for (yaml, kind) in [
            (serde_yaml::to_string(&Sandbox::crd()).unwrap(), "Sandbox"),
            (serde_yaml::to_string(&WarmPool::crd()).unwrap(), "WarmPool"),
            (serde_yaml::to_string(&WarmPod::crd()).unwrap(), "WarmPod"),
            (
                serde_yaml::to_string(&RuntimeEnvironment::crd()).unwrap(),
                "RuntimeEnvironment",
            ),
            (
                serde_yaml::to_string(&SandboxProfile::crd()).unwrap(),
                "SandboxProfile",
            ),
        ] {
            assert!(yaml.contains("llmsafespace.dev"));
            assert!(yaml.contains(kind));
        }
    }

    #[test]
    fn all_crds_are_namespaced() {
        assert_eq!(Sandbox::crd().spec.scope, "Namespaced");
        assert_eq!(WarmPool::crd().spec.scope, "Namespaced");
        assert_eq!(WarmPod::crd().spec.scope, "Namespaced");
    }
}
