//! Prints the CRD manifests for the five resource kinds, one YAML document
//! per kind, in `kubectl apply -f -`-friendly style.

use anyhow::Result;
use kube::CustomResourceExt;

use llmsafespace::crd::{RuntimeEnvironment, Sandbox, SandboxProfile, WarmPod, WarmPool};

pub fn generate() -> Result<()> {
    let docs = [
        serde_yaml::to_string(&Sandbox::crd())?,
        serde_yaml::to_string(&WarmPool::crd())?,
        serde_yaml::to_string(&WarmPod::crd())?,
        serde_yaml::to_string(&RuntimeEnvironment::crd())?,
        serde_yaml::to_string(&SandboxProfile::crd())?,
    ];
    println!("{}", docs.join("---\n"));
    Ok(())
}

/// Applies all five CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [
        Sandbox::crd(),
        WarmPool::crd(),
        WarmPod::crd(),
        RuntimeEnvironment::crd(),
        SandboxProfile::crd(),
    ] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed"),
            Err(kube::Error::Api(err)) if err.code == 409 => println!("CRD '{name}' already exists, skipping"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
