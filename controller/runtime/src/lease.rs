use crate::{
    core::CONTROLLER_NAME,
    k8s::{self, Lease, ObjectMeta, Patch, PatchParams},
};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

pub type Claims = watch::Receiver<Arc<kubert::lease::Claim>>;

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    name: &str,
    hostname: &str,
) -> Result<Claims> {
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    CONTROLLER_NAME.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            name,
            &PatchParams {
                field_manager: Some(CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Waits until `hostname` holds the lease.
pub async fn acquired(claims: &mut Claims, hostname: &str) -> Result<()> {
    loop {
        if claims.borrow_and_update().is_current_for(hostname) {
            return Ok(());
        }
        tracing::debug!("Waiting for leadership");
        if claims.changed().await.is_err() {
            bail!("lease manager terminated");
        }
    }
}

/// Completes when `hostname` no longer holds the lease.
pub async fn lost(mut claims: Claims, hostname: String) {
    loop {
        if !claims.borrow_and_update().is_current_for(&hostname) {
            return;
        }
        if claims.changed().await.is_err() {
            return;
        }
    }
}
