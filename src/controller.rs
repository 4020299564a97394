use crate::reconciler::ReconcileOutcome;
use crate::rollout::{ENABLE_ANNOTATION, Workload, WorkloadRef};
use crate::state::ControllerContext;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::api::ListParams;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// One check of every enabled workload. Skipped when the previous check is
/// still running.
pub async fn run(ctx: ControllerContext, cancel: CancellationToken) -> anyhow::Result<()> {
    let Ok(_guard) = ctx.scan_lock.try_lock() else {
        warn!("Previous scan is still running, skipping this tick");
        return Ok(());
    };

    let results = [
        scan::<Deployment>(&ctx, &cancel).await,
        scan::<StatefulSet>(&ctx, &cancel).await,
        scan::<DaemonSet>(&ctx, &cancel).await,
    ];

    if !cancel.is_cancelled() {
        ctx.health.mark_ready();
    }

    let failures = results
        .into_iter()
        .filter_map(Result::err)
        .inspect(|e| error!("{:?}", e))
        .count();
    if failures > 0 {
        anyhow::bail!("{} of 3 workload kinds could not be scanned", failures);
    }
    Ok(())
}

async fn scan<K: Workload>(
    ctx: &ControllerContext,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
        return Ok(());
    }

    let api: Api<K> = match &ctx.config.watch_namespace {
        Some(namespace) => Api::namespaced(ctx.kube_client.clone(), namespace),
        None => Api::all(ctx.kube_client.clone()),
    };

    // Annotations cannot be selected server-side, so filter after listing
    let workloads = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("Failed to list {}s", K::KIND))?;
    let enabled: Vec<K> = workloads.items.into_iter().filter(is_enabled).collect();

    info!(
        "Scanning for digest changes in {} {}s with annotation {}=true",
        enabled.len(),
        K::KIND,
        ENABLE_ANNOTATION
    );

    stream::iter(enabled)
        .for_each_concurrent(ctx.config.max_concurrent_reconciles, |workload| async move {
            reconcile_workload(ctx, cancel, workload).await
        })
        .await;

    Ok(())
}

fn is_enabled<K: Workload>(workload: &K) -> bool {
    workload
        .meta()
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ENABLE_ANNOTATION))
        .is_some_and(|value| value == "true")
}

async fn reconcile_workload<K: Workload>(
    ctx: &ControllerContext,
    cancel: &CancellationToken,
    workload: K,
) {
    let meta = workload.meta();
    let (Some(name), Some(namespace)) = (meta.name.clone(), meta.namespace.clone()) else {
        warn!("Skipping {} without name or namespace", K::KIND);
        return;
    };
    let workload_ref = WorkloadRef::new(K::KIND, name, namespace);

    // The patch is a single request sent last, so cancelling leaves a
    // workload either fully patched or untouched.
    tokio::select! {
        _ = cancel.cancelled() => {
            info!("{}: reconciliation cancelled", workload_ref);
        }
        result = ctx.reconciler.reconcile(&workload_ref, workload.pod_spec(), meta) => {
            match result {
                Ok(ReconcileOutcome::RolledOut { digests }) => {
                    info!("{}: rolled out to {}", workload_ref, digests);
                }
                Ok(outcome) => debug!("{}: {:?}", workload_ref, outcome),
                Err(e) => error!("{}: {:?}", workload_ref, e),
            }
        }
    }
}
