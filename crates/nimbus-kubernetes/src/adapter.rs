// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Kubernetes `ComputeProvider` implementation.
//!
//! Each Nimbus job maps to one `batch/v1` Job named `nimbus-<job id>`,
//! labeled so the watcher and the cleanup path can find it again.
//! Creation is idempotent: a 409 AlreadyExists means a previous attempt
//! already succeeded and is reported as success.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::batch::v1::{Job as KubeJob, JobSpec as KubeJobSpec};
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use nimbus_core::catalog::{ApplicationCache, CatalogSource};
use nimbus_core::job::{Job, ProviderKind};
use nimbus_core::provider::{
    CancelToken, ComputeProvider, LogSink, ProviderCapabilities, ProviderError,
};
use nimbus_core::staging::CappedReader;

/// Label carrying the adapter's role, shared by all Nimbus-owned objects.
pub const ROLE_LABEL: &str = "role";
/// Label carrying the Nimbus job id.
pub const JOB_ID_LABEL: &str = "nimbus.dev/job-id";

const USER_CONTAINER: &str = "user-job";
const WORKING_DIRECTORY: &str = "/work";

/// How often a quiet log stream re-checks the cancellation token.
const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

/// Kubernetes adapter configuration.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Namespace all Nimbus objects live in.
    pub namespace: String,
    /// Value of the role label on created Jobs.
    pub app_role: String,
    /// Shared filesystem root where input files are staged per job.
    pub staging_root: PathBuf,
    /// Machine classes this cluster serves.
    pub reservations: Vec<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "nimbus-app".to_string(),
            app_role: "nimbus-app".to_string(),
            staging_root: PathBuf::from("/var/lib/nimbus/staging"),
            reservations: Vec::new(),
        }
    }
}

/// Backend-native name of the Job object for a Nimbus job.
pub fn job_name(job_id: &str) -> String {
    format!("nimbus-{}", job_id)
}

/// Compute provider backed by the Kubernetes API.
pub struct KubernetesProvider {
    jobs: Api<KubeJob>,
    pods: Api<Pod>,
    config: KubernetesConfig,
    catalog: ApplicationCache,
}

impl KubernetesProvider {
    /// Create an adapter over an existing client.
    pub fn new(client: Client, config: KubernetesConfig, catalog: Arc<dyn CatalogSource>) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), &config.namespace),
            pods: Api::namespaced(client, &config.namespace),
            config,
            catalog: ApplicationCache::new(catalog),
        }
    }

    fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.config.staging_root.join(job_id)
    }

    async fn resolve_image(&self, job: &Job) -> Result<String, ProviderError> {
        let descriptor = self
            .catalog
            .lookup(&job.application.name, &job.application.version)
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))?
            .ok_or_else(|| {
                ProviderError::Rejected(format!("unknown application {}", job.application))
            })?;
        Ok(descriptor.tool)
    }
}

fn map_kube_err(err: kube::Error) -> ProviderError {
    match err {
        kube::Error::Api(response) => {
            ProviderError::Rejected(format!("{} ({})", response.message, response.code))
        }
        other => ProviderError::Unreachable(other.to_string()),
    }
}

/// Build the `batch/v1` Job object for a Nimbus job.
pub fn build_job(config: &KubernetesConfig, job: &Job, image: &str) -> KubeJob {
    let name = job_name(&job.id);
    let labels: BTreeMap<String, String> = [
        (ROLE_LABEL.to_string(), config.app_role.clone()),
        (JOB_ID_LABEL.to_string(), job.id.clone()),
    ]
    .into();

    let mut quantities = BTreeMap::new();
    quantities.insert(
        "cpu".to_string(),
        Quantity(format!("{}m", job.reservation.cpu * 1000)),
    );
    quantities.insert(
        "memory".to_string(),
        Quantity(format!("{}Gi", job.reservation.memory_gb)),
    );
    if let Some(gpu) = job.reservation.gpu {
        quantities.insert("nvidia.com/gpu".to_string(), Quantity(gpu.to_string()));
    }
    let resources = ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    };

    KubeJob {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(KubeJobSpec {
            active_deadline_seconds: Some(job.max_time.as_secs() as i64),
            backoff_limit: Some(1),
            parallelism: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    automount_service_account_token: Some(false),
                    containers: vec![Container {
                        name: USER_CONTAINER.to_string(),
                        image: Some(image.to_string()),
                        working_dir: Some(WORKING_DIRECTORY.to_string()),
                        resources: Some(resources),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[async_trait]
impl ComputeProvider for KubernetesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kubernetes
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            log_streaming: true,
            time_extension: false,
            suspension: false,
            reservations: self.config.reservations.clone(),
        }
    }

    async fn create(&self, job: &Job) -> Result<String, ProviderError> {
        let image = self.resolve_image(job).await?;
        let object = build_job(&self.config, job, &image);
        let name = job_name(&job.id);

        match self.jobs.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!(job_id = %job.id, name, image, "Created Kubernetes Job");
                Ok(name)
            }
            // A previous create attempt already succeeded.
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(job_id = %job.id, name, "Job already exists");
                Ok(name)
            }
            Err(e) => Err(map_kube_err(e)),
        }
    }

    async fn delete(&self, job: &Job) -> Result<(), ProviderError> {
        let name = job_name(&job.id);
        match self.jobs.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(job_id = %job.id, name, "Deleted Kubernetes Job");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(map_kube_err(e)),
        }
    }

    async fn follow_logs(
        &self,
        job: &Job,
        sink: LogSink,
        cancel: CancelToken,
    ) -> Result<(), ProviderError> {
        let selector = format!("{}={}", JOB_ID_LABEL, job.id);
        let pods = self
            .pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(map_kube_err)?;

        let Some(pod_name) = pods.items.first().and_then(|p| p.metadata.name.clone()) else {
            debug!(job_id = %job.id, "No pods yet, nothing to follow");
            return Ok(());
        };

        let params = LogParams {
            follow: true,
            container: Some(USER_CONTAINER.to_string()),
            ..Default::default()
        };
        let lines = self
            .pods
            .log_stream(&pod_name, &params)
            .await
            .map_err(map_kube_err)?
            .lines();

        forward_lines(lines, &sink, &cancel).await
    }

    async fn stage_file(
        &self,
        job: &Job,
        parameter: &str,
        length: u64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, ProviderError> {
        let dir = self.staging_dir(&job.id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut capped = CappedReader::new(reader, length);
        let mut file = tokio::fs::File::create(dir.join(parameter)).await?;
        let written = tokio::io::copy(&mut capped, &mut file).await?;
        capped.drain().await?;

        debug!(job_id = %job.id, parameter, written, "Staged input file");
        Ok(written)
    }

    async fn cleanup(&self, job: &Job) -> Result<(), ProviderError> {
        self.delete(job).await?;
        match tokio::fs::remove_dir_all(self.staging_dir(&job.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to remove staging directory");
                Err(ProviderError::Io(e))
            }
        }
    }
}

/// Forward log lines into the sink until the stream ends, the consumer goes
/// away, or the token cancels.
///
/// A following stream stays pending while the pod is quiet, so the token is
/// polled on a bounded interval rather than only when a line arrives.
async fn forward_lines<S>(
    mut lines: S,
    sink: &LogSink,
    cancel: &CancelToken,
) -> Result<(), ProviderError>
where
    S: futures::Stream<Item = std::io::Result<String>> + Unpin,
{
    loop {
        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(());
        }
        tokio::select! {
            line = lines.try_next() => {
                match line.map_err(ProviderError::Io)? {
                    Some(line) => {
                        if sink.stdout.send(line).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_core::job::{ApplicationRef, JobState, Reservation};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn test_job() -> Job {
        Job {
            id: "j1".to_string(),
            owner: "alice".to_string(),
            project: None,
            application: ApplicationRef::new("blast", "2.16.0"),
            reservation: Reservation {
                name: "u1-standard-4".to_string(),
                cpu: 4,
                memory_gb: 16,
                gpu: None,
            },
            nodes: 1,
            max_time: Duration::from_secs(7200),
            provider: ProviderKind::Kubernetes,
            state: JobState::Preparing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            provider_job_id: None,
            output_folder: "/work/out".to_string(),
            input_files: vec![],
        }
    }

    #[test]
    fn test_job_name_is_deterministic() {
        assert_eq!(job_name("j1"), "nimbus-j1");
    }

    #[test]
    fn test_build_job_metadata_and_labels() {
        let config = KubernetesConfig::default();
        let object = build_job(&config, &test_job(), "ncbi/blast:2.16.0");

        assert_eq!(object.metadata.name.as_deref(), Some("nimbus-j1"));
        assert_eq!(object.metadata.namespace.as_deref(), Some("nimbus-app"));

        let labels = object.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some("nimbus-app"));
        assert_eq!(labels.get(JOB_ID_LABEL).map(String::as_str), Some("j1"));

        // Pod template carries the same labels so the watcher and log
        // follower can find the pods.
        let template_labels = object
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(template_labels.get(JOB_ID_LABEL).map(String::as_str), Some("j1"));
    }

    #[test]
    fn test_build_job_spec_knobs() {
        let config = KubernetesConfig::default();
        let object = build_job(&config, &test_job(), "ncbi/blast:2.16.0");
        let spec = object.spec.unwrap();

        assert_eq!(spec.backoff_limit, Some(1));
        assert_eq!(spec.parallelism, Some(1));
        assert_eq!(spec.active_deadline_seconds, Some(7200));

        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].name, USER_CONTAINER);
        assert_eq!(
            pod_spec.containers[0].image.as_deref(),
            Some("ncbi/blast:2.16.0")
        );
    }

    #[test]
    fn test_build_job_resources_from_reservation() {
        let config = KubernetesConfig::default();
        let object = build_job(&config, &test_job(), "img");
        let resources = object.spec.unwrap().template.spec.unwrap().containers[0]
            .resources
            .clone()
            .unwrap();

        let limits = resources.limits.unwrap();
        assert_eq!(limits.get("cpu"), Some(&Quantity("4000m".to_string())));
        assert_eq!(limits.get("memory"), Some(&Quantity("16Gi".to_string())));
        assert_eq!(resources.requests.unwrap().get("cpu"), Some(&Quantity("4000m".to_string())));
        assert!(limits.get("nvidia.com/gpu").is_none());
    }

    fn sink() -> (LogSink, tokio::sync::mpsc::Receiver<String>) {
        let (stdout, stdout_rx) = tokio::sync::mpsc::channel(8);
        let (stderr, _stderr_rx) = tokio::sync::mpsc::channel(8);
        (LogSink { stdout, stderr }, stdout_rx)
    }

    #[tokio::test]
    async fn test_forward_lines_delivers_stream_to_stdout() {
        let (sink, mut stdout_rx) = sink();
        let cancel: CancelToken = Arc::new(AtomicBool::new(false));

        let lines = futures::stream::iter(vec![
            Ok::<_, std::io::Error>("first".to_string()),
            Ok("second".to_string()),
        ]);
        forward_lines(lines, &sink, &cancel).await.unwrap();

        assert_eq!(stdout_rx.recv().await.as_deref(), Some("first"));
        assert_eq!(stdout_rx.recv().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_cancel_stops_follow_on_a_silent_stream() {
        let (sink, _stdout_rx) = sink();
        let cancel: CancelToken = Arc::new(AtomicBool::new(false));

        // The stream never yields, like a pod that emits no output.
        let follower = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                forward_lines(
                    futures::stream::pending::<std::io::Result<String>>(),
                    &sink,
                    &cancel,
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.store(true, Ordering::Relaxed);

        tokio::time::timeout(Duration::from_secs(2), follower)
            .await
            .expect("follow should stop once cancelled")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_build_job_gpu_reservation() {
        let config = KubernetesConfig::default();
        let mut job = test_job();
        job.reservation.gpu = Some(2);
        let object = build_job(&config, &job, "img");
        let limits = object.spec.unwrap().template.spec.unwrap().containers[0]
            .resources
            .clone()
            .unwrap()
            .limits
            .unwrap();
        assert_eq!(limits.get("nvidia.com/gpu"), Some(&Quantity("2".to_string())));
    }
}
