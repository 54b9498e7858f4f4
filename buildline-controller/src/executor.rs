//! Build job submission against the Kubernetes cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, Secret, SecretEnvSource,
    SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::Client;

use crate::config::Config;
use buildline_core::{protocol, PipelineSpec, Stage};

/// The default timeout to use for cluster API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The canonical app label value of all buildline-created jobs.
pub const APP_NAME: &str = "buildline";
/// The canonical buildline label identifying a job's pipeline.
pub const LABEL_PIPELINE: &str = "buildline.rs/pipeline";
/// The canonical buildline label carrying a job's full commit sha.
pub const LABEL_COMMIT: &str = "buildline.rs/commit";
/// The canonical buildline label carrying a job's iteration.
pub const LABEL_ITERATION: &str = "buildline.rs/iteration";

/// The expected type of docker registry secrets.
const SECRET_TYPE_DOCKERCONFIG: &str = "kubernetes.io/dockerconfigjson";
/// The expected type of env-from secrets.
const SECRET_TYPE_OPAQUE: &str = "Opaque";

/// A fully resolved build, ready for submission as a cluster job.
#[derive(Clone, Debug)]
pub struct BuildSpec {
    pub pipeline: String,
    pub git_url: String,
    pub commit: String,
    pub iteration: u64,
    pub docker_secret: Option<String>,
    pub env_from_secret: Option<String>,
    pub spec: Arc<PipelineSpec>,
}

/// A record of a dispatched cluster job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobHandle {
    /// The job's name within the cluster.
    pub name: String,
    /// The commit the job was built from, when known.
    pub commit: Option<String>,
    /// The job's iteration, when known.
    pub iteration: Option<u64>,
    /// Whether the job still has active pods.
    pub active: bool,
}

/// The cluster system running submitted builds as isolated jobs.
#[async_trait]
pub trait ClusterExecutor: Send + Sync + 'static {
    /// Submit the given build as a running job.
    async fn submit(&self, build: &BuildSpec) -> Result<JobHandle>;

    /// The most recently created job of the given pipeline, if any.
    async fn most_recent(&self, pipeline: &str) -> Result<Option<JobHandle>>;
}

/// A `ClusterExecutor` backed by the Kubernetes batch API.
pub struct K8sExecutor {
    client: Client,
    config: Arc<Config>,
}

impl K8sExecutor {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    /// Verify that a referenced secret exists and carries the expected type.
    async fn ensure_secret(&self, name: &str, expected_type: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let secret = tokio::time::timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching secret")?
            .with_context(|| format!("could not locate secret {}/{}", self.config.namespace, name))?;
        let secret_type = secret.type_.as_deref().unwrap_or_default();
        if secret_type != expected_type {
            bail!("secret {}/{} is not type {}", self.config.namespace, name, expected_type);
        }
        Ok(())
    }
}

/// Assemble the job object for a build.
fn build_job(config: &Config, build: &BuildSpec) -> Job {
    let short = protocol::short_sha(&build.commit);
    let iteration = build.iteration.to_string();
    let labels: BTreeMap<String, String> = vec![
        ("app".to_string(), APP_NAME.to_string()),
        (LABEL_PIPELINE.to_string(), build.pipeline.clone()),
        (LABEL_COMMIT.to_string(), build.commit.clone()),
        (LABEL_ITERATION.to_string(), iteration.clone()),
    ]
    .into_iter()
    .collect();

    let base_env = vec![
        env_var(protocol::ENV_GIT_URL, &build.git_url),
        env_var(protocol::ENV_COMMIT_SHA, &build.commit),
        env_var(protocol::ENV_COMMIT_SHA_SHORT, short),
        env_var(protocol::ENV_ITERATION, &iteration),
    ];

    let mut containers = vec![sequencer_container(config, build, &iteration)];
    for (idx, stage) in build.spec.stages.iter().enumerate() {
        containers.push(stage_container(config, build, stage, idx + 1, base_env.clone()));
    }

    let mut volumes = vec![
        Volume {
            name: "work".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "shared".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    if let Some(secret) = &build.docker_secret {
        volumes.push(Volume {
            name: "docker-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", build.pipeline)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    active_deadline_seconds: Some(config.job_active_deadline_seconds as i64),
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The in-job sequencer container, which drives the stage chain.
fn sequencer_container(config: &Config, build: &BuildSpec, iteration: &str) -> Container {
    let stages = build.spec.stage_names().join(",");
    let mut env = vec![
        env_var("RUST_LOG", &config.rust_log),
        env_var("PIPELINE", &build.pipeline),
        env_var_field("JOB", "metadata.name"),
        env_var("STAGES", &stages),
        env_var("LOG_DIR", &config.shared_dir),
        env_var("START_SENTINEL", &config.start_sentinel),
        env_var("SUCCESS_SENTINEL", &config.success_sentinel),
        env_var("FAILURE_SENTINEL", &config.failure_sentinel),
        env_var("ITERATION", iteration),
        env_var("TIME_LIMIT_SECONDS", &config.job_time_limit_seconds.to_string()),
        env_var("INFLUXDB_DATABASE", &config.influxdb_database),
    ];
    if let Some(url) = &config.influxdb_url {
        env.push(env_var("INFLUXDB_URL", url));
    }
    Container {
        name: "sequencer".to_string(),
        image: Some(config.sequencer_image.clone()),
        env: Some(env),
        volume_mounts: Some(vec![volume_mount("shared", &config.shared_dir)]),
        ..Default::default()
    }
}

/// One stage container. The actual build/push/command shell logic lives
/// in the stage image; the controller only wires env and mounts.
fn stage_container(config: &Config, build: &BuildSpec, stage: &Stage, number: usize, mut env: Vec<EnvVar>) -> Container {
    env.push(env_var(protocol::ENV_STAGE_NAME, stage.name()));
    env.push(env_var(protocol::ENV_STAGE_NUMBER, &number.to_string()));
    let mut docker_stage = true;
    let image = match stage {
        Stage::Custom { image, commands, .. } => {
            docker_stage = false;
            env.push(env_var(protocol::ENV_COMMANDS, &commands.join("\n")));
            image.clone()
        }
        Stage::Push { .. } => {
            env.push(env_var(protocol::ENV_DOCKER_PUSH_TAGS, &stage.destinations().join(" ")));
            config.stage_shell_image.clone()
        }
        Stage::Build { build_dir, dockerfile, .. } => {
            env.push(env_var(protocol::ENV_BUILD_DIR, build_dir));
            env.push(env_var(protocol::ENV_DOCKERFILE, dockerfile));
            config.stage_shell_image.clone()
        }
    };

    let mut volume_mounts = vec![volume_mount("work", "/work"), volume_mount("shared", &config.shared_dir)];
    if docker_stage && build.docker_secret.is_some() {
        volume_mounts.push(volume_mount("docker-config", "/root/.docker"));
    }
    let env_from = build.env_from_secret.as_ref().map(|secret| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    Container {
        name: container_name(stage.name()),
        image: Some(image),
        working_dir: Some("/work".to_string()),
        env: Some(env),
        env_from,
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

/// A stage's container name. Stage names allow underscores, which are invalid
/// in container names, so those map to hyphens.
fn container_name(stage_name: &str) -> String {
    stage_name.to_ascii_lowercase().replace('_', "-")
}

#[async_trait]
impl ClusterExecutor for K8sExecutor {
    #[tracing::instrument(level = "debug", skip(self, build), fields(pipeline = %build.pipeline, commit = %build.commit, iteration = build.iteration))]
    async fn submit(&self, build: &BuildSpec) -> Result<JobHandle> {
        if let Some(secret) = &build.docker_secret {
            self.ensure_secret(secret, SECRET_TYPE_DOCKERCONFIG).await?;
        }
        if let Some(secret) = &build.env_from_secret {
            self.ensure_secret(secret, SECRET_TYPE_OPAQUE).await?;
        }

        let job = build_job(&self.config, build);
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let created = tokio::time::timeout(API_TIMEOUT, api.create(&PostParams::default(), &job))
            .await
            .context("timeout while creating job")?
            .context("error creating job in cluster")?;

        Ok(job_handle(&created))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn most_recent(&self, pipeline: &str) -> Result<Option<JobHandle>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let selector = format!("app={},{}={}", APP_NAME, LABEL_PIPELINE, pipeline);
        let params = ListParams::default().labels(&selector);
        let jobs = tokio::time::timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing jobs")?
            .context("error listing jobs in cluster")?;

        let newest = jobs
            .items
            .iter()
            .max_by_key(|job| job.metadata.creation_timestamp.as_ref().map(|ts| ts.0.timestamp()).unwrap_or(i64::MIN));
        Ok(newest.map(job_handle))
    }
}

/// Decode a job handle from a cluster job record.
fn job_handle(job: &Job) -> JobHandle {
    let labels = job.metadata.labels.clone().unwrap_or_default();
    JobHandle {
        name: job.metadata.name.clone().unwrap_or_default(),
        commit: labels.get(LABEL_COMMIT).cloned(),
        iteration: labels.get(LABEL_ITERATION).and_then(|val| val.parse().ok()),
        active: job
            .status
            .as_ref()
            .and_then(|status| status.active)
            .map(|active| active > 0)
            .unwrap_or(false),
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_var_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}
