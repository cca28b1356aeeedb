//! Local Docker backend
//!
//! Launches workers on the Docker engine of this host through bollard.

use super::{ContainerRuntime, RunSpec, RuntimeError, RuntimeResult};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Runtime backed by the local Docker engine
pub struct LocalDockerRuntime {
    docker: Docker,
}

impl LocalDockerRuntime {
    /// Connect using the platform's default socket
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn map_docker_error(err: DockerError, worker_id: &str) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(worker_id.to_string()),
        other => RuntimeError::Io(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for LocalDockerRuntime {
    async fn run(&self, spec: RunSpec) -> RuntimeResult<String> {
        let volumes: HashMap<String, HashMap<(), ()>> = spec
            .volumes
            .iter()
            .map(|volume| (volume.clone(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            binds: Some(spec.binds.iter().map(|bind| bind.to_docker()).collect()),
            network_mode: spec.network_mode.clone(),
            shm_size: spec.shm_size.map(|size| size as i64),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            user: spec.user.clone(),
            env: Some(spec.env.clone()),
            cmd: spec.command.clone(),
            labels: Some(spec.labels.clone()),
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            host_config: Some(host_config),
            ..Default::default()
        };

        tracing::info!("Launching worker {} from image {}", spec.name, spec.image);

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RuntimeError::Launch(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(RuntimeError::Launch(e.to_string()));
        }

        tracing::debug!("Worker {} running as {}", spec.name, created.id);
        Ok(created.id)
    }

    async fn exec_async(&self, worker_id: &str, command: &str) -> RuntimeResult<()> {
        let exec = self
            .docker
            .create_exec(
                worker_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "bash".to_string(),
                        "-c".to_string(),
                        command.to_string(),
                    ]),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_docker_error(e, worker_id))?;

        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error(e, worker_id))?;

        Ok(())
    }

    async fn wait_for_stopped(&self, worker_id: &str, seconds_of_wait: u64) -> RuntimeResult<()> {
        let mut stream = self.docker.wait_container(
            worker_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let wait = async {
            match stream.next().await {
                None | Some(Ok(_)) => Ok(()),
                // Non-zero exit code, the worker did stop
                Some(Err(DockerError::DockerContainerWaitError { .. })) => Ok(()),
                Some(Err(e)) => Err(map_docker_error(e, worker_id)),
            }
        };

        tokio::time::timeout(Duration::from_secs(seconds_of_wait), wait)
            .await
            .map_err(|_| RuntimeError::Timeout {
                worker_id: worker_id.to_string(),
                seconds: seconds_of_wait,
            })?
    }

    async fn remove(&self, worker_id: &str, force: bool) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                worker_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error(e, worker_id))
    }

    async fn image_exists_locally(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Io(e.to_string())),
        }
    }

    async fn ensure_image_available(&self, image: &str, seconds_of_wait: u64) -> RuntimeResult<()> {
        if self.image_exists_locally(image).await? {
            return Ok(());
        }

        tracing::info!("Pulling worker image {} (up to {}s)", image, seconds_of_wait);

        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let pull = self
            .docker
            .create_image(options, None, None)
            .try_collect::<Vec<_>>();

        match tokio::time::timeout(Duration::from_secs(seconds_of_wait), pull).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RuntimeError::Io(e.to_string())),
            Err(_) => Err(RuntimeError::Io(format!(
                "Image {} not pulled within {} seconds",
                image, seconds_of_wait
            ))),
        }
    }

    async fn clean_stranded(&self, image: &str) -> RuntimeResult<()> {
        let mut filters = HashMap::new();
        filters.insert("ancestor".to_string(), vec![image.to_string()]);

        let stranded = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Io(e.to_string()))?;

        for container in stranded {
            let Some(id) = container.id else { continue };
            tracing::warn!("Removing stranded worker {} of image {}", id, image);
            if let Err(e) = self.remove(&id, true).await {
                tracing::error!("Failed to remove stranded worker {}: {}", id, e);
            }
        }

        Ok(())
    }
}
