// Docker runtime (default runc) backing every sandbox environment.

use super::runtime::{CappedBuffer, ContainerRuntime, ContainerSpec, ExecOutput, ExecSpec, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Container runtime talking to the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket) and ping the daemon.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unreachable(format!("Failed to connect to Docker: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unreachable(format!("Docker ping failed: {}", e)))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// 404 and 409 mean the container vanished or stopped under us.
fn classify(err: BollardError, context: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            message,
        } => RuntimeError::Gone(format!("{}: {}", context, message)),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{}: {} ({})", context, message, status_code)),
        other => RuntimeError::Unreachable(format!("{}: {}", context, other)),
    }
}

/// Split `repo[:tag]` so a bare name pulls `latest` instead of every tag.
fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let tmpfs: HashMap<String, String> = spec
        .tmpfs
        .iter()
        .map(|path| (path.clone(), "rw,size=1g".to_string()))
        .collect();

    let mut security_opt = vec!["no-new-privileges".to_string()];
    if spec.cap_add.iter().any(|c| c == "SYS_ADMIN") {
        // the default AppArmor profile denies mount(2) even with CAP_SYS_ADMIN
        security_opt.push("apparmor=unconfined".to_string());
    }

    HostConfig {
        network_mode: Some(if spec.network_enabled { "bridge" } else { "none" }.to_string()),
        binds: Some(spec.binds.clone()),
        tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
        memory: spec.memory.map(|m| m as i64),
        nano_cpus: spec.cpus.map(|c| (c * 1_000_000_000.0) as i64),
        security_opt: Some(security_opt),
        cap_drop: Some(vec!["ALL".to_string()]),
        cap_add: Some(spec.cap_add.clone()),
        // reap orphans left behind by killed commands
        init: Some(true),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(classify(e, "Failed to inspect image")),
        }

        let (from_image, tag) = split_image_ref(image);
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "pull");
                    }
                }
                Err(BollardError::DockerResponseServerError { message, .. }) => {
                    return Err(RuntimeError::ImageUnavailable(format!("{}: {}", image, message)));
                }
                Err(e) => return Err(classify(e, "Failed to pull image")),
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();

        let config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(host_config(spec)),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: spec.working_dir.clone(),
            labels: Some(labels),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify(e, "Failed to create container"))?;
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, "Failed to start container"))
    }

    async fn exec(&self, id: &str, exec: &ExecSpec) -> Result<ExecOutput, RuntimeError> {
        let exec_config = CreateExecOptions {
            cmd: Some(exec.cmd.clone()),
            env: if exec.env.is_empty() { None } else { Some(exec.env.clone()) },
            working_dir: exec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(|e| classify(e, "Failed to create exec"))?;

        let started = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| classify(e, "Failed to start exec"))?;

        // keep draining past the cap so the process is never blocked on a full pipe
        let mut stdout = CappedBuffer::new(exec.output_limit);
        let mut stderr = CappedBuffer::new(exec.output_limit);
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                        Ok(_) => {}
                        Err(e) => return Err(classify(e, "Exec output stream failed")),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Api("exec started detached".to_string()));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| classify(e, "Failed to inspect exec"))?;

        let (stdout, stdout_dropped) = stdout.into_parts();
        let (stderr, stderr_dropped) = stderr.into_parts();
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
            stdout_dropped,
            stderr_dropped,
        })
    }

    async fn upload(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<(), RuntimeError> {
        debug!(container_id = %id, dest = %dest_dir, bytes = archive.len(), "Uploading archive");
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| classify(e, "Failed to upload archive"))
    }

    async fn download(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut stream = self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(e, "Failed to download archive"))?;
            archive.extend_from_slice(&chunk);
        }
        debug!(container_id = %id, path = %path, bytes = archive.len(), "Downloaded archive");
        Ok(archive)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(|e| classify(e, "Failed to stop container"))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, "Failed to remove container"))
    }
}
