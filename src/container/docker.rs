//! Docker CLI wrapper -- drive the `docker` binary for image, create, start
//! and wait operations.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ContainerExit, ContainerRuntime, ContainerSpec, RunningContainer, RuntimeError};

/// [`ContainerRuntime`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Check that the client is installed and can reach a daemon.
    pub async fn is_available(&self) -> bool {
        match self.output("version", &["version", "--format", "{{.Server.Version}}"]).await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }

    async fn output(&self, op: &'static str, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!(program = %self.program, ?args, "docker {}", op);
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    async fn run(&self, op: &'static str, args: &[&str]) -> Result<String, RuntimeError> {
        let out = self.output(op, args).await?;
        if !out.status.success() {
            return Err(RuntimeError::Command {
                op,
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Arguments for `docker create` from a spec.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    let mut entrypoint = spec.entrypoint.iter();
    if let Some(program) = entrypoint.next() {
        args.push("--entrypoint".to_string());
        args.push(program.clone());
    }
    args.push(spec.image.clone());
    // `--entrypoint` only takes the program; its own arguments lead the command.
    args.extend(entrypoint.cloned());
    args.extend(spec.cmd.iter().cloned());
    args
}

/// Every usable reference in `docker image ls` output: each line carries a
/// `repo:tag` and a `repo@digest`, either of which may be `<none>`.
pub fn parse_image_list(out: &str) -> Vec<String> {
    out.split_whitespace()
        .filter(|r| !r.contains("<none>"))
        .map(String::from)
        .collect()
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                warn!(error = %e, "Container output stream closed early");
            }
        }
        buf
    })
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_images(&self) -> Result<Vec<String>, RuntimeError> {
        let out = self
            .run(
                "image ls",
                &[
                    "image",
                    "ls",
                    "--digests",
                    "--format",
                    "{{.Repository}}:{{.Tag}} {{.Repository}}@{{.Digest}}",
                ],
            )
            .await?;
        Ok(parse_image_list(&out))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.run("pull", &["pull", image]).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::Command { stderr, .. }) => Err(RuntimeError::Pull {
                image: image.to_string(),
                reason: stderr,
            }),
            Err(e) => Err(e),
        }
    }

    async fn remove_container_if_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let out = self.output("rm", &["rm", "-f", name]).await?;
        if out.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.to_lowercase().contains("no such container") {
            return Ok(false);
        }
        Err(RuntimeError::Command {
            op: "rm",
            code: out.status.code(),
            stderr: stderr.trim().to_string(),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let args = create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run("create", &args).await?;
        Ok(id.trim().to_string())
    }

    async fn start(&self, id: &str, spec: &ContainerSpec) -> Result<Box<dyn RunningContainer>, RuntimeError> {
        let mut child = Command::new(&self.program)
            .args(["start", "--attach", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        Ok(Box::new(DockerContainer {
            program: self.program.clone(),
            id: id.to_string(),
            child,
            stdout,
            stderr,
            timeout: spec.timeout,
        }))
    }
}

struct DockerContainer {
    program: String,
    id: String,
    child: Child,
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
    timeout: Option<Duration>,
}

#[async_trait::async_trait]
impl RunningContainer for DockerContainer {
    async fn wait(self: Box<Self>) -> ContainerExit {
        let mut this = *self;

        let status = match this.timeout {
            None => this.child.wait().await.map_err(|e| e.to_string()),
            Some(limit) => match tokio::time::timeout(limit, this.child.wait()).await {
                Ok(status) => status.map_err(|e| e.to_string()),
                Err(_) => {
                    warn!(container = %this.id, ?limit, "Container timed out, killing");
                    if let Err(e) = Command::new(&this.program)
                        .args(["kill", this.id.as_str()])
                        .stdin(Stdio::null())
                        .output()
                        .await
                    {
                        warn!(container = %this.id, error = %e, "Failed to kill container");
                    }
                    let _ = this.child.kill().await;
                    Err(format!("Timed out after {}s", limit.as_secs_f64()))
                }
            },
        };

        let stdout = this.stdout.await.unwrap_or_default();
        let stderr = this.stderr.await.unwrap_or_default();

        match status {
            Ok(status) => ContainerExit {
                exit_code: status.code().map(i64::from),
                error: status
                    .code()
                    .is_none()
                    .then(|| "Container was terminated by a signal".to_string()),
                stdout,
                stderr,
            },
            Err(error) => ContainerExit {
                exit_code: None,
                error: Some(error),
                stdout,
                stderr,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args_places_entrypoint_arguments_after_image() {
        let spec = ContainerSpec::shell("patrol_web_home", "alpine:3", "wget -q -O- http://web");
        assert_eq!(
            create_args(&spec),
            vec![
                "create",
                "--rm",
                "--name",
                "patrol_web_home",
                "--entrypoint",
                "/bin/sh",
                "alpine:3",
                "-e",
                "-c",
                "wget -q -O- http://web",
            ]
        );

        let spec = ContainerSpec {
            name: "n".into(),
            image: "img".into(),
            entrypoint: vec!["/bin/bash".into(), "-o".into(), "pipefail".into()],
            cmd: vec!["-ec".into(), "true".into()],
            timeout: None,
        };
        assert_eq!(
            create_args(&spec)[4..],
            ["--entrypoint", "/bin/bash", "img", "-o", "pipefail", "-ec", "true"]
        );
    }

    #[test]
    fn test_parse_image_list_keeps_tags_and_digests() {
        let out = "alpine:3.19 alpine@sha256:aaa\n\
                   curlimages/curl:<none> curlimages/curl@sha256:bbb\n\
                   <none>:<none> <none>@<none>\n";
        assert_eq!(
            parse_image_list(out),
            vec!["alpine:3.19", "alpine@sha256:aaa", "curlimages/curl@sha256:bbb"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let cli = DockerCli::new("/nonexistent/docker-binary");
        assert!(!cli.is_available().await);
        match cli.list_images().await {
            Err(RuntimeError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/docker-binary")
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_command_maps_to_pull_error() {
        // `false` ignores its arguments and exits 1.
        let cli = DockerCli::new("false");
        match cli.pull_image("alpine").await {
            Err(RuntimeError::Pull { image, .. }) => assert_eq!(image, "alpine"),
            other => panic!("expected pull error, got {other:?}"),
        }
        assert!(matches!(
            cli.remove_container_if_exists("x").await,
            Err(RuntimeError::Command { op: "rm", code: Some(1), .. })
        ));
    }

    #[tokio::test]
    async fn test_start_captures_stdout() {
        // `echo` stands in for the client: it prints its arguments and exits 0.
        let cli = DockerCli::new("echo");
        let spec = ContainerSpec::shell("n", "img", "true");
        let running = cli.start("abc123", &spec).await.unwrap();
        let exit = running.wait().await;

        assert!(exit.succeeded());
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&exit.stdout), "start --attach abc123\n");
        assert!(exit.stderr.is_empty());
    }
}
