//! Container runtime boundary: everything the executor needs to run one check
//! as an isolated, auto-removed container.

pub mod docker;

use std::time::Duration;

use thiserror::Error;

pub use self::docker::DockerCli;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{op}` exited with code {code:?}: {stderr}")]
    Command {
        op: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to pull image '{image}': {reason}")]
    Pull { image: String, reason: String },
}

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// Kill the container if it is still running after this long.
    pub timeout: Option<Duration>,
}

impl ContainerSpec {
    /// Run `command` under `/bin/sh -e -c`, so the first failing
    /// sub-command fails the whole check.
    pub fn shell(name: impl Into<String>, image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            entrypoint: vec!["/bin/sh".to_string()],
            cmd: vec!["-e".to_string(), "-c".to_string(), command.into()],
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of waiting on a started container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerExit {
    /// `None` when the process did not exit normally.
    pub exit_code: Option<i64>,
    /// Set when waiting itself failed (runtime error, timeout, signal).
    pub error: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ContainerExit {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    /// Human-readable failure reason, if any.
    pub fn failure(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match self.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("Process exited with status {code}")),
            None => Some("Process did not report an exit code".to_string()),
        }
    }
}

/// A container that has been started with stdout and stderr attached.
#[async_trait::async_trait]
pub trait RunningContainer: Send {
    async fn wait(self: Box<Self>) -> ContainerExit;
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Tags (`repo:tag`) of every image available locally.
    async fn list_images(&self) -> Result<Vec<String>, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container by name; `Ok(false)` if there was none.
    async fn remove_container_if_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Create an auto-removing container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Attach to stdout/stderr and start the container.
    async fn start(&self, id: &str, spec: &ContainerSpec) -> Result<Box<dyn RunningContainer>, RuntimeError>;
}

/// Deterministic container name for a check: one live container per check.
pub fn container_name(service: &str, check: &str) -> String {
    let raw = format!("patrol-{service}-{check}").to_lowercase();
    let mut name = String::with_capacity(raw.len());
    let mut in_gap = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            in_gap = false;
        } else if !in_gap {
            name.push('_');
            in_gap = true;
        }
    }
    name
}

/// Canonical form of an image reference, comparable with what the runtime
/// lists: Docker Hub prefixes are dropped, untagged names get `:latest`, and
/// a digest-pinned reference becomes `repo@digest` with any tag removed.
pub fn image_ref(image: &str) -> String {
    let image = image.trim();
    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };
    let name = name
        .strip_prefix("docker.io/")
        .or_else(|| name.strip_prefix("index.docker.io/"))
        .unwrap_or(name);
    let name = name.strip_prefix("library/").unwrap_or(name);

    let (repo, tag) = match name.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (name, None),
    };
    match (digest, tag) {
        (Some(digest), _) => format!("{repo}@{digest}"),
        (None, Some(tag)) => format!("{repo}:{tag}"),
        (None, None) => format!("{repo}:latest"),
    }
}
