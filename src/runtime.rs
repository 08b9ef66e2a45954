//! Container operations backed by the runtime's command-line tool.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{ConsoleError, ConsoleResult};
use crate::models::{ContainerSummary, CreateContainerRequest, CreateContainerResponse};
use crate::service::ContainerService;

const NOT_FOUND_MARKERS: [&str; 2] = ["No such container", "No such object"];

#[derive(Clone, Debug)]
pub struct ContainerRuntime {
    binary: PathBuf,
}

/// One line of `ps --format {{json .}}` output.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "State", default)]
    state: String,
}

impl From<PsLine> for ContainerSummary {
    fn from(line: PsLine) -> Self {
        ContainerSummary {
            id: line.id,
            names: line
                .names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            image: line.image,
            status: line.status,
            state: line.state,
        }
    }
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Resolves `name` through `PATH`.
    pub fn locate(name: &str) -> ConsoleResult<Self> {
        which::which(name)
            .map(Self::new)
            .map_err(|_| ConsoleError::MissingBinary(name.to_string()))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Arguments that open an interactive shell inside `container_id`.
    pub fn exec_args(container_id: &str, shell: &[String]) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-it".to_string(),
            container_id.to_string(),
        ];
        args.extend(shell.iter().cloned());
        args
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    async fn output(&self, args: &[&str]) -> ConsoleResult<Output> {
        debug!("[runtime] {}", self.describe(args));
        match Command::new(&self.binary).args(args).output().await {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                ConsoleError::MissingBinary(self.binary.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the tool and returns stdout, mapping a non-zero exit to an error.
    /// `target` names the container the command acts on, if any.
    async fn run(&self, args: &[&str], target: Option<&str>) -> ConsoleResult<Vec<u8>> {
        let output = self.output(args).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(command_error(self.describe(args), message, target))
    }
}

fn command_error(command: String, message: String, target: Option<&str>) -> ConsoleError {
    match target {
        Some(id) if NOT_FOUND_MARKERS.iter().any(|m| message.contains(m)) => {
            ConsoleError::NotFound(id.to_string())
        }
        _ => ConsoleError::CommandFailed { command, message },
    }
}

fn parse_ps_output(stdout: &[u8]) -> Result<Vec<ContainerSummary>, serde_json::Error> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str::<PsLine>(line).map(ContainerSummary::from))
        .collect()
}

fn output_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ContainerService for ContainerRuntime {
    async fn list(&self) -> ConsoleResult<Vec<ContainerSummary>> {
        let args = ["ps", "-a", "--format", "{{json .}}"];
        let stdout = self.run(&args, None).await?;
        parse_ps_output(&stdout).map_err(|e| ConsoleError::CommandFailed {
            command: self.describe(&args),
            message: format!("unparseable output: {e}"),
        })
    }

    async fn create(&self, request: CreateContainerRequest) -> ConsoleResult<CreateContainerResponse> {
        let image = request.image.trim();
        if image.is_empty() {
            return Err(ConsoleError::InvalidRequest("image must not be empty".into()));
        }

        let mut args = vec!["create"];
        if let Some(name) = request.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            args.extend(["--name", name]);
        }
        args.push(image);

        let stdout = self.run(&args, None).await?;
        let id = String::from_utf8_lossy(&stdout).trim().to_string();
        Ok(CreateContainerResponse { id })
    }

    async fn start(&self, id: String) -> ConsoleResult<()> {
        self.run(&["start", id.as_str()], Some(&id)).await.map(|_| ())
    }

    async fn stop(&self, id: String) -> ConsoleResult<()> {
        self.run(&["stop", id.as_str()], Some(&id)).await.map(|_| ())
    }

    async fn inspect(&self, id: String) -> ConsoleResult<serde_json::Value> {
        let args = ["inspect", id.as_str()];
        let stdout = self.run(&args, Some(&id)).await?;
        let documents: Vec<serde_json::Value> =
            serde_json::from_slice(&stdout).map_err(|e| ConsoleError::CommandFailed {
                command: self.describe(&args),
                message: format!("unparseable output: {e}"),
            })?;
        documents
            .into_iter()
            .next()
            .ok_or(ConsoleError::NotFound(id))
    }

    async fn logs(&self, id: String, tail: Option<usize>) -> ConsoleResult<Vec<String>> {
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        let args = ["logs", "--tail", tail.as_str(), id.as_str()];
        let output = self.output(&args).await?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(command_error(self.describe(&args), message, Some(&id)));
        }

        let mut lines = output_lines(&output.stdout);
        lines.extend(output_lines(&output.stderr));
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_json_lines() {
        let stdout = br#"{"ID":"abc123","Names":"web,alias","Image":"nginx:latest","Status":"Up 2 minutes","State":"running"}

{"ID":"def456","Names":"db","Image":"postgres","Status":"Exited (0) 1 hour ago"}
"#;
        let containers = parse_ps_output(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].id, "abc123");
        assert_eq!(containers[0].names, vec!["web", "alias"]);
        assert_eq!(containers[0].state, "running");
        assert_eq!(containers[1].image, "postgres");
        assert_eq!(containers[1].state, "");
    }

    #[test]
    fn rejects_malformed_ps_output() {
        assert!(parse_ps_output(b"not json\n").is_err());
        assert!(parse_ps_output(b"").unwrap().is_empty());
    }

    #[test]
    fn exec_args_put_shell_after_container() {
        let args = ContainerRuntime::exec_args("abc", &["bash".into(), "-l".into()]);
        assert_eq!(args, vec!["exec", "-it", "abc", "bash", "-l"]);
    }

    #[test]
    fn missing_container_maps_to_not_found() {
        let err = command_error(
            "docker start nope".into(),
            "Error response from daemon: No such container: nope".into(),
            Some("nope"),
        );
        assert!(matches!(err, ConsoleError::NotFound(id) if id == "nope"));

        let err = command_error("docker ps".into(), "daemon down".into(), None);
        assert!(matches!(err, ConsoleError::CommandFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_passes_name_and_image() {
        let runtime = ContainerRuntime::new("echo");
        let response = runtime
            .create(CreateContainerRequest {
                image: "nginx:latest".into(),
                name: Some("web".into()),
            })
            .await
            .unwrap();
        assert_eq!(response.id, "create --name web nginx:latest");

        let response = runtime
            .create(CreateContainerRequest {
                image: "alpine".into(),
                name: None,
            })
            .await
            .unwrap();
        assert_eq!(response.id, "create alpine");
    }

    #[tokio::test]
    async fn create_requires_image() {
        let runtime = ContainerRuntime::new("echo");
        let err = runtime
            .create(CreateContainerRequest {
                image: "  ".into(),
                name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::InvalidRequest(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn logs_return_output_lines() {
        let runtime = ContainerRuntime::new("echo");
        let lines = runtime.logs("abc".into(), Some(5)).await.unwrap();
        assert_eq!(lines, vec!["logs --tail 5 abc"]);

        let lines = runtime.logs("abc".into(), None).await.unwrap();
        assert_eq!(lines, vec!["logs --tail all abc"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_reported() {
        let runtime = ContainerRuntime::new("false");
        let err = runtime.stop("abc".into()).await.unwrap_err();
        assert!(matches!(err, ConsoleError::CommandFailed { .. }));
        runtime.list().await.unwrap_err();
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let runtime = ContainerRuntime::new("/nonexistent/container-runtime");
        let err = runtime.start("abc".into()).await.unwrap_err();
        assert!(matches!(err, ConsoleError::MissingBinary(_)));
        assert!(matches!(
            ContainerRuntime::locate("definitely-not-a-runtime-binary"),
            Err(ConsoleError::MissingBinary(_))
        ));
    }
}
