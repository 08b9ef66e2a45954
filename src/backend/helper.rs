//! Helper-process backend for hosts without a native pseudo-terminal.
//!
//! A terminal helper executable and its support library are fetched once
//! into a local directory. On Windows the library is loaded at runtime and
//! drives the helper agent, which hosts `<runtime> exec -it <id> <shell>` on a
//! console of the requested size. Elsewhere the helper is a command wrapper
//! started as `<helper> <runtime> exec -it <id> <shell>` on a pseudo-terminal,
//! so the exec session always sees a real terminal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use super::{BackendHandle, BackendKind, SessionBackend, ShellRequest};
use crate::errors::{ConsoleError, ConsoleResult};
use crate::runtime::ContainerRuntime;

pub const DEFAULT_HELPER_DIR: &str = "winpty";
pub const DEFAULT_EXECUTABLE_URL: &str =
    "https://github.com/rprichard/winpty/releases/download/latest/winpty-agent.exe";
pub const DEFAULT_LIBRARY_URL: &str =
    "https://github.com/rprichard/winpty/releases/download/latest/winpty.dll";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub file_name: String,
}

impl Artifact {
    /// Names the local file after the last path segment of `url`, ignoring
    /// any query string or fragment.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let file_name = path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("artifact")
            .to_string();
        Self { url, file_name }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }
}

#[derive(Clone, Debug)]
pub struct HelperArtifacts {
    pub dir: PathBuf,
    pub executable: Artifact,
    pub library: Artifact,
}

impl Default for HelperArtifacts {
    fn default() -> Self {
        Self::new(
            DEFAULT_HELPER_DIR,
            Artifact::new(DEFAULT_EXECUTABLE_URL),
            Artifact::new(DEFAULT_LIBRARY_URL),
        )
    }
}

impl HelperArtifacts {
    pub fn new(dir: impl Into<PathBuf>, executable: Artifact, library: Artifact) -> Self {
        Self {
            dir: dir.into(),
            executable,
            library,
        }
    }

    pub fn executable_path(&self) -> PathBuf {
        self.dir.join(&self.executable.file_name)
    }

    pub fn library_path(&self) -> PathBuf {
        self.dir.join(&self.library.file_name)
    }

    /// Makes sure both artifacts are present, downloading the missing ones
    /// with a single attempt each. Returns the absolute helper directory.
    pub async fn ensure(&self) -> ConsoleResult<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ConsoleError::unavailable("failed to create helper directory", e))?;
        let dir = fs::canonicalize(&self.dir)
            .await
            .map_err(|e| ConsoleError::unavailable("failed to resolve helper directory", e))?;

        let client = reqwest::Client::new();
        fetch_if_missing(&client, &self.executable, &dir, true).await?;
        fetch_if_missing(&client, &self.library, &dir, false).await?;
        Ok(dir)
    }
}

async fn fetch_if_missing(
    client: &reqwest::Client,
    artifact: &Artifact,
    dir: &Path,
    executable: bool,
) -> ConsoleResult<()> {
    let target = dir.join(&artifact.file_name);
    if fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(());
    }

    info!("[helper] downloading {} from {}", artifact.file_name, artifact.url);
    let body = client
        .get(&artifact.url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| ConsoleError::unavailable(&format!("failed to fetch {}", artifact.url), e))?
        .bytes()
        .await
        .map_err(|e| ConsoleError::unavailable(&format!("failed to read {}", artifact.url), e))?;

    let partial = dir.join(format!("{}.partial", artifact.file_name));
    let placed = async {
        fs::write(&partial, &body).await?;
        #[cfg(unix)]
        if executable {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755)).await?;
        }
        #[cfg(not(unix))]
        let _ = executable;
        fs::rename(&partial, &target).await
    }
    .await;

    if let Err(e) = placed {
        let _ = fs::remove_file(&partial).await;
        return Err(ConsoleError::unavailable(
            &format!("failed to place {}", target.display()),
            e,
        ));
    }

    info!(
        "[helper] downloaded {} ({} bytes)",
        target.display(),
        body.len()
    );
    Ok(())
}

pub struct HelperBackend {
    runtime: PathBuf,
    artifacts: HelperArtifacts,
    fetch_lock: Mutex<()>,
}

impl HelperBackend {
    pub fn new(runtime: impl Into<PathBuf>, artifacts: HelperArtifacts) -> Self {
        Self {
            runtime: runtime.into(),
            artifacts,
            fetch_lock: Mutex::new(()),
        }
    }

    pub async fn prepare(&self) -> ConsoleResult<PathBuf> {
        let _guard = self.fetch_lock.lock().await;
        self.artifacts.ensure().await
    }
}

#[async_trait]
impl SessionBackend for HelperBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Helper
    }

    async fn open(&self, request: &ShellRequest) -> ConsoleResult<BackendHandle> {
        let dir = self.prepare().await?;
        let artifacts = self.artifacts.clone();
        let runtime = self.runtime.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || launch(&dir, &artifacts, &runtime, &request))
            .await
            .map_err(|e| ConsoleError::unavailable("helper spawn task failed", e))?
    }
}

#[cfg(windows)]
fn launch(
    dir: &Path,
    artifacts: &HelperArtifacts,
    runtime: &Path,
    request: &ShellRequest,
) -> ConsoleResult<BackendHandle> {
    let args = ContainerRuntime::exec_args(&request.container_id, &request.command);
    super::winpty::spawn(&dir.join(&artifacts.library.file_name), runtime, &args, request)
}

#[cfg(not(windows))]
fn launch(
    dir: &Path,
    artifacts: &HelperArtifacts,
    runtime: &Path,
    request: &ShellRequest,
) -> ConsoleResult<BackendHandle> {
    let mut cmd = portable_pty::CommandBuilder::new(dir.join(&artifacts.executable.file_name));
    cmd.arg(runtime);
    cmd.args(ContainerRuntime::exec_args(
        &request.container_id,
        &request.command,
    ));
    cmd.cwd(dir);
    if let Some(path) = path_with(dir) {
        cmd.env("PATH", path);
    }
    super::native::spawn_on_pty(BackendKind::Helper, request, cmd)
}

#[cfg(not(windows))]
fn path_with(dir: &Path) -> Option<std::ffi::OsString> {
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let paths = std::iter::once(dir.to_path_buf()).chain(std::env::split_paths(&existing));
    std::env::join_paths(paths).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    const UNREACHABLE: &str = "http://127.0.0.1:9/unreachable";

    #[test]
    fn artifact_file_name_comes_from_url() {
        let artifact = Artifact::new(DEFAULT_LIBRARY_URL);
        assert_eq!(artifact.file_name, "winpty.dll");
        assert_eq!(Artifact::new("http://host/").file_name, "artifact");
        assert_eq!(
            Artifact::new("https://mirror.example/pty/winpty.dll?raw=1&v=/x").file_name,
            "winpty.dll"
        );
        assert_eq!(
            Artifact::new("https://mirror.example/pty/winpty-agent.exe#sha256=ab/cd").file_name,
            "winpty-agent.exe"
        );
        assert_eq!(Artifact::new("https://mirror.example/?file=a").file_name, "artifact");
    }

    #[tokio::test]
    async fn present_artifacts_are_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helper"), b"bin").unwrap();
        std::fs::write(dir.path().join("support"), b"lib").unwrap();

        let artifacts = HelperArtifacts::new(
            dir.path(),
            Artifact::new(UNREACHABLE).with_file_name("helper"),
            Artifact::new(UNREACHABLE).with_file_name("support"),
        );
        let resolved = artifacts.ensure().await.unwrap();
        assert_eq!(resolved, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn unreachable_artifact_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = HelperArtifacts::new(
            dir.path().join("helper-dir"),
            Artifact::new(UNREACHABLE).with_file_name("helper"),
            Artifact::new(UNREACHABLE).with_file_name("support"),
        );

        let err = artifacts.ensure().await.unwrap_err();
        assert!(matches!(err, ConsoleError::BackendUnavailable(_)));
        assert!(!artifacts.executable_path().exists());
        assert!(!dir.path().join("helper-dir/helper.partial").exists());
    }

    #[tokio::test]
    async fn downloads_missing_artifacts_once() {
        let app = Router::new()
            .route("/helper", get(|| async { "helper-binary" }))
            .route("/support", get(|| async { "support-library" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let artifacts = HelperArtifacts::new(
            dir.path(),
            Artifact::new(format!("http://{addr}/helper")),
            Artifact::new(format!("http://{addr}/support")),
        );
        artifacts.ensure().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(artifacts.executable_path()).unwrap(),
            "helper-binary"
        );
        assert_eq!(
            std::fs::read_to_string(artifacts.library_path()).unwrap(),
            "support-library"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(artifacts.executable_path())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }

        server.abort();
        let _ = server.await;
        artifacts.ensure().await.unwrap();
    }

    #[cfg(unix)]
    fn helper_dir(helper: &str, runtime: &str) -> (tempfile::TempDir, HelperBackend) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [("helper", helper), ("fake-runtime", runtime)] {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(dir.path().join("support"), b"lib").unwrap();

        let backend = HelperBackend::new(
            dir.path().join("fake-runtime"),
            HelperArtifacts::new(
                dir.path(),
                Artifact::new(UNREACHABLE).with_file_name("helper"),
                Artifact::new(UNREACHABLE).with_file_name("support"),
            ),
        );
        (dir, backend)
    }

    #[cfg(unix)]
    async fn read_until_closed(handle: &mut BackendHandle) -> String {
        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while let Ok(chunk) = handle.read().await {
                seen.extend_from_slice(&chunk);
            }
        })
        .await
        .expect("helper output did not close");
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_session_relays_input_and_terminates() {
        let (_dir, backend) = helper_dir("exec cat", "exit 0");
        assert_eq!(backend.kind(), BackendKind::Helper);

        let mut handle = backend
            .open(&ShellRequest::new("abc123", vec!["sh".into()]))
            .await
            .unwrap();
        handle.write(Bytes::from_static(b"ping\n")).await.unwrap();

        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while !String::from_utf8_lossy(&seen).contains("ping") {
                seen.extend_from_slice(&handle.read().await.unwrap());
            }
        })
        .await
        .expect("helper did not echo input");

        handle.close().await;
        handle.close().await;
        read_until_closed(&mut handle).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_session_runs_on_a_sized_terminal() {
        let (_dir, backend) = helper_dir(
            r#"exec "$@""#,
            r#"if [ -t 0 ] && [ -t 1 ]; then echo "terminal: yes"; else echo "terminal: no"; fi
echo "args: $*"
stty size"#,
        );

        let request = ShellRequest::new("abc123", vec!["sh".into()]).with_size(Some(100), Some(30));
        let mut handle = backend.open(&request).await.unwrap();
        let output = read_until_closed(&mut handle).await;
        handle.close().await;

        assert!(output.contains("terminal: yes"), "output: {output:?}");
        assert!(output.contains("args: exec -it abc123 sh"), "output: {output:?}");
        assert!(output.contains("30 100"), "output: {output:?}");
    }
}
