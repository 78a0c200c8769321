//! Container-CLI implementation of [`RuntimeClient`].
//!
//! Every operation shells out to the configured CLI binary (`docker` by
//! default, anything CLI-compatible such as `podman` works) via
//! [`tokio::process::Command`]:
//!
//! | Operation | Invocation                                          |
//! |-----------|-----------------------------------------------------|
//! | create    | `create -i --name … [--network …] IMAGE CMD…`       |
//! | attach    | `start -a -i ID` (stdio becomes the duplex stream)  |
//! | exec      | `exec -i [-e KEY]… ID CMD…`                         |
//! | list      | `ps --no-trunc --format {{json .}}`                 |
//! | kill      | `kill --signal SIG ID`                              |
//! | inspect   | `inspect ID`                                        |
//!
//! Environment values are never placed on the command line: the CLI receives
//! `-e KEY` and reads the value from its own environment, which the spawner
//! sets explicitly.
//!
//! Attached CLI processes use `kill_on_drop(true)`; dropping the
//! [`DuplexStream`] keepalive detaches from the instance.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::runtime::{
    DuplexStream, InstanceDescriptor, InstanceHandle, InstanceMetadata, InstanceSpec,
    RuntimeClient, RuntimeFuture, RuntimeSignal,
};
use crate::{AppError, Result};

/// Stderr fragments that mean the runtime or image is missing.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "No such image",
    "Unable to find image",
    "pull access denied",
    "manifest unknown",
];

/// Container runtime driven through its command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Client invoking `binary` (e.g. `docker`, `podman`).
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a short-lived CLI invocation and return its trimmed stdout.
    async fn run_capture(&self, args: &[String], env: &[(String, String)]) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|err| self.spawn_error(&err))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let verb = args.first().map_or("command", String::as_str);
        Err(classify_failure(verb, &stderr))
    }

    /// Spawn a long-lived attached CLI process and wrap its stdio.
    fn spawn_attached(&self, args: &[String], env: &[(String, String)]) -> Result<DuplexStream> {
        let mut cmd = self.command();
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| self.spawn_error(&err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Runtime("failed to capture attached stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Runtime("failed to capture attached stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = line.as_str(), "runtime stderr");
                }
            });
        }

        Ok(DuplexStream {
            output: Box::new(stdout),
            input: Box::new(stdin),
            keepalive: Some(Box::new(AttachedProcess(child))),
        })
    }

    fn spawn_error(&self, err: &std::io::Error) -> AppError {
        if err.kind() == ErrorKind::NotFound {
            AppError::RuntimeUnavailable(format!("runtime binary `{}` not found", self.binary))
        } else {
            AppError::RuntimeUnavailable(format!("failed to run `{}`: {err}", self.binary))
        }
    }
}

/// Owns the attached CLI process; `kill_on_drop` ends it with the stream.
struct AttachedProcess(#[allow(dead_code)] Child);

impl RuntimeClient for DockerCli {
    fn create(&self, spec: &InstanceSpec) -> RuntimeFuture<'_, InstanceHandle> {
        let spec = spec.clone();
        Box::pin(async move {
            let args = create_args(&spec);
            let id = self.run_capture(&args, &spec.env).await?;
            if id.is_empty() {
                return Err(AppError::Runtime("create returned no instance id".into()));
            }
            info!(instance = %spec.name, image = %spec.image, "instance created");
            Ok(InstanceHandle {
                id,
                name: Some(spec.name),
            })
        })
    }

    fn attach(&self, handle: &InstanceHandle) -> RuntimeFuture<'_, DuplexStream> {
        let handle = handle.clone();
        Box::pin(async move {
            let args = vec![
                "start".to_owned(),
                "-a".to_owned(),
                "-i".to_owned(),
                handle.id.clone(),
            ];
            let stream = self.spawn_attached(&args, &[])?;
            debug!(instance = %handle, "attached to instance");
            Ok(stream)
        })
    }

    fn exec(
        &self,
        handle: &InstanceHandle,
        cmd: &[String],
        env: &[(String, String)],
    ) -> RuntimeFuture<'_, DuplexStream> {
        let handle = handle.clone();
        let cmd = cmd.to_vec();
        let env = env.to_vec();
        Box::pin(async move {
            let mut args = vec!["exec".to_owned(), "-i".to_owned()];
            for (key, _) in &env {
                args.push("-e".to_owned());
                args.push(key.clone());
            }
            args.push(handle.id.clone());
            args.extend(cmd);
            let stream = self.spawn_attached(&args, &env)?;
            debug!(instance = %handle, "exec'd into instance");
            Ok(stream)
        })
    }

    fn list(&self) -> RuntimeFuture<'_, Vec<InstanceDescriptor>> {
        Box::pin(async move {
            let args = ["ps", "--no-trunc", "--format", "{{json .}}"].map(str::to_owned);
            let raw = self.run_capture(&args, &[]).await?;
            raw.lines()
                .filter(|line| !line.trim().is_empty())
                .map(parse_ps_line)
                .collect()
        })
    }

    fn kill(&self, handle: &InstanceHandle, signal: RuntimeSignal) -> RuntimeFuture<'_, ()> {
        let handle = handle.clone();
        Box::pin(async move {
            let args = vec![
                "kill".to_owned(),
                "--signal".to_owned(),
                signal.as_str().to_owned(),
                handle.id.clone(),
            ];
            self.run_capture(&args, &[]).await?;
            info!(instance = %handle, signal = signal.as_str(), "signal sent to instance");
            Ok(())
        })
    }

    fn inspect(&self, handle: &InstanceHandle) -> RuntimeFuture<'_, InstanceMetadata> {
        let handle = handle.clone();
        Box::pin(async move {
            let args = vec!["inspect".to_owned(), handle.id.clone()];
            let raw = self.run_capture(&args, &[]).await?;
            parse_inspect(&raw)
        })
    }
}

/// Build the `create` argument vector for `spec`.
#[must_use]
pub fn create_args(spec: &InstanceSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_owned(),
        "-i".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
    ];
    if spec.auto_remove {
        args.push("--rm".to_owned());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_owned());
        args.push(network.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_owned());
        args.push(format!("{key}={value}"));
    }
    for (key, _) in &spec.env {
        args.push("-e".to_owned());
        args.push(key.clone());
    }
    if let Some(workdir) = &spec.workdir {
        args.push("-w".to_owned());
        args.push(workdir.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// One line of `ps --format {{json .}}` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    #[serde(default)]
    labels: String,
    #[serde(default)]
    state: Option<String>,
}

/// Parse one JSON line of `ps` output.
///
/// # Errors
///
/// Returns [`AppError::Runtime`] when the line is not the expected JSON shape.
pub fn parse_ps_line(line: &str) -> Result<InstanceDescriptor> {
    let raw: PsLine = serde_json::from_str(line)
        .map_err(|err| AppError::Runtime(format!("unexpected ps output: {err}")))?;
    let labels = raw
        .labels
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    Ok(InstanceDescriptor {
        id: raw.id,
        name: raw.names.split(',').next().unwrap_or_default().to_owned(),
        running: raw.state.as_deref().map_or(true, |state| state == "running"),
        labels,
    })
}

/// Parse `inspect` output (a JSON array with one object).
///
/// # Errors
///
/// Returns [`AppError::Runtime`] when the output is not an array holding an
/// object with an `Id`.
pub fn parse_inspect(raw: &str) -> Result<InstanceMetadata> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| AppError::Runtime(format!("unexpected inspect output: {err}")))?;
    let entry = value
        .as_array()
        .and_then(|items| items.first())
        .unwrap_or(&value);

    let id = entry
        .get("Id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Runtime("inspect output has no Id".into()))?
        .to_owned();
    let name = entry
        .get("Name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_owned();
    let labels: BTreeMap<String, String> = entry
        .pointer("/Config/Labels")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                .collect()
        })
        .unwrap_or_default();
    let mut networks: Vec<String> = entry
        .pointer("/NetworkSettings/Networks")
        .and_then(Value::as_object)
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    networks.sort();

    Ok(InstanceMetadata {
        id,
        name,
        networks,
        labels,
    })
}

fn classify_failure(verb: &str, stderr: &str) -> AppError {
    if UNAVAILABLE_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        AppError::RuntimeUnavailable(format!("{verb} failed: {stderr}"))
    } else {
        AppError::Runtime(format!("{verb} failed: {stderr}"))
    }
}
