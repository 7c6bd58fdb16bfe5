//! Invocations of the external `git` binary, all run inside a repository directory through
//! [`tokio::process::Command`].

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};

use crate::{errors::GatewayError, protocol::ServiceType};

/// Handle on the configured git binary.
#[derive(Debug, Clone)]
pub struct GitTool {
    bin: PathBuf,
}

impl GitTool {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    fn command(&self, dir: &Path, args: &[&str], protocol: Option<&str>) -> Command {
        tracing::debug!(dir = %dir.display(), "running {} {}", self.bin.display(), args.join(" "));
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).current_dir(dir).kill_on_drop(true);
        if let Some(protocol) = protocol {
            cmd.env("GIT_PROTOCOL", protocol);
        }
        cmd
    }

    /// Runs git to completion and returns its standard output.
    ///
    /// A non-zero exit is an error carrying the exit status and standard error.
    pub async fn output(
        &self,
        dir: &Path,
        args: &[&str],
        protocol: Option<&str>,
    ) -> Result<Vec<u8>, GatewayError> {
        let output = self
            .command(dir, args, protocol)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GatewayError::tool(format!("failed to run {}: {e}", self.bin.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::tool(format!(
                "git {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// `git <service> --stateless-rpc --advertise-refs .`
    pub async fn advertise_refs(
        &self,
        dir: &Path,
        service: ServiceType,
        protocol: Option<&str>,
    ) -> Result<Vec<u8>, GatewayError> {
        self.output(
            dir,
            &[service.rpc_name(), "--stateless-rpc", "--advertise-refs", "."],
            protocol,
        )
        .await
    }

    /// Reads one repository config value, without its trailing newline. `None` when the key is
    /// not set (git exits with status 1).
    pub async fn config(&self, dir: &Path, key: &str) -> Result<Option<String>, GatewayError> {
        let output = self
            .command(dir, &["config", key], None)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GatewayError::tool(format!("failed to run {}: {e}", self.bin.display())))?;
        match output.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&output.stdout)
                    .trim_end_matches('\n')
                    .to_string(),
            )),
            Some(1) => Ok(None),
            _ => Err(GatewayError::tool(format!(
                "git config {key} failed ({})",
                output.status
            ))),
        }
    }

    /// Regenerates the auxiliary files dumb HTTP clients rely on.
    pub async fn update_server_info(&self, dir: &Path) -> Result<(), GatewayError> {
        self.output(dir, &["update-server-info"], None).await.map(|_| ())
    }

    /// Starts `git <service> --stateless-rpc .` with piped standard input and output.
    pub fn spawn_rpc(
        &self,
        dir: &Path,
        service: ServiceType,
        protocol: Option<&str>,
    ) -> Result<Child, GatewayError> {
        self.command(dir, &[service.rpc_name(), "--stateless-rpc", "."], protocol)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| GatewayError::tool(format!("failed to spawn {}: {e}", self.bin.display())))
    }
}
