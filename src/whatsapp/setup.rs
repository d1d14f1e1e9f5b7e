//! Bridge sidecar lifecycle and device linking.
//!
//! `hearth link` uses this to make sure the `hearth-whatsapp` container is
//! running (inspect, start if stopped, create if missing) and then fetches
//! the linking QR code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use super::client::{WhatsAppClient, DEFAULT_BRIDGE_PORT};
use super::WhatsAppError;

/// Container name for the bridge sidecar.
pub const CONTAINER_NAME: &str = "hearth-whatsapp";

/// Path inside the container where the bridge keeps its auth state.
const AUTH_MOUNT: &str = "/data/auth";

/// Memory limit for the sidecar (512 MB).
const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;

/// Ensure the sidecar container is running.
///
/// `auth_dir` is bind-mounted so the linked session survives container
/// re-creation.
///
/// # Errors
///
/// Returns [`WhatsAppError::SetupFailed`] when Docker refuses any step.
pub async fn ensure_container(
    docker: &Docker,
    image: &str,
    auth_dir: &Path,
) -> Result<(), WhatsAppError> {
    match docker.inspect_container(CONTAINER_NAME, None).await {
        Ok(details) => {
            let running = details
                .state
                .as_ref()
                .and_then(|s| s.running)
                .unwrap_or(false);
            if running {
                info!(container = CONTAINER_NAME, "bridge sidecar already running");
                return Ok(());
            }
            docker
                .start_container(CONTAINER_NAME, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| {
                    WhatsAppError::SetupFailed(format!("failed to start container: {e}"))
                })?;
            info!(container = CONTAINER_NAME, "bridge sidecar started");
            return Ok(());
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {}
        Err(e) => {
            return Err(WhatsAppError::SetupFailed(format!(
                "failed to inspect container: {e}"
            )));
        }
    }

    let pull_opts = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };
    let mut pull_stream = docker.create_image(Some(pull_opts), None, None);
    while let Some(result) = pull_stream.next().await {
        if let Err(e) = result {
            warn!(error = %e, "image pull warning");
        }
    }
    info!(image, "bridge sidecar image pulled");

    std::fs::create_dir_all(auth_dir).map_err(|e| {
        WhatsAppError::SetupFailed(format!(
            "failed to create auth directory {}: {e}",
            auth_dir.display()
        ))
    })?;

    let port_key = format!("{DEFAULT_BRIDGE_PORT}/tcp");
    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_owned()),
            host_port: Some(DEFAULT_BRIDGE_PORT.to_string()),
        }]),
    );

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(vec![format!("{}:{AUTH_MOUNT}", auth_dir.display())]),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        memory: Some(MEMORY_LIMIT_BYTES),
        ..Default::default()
    };

    let mut labels = HashMap::new();
    labels.insert("hearth".to_owned(), "bridge".to_owned());

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let container_config = ContainerConfig {
        image: Some(image.to_owned()),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        env: Some(vec![format!("AUTH_DIR={AUTH_MOUNT}")]),
        host_config: Some(host_config),
        ..Default::default()
    };

    let create_opts = CreateContainerOptions {
        name: CONTAINER_NAME.to_owned(),
        platform: None,
    };
    docker
        .create_container(Some(create_opts), container_config)
        .await
        .map_err(|e| WhatsAppError::SetupFailed(format!("failed to create container: {e}")))?;

    docker
        .start_container(CONTAINER_NAME, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| WhatsAppError::SetupFailed(format!("failed to start container: {e}")))?;

    info!(container = CONTAINER_NAME, image, "bridge sidecar created and started");
    Ok(())
}

/// Outcome of a link attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The device was already linked to this phone number.
    AlreadyLinked(Option<String>),
    /// A QR code was written here; scan it from WhatsApp > Linked devices.
    QrWritten(PathBuf),
}

/// Run the linking flow: ensure the sidecar, wait for it, and write the QR
/// code PNG to `qr_path` unless the device is already linked.
///
/// # Errors
///
/// Returns an error when the container cannot be started, the bridge never
/// answers, or the QR payload cannot be decoded or written.
pub async fn link_device(
    docker: &Docker,
    client: &WhatsAppClient,
    image: &str,
    auth_dir: &Path,
    qr_path: &Path,
) -> Result<LinkOutcome, WhatsAppError> {
    ensure_container(docker, image, auth_dir).await?;
    client.wait_reachable().await?;

    let status = client.status().await?;
    if status.connected {
        return Ok(LinkOutcome::AlreadyLinked(status.phone_number));
    }

    let qr = client.get_qr().await?;
    write_qr_png(&qr, qr_path)?;
    Ok(LinkOutcome::QrWritten(qr_path.to_path_buf()))
}

/// Decode a base64 PNG (optionally a `data:image/png;base64,` URL) to `path`.
///
/// # Errors
///
/// Returns [`WhatsAppError::SetupFailed`] on bad base64 or I/O failure.
pub fn write_qr_png(encoded: &str, path: &Path) -> Result<(), WhatsAppError> {
    let payload = encoded
        .split_once("base64,")
        .map_or(encoded, |(_, data)| data)
        .trim();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| WhatsAppError::SetupFailed(format!("QR code is not valid base64: {e}")))?;
    std::fs::write(path, bytes).map_err(|e| {
        WhatsAppError::SetupFailed(format!("failed to write {}: {e}", path.display()))
    })
}
