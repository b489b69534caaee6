//! Cloud SQL Auth Proxy supervision.
//!
//! The proxy authenticates against the managed instance and exposes a plain
//! MySQL listener on loopback. It runs as a child process for the lifetime of
//! the engine.

use crate::config::RemoteConfig;
use backoff::ExponentialBackoff;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to spawn proxy `{bin}`: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Proxy exited before accepting connections: {0}")]
    Exited(String),
    #[error("Proxy did not accept connections on {addr} within {timeout:?}")]
    NotReady { addr: SocketAddr, timeout: Duration },
}

/// A running proxy child process.
#[derive(Debug)]
pub struct CloudSqlProxy {
    addr: SocketAddr,
    child: Mutex<Option<Child>>,
}

impl CloudSqlProxy {
    /// Build the proxy command line for the given remote configuration.
    pub fn command_args(remote: &RemoteConfig) -> Vec<String> {
        let mut args = vec![
            "--address".to_string(),
            Ipv4Addr::LOCALHOST.to_string(),
            "--port".to_string(),
            remote.proxy_port.to_string(),
        ];
        if remote.private_ip {
            args.push("--private-ip".to_string());
        }
        args.push(remote.instance_connection_name.clone());
        args
    }

    /// Spawn the proxy and wait until its listener accepts TCP connections.
    pub async fn start(remote: &RemoteConfig) -> Result<Self, ProxyError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, remote.proxy_port));
        info!(
            instance = %remote.instance_connection_name,
            %addr,
            private_ip = remote.private_ip,
            "Starting Cloud SQL Auth Proxy"
        );

        let child = Command::new(&remote.proxy_bin)
            .args(Self::command_args(remote))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProxyError::Spawn {
                bin: remote.proxy_bin.clone(),
                source,
            })?;

        let proxy = CloudSqlProxy {
            addr,
            child: Mutex::new(Some(child)),
        };

        if let Err(e) = proxy.wait_ready(remote.proxy_startup_timeout).await {
            proxy.shutdown().await;
            return Err(e);
        }

        info!(%addr, "Cloud SQL Auth Proxy is accepting connections");
        Ok(proxy)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), ProxyError> {
        let policy = ExponentialBackoff {
            current_interval: Duration::from_millis(100),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(timeout),
            ..Default::default()
        };

        let addr = self.addr;
        backoff::future::retry(policy, move || async move {
            if let Some(status) = self.exit_status().await {
                return Err(backoff::Error::permanent(ProxyError::Exited(status)));
            }
            TcpStream::connect(addr).await.map(drop).map_err(|e| {
                debug!(%addr, error = %e, "Proxy not ready yet");
                backoff::Error::transient(ProxyError::NotReady { addr, timeout })
            })
        })
        .await
    }

    async fn exit_status(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    /// Stop the proxy. Only the first call does any work.
    pub async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match child.kill().await {
            Ok(()) => info!(addr = %self.addr, "Cloud SQL Auth Proxy stopped"),
            Err(e) => warn!(addr = %self.addr, error = %e, "Failed to stop Cloud SQL Auth Proxy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(bin: &str, port: u16) -> RemoteConfig {
        RemoteConfig {
            instance_connection_name: "proj:region:inst".to_string(),
            db_user: "u".to_string(),
            db_pass: "p".to_string(),
            db_name: "d".to_string(),
            private_ip: false,
            proxy_bin: bin.to_string(),
            proxy_port: port,
            proxy_startup_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_command_args_public_ip() {
        let args = CloudSqlProxy::command_args(&remote("cloud-sql-proxy", 3307));
        assert_eq!(
            args,
            vec!["--address", "127.0.0.1", "--port", "3307", "proj:region:inst"]
        );
    }

    #[test]
    fn test_command_args_private_ip() {
        let mut cfg = remote("cloud-sql-proxy", 3307);
        cfg.private_ip = true;
        let args = CloudSqlProxy::command_args(&cfg);
        assert!(args.contains(&"--private-ip".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("proj:region:inst"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_fast() {
        let err = CloudSqlProxy::start(&remote("/nonexistent/cloud-sql-proxy", 3307))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_proxy_that_exits_is_reported() {
        // `false` ignores its arguments and exits immediately with status 1.
        let err = CloudSqlProxy::start(&remote("false", 1)).await.unwrap_err();
        assert!(
            matches!(err, ProxyError::Exited(_) | ProxyError::NotReady { .. }),
            "unexpected error: {}",
            err
        );
    }
}
