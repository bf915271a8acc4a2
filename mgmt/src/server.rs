// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The control-socket server: peer-credential gating and method dispatch.

use crate::rpc::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::supervisor::Supervisor;
use crate::MgmtError;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Serve RPC until the root shutdown flips. The socket is 0600 root-owned;
/// SO_PEERCRED must agree before a single frame is parsed.
pub async fn serve(supervisor: Arc<Supervisor>) -> Result<(), MgmtError> {
    let path = supervisor.options.socket_path.clone();
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    info!(socket = %path.display(), "control socket listening");

    let mut shutdown = supervisor.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                if !peer_allowed(&stream) {
                    warn!("control connection rejected: peer not permitted");
                    continue;
                }
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(supervisor, stream).await {
                        debug!(%error, "control connection closed");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = std::fs::remove_file(&path);
                    return Ok(());
                }
            }
        }
    }
}

/// Root, or whoever owns this process (development runs unprivileged).
fn peer_allowed(stream: &UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => {
            let uid = cred.uid();
            uid == 0 || uid == nix::unistd::geteuid().as_raw()
        }
        Err(_) => false,
    }
}

async fn serve_connection(
    supervisor: Arc<Supervisor>,
    mut stream: UnixStream,
) -> Result<(), MgmtError> {
    loop {
        let request: RpcRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(_) => return Ok(()), // peer went away
        };

        // Subscribe flips the connection into an event stream and never
        // returns to request/response mode.
        if request.method == "Subscribe" {
            return serve_subscription(supervisor, stream, &request.params).await;
        }

        let id = request.id;
        let response = match dispatch(&supervisor, request).await {
            Ok(result) => RpcResponse::ok(id, result),
            Err(error) => {
                RpcResponse::fail(id, error.kind(), &error.to_string(), error.path())
            }
        };
        if write_frame(&mut stream, &response).await.is_err() {
            return Ok(());
        }
    }
}

async fn serve_subscription(
    supervisor: Arc<Supervisor>,
    mut stream: UnixStream,
    params: &Value,
) -> Result<(), MgmtError> {
    let topics: Vec<String> = params["topics"]
        .as_array()
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let wants = |topic: &str| {
        topics.is_empty()
            || topics.iter().any(|t| {
                t == topic || (t.ends_with(":*") && topic.starts_with(&t[..t.len() - 1]))
            })
    };

    let mut events = supervisor.subscribe();
    let mut shutdown = supervisor.shutdown_signal();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { return Ok(()) };
                if !wants(event.topic()) {
                    continue;
                }
                let mut frame = serde_json::to_value(&event).unwrap_or(Value::Null);
                if let Some(object) = frame.as_object_mut() {
                    object.insert("topic".to_string(), json!(event.topic()));
                }
                if write_frame(&mut stream, &frame).await.is_err() {
                    return Ok(());
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch(supervisor: &Arc<Supervisor>, request: RpcRequest) -> Result<Value, MgmtError> {
    let params = request.params;
    match request.method.as_str() {
        "StageConfig" => {
            let model: config::Model = serde_json::from_value(params["model"].clone())
                .map_err(|e| bad_params(&e.to_string()))?;
            let id = supervisor.stage_model(model, "rpc")?;
            Ok(json!({ "revision": id }))
        }
        "DiffConfig" => Ok(supervisor.diff()),
        "ApplyConfig" => supervisor.apply_staged().await,
        "DiscardStaged" => Ok(json!({ "discarded": supervisor.discard_staged()? })),
        "GetConfig" => {
            let db = supervisor.db.lock();
            Ok(db
                .applied()
                .map(|r| serde_json::to_value(&r.model).unwrap_or(Value::Null))
                .unwrap_or(Value::Null))
        }
        "AddBlockedIP" => {
            let ip: std::net::IpAddr = parse_field(&params, "ip")?;
            let reason = params["reason"].as_str().unwrap_or("unspecified");
            supervisor.add_blocked_ip(ip, reason).await?;
            Ok(json!({ "blocked": ip }))
        }
        "GetLeases" => Ok(serde_json::to_value(supervisor.leases()?).unwrap_or(Value::Null)),
        "GetFlows" => Ok(serde_json::to_value(supervisor.flows()).unwrap_or(Value::Null)),
        "GetStatus" => Ok(supervisor.status()),
        "VpnStatus" => Ok(supervisor.vpn_status().await),
        "GetUplinks" => Ok(supervisor.uplink_status()),
        "ToggleUplink" => {
            let group = params["group"].as_str().unwrap_or_default();
            let interface = params["interface"].as_str().unwrap_or_default();
            let enabled = params["enabled"].as_bool().unwrap_or(true);
            Ok(json!({ "toggled": supervisor.toggle_uplink(group, interface, enabled) }))
        }
        "TestUplinks" => Ok(supervisor.test_uplinks().await),
        "DnsLookup" => {
            let name = params["name"].as_str().unwrap_or_default();
            Ok(supervisor.dns_lookup(name).await)
        }
        "DnsStats" => Ok(supervisor.dns_stats()),
        "StartScan" => {
            let cidr: ipnet::IpNet = parse_field(&params, "cidr")?;
            Ok(json!({ "targets": supervisor.start_scan(cidr) }))
        }
        "GetDevices" => Ok(serde_json::to_value(supervisor.devices()?).unwrap_or(Value::Null)),
        "SetDeviceIdentity" => {
            let mac = params["mac"].as_str().unwrap_or_default();
            let identity = params["identity"].as_str().unwrap_or_default();
            supervisor.set_device_identity(mac, identity)?;
            Ok(json!({ "mac": mac }))
        }
        "LinkDevice" => {
            let mac = params["mac"].as_str().unwrap_or_default();
            let peer = params["peer"].as_str().unwrap_or_default();
            supervisor.link_device(mac, peer)?;
            Ok(json!({ "mac": mac, "peer": peer }))
        }
        "VerifyUser" => {
            let user = params["user"].as_str().unwrap_or_default();
            let password = params["password"].as_str().unwrap_or_default();
            Ok(json!({ "ok": supervisor.verify_user(user, password)? }))
        }
        "ResetPassword" => {
            let user = params["user"].as_str().unwrap_or_default();
            let password = params["password"].as_str().unwrap_or_default();
            supervisor.reset_password(user, password)?;
            Ok(json!({ "user": user }))
        }
        "StageBinary" => {
            let bytes = params["bytes"].as_str().unwrap_or_default();
            let sha256 = params["sha256"].as_str().unwrap_or_default();
            let path = supervisor.stage_binary(bytes, sha256)?;
            Ok(json!({ "path": path }))
        }
        "Upgrade" => {
            let sha256 = params["sha256"].as_str().unwrap_or_default();
            let path = supervisor.upgrade(sha256)?;
            Ok(json!({ "path": path }))
        }
        "SystemReboot" => {
            let force = params["force"].as_bool().unwrap_or(false);
            supervisor.reboot(force)?;
            Ok(json!({ "rebooting": true }))
        }
        other => Err(bad_params(&format!("unknown method {other}"))),
    }
}

fn parse_field<T: std::str::FromStr>(params: &Value, field: &str) -> Result<T, MgmtError> {
    params[field]
        .as_str()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| bad_params(&format!("missing or malformed {field}")))
}

fn bad_params(reason: &str) -> MgmtError {
    MgmtError::Validation(config::ValidationErrors(vec![
        config::ValidationError::new("params", reason),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use crate::supervisor::SupervisorOptions;

    async fn served_supervisor() -> (tempfile::TempDir, Arc<Supervisor>, RpcClient) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            Supervisor::new(SupervisorOptions::headless(dir.path().to_path_buf())).unwrap();
        tokio::spawn(serve(Arc::clone(&supervisor)));
        // Wait for the socket to appear.
        let socket = supervisor.options.socket_path.clone();
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let client = RpcClient::connect(&socket).await.unwrap();
        (dir, supervisor, client)
    }

    #[tokio::test]
    async fn stage_apply_and_query_over_the_socket() {
        let (_dir, _supervisor, mut client) = served_supervisor().await;
        let model = config::from_yaml_str(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
",
        )
        .unwrap();
        let staged = client
            .call("StageConfig", json!({ "model": model }))
            .await
            .unwrap();
        assert_eq!(staged["revision"], 1);

        let diff = client.call("DiffConfig", Value::Null).await.unwrap();
        assert_eq!(diff["staged"], true);

        let applied = client.call("ApplyConfig", Value::Null).await.unwrap();
        assert_eq!(applied["revision"], 1);

        let status = client.call("GetStatus", Value::Null).await.unwrap();
        assert_eq!(status["applied_revision"], 1);

        let leases = client.call("GetLeases", Value::Null).await.unwrap();
        assert_eq!(leases, json!([]));
    }

    #[tokio::test]
    async fn errors_carry_stable_kinds() {
        let (_dir, _supervisor, mut client) = served_supervisor().await;
        let error = client
            .call("ApplyConfig", Value::Null)
            .await
            .unwrap_err();
        match error {
            crate::rpc::RpcError::Remote { kind, .. } => assert_eq!(kind, "validation"),
            other => panic!("unexpected {other:?}"),
        }

        let error = client
            .call("Bogus", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(error, crate::rpc::RpcError::Remote { .. }));
    }

    #[tokio::test]
    async fn credentials_round_trip() {
        let (_dir, _supervisor, mut client) = served_supervisor().await;
        client
            .call(
                "ResetPassword",
                json!({ "user": "admin", "password": "hunter2" }),
            )
            .await
            .unwrap();
        let ok = client
            .call("VerifyUser", json!({ "user": "admin", "password": "hunter2" }))
            .await
            .unwrap();
        assert_eq!(ok["ok"], true);
        let bad = client
            .call("VerifyUser", json!({ "user": "admin", "password": "wrong" }))
            .await
            .unwrap();
        assert_eq!(bad["ok"], false);
    }

    #[tokio::test]
    async fn subscription_receives_config_events() {
        let (_dir, supervisor, client) = served_supervisor().await;
        let mut stream = client
            .subscribe(vec!["config".to_string()])
            .await
            .unwrap();
        // Let the server task enter subscription mode before staging.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let model = config::Model::default();
        supervisor.stage_model(model, "rpc").unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(event["event"], "config_staged");
        assert_eq!(event["topic"], "config");
    }
}
