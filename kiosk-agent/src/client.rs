//! HTTP client for the kernel device surface (`/heartbeat`, `/claim`, `/report`).

use crate::execution::AgentCommand;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("kernel rejected {endpoint} with {status}: {message}")]
    Rejected { endpoint: &'static str, status: u16, message: String },
    #[error("malformed command from kernel: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Desired state returned by the kernel on each heartbeat
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatReply {
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub fast_loop_enabled: bool,
}

/// Command as returned by `/claim`
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimedCommand {
    pub id: i64,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl ClaimedCommand {
    pub fn decode(&self) -> Result<AgentCommand, serde_json::Error> {
        let mut wire = json!({ "type": self.command_type });
        if !self.payload.is_null() {
            wire["payload"] = self.payload.clone();
        }
        serde_json::from_value(wire)
    }
}

pub struct KernelClient {
    http: reqwest::Client,
    base_url: String,
}

impl KernelClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }

    async fn post(&self, endpoint: &'static str, token: &str, body: Value) -> Result<Value, ClientError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(ClientError::Rejected {
                endpoint,
                status: status.as_u16(),
                message: body["message"].as_str().unwrap_or_default().to_string(),
            });
        }
        Ok(body)
    }

    pub async fn heartbeat(&self, token: &str, device_id: i64) -> Result<HeartbeatReply, ClientError> {
        let body = self
            .post("/heartbeat", token, json!({ "device_id": device_id, "status": "online" }))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn claim(&self, token: &str, device_id: i64) -> Result<Option<ClaimedCommand>, ClientError> {
        let body = self.post("/claim", token, json!({ "device_id": device_id })).await?;
        match body.get("command") {
            Some(command) if !command.is_null() => Ok(Some(serde_json::from_value(command.clone())?)),
            _ => Ok(None),
        }
    }

    pub async fn report(
        &self,
        token: &str,
        command_id: i64,
        success: bool,
        output: &str,
        error: Option<&str>,
    ) -> Result<Value, ClientError> {
        let status = if success { "executed" } else { "failed" };
        self.post(
            "/report",
            token,
            json!({ "command_id": command_id, "status": status, "output": output, "error": error }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_claimed_command() {
        let raw = json!({
            "id": 7,
            "device_id": 3,
            "type": "toggle_fast_loop",
            "payload": { "enable": true, "interval_secs": 10 },
            "status": "sent",
        });
        let claimed: ClaimedCommand = serde_json::from_value(raw).unwrap();
        assert_eq!(claimed.id, 7);
        assert_eq!(claimed.decode().unwrap(), AgentCommand::ToggleFastLoop { enable: true, interval_secs: 10 });
    }

    #[test]
    fn test_decode_forced_update_without_payload() {
        let claimed: ClaimedCommand = serde_json::from_value(json!({ "id": 1, "type": "forced_update" })).unwrap();
        assert_eq!(claimed.decode().unwrap(), AgentCommand::ForcedUpdate);
    }

    #[tokio::test]
    async fn test_heartbeat_body_matches_kernel_contract() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 4096];
            let mut request = String::new();
            while !request.contains("\r\n\r\n") || !request.trim_end().ends_with('}') {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            let reply = r#"{"success":true,"poll_interval_secs":10}"#;
            write!(
                stream,
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                reply.len(),
                reply
            )
            .unwrap();
            request
        });

        let client = KernelClient::new(&format!("http://{addr}")).unwrap();
        let reply = client.heartbeat("tok", 3).await.unwrap();
        assert_eq!(reply.poll_interval_secs, 10);

        let request = server.join().unwrap();
        let body = request.split("\r\n\r\n").nth(1).unwrap();
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body, json!({ "device_id": 3, "status": "online" }));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let claimed: ClaimedCommand = serde_json::from_value(json!({ "id": 1, "type": "format_disk" })).unwrap();
        assert!(claimed.decode().is_err());
    }
}
