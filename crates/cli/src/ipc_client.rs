//! Client side of the loopback IPC surface: reads `data/.ipc-port` and
//! issues bearer-authenticated requests.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use attache_config::AppConfig;

#[derive(Debug, Deserialize)]
struct PortFile {
    port: u16,
    token: String,
}

pub struct IpcClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl IpcClient {
    pub fn connect(config: &AppConfig) -> Result<Self> {
        let path = config.ipc_port_path();
        let raw = std::fs::read_to_string(&path).with_context(|| {
            format!("read {} — is the daemon running?", path.display())
        })?;
        let port_file: PortFile = serde_json::from_str(&raw).context("parse ipc port file")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base: format!("http://127.0.0.1:{}", port_file.port),
            token: port_file.token,
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("ipc request failed — is the daemon running?")?;
        Self::decode(response).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut request = self
            .http
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.context("ipc request failed")?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!(
                "daemon returned {status}: {}",
                body["error"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }
}
