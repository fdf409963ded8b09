//! HTTP implementations of the store seams: Consul-style blocking queries
//! for KV and catalog data, Vault-style read and token renewal for secrets.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{ConsulConfig, SslConfig, VaultConfig};
use crate::deps::{CatalogService, KvPair, Secret};
use crate::error::{ClientError, StoreError};

use super::{KvStore, SecretStore};

const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";
const CONSUL_TOKEN_HEADER: &str = "X-Consul-Token";
const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
const VAULT_NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// KV store client speaking the Consul HTTP API.
#[derive(Debug)]
pub struct HttpKvClient {
    base: String,
    token: Option<String>,
    basic_auth: Option<(String, Option<String>)>,
    /// `stale=` is sent on reads when staleness is permitted at all.
    stale_params: String,
    client: reqwest::Client,
}

impl HttpKvClient {
    pub fn new(config: &ConsulConfig, max_stale: Duration) -> Result<Self, ClientError> {
        let address = config
            .address
            .clone()
            .ok_or(ClientError::MissingAddress { source_kind: "kv" })?;

        let basic_auth = config.auth.as_ref().filter(|a| a.enabled()).map(|a| {
            (
                a.username.clone().unwrap_or_default(),
                a.password.clone(),
            )
        });

        let stale_params = if max_stale > Duration::ZERO {
            format!("&stale=&max_stale={}s", max_stale.as_secs().max(1))
        } else {
            String::new()
        };

        Ok(Self {
            base: base_url(&address, &config.ssl()),
            token: config.token.clone(),
            basic_auth,
            stale_params,
            client: build_client("kv", &config.ssl())?,
        })
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header(CONSUL_TOKEN_HEADER, token);
        }
        if let Some((user, pass)) = &self.basic_auth {
            req = req.basic_auth(user, pass.as_deref());
        }
        req
    }
}

#[async_trait]
impl KvStore for HttpKvClient {
    async fn kv_list(
        &self,
        path: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<KvPair>), StoreError> {
        let url = format!(
            "{}/v1/kv/{}?recurse=true&index={}&wait={}s{}",
            self.base,
            path,
            index,
            wait.as_secs(),
            self.stale_params
        );
        debug!(target: "clients", %url, "kv list");

        let resp = self.get(url).send().await?;
        // A prefix with no keys yet is not an error.
        if resp.status().as_u16() == 404 {
            return Ok((read_index(&resp, index), Vec::new()));
        }
        let resp = check_status(resp).await?;
        let new_index = read_index(&resp, index);

        let entries: Vec<RawKvEntry> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let mut pairs = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = entry
                .key
                .strip_prefix(path)
                .unwrap_or(&entry.key)
                .trim_start_matches('/')
                .to_string();
            let value = match entry.value {
                Some(encoded) => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| StoreError::Decode(e.to_string()))?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                None => String::new(),
            };
            pairs.push(KvPair::new(key, value));
        }

        Ok((new_index, pairs))
    }

    async fn catalog_service(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<CatalogService>), StoreError> {
        let url = format!(
            "{}/v1/catalog/service/{}?index={}&wait={}s{}",
            self.base,
            name,
            index,
            wait.as_secs(),
            self.stale_params
        );
        debug!(target: "clients", %url, "catalog service");

        let resp = check_status(self.get(url).send().await?).await?;
        let new_index = read_index(&resp, index);

        let entries: Vec<RawCatalogEntry> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let services = entries
            .into_iter()
            .map(|e| CatalogService {
                service_id: e.service_id,
                service_name: e.service_name,
                service_address: e.service_address,
                service_tags: e.service_tags,
                service_port: e.service_port,
            })
            .collect();

        Ok((new_index, services))
    }
}

/// Secrets store client speaking the Vault HTTP API.
pub struct HttpSecretClient {
    base: String,
    token: Option<String>,
    namespace: Option<String>,
    client: reqwest::Client,
}

impl HttpSecretClient {
    pub fn new(config: &VaultConfig) -> Result<Self, ClientError> {
        let address = config.address.clone().ok_or(ClientError::MissingAddress {
            source_kind: "secrets",
        })?;

        Ok(Self {
            base: base_url(&address, &config.ssl()),
            token: config.token.clone(),
            namespace: config.namespace.clone(),
            client: build_client("secrets", &config.ssl())?,
        })
    }

    fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req;
        if let Some(token) = &self.token {
            req = req.header(VAULT_TOKEN_HEADER, token);
        }
        if let Some(ns) = &self.namespace {
            req = req.header(VAULT_NAMESPACE_HEADER, ns);
        }
        req
    }
}

#[async_trait]
impl SecretStore for HttpSecretClient {
    async fn read_secret(&self, path: &str) -> Result<Secret, StoreError> {
        let url = format!("{}/v1/{}", self.base, path);
        debug!(target: "clients", %url, "read secret");

        let resp = check_status(self.request(self.client.get(url)).send().await?).await?;
        let raw: RawSecretResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        let mut secret = Secret::from_value(raw.data);
        if raw.lease_duration > 0 {
            secret.lease_duration = Some(Duration::from_secs(raw.lease_duration));
        }
        Ok(secret)
    }

    async fn renew_token(&self) -> Result<Duration, StoreError> {
        let url = format!("{}/v1/auth/token/renew-self", self.base);
        debug!(target: "clients", %url, "renew token");

        let resp = check_status(self.request(self.client.post(url)).send().await?).await?;
        let raw: RawRenewResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        Ok(Duration::from_secs(raw.auth.lease_duration))
    }
}

/// Prefixes a scheme when the configured address has none.
fn base_url(address: &str, ssl: &SslConfig) -> String {
    let address = address.trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else if ssl.enabled() {
        format!("https://{address}")
    } else {
        format!("http://{address}")
    }
}

/// Builds a reqwest client, loading TLS material up front so broken config
/// fails at construction rather than on the first poll.
fn build_client(source_kind: &'static str, ssl: &SslConfig) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder();

    if ssl.enabled() {
        if !ssl.verify() {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &ssl.ca_cert {
            let pem = std::fs::read(ca).map_err(|e| ClientError::Tls {
                source_kind,
                reason: format!("ca_cert {ca:?}: {e}"),
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ClientError::Tls {
                source_kind,
                reason: format!("ca_cert {ca:?}: {e}"),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        match (&ssl.cert, &ssl.key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert).map_err(|e| ClientError::Tls {
                    source_kind,
                    reason: format!("cert {cert:?}: {e}"),
                })?;
                pem.extend(std::fs::read(key).map_err(|e| ClientError::Tls {
                    source_kind,
                    reason: format!("key {key:?}: {e}"),
                })?);
                let identity =
                    reqwest::Identity::from_pem(&pem).map_err(|e| ClientError::Tls {
                        source_kind,
                        reason: e.to_string(),
                    })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(ClientError::Tls {
                    source_kind,
                    reason: "cert and key must be configured together".to_string(),
                })
            }
        }
    }

    builder.build().map_err(|e| ClientError::Build {
        source_kind,
        reason: e.to_string(),
    })
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::UnexpectedStatus {
        status: status.as_u16(),
        body,
    })
}

fn read_index(resp: &reqwest::Response, fallback: u64) -> u64 {
    resp.headers()
        .get(CONSUL_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

#[derive(Deserialize)]
struct RawKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Deserialize)]
struct RawCatalogEntry {
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(rename = "ServiceName", default)]
    service_name: String,
    #[serde(rename = "ServiceAddress", default)]
    service_address: String,
    #[serde(rename = "ServiceTags", default)]
    service_tags: Vec<String>,
    #[serde(rename = "ServicePort", default)]
    service_port: u16,
}

#[derive(Deserialize)]
struct RawSecretResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Deserialize)]
struct RawRenewResponse {
    auth: RawRenewAuth,
}

#[derive(Deserialize)]
struct RawRenewAuth {
    #[serde(default)]
    lease_duration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_adds_scheme_by_ssl() {
        let plain = SslConfig::default();
        assert_eq!(base_url("127.0.0.1:8500", &plain), "http://127.0.0.1:8500");

        let tls = SslConfig {
            enabled: Some(true),
            ..SslConfig::default()
        };
        assert_eq!(base_url("127.0.0.1:8200", &tls), "https://127.0.0.1:8200");
        assert_eq!(
            base_url("https://vault.internal/", &plain),
            "https://vault.internal"
        );
    }

    #[test]
    fn missing_address_is_a_client_error() {
        let err =
            HttpKvClient::new(&ConsulConfig::default(), Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, ClientError::MissingAddress { .. }));
    }

    #[test]
    fn cert_without_key_rejected() {
        let ssl = SslConfig {
            enabled: Some(true),
            cert: Some("/tmp/cert.pem".into()),
            ..SslConfig::default()
        };
        let err = build_client("kv", &ssl).unwrap_err();
        assert!(matches!(err, ClientError::Tls { .. }));
    }
}
