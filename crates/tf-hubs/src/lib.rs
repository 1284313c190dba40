// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hub downloader: resolves a product reference to bytes on disk, trying
//! each configured hub in order and verifying an MD5 checksum before
//! declaring success, when the hub's catalog supplies one in a form this
//! server understands.
//!
//! Hubs are tried most-preferred first, a per-hub failure is logged and
//! swallowed, and only exhausting every hub is a hard error.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tf_config::{HubAuth, HubEntry};
use tf_error::{ErrorCode, TfError};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const CHUNK_LOG_INTERVAL: usize = 100;

/// A hub's checksum field, which comes in one of two shapes: a list of
/// `{algorithm, value}` entries, or a single multihash-prefixed string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChecksumField {
    /// `[{"algorithm": "md5", "value": "..."}, ...]`
    Entries(Vec<ChecksumEntry>),
    /// A multihash-prefixed string, e.g. `"d5" + hex(md5 digest)`.
    Multihash(String),
}

/// One entry of a list-shaped checksum field.
#[derive(Debug, Clone, Deserialize)]
pub struct ChecksumEntry {
    /// Checksum algorithm name, e.g. `"md5"` or `"sha256"`.
    pub algorithm: String,
    /// Hex-encoded digest value.
    pub value: String,
}

/// Multihash code prefix identifying an MD5 digest.
const MD5_MULTIHASH_PREFIX: &str = "d5";

/// Pull a usable MD5 hex digest out of a hub's checksum field, if there is
/// one. Only MD5 is honored; any other algorithm (or a missing field) warns
/// and skips verification rather than failing the download.
fn resolve_md5(checksum: &Option<ChecksumField>, hub: &str) -> Option<String> {
    match checksum {
        None => {
            warn!(hub, "hub reported no checksum for product, skipping verification");
            None
        }
        Some(ChecksumField::Entries(entries)) => {
            let found = entries.iter().find(|e| e.algorithm.eq_ignore_ascii_case("md5"));
            if found.is_none() {
                warn!(hub, "hub reported no MD5 checksum entry, skipping verification");
            }
            found.map(|e| e.value.clone())
        }
        Some(ChecksumField::Multihash(raw)) => {
            if raw.len() > MD5_MULTIHASH_PREFIX.len() + 2
                && raw[..MD5_MULTIHASH_PREFIX.len()].eq_ignore_ascii_case(MD5_MULTIHASH_PREFIX)
            {
                Some(raw[MD5_MULTIHASH_PREFIX.len() + 2..].to_string())
            } else {
                warn!(hub, checksum = %raw, "hub checksum uses an unsupported algorithm, skipping verification");
                None
            }
        }
    }
}

/// Metadata about a product as reported by a hub's OData product API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductInfo {
    /// Hub-internal product id.
    pub id: String,
    /// Product file name.
    pub name: String,
    /// Checksum reported by the hub, if any.
    #[serde(default)]
    pub checksum: Option<ChecksumField>,
}

#[derive(Debug, Deserialize)]
struct ODataProductList {
    value: Vec<ProductInfo>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// A client bound to one configured hub, handling auth and checksum
/// verification for that hub alone.
pub struct HubClient {
    http: reqwest::Client,
    entry: HubEntry,
    oauth_token: Mutex<Option<(String, Instant)>>,
}

impl HubClient {
    /// Build a client for a single hub entry.
    pub fn new(entry: HubEntry) -> Self {
        Self {
            http: reqwest::Client::new(),
            entry,
            oauth_token: Mutex::new(None),
        }
    }

    /// Operator-facing hub name, used in error context.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    async fn ensure_token(&self) -> Result<Option<String>, TfError> {
        let HubAuth::OAuth2 {
            username,
            password,
            token_url,
            client_id,
        } = &self.entry.auth
        else {
            return Ok(None);
        };

        {
            let guard = self.oauth_token.lock().expect("oauth token mutex poisoned");
            if let Some((token, expires_at)) = guard.as_ref()
                && Instant::now() < *expires_at
            {
                return Ok(Some(token.clone()));
            }
        }

        let resp = self
            .http
            .post(token_url)
            .form(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
                ("client_id", client_id),
            ])
            .send()
            .await
            .map_err(|e| {
                TfError::new(ErrorCode::HubDownloadFailed, format!("token refresh failed: {e}"))
                    .with_context("hub", self.entry.name.clone())
            })?;

        let token: TokenResponse = resp.json().await.map_err(|e| {
            TfError::new(ErrorCode::HubDownloadFailed, format!("invalid token response: {e}"))
                .with_context("hub", self.entry.name.clone())
        })?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(30));
        let access_token = token.access_token;
        *self.oauth_token.lock().expect("oauth token mutex poisoned") =
            Some((access_token.clone(), expires_at));
        Ok(Some(access_token))
    }

    async fn authed_get(&self, url: &str) -> Result<reqwest::RequestBuilder, TfError> {
        let mut req = self.http.get(url);
        req = match &self.entry.auth {
            HubAuth::Basic { username, password } => {
                req.basic_auth(username, Some(password))
            }
            HubAuth::OAuth2 { .. } => {
                if let Some(token) = self.ensure_token().await? {
                    req.bearer_auth(token)
                } else {
                    req
                }
            }
        };
        Ok(req)
    }

    /// Look up product metadata by name via the hub's OData API.
    pub async fn product_info(&self, product_name: &str) -> Result<ProductInfo, TfError> {
        let url = format!(
            "{}/Products?$filter=startswith(Name,'{}')",
            self.entry.url.trim_end_matches('/'),
            product_name
        );
        let req = self.authed_get(&url).await?;
        let resp = req.send().await.map_err(|e| {
            TfError::new(ErrorCode::HubDownloadFailed, format!("product lookup failed: {e}"))
                .with_context("hub", self.entry.name.clone())
        })?;

        if !resp.status().is_success() {
            return Err(TfError::new(
                ErrorCode::HubDownloadFailed,
                format!("hub returned status {}", resp.status()),
            )
            .with_context("hub", self.entry.name.clone()));
        }

        let list: ODataProductList = resp.json().await.map_err(|e| {
            TfError::new(ErrorCode::HubDownloadFailed, format!("invalid product list: {e}"))
                .with_context("hub", self.entry.name.clone())
        })?;

        list.value.into_iter().next().ok_or_else(|| {
            TfError::new(
                ErrorCode::HubDownloadFailed,
                format!("product '{product_name}' not found on hub"),
            )
            .with_context("hub", self.entry.name.clone())
        })
    }

    /// Stream a product's bytes to `dest`, verifying the MD5 checksum
    /// against [`ProductInfo::checksum`] once the download completes, if the
    /// hub reported one in a supported form.
    pub async fn download(&self, info: &ProductInfo, dest: &Path) -> Result<(), TfError> {
        let url = format!(
            "{}/Products('{}')/$value",
            self.entry.url.trim_end_matches('/'),
            info.id
        );
        let req = self.authed_get(&url).await?;
        let resp = req.send().await.map_err(|e| {
            TfError::new(ErrorCode::HubDownloadFailed, format!("download request failed: {e}"))
                .with_context("hub", self.entry.name.clone())
        })?;

        if !resp.status().is_success() {
            return Err(TfError::new(
                ErrorCode::HubDownloadFailed,
                format!("download returned status {}", resp.status()),
            )
            .with_context("hub", self.entry.name.clone()));
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            TfError::new(ErrorCode::HubDownloadFailed, format!("cannot create {}: {e}", dest.display()))
        })?;

        let mut hasher = Md5::new();
        let mut stream = resp.bytes_stream();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                TfError::new(ErrorCode::HubDownloadFailed, format!("stream error: {e}"))
                    .with_context("hub", self.entry.name.clone())
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| {
                TfError::new(ErrorCode::HubDownloadFailed, format!("write error: {e}"))
            })?;
            chunks += 1;
            if chunks % CHUNK_LOG_INTERVAL == 0 {
                info!(hub = %self.entry.name, chunks, "download in progress");
            }
        }
        file.flush().await.ok();

        let computed = hex::encode(hasher.finalize());
        if let Some(expected) = resolve_md5(&info.checksum, &self.entry.name) {
            if !computed.eq_ignore_ascii_case(&expected) {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(TfError::new(
                    ErrorCode::ChecksumMismatch,
                    "downloaded product checksum does not match hub-reported checksum",
                )
                .with_context("hub", self.entry.name.clone())
                .with_context("expected", expected)
                .with_context("computed", computed));
            }
        }

        Ok(())
    }
}

/// Download `product_name` from the first hub (in `hubs` order) that has it
/// and that serves it without a checksum mismatch.
///
/// Every hub's failure is logged and the next hub tried; only when every
/// configured hub has failed does this return `Err`, carrying the list of
/// hub names attempted in its context.
pub async fn download_product(
    product_name: &str,
    hubs: &[HubEntry],
    dest_dir: &Path,
) -> Result<PathBuf, TfError> {
    let mut tried = Vec::new();

    for entry in hubs {
        let hub_name = entry.name.clone();
        let client = HubClient::new(entry.clone());

        let result: Result<PathBuf, TfError> = async {
            let info = client.product_info(product_name).await?;
            let dest = dest_dir.join(&info.name);
            client.download(&info, &dest).await?;
            Ok(dest)
        }
        .await;

        match result {
            Ok(path) => {
                info!(hub = %hub_name, product = %product_name, "download succeeded");
                return Ok(path);
            }
            Err(e) => {
                warn!(hub = %hub_name, product = %product_name, error = %e, "hub download failed, trying next hub");
                tried.push(hub_name);
            }
        }
    }

    Err(TfError::new(
        ErrorCode::HubDownloadFailed,
        format!("all {} configured hubs failed to deliver '{product_name}'", tried.len()),
    )
    .with_context("product", product_name.to_string())
    .with_context("hubs_tried", tried))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}
