/**
 * Chart model and tarball download for the chart cache
 */
use super::errors::{internal_error, invalid_argument_error};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Url};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Repository a chart was indexed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub namespace: String,
    pub name: String,
    /// Base URL of the repository, used to resolve relative tarball URLs
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartVersion {
    pub version: String,
    /// Tarball URLs, the first one is the one to download
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    /// `<repo name>/<chart name>`, possibly URL-escaped
    pub id: String,
    pub name: String,
    pub repo: RepoRef,
    /// Sorted newest first
    pub chart_versions: Vec<ChartVersion>,
}

/// What the chart cache stores for every chart version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartCacheEntryValue {
    pub chart_tarball: Vec<u8>,
}

/// Fetches chart tarballs
#[async_trait]
pub trait ChartDownloader: Send + Sync {
    async fn download(&self, chart_id: &str, url: &str, version: &str) -> Result<Vec<u8>>;
}

/// Settings for outbound chart downloads
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// PEM client certificate and key, for mutual TLS
    pub cert_bytes: Vec<u8>,
    pub key_bytes: Vec<u8>,
    /// PEM CA bundle trusted in addition to the system roots
    pub ca_bytes: Vec<u8>,
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

/// [`ChartDownloader`] over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpChartDownloader {
    client: Client,
    options: ClientOptions,
}

impl HttpChartDownloader {
    /// # Errors
    ///
    /// Will return `Err` if the TLS material in `options` can not be parsed
    pub fn new(options: ClientOptions) -> Result<Self> {
        let mut builder = Client::builder();
        if !options.user_agent.is_empty() {
            builder = builder.user_agent(options.user_agent.clone());
        }
        if !options.ca_bytes.is_empty() {
            for cert in Certificate::from_pem_bundle(&options.ca_bytes)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if !options.cert_bytes.is_empty() || !options.key_bytes.is_empty() {
            let pem = [options.cert_bytes.as_slice(), options.key_bytes.as_slice()].concat();
            builder = builder.identity(Identity::from_pem(&pem)?);
        }
        Ok(Self {
            client: builder.build()?,
            options,
        })
    }
}

#[async_trait]
impl ChartDownloader for HttpChartDownloader {
    async fn download(&self, chart_id: &str, url: &str, version: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if !self.options.username.is_empty() && !self.options.password.is_empty() {
            request = request.basic_auth(&self.options.username, Some(&self.options.password));
        }
        let response = request.send().await?.error_for_status()?;
        let tarball = response.bytes().await?;

        info!(
            "📦 Fetched chart [{}], version [{}], url [{}]: [{}] bytes",
            chart_id,
            version,
            url,
            tarball.len()
        );
        Ok(tarball.to_vec())
    }
}

/// Download a chart tarball and encode it for the cache
///
/// # Errors
///
/// Will return `Err` if the download fails
pub async fn compute_value(downloader: &dyn ChartDownloader, chart_id: &str, url: &str, version: &str) -> Result<Vec<u8>> {
    let chart_tarball = downloader.download(chart_id, url, version).await?;
    Ok(bincode::serialize(&ChartCacheEntryValue { chart_tarball })?)
}

/// URL-unescaped chart ID, which must look like `repo/chart`
///
/// # Errors
///
/// Will return `Err` if the ID can not be decoded or has the wrong shape
pub fn unescaped_chart_id(chart_id: &str) -> Result<String> {
    let unescaped = urlencoding::decode(&chart_id.replace('+', " "))
        .map_err(|e| internal_error(format!("Unable to decode chart ID [{chart_id}]: {e}")))?
        .into_owned();
    if unescaped.split('/').count() != 2 {
        return Err(invalid_argument_error(format!(
            "Incorrect package ref identifier, currently just 'foo/bar' patterns are supported: {chart_id}"
        )));
    }
    Ok(unescaped)
}

/// Resolve a tarball URL that may be relative to the repository URL
///
/// # Errors
///
/// Will return `Err` if either URL is malformed
pub fn resolve_url(repo_url: &str, chart_url: &str) -> Result<String> {
    if let Ok(absolute) = Url::parse(chart_url) {
        return Ok(absolute.to_string());
    }
    // the repository URL names a directory
    let base = if repo_url.ends_with('/') { repo_url.to_string() } else { format!("{repo_url}/") };
    let base = Url::parse(&base).map_err(|e| invalid_argument_error(format!("invalid repository URL [{repo_url}]: {e}")))?;
    let resolved = base
        .join(chart_url)
        .map_err(|e| invalid_argument_error(format!("invalid chart URL [{chart_url}]: {e}")))?;
    Ok(resolved.to_string())
}
