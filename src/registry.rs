use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, LINK};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;

use crate::error::AppError;
use crate::models::{Catalog, ImageConfig, Manifest, Registry, TagList};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.manifest.v1+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The registry operations the retention engine and scan scheduler rely on.
#[async_trait]
pub trait RegistryAccess: Send + Sync {
    async fn list_repositories(&self) -> Result<Vec<String>>;

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>>;

    async fn get_digest_for_tag(&self, repo: &str, tag: &str) -> Result<String>;

    async fn get_creation_time(&self, repo: &str, tag: &str) -> Result<DateTime<Utc>>;

    async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()>;
}

/// Builds a [`RegistryAccess`] for a stored connection record.
pub trait RegistryConnector: Send + Sync {
    fn connect(&self, registry: &Registry) -> Result<Arc<dyn RegistryAccess>>;
}

/// Connects over HTTP using [`RegistryClient`].
#[derive(Debug, Default, Clone)]
pub struct HttpConnector;

impl RegistryConnector for HttpConnector {
    fn connect(&self, registry: &Registry) -> Result<Arc<dyn RegistryAccess>> {
        Ok(Arc::new(RegistryClient::from_registry(registry)?))
    }
}

pub struct RegistryClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl RegistryClient {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        insecure: bool,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url,
            username: username.filter(|u| !u.is_empty()),
            password,
        })
    }

    pub fn from_registry(registry: &Registry) -> Result<Self> {
        Self::new(
            &registry.url,
            registry.username.clone(),
            registry.password.clone(),
            registry.insecure,
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> RequestBuilder {
        debug!("{} {}", method, url);
        let req = self.client.request(method, url);
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    /// GET /v2/: checks the registry is reachable and credentials are accepted
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/v2/", self.base_url);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Connection failed")?;

        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED => Err(AppError::Unauthorized.into()),
            status => Err(AppError::RegistryApi(format!("unexpected status {}", status)).into()),
        }
    }

    /// GET /v2/_catalog with pagination
    async fn fetch_catalog(&self) -> Result<Vec<String>> {
        let mut repos = Vec::new();
        let mut url = format!("{}/v2/_catalog?n=100", self.base_url);

        loop {
            let resp = self
                .request(reqwest::Method::GET, &url)
                .send()
                .await
                .context("Failed to fetch catalog")?;

            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!(AppError::RegistryApi(format!(
                    "catalog returned status {}",
                    status
                )));
            }

            let next_link = Self::parse_next_link(&resp);

            let catalog: Catalog = resp.json().await.context("Failed to parse catalog JSON")?;
            repos.extend(catalog.repositories);

            match next_link {
                Some(next) => url = self.resolve_url(&next),
                None => break,
            }
        }

        Ok(repos)
    }

    /// GET /v2/<repo>/tags/list with pagination
    async fn fetch_tags(&self, repo: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut url = format!("{}/v2/{}/tags/list", self.base_url, repo);

        loop {
            let resp = self
                .request(reqwest::Method::GET, &url)
                .send()
                .await
                .with_context(|| format!("Failed to fetch tags for {}", repo))?;

            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!(AppError::RegistryApi(format!(
                    "tag list for {} returned status {}",
                    repo, status
                )));
            }

            let next_link = Self::parse_next_link(&resp);

            let tag_list: TagList = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse tag list for {}", repo))?;

            if let Some(t) = tag_list.tags {
                tags.extend(t);
            }

            match next_link {
                Some(next) => url = self.resolve_url(&next),
                None => break,
            }
        }

        Ok(tags)
    }

    /// HEAD /v2/<repo>/manifests/<tag>: extract Docker-Content-Digest header
    async fn fetch_digest(&self, repo: &str, tag: &str) -> Result<String> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, tag);
        let resp = self
            .request(reqwest::Method::HEAD, &url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES)
            .send()
            .await
            .with_context(|| format!("Failed to HEAD manifest for {}:{}", repo, tag))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(
                "HEAD manifest for {}:{} returned status {}",
                repo,
                tag,
                status
            );
        }

        resp.headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .with_context(|| format!("Missing Docker-Content-Digest header for {}:{}", repo, tag))
    }

    /// GET /v2/<repo>/manifests/<tag>: parse manifest JSON
    async fn fetch_manifest(&self, repo: &str, tag: &str) -> Result<Manifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, tag);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES)
            .send()
            .await
            .with_context(|| format!("Failed to GET manifest for {}:{}", repo, tag))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(
                "GET manifest for {}:{} returned status {}",
                repo,
                tag,
                status
            );
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse manifest for {}:{}", repo, tag))
    }

    /// GET /v2/<repo>/blobs/<config_digest>: parse created timestamp
    async fn fetch_image_config(&self, repo: &str, config_digest: &str) -> Result<ImageConfig> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repo, config_digest);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to GET blob {} for {}", config_digest, repo))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(
                "GET blob {} for {} returned status {}",
                config_digest,
                repo,
                status
            );
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse image config for {}", repo))
    }

    /// Parse the Link header for pagination (next URL)
    fn parse_next_link(resp: &reqwest::Response) -> Option<String> {
        let link = resp.headers().get(LINK)?.to_str().ok()?;
        // Link: </v2/_catalog?n=100&last=xxx>; rel="next"
        if link.contains("rel=\"next\"") {
            let start = link.find('<')? + 1;
            let end = link.find('>')?;
            Some(link[start..end].to_string())
        } else {
            None
        }
    }

    /// Resolve a relative URL path against the base URL
    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl RegistryAccess for RegistryClient {
    async fn list_repositories(&self) -> Result<Vec<String>> {
        self.fetch_catalog().await
    }

    async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        self.fetch_tags(repo).await
    }

    async fn get_digest_for_tag(&self, repo: &str, tag: &str) -> Result<String> {
        self.fetch_digest(repo, tag).await
    }

    async fn get_creation_time(&self, repo: &str, tag: &str) -> Result<DateTime<Utc>> {
        let manifest = self.fetch_manifest(repo, tag).await?;
        let config = manifest
            .config
            .filter(|c| !c.digest.is_empty())
            .with_context(|| format!("Manifest config digest missing for {}:{}", repo, tag))?;

        self.fetch_image_config(repo, &config.digest)
            .await?
            .created
            .with_context(|| format!("Image config for {}:{} has no created time", repo, tag))
    }

    /// DELETE /v2/<repo>/manifests/<digest>
    async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<()> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, digest);
        let resp = self
            .request(reqwest::Method::DELETE, &url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES)
            .send()
            .await
            .with_context(|| format!("Failed to DELETE manifest {} for {}", digest, repo))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!(
                "DELETE manifest {} for {} returned status {}",
                digest,
                repo,
                status
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(url: &str) -> RegistryClient {
        RegistryClient::new(url, None, None, false).unwrap()
    }

    #[test]
    fn test_resolve_url_relative() {
        let client = client("http://localhost:5000");
        let resolved = client.resolve_url("/v2/_catalog?n=100&last=foo");
        assert_eq!(resolved, "http://localhost:5000/v2/_catalog?n=100&last=foo");
    }

    #[test]
    fn test_resolve_url_absolute() {
        let client = client("http://localhost:5000");
        let resolved = client.resolve_url("http://other:5000/v2/_catalog?n=100");
        assert_eq!(resolved, "http://other:5000/v2/_catalog?n=100");
    }

    #[test]
    fn test_resolve_url_strips_trailing_slash() {
        let client = client("http://localhost:5000/");
        let resolved = client.resolve_url("/v2/_catalog");
        assert_eq!(resolved, "http://localhost:5000/v2/_catalog");
    }

    #[test(tokio::test)]
    async fn test_catalog_follows_link_header() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/_catalog"))
            .and(query_param("last", "beta"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "repositories": ["gamma"] })),
            )
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v2/_catalog"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", "</v2/_catalog?n=100&last=beta>; rel=\"next\"")
                    .set_body_json(serde_json::json!({ "repositories": ["alpha", "beta"] })),
            )
            .mount(&server)
            .await;

        let repos = client(&server.uri()).list_repositories().await.unwrap();
        assert_eq!(repos, vec!["alpha", "beta", "gamma"]);
    }

    #[test(tokio::test)]
    async fn test_creation_time_reads_config_blob() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/app/manifests/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "schemaVersion": 2,
                "config": { "mediaType": "application/vnd.docker.container.image.v1+json", "size": 10, "digest": "sha256:cfg" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v2/app/blobs/sha256:cfg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "created": "2024-03-01T10:00:00Z" })),
            )
            .mount(&server)
            .await;

        let created = client(&server.uri())
            .get_creation_time("app", "v1")
            .await
            .unwrap();
        assert_eq!(created.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test(tokio::test)]
    async fn test_creation_time_missing_config_is_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/app/manifests/v1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "schemaVersion": 2 })),
            )
            .mount(&server)
            .await;

        assert!(client(&server.uri())
            .get_creation_time("app", "v1")
            .await
            .is_err());
    }

    #[test(tokio::test)]
    async fn test_digest_uses_basic_auth() {
        let server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/v2/app/manifests/latest"))
            .and(basic_auth("ci", "secret"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Docker-Content-Digest", "sha256:abc"),
            )
            .mount(&server)
            .await;

        let client = RegistryClient::new(
            &server.uri(),
            Some("ci".to_string()),
            Some("secret".to_string()),
            false,
        )
        .unwrap();
        let digest = client.get_digest_for_tag("app", "latest").await.unwrap();
        assert_eq!(digest, "sha256:abc");
    }

    #[test(tokio::test)]
    async fn test_delete_manifest_reports_status() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/v2/app/manifests/sha256:abc"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .delete_manifest("app", "sha256:abc")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("405"));
    }

    #[test(tokio::test)]
    async fn test_ping_unauthorized() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server.uri()).ping().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::Unauthorized)
        ));
    }
}
