use super::UpdateError;
use async_trait::async_trait;
use hostgate_types::UpdateFeedKind;
use reqwest::Url;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CLIENT_ID_HEADER: &str = "X-Client-Id";
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Name of the release manifest for this platform
pub fn channel_file() -> &'static str {
    if cfg!(target_os = "macos") {
        "latest-mac.yml"
    } else if cfg!(target_os = "linux") {
        "latest-linux.yml"
    } else {
        "latest.yml"
    }
}

/// One downloadable artifact of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub url: String,
    /// Base64 encoded SHA-512 of the artifact
    #[serde(default)]
    pub sha512: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Release description published next to the installers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub version: String,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub sha512: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    /// Where relative file urls are resolved against; set by the feed
    #[serde(skip)]
    pub base_url: Option<String>,
}

impl ReleaseManifest {
    pub fn parse(text: &str) -> Result<Self, UpdateError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// The artifact to download: the first listed file, or the legacy
    /// top level `path`.
    pub fn primary_file(&self) -> Option<ManifestFile> {
        if let Some(file) = self.files.first() {
            return Some(file.clone());
        }
        self.path.as_ref().map(|path| ManifestFile {
            url: path.clone(),
            sha512: self.sha512.clone(),
            size: None,
        })
    }

    pub fn resolve_url(&self, url: &str) -> Result<Url, UpdateError> {
        if let Ok(absolute) = Url::parse(url) {
            return Ok(absolute);
        }
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| UpdateError::InvalidUrl(url.to_string()))?;
        Url::parse(base)
            .and_then(|base| base.join(url))
            .map_err(|_| UpdateError::InvalidUrl(url.to_string()))
    }
}

/// A source of release manifests
#[async_trait]
pub trait UpdateFeed: Send + Sync {
    fn kind(&self) -> UpdateFeedKind;

    /// Where the feed points, for logs
    fn describe(&self) -> String;

    async fn latest(&self, client: &reqwest::Client) -> Result<ReleaseManifest, UpdateError>;
}

async fn fetch_text(request: reqwest::RequestBuilder, url: &str) -> Result<String, UpdateError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(UpdateError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.text().await?)
}

/// Plain HTTP directory holding the manifest and installers
#[derive(Debug, Clone)]
pub struct GenericFeed {
    base_url: String,
    user_agent: String,
    client_id: String,
}

impl GenericFeed {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            user_agent: user_agent.into(),
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl UpdateFeed for GenericFeed {
    fn kind(&self) -> UpdateFeedKind {
        UpdateFeedKind::Primary
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn latest(&self, client: &reqwest::Client) -> Result<ReleaseManifest, UpdateError> {
        let url = format!("{}{}", self.base_url, channel_file());
        debug!(%url, "Fetching release manifest");

        let request = client
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .header(CLIENT_ID_HEADER, &self.client_id);
        let mut manifest = ReleaseManifest::parse(&fetch_text(request, &url).await?)?;
        manifest.base_url = Some(self.base_url.clone());
        Ok(manifest)
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

/// Latest release of a GitHub repository
#[derive(Debug, Clone)]
pub struct GitHubReleaseFeed {
    api_base: String,
    owner: String,
    repo: String,
    user_agent: String,
}

impl GitHubReleaseFeed {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            api_base: GITHUB_API_BASE.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            user_agent: user_agent.into(),
        }
    }

    /// Point at a GitHub compatible API other than api.github.com
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl UpdateFeed for GitHubReleaseFeed {
    fn kind(&self) -> UpdateFeedKind {
        UpdateFeedKind::Fallback
    }

    fn describe(&self) -> String {
        format!("github:{}/{}", self.owner, self.repo)
    }

    async fn latest(&self, client: &reqwest::Client) -> Result<ReleaseManifest, UpdateError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.owner, self.repo
        );
        debug!(%url, "Fetching latest GitHub release");

        let request = client
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/vnd.github+json");
        let release: GitHubRelease = serde_json::from_str(&fetch_text(request, &url).await?)
            .map_err(|e| UpdateError::Release(e.to_string()))?;

        let name = channel_file();
        let asset = release
            .assets
            .iter()
            .find(|asset| asset.name == name)
            .ok_or_else(|| UpdateError::MissingAsset {
                name: name.to_string(),
                release: release.tag_name.clone(),
            })?;

        let request = client
            .get(&asset.browser_download_url)
            .header(USER_AGENT, &self.user_agent);
        let mut manifest =
            ReleaseManifest::parse(&fetch_text(request, &asset.browser_download_url).await?)?;

        // Installers sit next to the manifest in the release
        let base = asset
            .browser_download_url
            .rsplit_once('/')
            .map(|(base, _)| format!("{base}/"))
            .unwrap_or_else(|| {
                format!(
                    "https://github.com/{}/{}/releases/download/{}/",
                    self.owner, self.repo, release.tag_name
                )
            });
        manifest.base_url = Some(base);
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
version: 1.4.0
files:
  - url: Hostgate-1.4.0.dmg
    sha512: q2Z0cM8H2Q==
    size: 1024
path: Hostgate-1.4.0.dmg
sha512: q2Z0cM8H2Q==
releaseDate: '2025-03-01T10:00:00.000Z'
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = ReleaseManifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.version, "1.4.0");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].size, Some(1024));
        assert_eq!(manifest.release_date.as_deref(), Some("2025-03-01T10:00:00.000Z"));
    }

    #[test]
    fn test_primary_file_falls_back_to_path() {
        let manifest = ReleaseManifest::parse("version: 1.0.0\npath: app.zip\nsha512: abc\n").unwrap();
        let file = manifest.primary_file().unwrap();
        assert_eq!(file.url, "app.zip");
        assert_eq!(file.sha512.as_deref(), Some("abc"));

        let empty = ReleaseManifest::parse("version: 1.0.0\n").unwrap();
        assert!(empty.primary_file().is_none());
    }

    #[test]
    fn test_resolve_url() {
        let mut manifest = ReleaseManifest::parse(MANIFEST).unwrap();
        assert!(manifest.resolve_url("Hostgate-1.4.0.dmg").is_err());

        manifest.base_url = Some("https://updates.example.com/releases/".to_string());
        assert_eq!(
            manifest.resolve_url("Hostgate-1.4.0.dmg").unwrap().as_str(),
            "https://updates.example.com/releases/Hostgate-1.4.0.dmg"
        );
        assert_eq!(
            manifest
                .resolve_url("https://cdn.example.com/a.dmg")
                .unwrap()
                .as_str(),
            "https://cdn.example.com/a.dmg"
        );
    }

    #[test]
    fn test_generic_feed_normalizes_base() {
        let feed = GenericFeed::new("https://example.com/api/v1/version", "Hostgate/1.0.0", "id");
        assert_eq!(feed.describe(), "https://example.com/api/v1/version/");
        assert_eq!(feed.kind(), UpdateFeedKind::Primary);
    }
}
