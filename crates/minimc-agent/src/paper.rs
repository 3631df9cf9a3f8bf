use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::launch::SERVER_JAR;

pub const MANIFEST_FILE: &str = "manifest.json";

const PROJECT: &str = "paper";
const PROGRESS_STEP_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BuildsResponse {
    builds: Vec<BuildRef>,
}

#[derive(Debug, Deserialize)]
struct BuildRef {
    build: u32,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    downloads: BuildDownloads,
}

#[derive(Debug, Deserialize)]
struct BuildDownloads {
    application: ApplicationDownload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationDownload {
    pub name: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// What was installed last, next to `server.jar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub filename: String,
    pub version: String,
    pub build: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDecision {
    Install,
    UpToDate,
    /// Installed version differs but the version was picked automatically; leave it alone.
    KeepExisting { installed: String },
    /// Installed version differs and the operator asked for another one.
    Replace { installed: String },
}

/// `manual` is true when the operator pinned a version rather than following latest.
pub fn manifest_decision(
    existing: Option<&Manifest>,
    version: &str,
    latest_build: u32,
    manual: bool,
) -> ManifestDecision {
    let Some(existing) = existing else {
        return ManifestDecision::Install;
    };
    if existing.version == version {
        if existing.build >= latest_build {
            ManifestDecision::UpToDate
        } else {
            ManifestDecision::Install
        }
    } else if manual {
        ManifestDecision::Replace {
            installed: existing.version.clone(),
        }
    } else {
        ManifestDecision::KeepExisting {
            installed: existing.version.clone(),
        }
    }
}

pub async fn read_manifest(data_dir: &Path) -> Option<Manifest> {
    let raw = tokio::fs::read(data_dir.join(MANIFEST_FILE)).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable {MANIFEST_FILE}");
            None
        }
    }
}

async fn write_manifest(data_dir: &Path, manifest: &Manifest) -> anyhow::Result<()> {
    let path = data_dir.join(MANIFEST_FILE);
    let tmp = data_dir.join(format!("{MANIFEST_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(manifest)?;
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Thin client for the PaperMC downloads API (v2).
#[derive(Debug, Clone)]
pub struct PaperClient {
    http: reqwest::Client,
    base_url: String,
}

impl PaperClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("minimc-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{PROJECT}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = self.url(path);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=3_u32 {
            let res: anyhow::Result<T> = async {
                self.http
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET {url}"))?
                    .error_for_status()
                    .with_context(|| format!("GET {url} (status)"))?
                    .json()
                    .await
                    .with_context(|| format!("parse {url}"))
            }
            .await;
            match res {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed: {url}")))
    }

    pub async fn latest_version(&self) -> anyhow::Result<String> {
        let project: ProjectResponse = self.get_json("").await?;
        project
            .versions
            .last()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no paper versions published"))
    }

    pub async fn latest_build(&self, version: &str) -> anyhow::Result<u32> {
        let builds: BuildsResponse = self
            .get_json(&format!("/versions/{version}/builds"))
            .await?;
        builds
            .builds
            .last()
            .map(|b| b.build)
            .ok_or_else(|| anyhow::anyhow!("no builds published for paper {version}"))
    }

    pub async fn build_download(
        &self,
        version: &str,
        build: u32,
    ) -> anyhow::Result<ApplicationDownload> {
        let info: BuildResponse = self
            .get_json(&format!("/versions/{version}/builds/{build}"))
            .await?;
        Ok(info.downloads.application)
    }

    pub fn download_url(&self, version: &str, build: u32, filename: &str) -> String {
        self.url(&format!(
            "/versions/{version}/builds/{build}/downloads/{filename}"
        ))
    }

    /// Streams `url` into `dest` through a `.tmp` sibling, checking SHA-256 when one is
    /// given. Returns the byte count and the digest.
    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
    ) -> anyhow::Result<(u64, String)> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url} (status)"))?;

        let tmp = dest.with_extension("tmp");
        let res = stream_to_file(resp, &tmp).await;
        let (size, digest) = match res {
            Ok(v) => v,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected_sha256
            && !expected.eq_ignore_ascii_case(&digest)
        {
            let _ = tokio::fs::remove_file(&tmp).await;
            anyhow::bail!("sha256 mismatch for {url}: expected {expected}, got {digest}");
        }

        install_download(&tmp, dest).await?;
        Ok((size, digest))
    }
}

/// Moves a finished download into place. The temp file never outlives a failed move.
async fn install_download(tmp: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Err(e) = tokio::fs::rename(tmp, dest).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(anyhow::Error::new(e).context(format!("move download into {}", dest.display())));
    }
    Ok(())
}

async fn stream_to_file(resp: reqwest::Response, tmp: &Path) -> anyhow::Result<(u64, String)> {
    let started = std::time::Instant::now();
    let mut file = tokio::fs::File::create(tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut next_report = PROGRESS_STEP_BYTES;

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("read download body")?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
        if total >= next_report {
            let secs = started.elapsed().as_secs_f64().max(0.1);
            tracing::info!(
                "downloading: {:.2} MB done, {:.2} MB/s",
                total as f64 / 1024.0 / 1024.0,
                total as f64 / 1024.0 / 1024.0 / secs
            );
            next_report = next_report.saturating_add(PROGRESS_STEP_BYTES);
        }
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((total, hex::encode(hasher.finalize())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Installed(Manifest),
    Skipped(ManifestDecision),
}

/// Makes sure `server.jar` in `data_dir` is the newest Paper build of the wanted version.
/// `requested` is `None` to follow the latest release.
pub async fn provision(
    client: &PaperClient,
    data_dir: &Path,
    requested: Option<&str>,
) -> anyhow::Result<ProvisionOutcome> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let manual = requested.is_some();
    let version = match requested {
        Some(v) => v.to_string(),
        None => client.latest_version().await?,
    };
    tracing::info!("using paper version {version}");

    let build = client.latest_build(&version).await?;
    let jar_path: PathBuf = data_dir.join(SERVER_JAR);
    let existing = read_manifest(data_dir).await;

    let decision = manifest_decision(existing.as_ref(), &version, build, manual);
    match &decision {
        ManifestDecision::UpToDate if jar_path.exists() => {
            tracing::info!("paper {version} (build {build}) is already up to date");
            return Ok(ProvisionOutcome::Skipped(decision));
        }
        ManifestDecision::UpToDate => {
            tracing::warn!("{SERVER_JAR} is missing although {MANIFEST_FILE} is current, reinstalling");
        }
        ManifestDecision::KeepExisting { installed } => {
            tracing::warn!(
                "installed version {installed} differs from latest {version}; automatic versioning keeps it. Set MC_VERSION to switch"
            );
            return Ok(ProvisionOutcome::Skipped(decision));
        }
        ManifestDecision::Replace { installed } => {
            tracing::warn!("replacing installed version {installed} with {version}, worlds may need an upgrade");
        }
        ManifestDecision::Install => {}
    }

    let app = client.build_download(&version, build).await?;
    let url = client.download_url(&version, build, &app.name);
    tracing::info!("downloading {} (build {build})", app.name);

    let (size, sha256) = client
        .download_to(&url, &jar_path, app.sha256.as_deref())
        .await?;
    tracing::info!(
        "downloaded build {build} ({:.2} MB)",
        size as f64 / 1024.0 / 1024.0
    );

    let manifest = Manifest {
        filename: app.name,
        version,
        build,
        size,
        download: url,
        sha256,
        date: chrono::Utc::now().to_rfc3339(),
    };
    write_manifest(data_dir, &manifest).await?;
    tracing::info!("{MANIFEST_FILE} written");
    Ok(ProvisionOutcome::Installed(manifest))
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, routing::get};

    use super::*;

    const JAR_BYTES: &[u8] = b"not really a jar";

    fn manifest(version: &str, build: u32) -> Manifest {
        Manifest {
            filename: format!("paper-{version}-{build}.jar"),
            version: version.to_string(),
            build,
            size: 1,
            download: String::new(),
            sha256: String::new(),
            date: String::new(),
        }
    }

    #[test]
    fn decision_table() {
        assert_eq!(
            manifest_decision(None, "1.21.4", 10, false),
            ManifestDecision::Install
        );
        let m = manifest("1.21.4", 10);
        assert_eq!(
            manifest_decision(Some(&m), "1.21.4", 10, false),
            ManifestDecision::UpToDate
        );
        assert_eq!(
            manifest_decision(Some(&m), "1.21.4", 11, false),
            ManifestDecision::Install
        );
        assert_eq!(
            manifest_decision(Some(&m), "1.21.5", 1, false),
            ManifestDecision::KeepExisting {
                installed: "1.21.4".to_string()
            }
        );
        assert_eq!(
            manifest_decision(Some(&m), "1.20.6", 1, true),
            ManifestDecision::Replace {
                installed: "1.21.4".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failed_install_removes_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("server.tmp");
        let dest = dir.path().join(SERVER_JAR);
        std::fs::write(&tmp, JAR_BYTES).unwrap();
        // A non-empty directory in the way makes the rename fail.
        std::fs::create_dir_all(dest.join("plugins")).unwrap();

        assert!(install_download(&tmp, &dest).await.is_err());
        assert!(!tmp.exists());
        assert!(dest.is_dir());
    }

    #[tokio::test]
    async fn legacy_manifest_without_checksum_still_parses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"filename":"paper-1.21.4-3.jar","version":"1.21.4","build":3,"size":10,"download":"x","date":"d"}"#,
        )
        .unwrap();
        let m = read_manifest(dir.path()).await.unwrap();
        assert_eq!(m.build, 3);
        assert!(m.sha256.is_empty());

        std::fs::write(dir.path().join(MANIFEST_FILE), "{").unwrap();
        assert!(read_manifest(dir.path()).await.is_none());
    }

    async fn fake_api(sha256: String) -> String {
        let build_info = serde_json::json!({
            "build": 12,
            "downloads": { "application": { "name": "paper-1.21.4-12.jar", "sha256": sha256 } }
        });
        let app = Router::new()
            .route(
                "/projects/paper",
                get(|| async { Json(serde_json::json!({ "versions": ["1.20.6", "1.21.4"] })) }),
            )
            .route(
                "/projects/paper/versions/1.21.4/builds",
                get(|| async {
                    Json(serde_json::json!({ "builds": [{ "build": 10 }, { "build": 12 }] }))
                }),
            )
            .route(
                "/projects/paper/versions/1.21.4/builds/12",
                get(move || {
                    let body = build_info.clone();
                    async move { Json(body) }
                }),
            )
            .route(
                "/projects/paper/versions/1.21.4/builds/12/downloads/paper-1.21.4-12.jar",
                get(|| async { JAR_BYTES }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn installs_latest_build_and_then_skips() {
        let base = fake_api(hex::encode(Sha256::digest(JAR_BYTES))).await;
        let client = PaperClient::new(base).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let outcome = provision(&client, dir.path(), None).await.unwrap();
        let ProvisionOutcome::Installed(m) = outcome else {
            panic!("expected install, got {outcome:?}");
        };
        assert_eq!(m.version, "1.21.4");
        assert_eq!(m.build, 12);
        assert_eq!(m.size, JAR_BYTES.len() as u64);
        assert_eq!(std::fs::read(dir.path().join(SERVER_JAR)).unwrap(), JAR_BYTES);
        assert_eq!(read_manifest(dir.path()).await.unwrap(), m);

        let again = provision(&client, dir.path(), None).await.unwrap();
        assert_eq!(again, ProvisionOutcome::Skipped(ManifestDecision::UpToDate));
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let base = fake_api("00".repeat(32)).await;
        let client = PaperClient::new(base).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let err = provision(&client, dir.path(), Some("1.21.4"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
        assert!(!dir.path().join(SERVER_JAR).exists());
        assert!(!dir.path().join("server.tmp").exists());
        assert!(read_manifest(dir.path()).await.is_none());
    }
}
