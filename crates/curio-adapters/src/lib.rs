//! Acquisition strategies and domain screener registry.
//!
//! Each [`StrategyDescriptor`] variant implements exactly one [`FetchStrategy`];
//! adding a source type means adding a variant and its impl here.

pub mod screeners;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use curio_core::{
    CurioError, FigshareSpec, FileRecord, FileSpec, FtpSpec, GitSpec, HttpSpec, HubRepoType,
    HuggingfaceSpec, ManualSpec, ObjectSpec, S3Spec, StrategyDescriptor,
};
use curio_storage::{safe_component, safe_entry_path, sha256_hex, HttpFetcher, PayloadStore};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

pub use screeners::{
    registered_screeners, screener_for, AssetCandidate, CandidateRecord, DomainScreener, HookVerdict,
    ParseFailure, ParsedUnit, PatternRedactionHook, RawPayload, RedactionHook,
};

pub const CRATE_NAME: &str = "curio-adapters";

const DEFAULT_FIGSHARE_API: &str = "https://api.figshare.com/v2";
const DEFAULT_HUB: &str = "https://huggingface.co";

/// Shared handles passed to every strategy for one target.
pub struct FetchContext<'a> {
    pub run_id: Uuid,
    pub http: &'a HttpFetcher,
    pub store: &'a PayloadStore,
    /// Per-target cap on fetched files.
    pub max_files: Option<usize>,
}

/// A file placed in the target's payload directory by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub record: FileRecord,
    pub expected_sha256: Option<String>,
    pub extract: bool,
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError>;
}

pub fn strategy_for(descriptor: &StrategyDescriptor) -> &dyn FetchStrategy {
    match descriptor {
        StrategyDescriptor::Http(spec) => spec,
        StrategyDescriptor::Ftp(spec) => spec,
        StrategyDescriptor::Git(spec) => spec,
        StrategyDescriptor::S3(spec) => spec,
        StrategyDescriptor::Huggingface(spec) => spec,
        StrategyDescriptor::Figshare(spec) => spec,
        StrategyDescriptor::Manual(spec) => spec,
    }
}

fn limited<T>(items: &[T], max_files: Option<usize>) -> &[T] {
    match max_files {
        Some(limit) if limit < items.len() => &items[..limit],
        _ => items,
    }
}

/// Last non-empty URL path segment, made safe for use as a file name.
pub fn filename_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if last.is_empty() || last.contains(':') {
        "payload.bin".to_string()
    } else {
        safe_component(last)
    }
}

fn relative_record(record: FileRecord, dest: &Path, path: &Path) -> FileRecord {
    FileRecord {
        path: path
            .strip_prefix(dest)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/"),
        ..record
    }
}

/// Errors when a second entry would land on a file name already written this fetch.
fn claim_name(seen: &mut HashSet<String>, name: &str) -> Result<(), String> {
    if seen.insert(name.to_string()) {
        Ok(())
    } else {
        Err(format!("more than one file maps to {name:?}"))
    }
}

async fn download_to(
    ctx: &FetchContext<'_>,
    url: &str,
    path: &Path,
) -> Result<FileRecord, CurioError> {
    let response = ctx
        .http
        .fetch_bytes(ctx.run_id, url)
        .await
        .map_err(|e| e.into_curio(url))?;
    ctx.store
        .write_atomic(path, &response.body)
        .await
        .map_err(|e| CurioError::io(format!("storing {url}"), format!("{e:#}")))
}

async fn download_file_specs(
    ctx: &FetchContext<'_>,
    files: &[FileSpec],
    dest: &Path,
) -> Result<Vec<FetchedFile>, CurioError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for spec in limited(files, ctx.max_files) {
        let name = spec
            .filename
            .as_deref()
            .map(safe_component)
            .unwrap_or_else(|| filename_from_url(&spec.url));
        claim_name(&mut seen, &name).map_err(CurioError::Config)?;
        let path = dest.join(&name);
        let record = download_to(ctx, &spec.url, &path).await?;
        out.push(FetchedFile {
            record: relative_record(record, dest, &path),
            expected_sha256: spec.sha256.clone(),
            extract: spec.extract,
        });
    }
    Ok(out)
}

async fn download_objects(
    ctx: &FetchContext<'_>,
    base: &str,
    objects: &[ObjectSpec],
    dest: &Path,
) -> Result<Vec<FetchedFile>, CurioError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for object in limited(objects, ctx.max_files) {
        let key = object.key.trim_start_matches('/');
        claim_name(&mut seen, key).map_err(CurioError::Config)?;
        // Keys are remote-controlled paths; hold them to the same rule as archive entries.
        let path = safe_entry_path(dest, Path::new(key))?;
        let url = format!("{}/{}", base.trim_end_matches('/'), key);
        let record = download_to(ctx, &url, &path).await?;
        out.push(FetchedFile {
            record: relative_record(record, dest, &path),
            expected_sha256: object.sha256.clone(),
            extract: object.extract,
        });
    }
    Ok(out)
}

#[async_trait]
impl FetchStrategy for HttpSpec {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        download_file_specs(ctx, &self.files, dest).await
    }
}

/// Virtual-hosted bucket URL, or `<endpoint>/<bucket>` for S3-compatible stores.
pub fn s3_base_url(spec: &S3Spec) -> String {
    match (&spec.endpoint, spec.region.as_deref()) {
        (Some(endpoint), _) => format!("{}/{}", endpoint.trim_end_matches('/'), spec.bucket),
        (None, None) | (None, Some("us-east-1")) => {
            format!("https://{}.s3.amazonaws.com", spec.bucket)
        }
        (None, Some(region)) => format!("https://{}.s3.{region}.amazonaws.com", spec.bucket),
    }
}

#[async_trait]
impl FetchStrategy for S3Spec {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        download_objects(ctx, &s3_base_url(self), &self.objects, dest).await
    }
}

pub fn hub_resolve_base(spec: &HuggingfaceSpec) -> String {
    let hub = spec.endpoint.as_deref().unwrap_or(DEFAULT_HUB).trim_end_matches('/');
    let prefix = match spec.repo_type {
        HubRepoType::Dataset => "datasets/",
        HubRepoType::Model => "",
    };
    format!("{hub}/{prefix}{}/resolve/{}", spec.repo_id, spec.revision)
}

#[async_trait]
impl FetchStrategy for HuggingfaceSpec {
    fn kind(&self) -> &'static str {
        "huggingface"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        download_objects(ctx, &hub_resolve_base(self), &self.files, dest).await
    }
}

#[derive(Debug, Deserialize)]
struct FigshareFile {
    name: String,
    download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

#[async_trait]
impl FetchStrategy for FigshareSpec {
    fn kind(&self) -> &'static str {
        "figshare"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        let api = self.api_base.as_deref().unwrap_or(DEFAULT_FIGSHARE_API);
        let listing_url = format!("{}/articles/{}/files", api.trim_end_matches('/'), self.article_id);
        let listing = ctx
            .http
            .fetch_bytes(ctx.run_id, &listing_url)
            .await
            .map_err(|e| e.into_curio(&listing_url))?;
        let files: Vec<FigshareFile> = serde_json::from_slice(&listing.body).map_err(|e| {
            CurioError::permanent(&listing_url, format!("unexpected figshare listing: {e}"))
        })?;
        debug!(article_id = self.article_id, files = files.len(), "figshare listing");

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for file in limited(&files, ctx.max_files) {
            let name = safe_component(&file.name);
            // The listing is remote data; a collision means it cannot be stored faithfully.
            claim_name(&mut seen, &name).map_err(CurioError::integrity)?;
            let path = dest.join(&name);
            let record = download_to(ctx, &file.download_url, &path).await?;
            if let Some(expected) = file.size {
                if expected != record.bytes {
                    return Err(CurioError::integrity(format!(
                        "size mismatch for {}: expected {expected}, got {}",
                        file.name, record.bytes
                    )));
                }
            }
            out.push(FetchedFile {
                record: relative_record(record, dest, &path),
                expected_sha256: None,
                extract: false,
            });
        }
        Ok(out)
    }
}

async fn run_tool(program: &str, args: &[&str], subject: &str) -> Result<Output, CurioError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CurioError::permanent(subject, format!("spawning {program}: {e}")))?;
    Ok(output)
}

// curl exit codes for DNS, connect, timeout and partial transfer failures.
const CURL_TRANSIENT_EXITS: [i32; 5] = [6, 7, 18, 28, 56];

#[async_trait]
impl FetchStrategy for FtpSpec {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for spec in limited(&self.files, ctx.max_files) {
            let name = spec
                .filename
                .as_deref()
                .map(safe_component)
                .unwrap_or_else(|| filename_from_url(&spec.url));
            claim_name(&mut seen, &name).map_err(CurioError::Config)?;
            let path = dest.join(&name);
            let temp = dest.join(format!(".{}.part.tmp", Uuid::new_v4()));
            let temp_arg = temp.to_string_lossy().to_string();
            let output = run_tool(
                "curl",
                &[
                    "--fail",
                    "--silent",
                    "--show-error",
                    "--output",
                    temp_arg.as_str(),
                    "--",
                    spec.url.as_str(),
                ],
                &spec.url,
            )
            .await?;
            if !output.status.success() {
                let _ = tokio::fs::remove_file(&temp).await;
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let code = output.status.code().unwrap_or(-1);
                let message = format!("curl exited {code}: {stderr}");
                return Err(if CURL_TRANSIENT_EXITS.contains(&code) {
                    CurioError::transient(&spec.url, message)
                } else {
                    CurioError::permanent(&spec.url, message)
                });
            }
            let bytes = tokio::fs::read(&temp)
                .await
                .map_err(|e| CurioError::io(temp.display(), e))?;
            tokio::fs::rename(&temp, &path)
                .await
                .map_err(|e| CurioError::io(path.display(), e))?;
            out.push(FetchedFile {
                record: FileRecord {
                    path: name,
                    sha256: sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                },
                expected_sha256: spec.sha256.clone(),
                extract: spec.extract,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FetchStrategy for GitSpec {
    fn kind(&self) -> &'static str {
        "git"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        // `checkout` cannot take `--` before a revision, so option-like revs are refused up front.
        if let Some(rev) = self.rev.as_deref().filter(|rev| rev.starts_with('-')) {
            return Err(CurioError::Config(format!("git rev {rev:?} looks like an option")));
        }
        let checkout = dest.join("repo");
        let checkout_arg = checkout.to_string_lossy().to_string();
        let mut clone_args = vec!["clone", "--quiet"];
        if self.rev.is_none() {
            clone_args.extend(["--depth", "1"]);
        }
        clone_args.extend(["--", self.repo.as_str(), checkout_arg.as_str()]);

        let output = run_tool("git", &clone_args, &self.repo).await?;
        if !output.status.success() {
            // Network and remote hiccups are indistinguishable from the exit code; retry bounded.
            return Err(CurioError::transient(
                &self.repo,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        if let Some(rev) = &self.rev {
            let output = run_tool(
                "git",
                &["-C", checkout_arg.as_str(), "checkout", "--quiet", rev.as_str()],
                &self.repo,
            )
            .await?;
            if !output.status.success() {
                return Err(CurioError::permanent(
                    &self.repo,
                    format!(
                        "checking out {rev}: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ));
            }
        }

        let files = PayloadStore::list_files(&checkout)
            .map_err(|e| CurioError::io(checkout.display(), format!("{e:#}")))?;
        info!(repo = %self.repo, files = files.len(), "cloned repository");
        Ok(limited(&files, ctx.max_files)
            .iter()
            .cloned()
            .map(|record| FetchedFile {
                record: FileRecord {
                    path: format!("repo/{}", record.path),
                    ..record
                },
                expected_sha256: None,
                extract: false,
            })
            .collect())
    }
}

#[async_trait]
impl FetchStrategy for ManualSpec {
    fn kind(&self) -> &'static str {
        "manual"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>, dest: &Path) -> Result<Vec<FetchedFile>, CurioError> {
        let source = self.path.clone();
        let sources: Vec<PathBuf> = if source.is_dir() {
            PayloadStore::list_files(&source)
                .map_err(|e| CurioError::io(source.display(), format!("{e:#}")))?
                .into_iter()
                .map(|record| source.join(record.path))
                .collect()
        } else if source.is_file() {
            vec![source.clone()]
        } else {
            return Err(CurioError::permanent(
                source.display().to_string(),
                "manual source path does not exist",
            ));
        };

        let mut out = Vec::new();
        for file in limited(&sources, ctx.max_files) {
            let rel = if source.is_dir() {
                file.strip_prefix(&source).unwrap_or(file).to_path_buf()
            } else {
                PathBuf::from(file.file_name().unwrap_or_default())
            };
            let path = safe_entry_path(dest, &rel)?;
            let bytes = tokio::fs::read(file)
                .await
                .map_err(|e| CurioError::io(file.display(), e))?;
            let record = ctx
                .store
                .write_atomic(&path, &bytes)
                .await
                .map_err(|e| CurioError::io(path.display(), format!("{e:#}")))?;
            out.push(FetchedFile {
                record: relative_record(record, dest, &path),
                expected_sha256: None,
                extract: false,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_core::{Bucket, OutputPool};
    use curio_storage::HttpClientConfig;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn filename_from_url_handles_queries_and_trailing_slashes() {
        assert_eq!(filename_from_url("https://x.org/data/train.jsonl?dl=1"), "train.jsonl");
        assert_eq!(filename_from_url("https://x.org/data/"), "data");
        assert_eq!(filename_from_url("https://x.org"), "x.org");
        assert_eq!(filename_from_url("https://"), "payload.bin");
    }

    #[test]
    fn hub_and_bucket_urls_are_resolved() {
        let hf = HuggingfaceSpec {
            repo_id: "org/chem".into(),
            revision: "main".into(),
            repo_type: HubRepoType::Dataset,
            endpoint: None,
            files: vec![],
        };
        assert_eq!(
            hub_resolve_base(&hf),
            "https://huggingface.co/datasets/org/chem/resolve/main"
        );
        let s3 = S3Spec {
            bucket: "open-data".into(),
            region: Some("eu-west-1".into()),
            endpoint: None,
            objects: vec![],
        };
        assert_eq!(s3_base_url(&s3), "https://open-data.s3.eu-west-1.amazonaws.com");
    }

    #[test]
    fn strategy_dispatch_follows_descriptor_variant() {
        let desc = StrategyDescriptor::Git(GitSpec {
            repo: "https://example.org/repo.git".into(),
            rev: None,
        });
        assert_eq!(strategy_for(&desc).kind(), "git");
        assert_eq!(strategy_for(&desc).kind(), desc.kind());
    }

    #[tokio::test]
    async fn http_strategy_downloads_declared_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/a.jsonl"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"text\":\"hi\"}\n"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let dest = store.target_dir(Bucket::Green, OutputPool::Permissive, "t1");
        store.reset_target_dir(&dest).await.unwrap();

        let spec = HttpSpec {
            files: vec![FileSpec {
                url: format!("{}/files/a.jsonl", server.uri()),
                filename: None,
                sha256: Some("abc".into()),
                extract: false,
            }],
        };
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            max_files: None,
        };
        let files = spec.fetch(&ctx, &dest).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].record.path, "a.jsonl");
        assert_eq!(files[0].expected_sha256.as_deref(), Some("abc"));
        assert!(dest.join("a.jsonl").exists());
    }

    #[tokio::test]
    async fn colliding_file_names_fail_the_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let file = |url: String| FileSpec {
            url,
            filename: None,
            sha256: None,
            extract: false,
        };
        let spec = HttpSpec {
            files: vec![
                file(format!("{}/v1/data.jsonl", server.uri())),
                file(format!("{}/v2/data.jsonl?rev=2", server.uri())),
            ],
        };
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            max_files: None,
        };
        let err = spec.fetch(&ctx, &dir.path().join("t")).await.unwrap_err();
        assert!(matches!(err, CurioError::Config(ref msg) if msg.contains("data.jsonl")));
    }

    #[tokio::test]
    async fn option_like_git_rev_is_refused_without_running_git() {
        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            max_files: None,
        };
        let spec = GitSpec {
            repo: "https://example.org/repo.git".into(),
            rev: Some("--upload-pack=touch /tmp/owned".into()),
        };
        let err = spec.fetch(&ctx, &dir.path().join("t")).await.unwrap_err();
        assert!(matches!(err, CurioError::Config(_)));
        assert!(!dir.path().join("t/repo").exists());
    }

    #[tokio::test]
    async fn object_keys_cannot_escape_destination() {
        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let spec = S3Spec {
            bucket: "b".into(),
            region: None,
            endpoint: Some("http://127.0.0.1:9".into()),
            objects: vec![ObjectSpec {
                key: "../../etc/passwd".into(),
                sha256: None,
                extract: false,
            }],
        };
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            max_files: None,
        };
        let err = spec.fetch(&ctx, &dir.path().join("t")).await.unwrap_err();
        assert!(matches!(err, CurioError::Integrity(_)));
    }

    #[tokio::test]
    async fn figshare_listing_drives_downloads_and_checks_size() {
        let server = MockServer::start().await;
        let listing = serde_json::json!([
            {"name": "ok.txt", "download_url": format!("{}/dl/1", server.uri()), "size": 5},
            {"name": "short.txt", "download_url": format!("{}/dl/2", server.uri()), "size": 99}
        ]);
        Mock::given(method("GET"))
            .and(path("/articles/42/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tiny"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let spec = FigshareSpec {
            article_id: 42,
            api_base: Some(server.uri()),
        };
        let mut ctx = FetchContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            max_files: None,
        };

        let err = spec.fetch(&ctx, &dir.path().join("a")).await.unwrap_err();
        assert!(matches!(err, CurioError::Integrity(_)));

        ctx.max_files = Some(1);
        let files = spec.fetch(&ctx, &dir.path().join("b")).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].record.path, "ok.txt");
    }

    #[tokio::test]
    async fn manual_strategy_copies_directory_tree() {
        let src = tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested/b.txt"), "beta").unwrap();
        std::fs::write(src.path().join("a.txt"), "alpha").unwrap();

        let out = tempdir().unwrap();
        let store = PayloadStore::new(out.path());
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            http: &http,
            store: &store,
            max_files: None,
        };
        let spec = ManualSpec {
            path: src.path().to_path_buf(),
        };
        let dest = out.path().join("t");
        let mut files = spec.fetch(&ctx, &dest).await.unwrap();
        files.sort_by(|a, b| a.record.path.cmp(&b.record.path));
        let paths: Vec<_> = files.iter().map(|f| f.record.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "nested/b.txt"]);
    }
}
