use crate::config::PkgSettings;
use crate::error::{RepairError, RepairResult};
use crate::executor::CommandExecutor;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use url::Url;

pub const META_ENDPOINT: &str = "meta.conf";

const PASS_MARKER: &str = "[✓]";
const FAIL_MARKER: &str = "[x]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSummary {
    pub message: String,
    pub detail: String,
    pub all_reachable: bool,
}

impl ProbeSummary {
    fn failed(message: &str, detail: impl Into<String>) -> Self {
        Self {
            message: message.to_string(),
            detail: detail.into(),
            all_reachable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoProbe {
    pub url: String,
    pub reachable: bool,
    pub info: String,
}

impl RepoProbe {
    fn reachable(url: &str) -> Self {
        Self {
            url: url.to_string(),
            reachable: true,
            info: "ok".to_string(),
        }
    }

    fn unreachable(url: &str, info: String) -> Self {
        Self {
            url: url.to_string(),
            reachable: false,
            info,
        }
    }

    pub fn line(&self) -> String {
        let marker = if self.reachable { PASS_MARKER } else { FAIL_MARKER };
        format!("{} {} ({})", marker, self.url, self.info)
    }
}

// Lines look like `url : "pkg+http://pkg.FreeBSD.org/${ABI}/quarterly",`.
pub fn parse_repo_urls(dump: &str, abi: &str, placeholder: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for line in dump.lines() {
        let line = line.trim();
        if !line.starts_with("url") {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "url" {
            continue;
        }

        let value = value
            .trim()
            .trim_end_matches(',')
            .trim_matches(|c: char| c == '"' || c == '\'')
            .trim();
        let mut url = normalize_scheme(value);
        if !placeholder.is_empty() {
            url = url.replace(placeholder, abi);
        }
        if !url.is_empty() {
            urls.push(url);
        }
    }
    urls
}

fn normalize_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("pkg+http://") {
        format!("http://{}", rest)
    } else if let Some(rest) = url.strip_prefix("pkg+https://") {
        format!("https://{}", rest)
    } else {
        url.to_string()
    }
}

pub fn meta_url(url: &str) -> String {
    format!("{}/{}", url.trim_end_matches('/'), META_ENDPOINT)
}

pub fn connect_target(url: &Url) -> RepairResult<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| RepairError::NetworkUnreachable(format!("{} has no host", url)))?;
    let default_port = if url.scheme() == "https" { 443 } else { 80 };
    Ok((
        host.trim_start_matches('[').trim_end_matches(']').to_string(),
        url.port().unwrap_or(default_port),
    ))
}

pub struct RepoProber {
    executor: Arc<dyn CommandExecutor>,
    settings: Arc<PkgSettings>,
    client: reqwest::Client,
}

impl RepoProber {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        settings: Arc<PkgSettings>,
    ) -> RepairResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout())
            .user_agent(format!("ppr/{}", crate::PPR_VERSION))
            .build()?;
        Ok(Self::with_client(executor, settings, client))
    }

    pub fn with_client(
        executor: Arc<dyn CommandExecutor>,
        settings: Arc<PkgSettings>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            executor,
            settings,
            client,
        }
    }

    pub async fn discover(&self, deadline: Instant) -> RepairResult<Vec<String>> {
        let pkg = self.settings.pkg_binary.as_str();
        let abi = match self.executor.execute(pkg, &["config", "ABI"], deadline).await {
            Ok(out) => out.trim().to_string(),
            Err(e) => {
                warn!("Could not query pkg ABI: {}", e);
                String::new()
            }
        };
        debug!("pkg ABI is '{}'", abi);

        let dump = self.executor.execute(pkg, &["-vv"], deadline).await?;
        let urls = parse_repo_urls(&dump, &abi, &self.settings.abi_placeholder);
        if urls.is_empty() {
            return Err(RepairError::ConfigParseIncomplete(
                "no url entries parsed from pkg -vv output".into(),
            ));
        }
        info!("Found {} repository url(s)", urls.len());
        Ok(urls)
    }

    pub async fn probe_all(&self, deadline: Instant) -> ProbeSummary {
        let urls = match self.discover(deadline).await {
            Ok(urls) => urls,
            Err(RepairError::ConfigParseIncomplete(detail)) => {
                return ProbeSummary::failed("could not detect repository URLs", detail);
            }
            Err(e) => return ProbeSummary::failed("could not run pkg -vv", e.to_string()),
        };

        let mut lines = Vec::with_capacity(urls.len());
        let mut all_reachable = true;
        for url in &urls {
            let probe = match timeout_at(deadline, self.probe_repo(url)).await {
                Ok(probe) => probe,
                Err(_) => RepoProbe::unreachable(url, "stage deadline exceeded".into()),
            };
            if probe.reachable {
                info!("Repository {} is reachable", url);
            } else {
                warn!("Repository {} is unreachable: {}", url, probe.info);
                all_reachable = false;
            }
            lines.push(probe.line());
        }

        let message = if all_reachable {
            "repository network reachable"
        } else {
            "some repositories are unreachable"
        };
        ProbeSummary {
            message: message.to_string(),
            detail: lines.join("\n"),
            all_reachable,
        }
    }

    pub async fn probe_repo(&self, raw: &str) -> RepoProbe {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => return RepoProbe::unreachable(raw, format!("parse error: {}", e)),
        };
        let (host, port) = match connect_target(&url) {
            Ok(target) => target,
            Err(e) => {
                debug!("Skipping {}: {}", raw, e);
                return RepoProbe::unreachable(raw, "no host to probe".to_string());
            }
        };

        if let Err(e) = tcp_check(&host, port, self.settings.connect_timeout()).await {
            return RepoProbe::unreachable(raw, format!("tcp connect failed: {}", e));
        }

        let meta = meta_url(raw);
        debug!("GET {}", meta);
        match self.client.get(&meta).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..400).contains(&status) {
                    RepoProbe::reachable(raw)
                } else {
                    RepoProbe::unreachable(raw, format!("GET /{} status {}", META_ENDPOINT, status))
                }
            }
            Err(e) => RepoProbe::unreachable(raw, format!("GET /{} failed: {}", META_ENDPOINT, e)),
        }
    }
}

async fn tcp_check(host: &str, port: u16, limit: Duration) -> RepairResult<()> {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(RepairError::Io(e)),
        Err(_) => Err(RepairError::NetworkUnreachable(format!(
            "no answer from {}:{} within {}s",
            host,
            port,
            limit.as_secs()
        ))),
    }
}
