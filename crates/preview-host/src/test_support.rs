//! In-memory collaborators for exercising instances without network or processes.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use preview_instance::{PrDetails, PrNumber};

use crate::{
    archive::ArchiveFetcher,
    comments::Templates,
    github::{GithubApi, PullRequestMeta},
    instance::{InstanceEnv, InstanceSettings},
    port_alloc::{PortAllocator, PortStats},
    registry::InstanceRegistry,
    site_server::{LaunchSpec, SiteLauncher, SiteServer},
};

#[derive(Default)]
pub struct FakeFetcher {
    fetches: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
    malformed: AtomicBool,
}

impl FakeFetcher {
    pub fn fetches(&self) -> Vec<(String, String)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    /// Fetch succeeds but the checkout has no site directory.
    pub fn set_malformed(&self, on: bool) {
        self.malformed.store(on, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ArchiveFetcher for FakeFetcher {
    async fn fetch(&self, source_repo: &str, branch: &str, dest: &Path) -> anyhow::Result<()> {
        self.fetches
            .lock()
            .unwrap()
            .push((source_repo.to_string(), branch.to_string()));
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("archive unavailable");
        }
        if dest.exists() {
            anyhow::bail!("destination already exists: {}", dest.display());
        }
        let site = if self.malformed.load(Ordering::SeqCst) {
            dest.join("src")
        } else {
            dest.join("docs")
        };
        std::fs::create_dir_all(&site)?;
        std::fs::write(site.join("index.md"), format!("# {branch}\n"))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    fail_next: AtomicBool,
    launches: Mutex<Vec<(u64, u16, PathBuf)>>,
    live: Arc<Mutex<HashSet<u32>>>,
}

impl FakeLauncher {
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// `(pr, port)` of every successful launch, in order.
    pub fn launches(&self) -> Vec<(u64, u16)> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|(pr, port, _)| (*pr, *port))
            .collect()
    }

    pub fn cwd_of(&self, launch: usize) -> PathBuf {
        self.launches.lock().unwrap()[launch].2.clone()
    }

    /// Servers launched and not yet killed.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl SiteLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Box<dyn SiteServer>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("spawn refused");
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.launches
            .lock()
            .unwrap()
            .push((spec.pr.0, spec.port, spec.cwd.to_path_buf()));
        self.live.lock().unwrap().insert(pid);
        Ok(Box::new(FakeServer {
            pid,
            live: Arc::clone(&self.live),
        }))
    }
}

#[derive(Debug)]
struct FakeServer {
    pid: u32,
    live: Arc<Mutex<HashSet<u32>>>,
}

impl SiteServer for FakeServer {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&mut self) {
        self.live.lock().unwrap().remove(&self.pid);
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub pr: u64,
    pub body: String,
}

#[derive(Default)]
pub struct FakeGithub {
    comments: Mutex<Vec<PostedComment>>,
    pulls: Mutex<HashMap<u64, PullRequestMeta>>,
}

impl FakeGithub {
    pub fn comments(&self) -> Vec<PostedComment> {
        self.comments.lock().unwrap().clone()
    }

    pub fn add_pull(&self, number: u64, meta: PullRequestMeta) {
        self.pulls.lock().unwrap().insert(number, meta);
    }
}

#[async_trait::async_trait]
impl GithubApi for FakeGithub {
    async fn post_comment(
        &self,
        _owner: &str,
        _repo: &str,
        number: PrNumber,
        body: &str,
    ) -> anyhow::Result<()> {
        self.comments.lock().unwrap().push(PostedComment {
            pr: number.0,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        number: PrNumber,
    ) -> anyhow::Result<PullRequestMeta> {
        self.pulls
            .lock()
            .unwrap()
            .get(&number.0)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("pull request {number} not found"))
    }
}

/// A registry wired to fakes, with its site root in a temp dir.
pub struct Harness {
    pub registry: Arc<InstanceRegistry>,
    pub fetcher: Arc<FakeFetcher>,
    pub launcher: Arc<FakeLauncher>,
    pub github: Arc<FakeGithub>,
    pub ports: Arc<Mutex<PortAllocator>>,
    pub stale_after: Duration,
    _root: tempfile::TempDir,
}

impl Harness {
    pub fn new(min_port: u16, max_port: u16, max_bindings: Option<usize>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let launcher = Arc::new(FakeLauncher::default());
        let github = Arc::new(FakeGithub::default());
        let ports = Arc::new(Mutex::new(
            PortAllocator::new(min_port, max_port, max_bindings).unwrap(),
        ));
        let stale_after = Duration::from_secs(60 * 60);

        let env = InstanceEnv {
            ports: Arc::clone(&ports),
            fetcher: fetcher.clone(),
            launcher: launcher.clone(),
            github: github.clone(),
            templates: Templates::new("preview.test", 1, None),
            settings: InstanceSettings {
                site_root: root.path().join("sites"),
                site_subdir: "docs".to_string(),
                port_base: min_port,
                stale_after,
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
        };

        Self {
            registry: InstanceRegistry::new(env),
            fetcher,
            launcher,
            github,
            ports,
            stale_after,
            _root: root,
        }
    }

    pub fn details(&self, number: u64) -> PrDetails {
        PrDetails {
            number: PrNumber(number),
            source_repo: "contrib/docs".to_string(),
            branch: format!("branch-{number}"),
            target_owner: "org".to_string(),
            target_repo: "docs".to_string(),
            author: "contrib".to_string(),
        }
    }

    pub fn ports_assigned(&self) -> usize {
        self.ports.lock().unwrap().assigned_count()
    }

    pub fn port_stats(&self) -> PortStats {
        self.ports.lock().unwrap().stats()
    }
}
