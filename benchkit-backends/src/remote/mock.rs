//! Recording launcher for tests.

use super::launcher::{GenerateParameters, InferenceServer, LaunchSpec, ServerLauncher};
use async_trait::async_trait;
use benchkit_core::{BackendError, Result};
use std::sync::{Arc, Mutex, MutexGuard};

/// What a [`MockLauncher`] and its servers saw.
#[derive(Debug, Default)]
pub struct MockServerLog {
    pub launches: Vec<LaunchSpec>,
    /// Files of the first volume's host directory at launch time, sorted, relative.
    pub mounted_files: Vec<Vec<String>>,
    pub generate_requests: Vec<(Vec<String>, GenerateParameters)>,
    pub embed_requests: Vec<Vec<String>>,
    pub closes: usize,
}

impl MockServerLog {
    /// Requests of any kind received so far.
    pub fn requests(&self) -> usize {
        self.generate_requests.len() + self.embed_requests.len()
    }
}

fn lock(log: &Mutex<MockServerLog>) -> MutexGuard<'_, MockServerLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Launcher whose servers echo prompts back instead of running a model.
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    fail_launch: bool,
    log: Arc<Mutex<MockServerLog>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch fails with an upstream error.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> Arc<Mutex<MockServerLog>> {
        Arc::clone(&self.log)
    }
}

fn list_files(root: &std::path::Path) -> Vec<String> {
    fn walk(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().into_owned());
            }
        }
    }

    let mut files = Vec::new();
    walk(root, root, &mut files);
    files.sort();
    files
}

#[async_trait]
impl ServerLauncher for MockLauncher {
    type Server = MockServer;

    async fn launch(&self, spec: &LaunchSpec) -> Result<MockServer> {
        let mounted = spec
            .volumes
            .first()
            .map(|v| list_files(&v.host))
            .unwrap_or_default();
        {
            let mut log = lock(&self.log);
            log.launches.push(spec.clone());
            log.mounted_files.push(mounted);
        }
        if self.fail_launch {
            return Err(BackendError::upstream(
                format!("server for {}", spec.model),
                BackendError::server("mock launch failure"),
            ));
        }
        Ok(MockServer {
            running: true,
            log: Arc::clone(&self.log),
        })
    }
}

pub struct MockServer {
    running: bool,
    log: Arc<Mutex<MockServerLog>>,
}

#[async_trait]
impl InferenceServer for MockServer {
    fn endpoint(&self) -> &str {
        "http://mock"
    }

    async fn generate(
        &self,
        prompts: &[String],
        parameters: &GenerateParameters,
    ) -> Result<Vec<String>> {
        lock(&self.log)
            .generate_requests
            .push((prompts.to_vec(), parameters.clone()));
        Ok(prompts.iter().map(|p| format!("{p} ...")).collect())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        lock(&self.log).embed_requests.push(texts.to_vec());
        Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
    }

    async fn close(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            lock(&self.log).closes += 1;
        }
        Ok(())
    }
}
