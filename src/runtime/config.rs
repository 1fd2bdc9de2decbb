use crate::common::*;
use crate::runtime::logging::{DummyLogger, FileLogger, VecLogger};
use std::path::PathBuf;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LogConfig {
    Disabled,
    // kept in memory, dumped to stderr when the process's logger drops
    Memory,
    File(PathBuf),
}

/// Settings of one runtime process.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProcessConfig {
    pub process_name: String,
    // size of the worker pool every logical thread of the process runs on
    pub worker_threads: usize,
    pub log: LogConfig,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self { process_name: "process".into(), worker_threads: 4, log: LogConfig::Memory }
    }
}
impl ProcessConfig {
    pub fn named(process_name: impl Into<String>) -> Self {
        Self { process_name: process_name.into(), ..Default::default() }
    }
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
    pub fn build_runtime(&self) -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads.max(1))
            .thread_name(format!("{}-worker", self.process_name))
            .enable_time()
            .build()
    }
    pub fn make_logger(&self) -> std::io::Result<Box<dyn Logger>> {
        Ok(match &self.log {
            LogConfig::Disabled => Box::new(DummyLogger),
            LogConfig::Memory => Box::new(VecLogger::new(self.process_name.clone())),
            LogConfig::File(path) => {
                let file = std::fs::File::create(path)?;
                Box::new(FileLogger::new(self.process_name.clone(), file))
            }
        })
    }
}
