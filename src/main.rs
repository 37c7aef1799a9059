use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use component::{router::EngineOptions, App, ServerOptions};
use llm::worker::{Worker, WorkerOptions};
use sys::{
    llm::{
        Completion, Embedder, EmbeddingOptions, HttpCompletion, HttpEmbedder, LlmOptions, Prompts,
    },
    memory::MemoryRegistry,
};

mod component;
mod debug_tool;
mod llm;
mod sys;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, short, default_value = "engine.toml")]
    config: PathBuf,

    /// run without a model server, echoing prompts back
    #[arg(long)]
    debug_llm: bool,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct Project {
    #[serde(default)]
    engine: ServerOptions,
    #[serde(default)]
    llm: LlmOptions,
    #[serde(default)]
    embedding: EmbeddingOptions,
    #[serde(default)]
    memory: MemoryOptions,
    #[serde(default)]
    prompts: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct MemoryOptions {
    #[serde(default)]
    dir: String,
    #[serde(default)]
    k: usize,
    #[serde(default)]
    threshold: Option<f32>,
}

impl MemoryOptions {
    fn fill_default_value(&mut self) {
        if self.dir.is_empty() {
            self.dir = "data/memory".to_string();
        }
        if self.k == 0 {
            self.k = 3;
        }
        if self.threshold.is_none() {
            self.threshold = Some(0.5);
        }
    }
}

impl Project {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|_| anyhow::anyhow!("config file `{}` not found", path.display()))?;
        let mut project: Project = toml::from_str(&source)?;
        project.fill_default_value();
        Ok(project)
    }

    fn fill_default_value(&mut self) {
        self.engine.fill_default_value();
        self.llm.fill_default_value();
        self.embedding.fill_default_value();
        self.memory.fill_default_value();
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Args::parse();
    let project = Project::load(&cli.config)?;
    let server = project.engine.clone();

    let (llm, embedder): (Arc<dyn Completion>, Arc<dyn Embedder>) = if cli.debug_llm {
        log::warn!("--debug-llm: using the offline echo model");
        (
            Arc::new(debug_tool::EchoCompletion::new().with_delay(Duration::from_millis(200))),
            Arc::new(debug_tool::HashEmbedder::new(project.embedding.dim)),
        )
    } else {
        (
            Arc::new(HttpCompletion::new(project.llm.clone())?),
            Arc::new(HttpEmbedder::new(project.embedding.clone())?),
        )
    };

    let dim = embedder.dim();
    let worker = Worker {
        llm,
        embedder,
        prompts: Arc::new(Prompts::new(&project.prompts)?),
        options: WorkerOptions {
            threshold: project.memory.threshold.unwrap_or(0.5),
            retries: project.llm.retries,
            retry_backoff: Duration::from_millis(project.llm.retry_backoff_ms),
        },
    };

    let app = App {
        engine: EngineOptions {
            idle_action: server.idle_action.clone(),
            memory_dir: PathBuf::from(&project.memory.dir),
            memory_k: project.memory.k,
            call_deadline: project.llm.deadline(),
        },
        server,
        worker,
        memory: MemoryRegistry::new(dim),
    };

    let res = app.run_loop();
    if let Err(err) = &res {
        log::error!("engine stopped: {err:?}");
    }
    res
}
