use std::{sync::Arc, thread::JoinHandle, time::Duration};

use crossbeam::channel::{Receiver, Sender};
use serde_json::Value;

use crate::sys::{
    llm::{Completion, Content, Embedder, LlmError, Prompts},
    memory::SharedStore,
};

const SYSTEM_PROMPT: &str = "You are the mind of characters living in a game world. \
    Follow the requested output format exactly.";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("prompt rendering failed: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Memories to look up before rendering, written as a `memories` array into
/// the object at the JSON pointer `target` of the prompt context.
pub struct Recall {
    pub store: SharedStore,
    pub query: String,
    pub k: usize,
    pub target: String,
}

pub struct Generate {
    pub ticket: u64,
    /// Stored before recall so the model sees the newest memory.
    pub remember: Vec<(SharedStore, String)>,
    pub recall: Vec<Recall>,
    pub template: &'static str,
    pub context: Value,
}

pub enum Job {
    Remember {
        ticket: u64,
        items: Vec<(SharedStore, String)>,
    },
    Generate(Generate),
}

#[derive(Debug)]
pub struct Reply {
    pub ticket: u64,
    pub outcome: Result<String, JobError>,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub threshold: f32,
    pub retries: u32,
    pub retry_backoff: Duration,
}

#[derive(Clone)]
pub struct Worker {
    pub llm: Arc<dyn Completion>,
    pub embedder: Arc<dyn Embedder>,
    pub prompts: Arc<Prompts>,
    pub options: WorkerOptions,
}

impl Worker {
    fn remember(&self, items: &[(SharedStore, String)]) {
        for (store, text) in items {
            let vector = match self.embedder.embed(text) {
                Ok(vector) => vector,
                Err(e) => {
                    log::warn!("failed to embed memory {text:?}: {e}");
                    continue;
                }
            };
            if let Err(e) = store.lock().remember(text, vector) {
                log::error!("failed to store memory {text:?}: {e}");
            }
        }
    }

    fn recall(&self, recall: &Recall) -> Vec<String> {
        if recall.k == 0 {
            return vec![];
        }
        let vector = match self.embedder.embed(&recall.query) {
            Ok(vector) => vector,
            Err(e) => {
                log::warn!("failed to embed query {:?}: {e}", recall.query);
                return vec![];
            }
        };
        let recalled = recall
            .store
            .lock()
            .recall(&vector, recall.k, self.options.threshold);
        match recalled {
            Ok(memories) => memories,
            Err(e) => {
                log::error!("memory search failed: {e}");
                vec![]
            }
        }
    }

    /// `retry_backoff * 2^attempt`, saturating instead of overflowing.
    fn backoff(&self, attempt: u32) -> Duration {
        self.options
            .retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    fn complete(&self, prompt: String) -> Result<String, LlmError> {
        let prompts = [Content::system(SYSTEM_PROMPT), Content::user(prompt)];
        let mut attempt = 0;
        loop {
            match self.llm.complete(&prompts) {
                Ok(text) => {
                    log::debug!("completion:\n{text}");
                    return Ok(text);
                }
                Err(e) if attempt < self.options.retries => {
                    let backoff = self.backoff(attempt);
                    log::warn!("model call failed ({e}), retrying in {backoff:?}");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn generate(&self, mut job: Generate) -> Reply {
        self.remember(&job.remember);

        for recall in &job.recall {
            let memories = self.recall(recall);
            match job
                .context
                .pointer_mut(&recall.target)
                .and_then(Value::as_object_mut)
            {
                Some(slot) => {
                    slot.insert("memories".to_string(), memories.into());
                }
                None => log::warn!("prompt context has no object at {}", recall.target),
            }
        }

        let outcome = self
            .prompts
            .render(job.template, &job.context)
            .map_err(JobError::from)
            .and_then(|prompt| Ok(self.complete(prompt)?));

        Reply {
            ticket: job.ticket,
            outcome,
        }
    }

    /// Runs one job. A memory write replies with empty text once it is stored.
    pub fn run(&self, job: Job) -> Reply {
        match job {
            Job::Remember { ticket, items } => {
                self.remember(&items);
                Reply {
                    ticket,
                    outcome: Ok(String::new()),
                }
            }
            Job::Generate(job) => self.generate(job),
        }
    }

    pub fn run_loop(&self, rx: Receiver<Job>, tx: Sender<Reply>) {
        while let Ok(job) = rx.recv() {
            if tx.send(self.run(job)).is_err() {
                break;
            }
        }
        log::debug!("worker {:?} exiting", std::thread::current().name());
    }
}

/// Starts `n` workers sharing one job queue.
pub fn spawn_pool(
    n: usize,
    worker: Worker,
    rx: Receiver<Job>,
    tx: Sender<Reply>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..n.max(1))
        .map(|i| {
            let worker = worker.clone();
            let rx = rx.clone();
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("llm-worker-{i}"))
                .spawn(move || worker.run_loop(rx, tx))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        debug_tool::{EchoCompletion, HashEmbedder},
        sys::memory::MemoryStore,
    };

    fn worker(llm: EchoCompletion, retries: u32) -> Worker {
        let overrides = HashMap::from([(
            "action".to_string(),
            "{{name}} remembers {{#each memories}}[{{this}}]{{/each}}".to_string(),
        )]);
        Worker {
            llm: Arc::new(llm),
            embedder: Arc::new(HashEmbedder::new(32)),
            prompts: Arc::new(Prompts::new(&overrides).unwrap()),
            options: WorkerOptions {
                threshold: 0.1,
                retries,
                retry_backoff: Duration::from_millis(1),
            },
        }
    }

    #[test]
    fn remembers_before_recalling() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(
            MemoryStore::open(dir.path().join("a.mem"), 32).unwrap(),
        ));
        let w = worker(EchoCompletion::new(), 0);

        let reply = w.generate(Generate {
            ticket: 7,
            remember: vec![(store.clone(), "drank watermelon juice".to_string())],
            recall: vec![Recall {
                store: store.clone(),
                query: "watermelon juice".to_string(),
                k: 3,
                target: String::new(),
            }],
            template: "action",
            context: serde_json::json!({"name": "Wang"}),
        });

        assert_eq!(reply.ticket, 7);
        assert_eq!(
            reply.outcome.unwrap(),
            "Wang remembers [drank watermelon juice]"
        );
        assert_eq!(store.lock().len(), 1);
    }

    #[test]
    fn retries_then_gives_up() {
        let llm = EchoCompletion::new();
        llm.push_failure();
        llm.push("<chat|a|b>");
        let w = worker(llm, 1);
        let job = || Generate {
            ticket: 1,
            remember: vec![],
            recall: vec![],
            template: "action",
            context: serde_json::json!({"name": "Li"}),
        };
        assert_eq!(w.generate(job()).outcome.unwrap(), "<chat|a|b>");

        let llm = EchoCompletion::new();
        llm.push_failure();
        llm.push_failure();
        let w = worker(llm, 1);
        assert!(matches!(
            w.generate(job()).outcome,
            Err(JobError::Llm(LlmError::Http(_)))
        ));
    }

    #[test]
    fn backoff_saturates_for_large_attempts() {
        let w = worker(EchoCompletion::new(), 0);
        assert_eq!(w.backoff(0), Duration::from_millis(1));
        assert_eq!(w.backoff(3), Duration::from_millis(8));
        assert!(w.backoff(40) >= w.backoff(31));
        assert_eq!(w.backoff(u32::MAX), w.backoff(64));
    }

    #[test]
    fn memory_jobs_reply_after_storing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(
            MemoryStore::open(dir.path().join("a.mem"), 32).unwrap(),
        ));
        let w = worker(EchoCompletion::new(), 0);
        let reply = w.run(Job::Remember {
            ticket: 9,
            items: vec![(store.clone(), "sold peaches".to_string())],
        });
        assert_eq!(reply.ticket, 9);
        assert_eq!(reply.outcome.unwrap(), "");
        assert_eq!(store.lock().len(), 1);
    }

    #[test]
    fn pool_answers_over_channels() {
        let (job_tx, job_rx) = crossbeam::channel::unbounded();
        let (reply_tx, reply_rx) = crossbeam::channel::unbounded();
        let handles = spawn_pool(2, worker(EchoCompletion::new(), 0), job_rx, reply_tx).unwrap();

        for ticket in 0..4 {
            job_tx
                .send(Job::Generate(Generate {
                    ticket,
                    remember: vec![],
                    recall: vec![],
                    template: "action",
                    context: serde_json::json!({"name": ticket}),
                }))
                .unwrap();
        }
        let mut tickets: Vec<u64> = (0..4)
            .map(|_| reply_rx.recv_timeout(Duration::from_secs(5)).unwrap().ticket)
            .collect();
        tickets.sort();
        assert_eq!(tickets, vec![0, 1, 2, 3]);

        drop(job_tx);
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
