use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{SocketAddr, UdpSocket},
    path::PathBuf,
    time::{Duration, Instant},
};

use crossbeam::channel::{Sender, TrySendError};
use serde::Deserialize;
use serde_json::Value;

use super::packet::split_message;
use crate::{
    llm::worker::{Generate, Job, Reply},
    sys::{
        memory::{MemoryRegistry, SharedStore},
        Conversation, ConversationLength, Line, Npc, StateUpdate,
    },
};

const FUNCS: [&str; 8] = [
    "init",
    "wake_up",
    "create_conversation",
    "confirm_conversation_line",
    "re_create_conversation",
    "action_done",
    "talk2npc",
    "close",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "func", rename_all = "snake_case")]
pub enum Request {
    Init(InitRequest),
    WakeUp(WakeUpRequest),
    CreateConversation(CreateConversationRequest),
    ConfirmConversationLine(ConfirmRequest),
    ReCreateConversation(ReCreateRequest),
    ActionDone(ActionDoneRequest),
    Talk2npc(TalkRequest),
    Close,
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub scene_name: String,
    pub language: String,
    #[serde(default)]
    pub npc: Vec<NpcInit>,
    #[serde(default)]
    pub action_space: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpcInit {
    pub name: String,
    #[serde(default, alias = "description")]
    pub desc: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub backpack: Vec<String>,
    #[serde(default)]
    pub memory: Vec<String>,
    #[serde(default)]
    pub action_space: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct WakeUpRequest {
    pub npc_name: String,
    #[serde(default)]
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub npc_state: StateUpdate,
    #[serde(default)]
    pub time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TalkRequest {
    pub npc_name: String,
    #[serde(default)]
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub npc_state: StateUpdate,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub player_name: String,
    pub speech_content: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionDoneRequest {
    pub npc_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(alias = "participants")]
    pub npc: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub starting: Option<String>,
    #[serde(default)]
    pub player_desc: Option<String>,
    #[serde(default)]
    pub memory_k: Option<usize>,
    #[serde(default)]
    pub length: ConversationLength,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub state: HashMap<String, StateUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub conversation_id: String,
    pub index: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReCreateRequest {
    #[serde(alias = "conversation_id")]
    pub id: String,
    #[serde(default)]
    pub character: Option<String>,
    #[serde(default)]
    pub interruption: String,
    #[serde(default)]
    pub player_desc: Option<String>,
    #[serde(default)]
    pub memory_k: Option<usize>,
    #[serde(default)]
    pub length: ConversationLength,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "func", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Action {
        npc_name: &'a str,
        action: &'a str,
        object: &'a str,
        parameters: &'a [String],
    },
    Conversation {
        id: &'a str,
        participants: &'a [String],
        location: &'a str,
        topic: &'a str,
        index: usize,
        length: usize,
        lines: &'a [Line],
        start_time: String,
    },
    ConversationLine {
        id: &'a str,
        index: usize,
        line: &'a Line,
    },
    ConversationEnd {
        id: &'a str,
        end_time: String,
    },
}

/// Where engine output goes. The game only ever sees what passes through here.
pub trait GameLink: Send {
    fn send(&self, message: &Value);
}

pub struct UdpLink {
    pub socket: UdpSocket,
    pub game: SocketAddr,
    pub max_packet_size: usize,
}

impl GameLink for UdpLink {
    fn send(&self, message: &Value) {
        let payload = message.to_string().into_bytes();
        let id = uuid::Uuid::new_v4().simple().to_string();
        for packet in split_message(&id, &payload, self.max_packet_size) {
            if let Err(e) = self.socket.send_to(&packet, self.game) {
                log::warn!("failed to send packet to {}: {e}", self.game);
                return;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub name: String,
    pub language: String,
    pub action_space: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub idle_action: String,
    pub memory_dir: PathBuf,
    pub memory_k: usize,
    pub call_deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum PendingKind {
    Action { npc: String },
    Conversation { id: String },
}

struct Pending {
    kind: PendingKind,
    deadline: Instant,
}

/// All mutable engine state. Owned by the routing thread; workers only see
/// the shared memory stores handed to them inside jobs.
///
/// The routing thread never blocks on the job queue. A model call that cannot
/// be queued fails at the next tick; memory writes wait in `backlog`.
pub struct Engine {
    pub(super) options: EngineOptions,
    pub(super) scene: Option<Scene>,
    pub(super) npcs: HashMap<String, Npc>,
    pub(super) stores: HashMap<String, SharedStore>,
    pub(super) conversations: HashMap<String, Conversation>,
    pub(super) memory: MemoryRegistry,
    pending: HashMap<u64, Pending>,
    next_ticket: u64,
    jobs: Sender<Job>,
    backlog: VecDeque<Job>,
    /// Tickets of queued jobs that still have memories to write.
    writes: HashSet<u64>,
    save_when_written: bool,
    link: Box<dyn GameLink>,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        memory: MemoryRegistry,
        jobs: Sender<Job>,
        link: Box<dyn GameLink>,
    ) -> Self {
        Self {
            options,
            scene: None,
            npcs: HashMap::new(),
            stores: HashMap::new(),
            conversations: HashMap::new(),
            memory,
            pending: HashMap::new(),
            next_ticket: 0,
            jobs,
            backlog: VecDeque::new(),
            writes: HashSet::new(),
            save_when_written: false,
            link,
        }
    }

    pub fn dispatch(&mut self, message: Value) {
        let func = match message.get("func").and_then(Value::as_str) {
            Some(func) if FUNCS.contains(&func) => func.to_string(),
            Some(func) => {
                log::warn!("ignoring message with unknown func `{func}`");
                return;
            }
            None => {
                log::warn!("ignoring message without func: {message}");
                return;
            }
        };

        let request: Request = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("malformed `{func}` message: {e}");
                return;
            }
        };
        log::debug!("dispatching {func}");

        match request {
            Request::Init(req) => self.init(req),
            Request::WakeUp(req) => self.wake_up(req),
            Request::Talk2npc(req) => self.talk(req),
            Request::ActionDone(req) => self.action_done(req),
            Request::CreateConversation(req) => {
                self.create_conversation(req);
            }
            Request::ConfirmConversationLine(req) => self.confirm_line(req),
            Request::ReCreateConversation(req) => self.re_create_conversation(req),
            Request::Close => self.close(),
        }
    }

    /// Continuation for a finished model call.
    pub fn on_reply(&mut self, reply: Reply) {
        let wrote = self.writes.remove(&reply.ticket);
        if wrote {
            self.save_if_written();
        }

        let Some(pending) = self.pending.remove(&reply.ticket) else {
            if !wrote {
                log::debug!("discarding late reply for ticket {}", reply.ticket);
            }
            return;
        };

        let text = match reply.outcome {
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!("model call for {:?} failed: {e}", pending.kind);
                None
            }
        };
        self.resolve(pending.kind, text);
    }

    /// Retries backlogged memory writes, then fails every call whose deadline
    /// has passed.
    pub fn tick(&mut self, now: Instant) {
        self.flush_backlog();

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(ticket, _)| *ticket)
            .collect();

        for ticket in expired {
            if let Some(pending) = self.pending.remove(&ticket) {
                log::warn!("model call for {:?} timed out", pending.kind);
                self.resolve(pending.kind, None);
            }
        }
    }

    fn resolve(&mut self, kind: PendingKind, text: Option<String>) {
        match kind {
            PendingKind::Action { npc } => self.finish_action(&npc, text),
            PendingKind::Conversation { id } => self.finish_conversation(&id, text),
        }
    }

    #[cfg(test)]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Queues a model call. If the queue is full the call is failed at the next
    /// tick, and any memories it carried are written on their own.
    pub(super) fn submit(&mut self, mut job: Generate, kind: PendingKind) -> u64 {
        let ticket = self.ticket();
        job.ticket = ticket;
        let writes = !job.remember.is_empty();

        let mut deadline = Instant::now() + self.options.call_deadline;
        match self.jobs.try_send(Job::Generate(job)) {
            Ok(()) => {
                if writes {
                    self.writes.insert(ticket);
                }
            }
            Err(e) => {
                let reason = if e.is_full() { "full" } else { "closed" };
                log::warn!("job queue {reason}, failing call {ticket} for {kind:?}");
                deadline = Instant::now();
                if let Job::Generate(job) = e.into_inner() {
                    self.remember(job.remember);
                }
            }
        }

        self.pending.insert(ticket, Pending { kind, deadline });
        ticket
    }

    pub(super) fn remember(&mut self, items: Vec<(SharedStore, String)>) {
        if items.is_empty() {
            return;
        }
        let ticket = self.ticket();
        self.writes.insert(ticket);
        self.backlog.push_back(Job::Remember { ticket, items });
        self.flush_backlog();
    }

    fn flush_backlog(&mut self) {
        while let Some(job) = self.backlog.pop_front() {
            match self.jobs.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    log::debug!("job queue full, {} memory jobs waiting", self.backlog.len() + 1);
                    self.backlog.push_front(job);
                    return;
                }
                Err(TrySendError::Disconnected(job)) => {
                    log::error!("worker pool is gone, memories dropped");
                    for job in std::iter::once(job).chain(self.backlog.drain(..)) {
                        if let Job::Remember { ticket, .. } = job {
                            self.writes.remove(&ticket);
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Saves every store now. If memory writes are still outstanding, saves
    /// again when the reply for the last of them arrives.
    pub(super) fn save_memories(&mut self) -> usize {
        let saved = self.memory.save_all();
        self.save_when_written = !self.writes.is_empty();
        if self.save_when_written {
            log::info!(
                "{} memory writes outstanding, saving again once they land",
                self.writes.len()
            );
        }
        saved
    }

    fn save_if_written(&mut self) {
        if self.save_when_written && self.writes.is_empty() {
            self.save_when_written = false;
            let saved = self.memory.save_all();
            log::info!("outstanding memories written, {saved} memory stores saved");
        }
    }

    pub(super) fn emit(&self, message: Outbound) {
        match serde_json::to_value(&message) {
            Ok(value) => self.link.send(&value),
            Err(e) => log::error!("failed to encode outbound message: {e}"),
        }
    }

    pub(super) fn store_path(&self, scene: &str, npc: &str) -> PathBuf {
        let clean = |s: &str| s.replace(['/', '\\', ':'], "_");
        self.options
            .memory_dir
            .join(clean(scene))
            .join(format!("{}.mem", clean(npc)))
    }

    #[cfg(test)]
    pub fn npc(&self, name: &str) -> Option<&Npc> {
        self.npcs.get(name)
    }

    #[cfg(test)]
    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, sync::Arc};

    use crossbeam::channel::{Receiver, Sender};

    use super::*;
    use crate::{
        debug_tool::{EchoCompletion, HashEmbedder},
        llm::worker::{Worker, WorkerOptions},
        sys::llm::Prompts,
    };

    impl GameLink for Sender<Value> {
        fn send(&self, message: &Value) {
            let _ = Sender::send(self, message.clone());
        }
    }

    /// Engine wired to one in-thread worker with a scripted model.
    pub struct Harness {
        pub engine: Engine,
        pub worker: Worker,
        pub jobs: Receiver<Job>,
        pub out: Receiver<Value>,
        pub llm: Arc<EchoCompletion>,
        pub dir: tempfile::TempDir,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_queue(None)
        }

        /// Harness whose job queue holds at most `capacity` jobs.
        pub fn with_queue(capacity: Option<usize>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (job_tx, jobs) = match capacity {
                Some(n) => crossbeam::channel::bounded(n),
                None => crossbeam::channel::unbounded(),
            };
            let (out_tx, out) = crossbeam::channel::unbounded();
            let llm = Arc::new(EchoCompletion::new());
            let worker = Worker {
                llm: llm.clone(),
                embedder: Arc::new(HashEmbedder::new(32)),
                prompts: Arc::new(Prompts::new(&HashMap::new()).unwrap()),
                options: WorkerOptions {
                    threshold: 0.0,
                    retries: 0,
                    retry_backoff: Duration::from_millis(1),
                },
            };
            let engine = Engine::new(
                EngineOptions {
                    idle_action: "idle".to_string(),
                    memory_dir: dir.path().to_path_buf(),
                    memory_k: 3,
                    call_deadline: Duration::from_secs(30),
                },
                MemoryRegistry::new(32),
                job_tx,
                Box::new(out_tx),
            );
            Self {
                engine,
                worker,
                jobs,
                out,
                llm,
                dir,
            }
        }

        /// Runs every queued job on this thread and feeds replies back.
        pub fn run_jobs(&mut self) -> usize {
            let mut generated = 0;
            while let Ok(job) = self.jobs.try_recv() {
                let generate = matches!(job, Job::Generate(_));
                self.engine.on_reply(self.worker.run(job));
                if generate {
                    generated += 1;
                }
            }
            generated
        }

        pub fn sent(&self) -> Vec<Value> {
            self.out.try_iter().collect()
        }

        pub fn init(&mut self) {
            self.engine.dispatch(serde_json::json!({
                "func": "init",
                "scene_name": "village",
                "language": "C",
                "action_space": ["mov", "chat", "take", "idle"],
                "npc": [
                    {"name": "王大妈", "desc": "热心的邻居", "mood": "开心", "location": "菜市场",
                     "memory": ["昨天给李大爷送了桃子"]},
                    {"name": "李大爷", "desc": "退休的老师", "mood": "平静", "location": "李大爷家"}
                ]
            }));
            self.run_jobs();
        }
    }

    #[test]
    fn unknown_and_malformed_messages_are_ignored() {
        let mut h = Harness::new();
        h.engine.dispatch(serde_json::json!({"func": "dance"}));
        h.engine.dispatch(serde_json::json!({"no": "func"}));
        h.engine.dispatch(serde_json::json!([1, 2, 3]));
        // init without the required language
        h.engine
            .dispatch(serde_json::json!({"func": "init", "scene_name": "x"}));
        assert!(h.engine.scene.is_none());
        assert_eq!(h.run_jobs(), 0);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn request_tags_match_wire_names() {
        for func in FUNCS {
            let parsed = serde_json::from_value::<Request>(serde_json::json!({"func": func}));
            // every known func is a variant, even if its body is missing
            if let Err(e) = parsed {
                assert!(!e.to_string().contains("unknown variant"), "{func}: {e}");
            }
        }
    }

    #[test]
    fn expired_calls_resolve_as_failures_and_late_replies_are_dropped() {
        let mut h = Harness::new();
        h.init();
        h.engine
            .dispatch(serde_json::json!({"func": "wake_up", "npc_name": "李大爷"}));
        assert_eq!(h.engine.pending_calls(), 1);

        h.engine.tick(Instant::now() + Duration::from_secs(60));
        assert_eq!(h.engine.pending_calls(), 0);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["func"], "action");
        assert_eq!(sent[0]["action"], "idle");

        h.llm.push("<chat|王大妈|你好>");
        assert_eq!(h.run_jobs(), 1);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn store_paths_are_per_scene_and_npc() {
        let h = Harness::new();
        let path = h.engine.store_path("village", "a/b");
        assert_eq!(path, h.dir.path().join("village").join("a_b.mem"));
    }

    #[test]
    fn full_job_queue_fails_calls_without_blocking() {
        let mut h = Harness::with_queue(Some(1));
        h.init();

        h.engine
            .dispatch(serde_json::json!({"func": "wake_up", "npc_name": "王大妈"}));
        // the queue is full, this call fails on the next tick
        h.engine
            .dispatch(serde_json::json!({"func": "wake_up", "npc_name": "李大爷"}));
        h.engine.tick(Instant::now());
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["npc_name"], "李大爷");
        assert_eq!(sent[0]["action"], "idle");

        // the memory this call carried waits in the backlog
        h.engine.dispatch(serde_json::json!({
            "func": "talk2npc", "npc_name": "李大爷", "player_name": "小明", "speech_content": "早"
        }));
        assert_eq!(h.engine.pending_calls(), 2);

        h.llm.push("<chat|李大爷|早>");
        assert_eq!(h.run_jobs(), 1);
        h.engine.tick(Instant::now());
        assert_eq!(h.engine.pending_calls(), 0);
        assert_eq!(h.run_jobs(), 0);
        assert_eq!(h.engine.stores["李大爷"].lock().len(), 1);

        let actions: Vec<Value> = h
            .sent()
            .into_iter()
            .map(|m| m["action"].clone())
            .collect();
        assert_eq!(
            actions,
            vec![serde_json::json!("chat"), serde_json::json!("idle")]
        );
    }
}
