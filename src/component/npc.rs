//! NPC lifecycle: dormant -> awake -> acting -> awake ... -> dormant.
//!
//! An NPC is owned by at most one model call at a time. Events that arrive
//! while a call is in flight wait in the NPC's queue and are replayed in
//! arrival order once the call resolves.

use std::collections::VecDeque;

use serde_json::{json, Value};

use super::{
    parser::parse_action,
    router::{
        ActionDoneRequest, Engine, InitRequest, NpcInit, Outbound, PendingKind, Scene,
        TalkRequest, WakeUpRequest,
    },
};
use crate::{
    llm::worker::{Generate, Recall},
    sys::{
        llm::{language_name, ACTION_TEMPLATE},
        Action, ActionOutcome, Npc, NpcEvent, NpcState, Observation, StateUpdate, Stimulus,
    },
};

impl Npc {
    pub fn new(init: NpcInit, scene_actions: &[String]) -> Self {
        let mut action_space = init.action_space;
        for action in scene_actions {
            if !action_space.contains(action) {
                action_space.push(action.clone());
            }
        }

        Self {
            name: init.name,
            description: init.desc,
            mood: init.mood,
            location: init.location,
            position: None,
            backpack: init.backpack,
            memory: init.memory,
            action_space,
            observation: Observation::default(),
            state: NpcState::Dormant,
            last_action: None,
            in_flight: None,
            pending: VecDeque::new(),
        }
    }

    pub fn busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// An empty action space allows anything.
    pub fn allows(&self, action: &str) -> bool {
        self.action_space.is_empty() || self.action_space.iter().any(|a| a == action)
    }

    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(position) = &update.position {
            self.position = Some(position.clone());
        }
        if let Some(observation) = &update.observation {
            self.observation = observation.clone();
        }
        if let Some(backpack) = &update.backpack {
            self.backpack = backpack.clone();
        }
        if let Some(scenario) = &update.scenario {
            self.location = scenario.clone();
        }
    }

    pub fn act(&mut self, action: Action) {
        self.state = NpcState::Acting;
        self.last_action = Some(action);
    }

    /// Records the result of the last action and returns it as a memory.
    pub fn finish(&mut self, outcome: &ActionOutcome) -> String {
        let memory = outcome_memory(outcome);
        self.memory.push(memory.clone());
        self.state = NpcState::Awake;
        memory
    }

    pub fn sleep(&mut self) {
        self.state = NpcState::Dormant;
        self.pending.clear();
    }

    fn prompt_context(&self, scene: &Scene, stimulus: &Stimulus, time: Option<&str>) -> Value {
        json!({
            "name": self.name,
            "scene": scene.name,
            "language": language_name(&scene.language),
            "description": self.description,
            "mood": self.mood,
            "location": self.location,
            "position": self.position,
            "time": time,
            "observation": self.observation,
            "backpack": self.backpack,
            "action_space": self.action_space,
            "last_action": self.last_action,
            "stimulus": stimulus.describe(),
        })
    }

    fn recall_query(&self, stimulus: &Stimulus) -> String {
        let mut query = stimulus.describe();
        for person in &self.observation.people {
            query.push(' ');
            query.push_str(person);
        }
        query
    }
}

pub fn outcome_memory(outcome: &ActionOutcome) -> String {
    let mut memory = String::new();
    if let Some(time) = &outcome.time {
        memory.push_str(time);
        memory.push_str(": ");
    }
    memory.push_str(&format!("I did `{}`", outcome.action));
    if !outcome.object.is_empty() {
        memory.push_str(&format!(" on {}", outcome.object));
    }
    let parameters: Vec<&str> = outcome
        .parameters
        .iter()
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .collect();
    if !parameters.is_empty() {
        memory.push_str(&format!(" with {}", parameters.join(", ")));
    }
    if outcome.success {
        memory.push_str(" and it worked.");
    } else if outcome.reason.is_empty() {
        memory.push_str(" but it failed.");
    } else {
        memory.push_str(&format!(" but it failed because {}.", outcome.reason));
    }
    memory
}

fn with_context(
    mut update: StateUpdate,
    scenario: Option<String>,
    time: Option<String>,
) -> StateUpdate {
    update.scenario = scenario;
    update.time = time;
    update
}

impl Engine {
    pub(super) fn init(&mut self, req: InitRequest) {
        let scene = Scene {
            name: req.scene_name,
            language: req.language,
            action_space: req.action_space,
        };

        let mut stores = Vec::with_capacity(req.npc.len());
        for npc in &req.npc {
            let path = self.store_path(&scene.name, &npc.name);
            match self.memory.open(&path) {
                Ok(store) => stores.push(store),
                Err(e) => {
                    log::error!("init of scene `{}` aborted: {e}", scene.name);
                    return;
                }
            }
        }

        let mut remember = vec![];
        for (init, store) in req.npc.into_iter().zip(stores) {
            let npc = Npc::new(init, &scene.action_space);
            remember.extend(npc.memory.iter().map(|m| (store.clone(), m.clone())));
            self.stores.insert(npc.name.clone(), store);
            self.npcs.insert(npc.name.clone(), npc);
        }
        self.remember(remember);

        log::info!(
            "scene `{}` ({}) initialised with {} npcs",
            scene.name,
            scene.language,
            self.npcs.len()
        );
        self.scene = Some(scene);
    }

    /// Makes sure `name` exists, creating a blank NPC for unseen names.
    fn ensure_npc(&mut self, name: &str) -> bool {
        if self.npcs.contains_key(name) {
            return true;
        }
        let Some(scene) = &self.scene else {
            log::warn!("ignoring event for `{name}` before init");
            return false;
        };

        let path = self.store_path(&scene.name, name);
        let store = match self.memory.open(&path) {
            Ok(store) => store,
            Err(e) => {
                log::error!("cannot open memory for `{name}`: {e}");
                return false;
            }
        };
        let init = NpcInit {
            name: name.to_string(),
            ..NpcInit::default()
        };
        let npc = Npc::new(init, &scene.action_space);
        log::info!("new npc `{name}` joined the scene");
        self.stores.insert(name.to_string(), store);
        self.npcs.insert(name.to_string(), npc);
        true
    }

    pub(super) fn wake_up(&mut self, req: WakeUpRequest) {
        if !self.ensure_npc(&req.npc_name) {
            return;
        }
        let update = with_context(req.npc_state, req.scenario_name, req.time);
        self.npc_event(&req.npc_name, NpcEvent::Wake { update });
    }

    pub(super) fn talk(&mut self, req: TalkRequest) {
        if !self.ensure_npc(&req.npc_name) {
            return;
        }
        let update = with_context(req.npc_state, req.scenario_name, req.time);
        let player = if req.player_name.is_empty() {
            "The player".to_string()
        } else {
            req.player_name
        };
        let event = NpcEvent::Talk {
            update,
            player,
            speech: req.speech_content,
        };
        self.npc_event(&req.npc_name, event);
    }

    pub(super) fn action_done(&mut self, req: ActionDoneRequest) {
        if !self.npcs.contains_key(&req.npc_name) {
            log::warn!("action_done for unknown npc `{}`", req.npc_name);
            return;
        }
        let outcome = ActionOutcome {
            success: req.status.eq_ignore_ascii_case("success"),
            action: req.action,
            object: req.object,
            parameters: req.parameters,
            reason: req.reason,
            time: req.time,
        };
        self.npc_event(&req.npc_name, NpcEvent::Done { outcome });
    }

    pub(super) fn close(&mut self) {
        for npc in self.npcs.values_mut() {
            npc.sleep();
        }
        let saved = self.save_memories();
        log::info!(
            "closed: {} npcs dormant, {saved} memory stores saved",
            self.npcs.len()
        );
    }

    fn npc_event(&mut self, name: &str, event: NpcEvent) {
        let Some(npc) = self.npcs.get_mut(name) else {
            return;
        };
        if npc.busy() {
            log::debug!("`{name}` is busy, queueing {event:?}");
            npc.pending.push_back(event);
            return;
        }
        self.handle_npc_event(name, event);
    }

    fn handle_npc_event(&mut self, name: &str, event: NpcEvent) {
        let Some(npc) = self.npcs.get_mut(name) else {
            return;
        };

        let (stimulus, time, remember) = match event {
            NpcEvent::Wake { update } => {
                npc.apply(&update);
                (Stimulus::Drive, update.time, None)
            }
            NpcEvent::Talk {
                update,
                player,
                speech,
            } => {
                npc.apply(&update);
                let memory = format!("{player} said to me: {speech}");
                npc.memory.push(memory.clone());
                let stimulus = Stimulus::Speech {
                    speaker: player,
                    content: speech,
                };
                (stimulus, update.time, Some(memory))
            }
            NpcEvent::Done { outcome } => {
                if npc.state == NpcState::Dormant {
                    log::warn!("`{name}` is dormant, dropping stale action_done");
                    return;
                }
                let memory = npc.finish(&outcome);
                let time = outcome.time.clone();
                (Stimulus::Outcome { memory: memory.clone() }, time, Some(memory))
            }
        };

        npc.state = NpcState::Awake;
        log::info!("`{name}` is awake");
        self.request_action(name, stimulus, time, remember);
    }

    fn request_action(
        &mut self,
        name: &str,
        stimulus: Stimulus,
        time: Option<String>,
        remember: Option<String>,
    ) {
        let (Some(npc), Some(scene)) = (self.npcs.get(name), &self.scene) else {
            return;
        };
        let context = npc.prompt_context(scene, &stimulus, time.as_deref());
        let query = npc.recall_query(&stimulus);

        let store = self.stores.get(name).cloned();
        let job = Generate {
            ticket: 0,
            remember: match (&store, remember) {
                (Some(store), Some(memory)) => vec![(store.clone(), memory)],
                _ => vec![],
            },
            recall: store
                .into_iter()
                .map(|store| Recall {
                    store,
                    query: query.clone(),
                    k: self.options.memory_k,
                    target: String::new(),
                })
                .collect(),
            template: ACTION_TEMPLATE,
            context,
        };

        let ticket = self.submit(job, PendingKind::Action { npc: name.to_string() });
        if let Some(npc) = self.npcs.get_mut(name) {
            npc.in_flight = Some(ticket);
        }
    }

    pub(super) fn finish_action(&mut self, name: &str, text: Option<String>) {
        let idle = Action::idle(&self.options.idle_action);
        let Some(npc) = self.npcs.get_mut(name) else {
            return;
        };
        npc.in_flight = None;

        let action = match text {
            Some(text) => {
                let action = parse_action(&text);
                if action.is_empty() {
                    log::warn!("no action in model output for `{name}`: {text:?}");
                    idle
                } else if !npc.allows(&action.action) {
                    log::warn!(
                        "`{name}` chose `{}` outside its action space: {text:?}",
                        action.action
                    );
                    idle
                } else {
                    action
                }
            }
            None => idle,
        };

        if npc.state == NpcState::Dormant {
            log::info!("`{name}` went dormant while thinking, dropping {action:?}");
        } else {
            log::info!("`{name}` acts: {action:?}");
            npc.act(action.clone());
            self.emit(Outbound::Action {
                npc_name: name,
                action: &action.action,
                object: &action.object,
                parameters: &action.parameters,
            });
        }

        self.drain(name);
    }

    fn drain(&mut self, name: &str) {
        loop {
            let Some(npc) = self.npcs.get_mut(name) else {
                return;
            };
            if npc.busy() {
                return;
            }
            let Some(event) = npc.pending.pop_front() else {
                return;
            };
            self.handle_npc_event(name, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{
        component::router::tests::Harness,
        sys::{llm::Prompts, memory::MemoryStore},
    };

    #[test]
    fn init_creates_dormant_npcs_and_stores_memories() {
        let mut h = Harness::new();
        h.init();
        let npc = h.engine.npc("王大妈").unwrap();
        assert_eq!(npc.state, NpcState::Dormant);
        assert_eq!(npc.memory, vec!["昨天给李大爷送了桃子".to_string()]);
        assert!(npc.allows("mov"));
        assert!(!npc.allows("fly"));
        assert_eq!(h.engine.stores["王大妈"].lock().len(), 1);
        assert_eq!(h.engine.stores["李大爷"].lock().len(), 0);
    }

    #[test]
    fn wake_up_emits_parsed_action() {
        let mut h = Harness::new();
        h.init();
        h.llm.push("我想去找李大爷。<mov｜李大爷家｜>");
        h.engine.dispatch(json!({
            "func": "wake_up",
            "npc_name": "王大妈",
            "scenario_name": "菜市场",
            "npc_state": {
                "position": {"x": 1, "y": 2, "z": 3},
                "observation": {"people": ["卖瓜的"], "items": ["西瓜"], "locations": ["李大爷家"]},
                "backpack": ["桃子"]
            },
            "time": "08:00"
        }));
        assert_eq!(h.engine.npc("王大妈").unwrap().state, NpcState::Awake);
        assert_eq!(h.run_jobs(), 1);

        let sent = h.sent();
        assert_eq!(
            sent,
            vec![json!({
                "func": "action",
                "npc_name": "王大妈",
                "action": "mov",
                "object": "李大爷家",
                "parameters": [""]
            })]
        );
        let npc = h.engine.npc("王大妈").unwrap();
        assert_eq!(npc.state, NpcState::Acting);
        assert_eq!(npc.backpack, vec!["桃子".to_string()]);
        assert_eq!(npc.observation.items, vec!["西瓜".to_string()]);
        assert!(!npc.busy());
    }

    #[test]
    fn unusable_output_becomes_idle() {
        let mut h = Harness::new();
        h.init();
        h.llm.push("I am not sure what to do.");
        h.llm.push("<fly|moon|>");
        h.llm.push_failure();

        for _ in 0..3 {
            h.engine
                .dispatch(json!({"func": "wake_up", "npc_name": "李大爷"}));
            h.run_jobs();
        }
        let actions: Vec<Value> = h.sent().into_iter().map(|m| m["action"].clone()).collect();
        assert_eq!(actions, vec![json!("idle"), json!("idle"), json!("idle")]);
    }

    #[test]
    fn action_done_remembers_and_continues() {
        let mut h = Harness::new();
        h.init();
        h.llm.push("<take|箱子|西瓜汁，桃子>");
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "李大爷"}));
        h.run_jobs();

        h.llm.push("<chat|王大妈|要不要喝西瓜汁>");
        h.engine.dispatch(json!({
            "func": "action_done",
            "npc_name": "李大爷",
            "status": "fail",
            "action": "take",
            "object": "箱子",
            "parameters": ["西瓜汁", "桃子"],
            "reason": "箱子是锁着的",
            "time": "09:00"
        }));
        h.run_jobs();

        let npc = h.engine.npc("李大爷").unwrap();
        assert_eq!(
            npc.memory.last().unwrap(),
            "09:00: I did `take` on 箱子 with 西瓜汁, 桃子 but it failed because 箱子是锁着的."
        );
        assert_eq!(h.engine.stores["李大爷"].lock().len(), 1);
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["action"], "chat");
        assert_eq!(sent[1]["object"], "王大妈");
    }

    #[test]
    fn events_queue_behind_in_flight_call() {
        let mut h = Harness::new();
        h.init();
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "李大爷"}));
        h.engine.dispatch(json!({
            "func": "action_done", "npc_name": "李大爷", "status": "success", "action": "idle"
        }));
        h.engine.dispatch(json!({
            "func": "talk2npc", "npc_name": "李大爷", "player_name": "小明", "speech_content": "你好"
        }));

        let npc = h.engine.npc("李大爷").unwrap();
        assert!(npc.busy());
        assert_eq!(npc.pending.len(), 2);
        assert_eq!(h.engine.pending_calls(), 1);

        h.llm.push("<idle|none|>");
        h.llm.push("<idle|none|>");
        h.llm.push("<chat|小明|你好啊>");
        // each resolved call releases the next queued event
        assert_eq!(h.run_jobs(), 3);

        let npc = h.engine.npc("李大爷").unwrap();
        assert!(npc.pending.is_empty());
        assert_eq!(npc.memory.len(), 2);
        assert_eq!(npc.memory[1], "小明 said to me: 你好");
        let sent = h.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2]["parameters"], json!(["你好啊"]));
    }

    #[test]
    fn close_puts_everyone_to_sleep_and_saves() {
        let mut h = Harness::new();
        h.init();
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "王大妈"}));
        h.engine.dispatch(json!({"func": "close"}));

        assert!(h
            .engine
            .npcs
            .values()
            .all(|npc| npc.state == NpcState::Dormant));
        assert!(h.dir.path().join("village").join("王大妈.mem").exists());

        // the reply for the call made before close is not forwarded
        h.llm.push("<mov|home|>");
        h.run_jobs();
        assert!(h.sent().is_empty());

        // stale action_done is ignored
        h.engine.dispatch(json!({
            "func": "action_done", "npc_name": "王大妈", "status": "success", "action": "mov"
        }));
        assert_eq!(h.run_jobs(), 0);
    }

    #[test]
    fn close_saves_memories_still_queued() {
        let mut h = Harness::new();
        h.init();
        h.llm.push("<idle|none|>");
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "李大爷"}));
        h.run_jobs();
        h.engine.dispatch(json!({
            "func": "action_done", "npc_name": "李大爷", "status": "success", "action": "idle"
        }));
        h.engine.dispatch(json!({"func": "close"}));

        let path = h.engine.store_path("village", "李大爷");
        assert_eq!(MemoryStore::open(&path, 32).unwrap().len(), 0);

        // the outcome memory lands after close and is saved then
        h.run_jobs();
        assert_eq!(MemoryStore::open(&path, 32).unwrap().len(), 1);
    }

    #[test]
    fn previous_action_reaches_the_prompt() {
        let mut h = Harness::new();
        h.init();
        h.llm.push("<take|箱子|>");
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "李大爷"}));
        h.run_jobs();

        let npc = h.engine.npc("李大爷").unwrap();
        let scene = h.engine.scene.as_ref().unwrap();
        let data = npc.prompt_context(scene, &Stimulus::Drive, None);
        let prompt = Prompts::new(&HashMap::new())
            .unwrap()
            .render(ACTION_TEMPLATE, &data)
            .unwrap();
        assert!(prompt.contains("Your previous action: take 箱子."));
    }

    #[test]
    fn unknown_npc_is_created_on_wake_up_after_init() {
        let mut h = Harness::new();
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "路人"}));
        assert!(h.engine.npc("路人").is_none());

        h.init();
        h.engine
            .dispatch(json!({"func": "wake_up", "npc_name": "路人"}));
        let npc = h.engine.npc("路人").unwrap();
        assert_eq!(npc.state, NpcState::Awake);
        assert!(npc.allows("chat"));
    }

    #[test]
    fn outcome_memory_reads_naturally() {
        let outcome = ActionOutcome {
            success: true,
            action: "mov".to_string(),
            object: "李大爷家".to_string(),
            parameters: vec!["".to_string()],
            ..ActionOutcome::default()
        };
        assert_eq!(outcome_memory(&outcome), "I did `mov` on 李大爷家 and it worked.");
    }
}
