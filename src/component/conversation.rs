//! Scripted multi-NPC conversations, delivered to the game and then paged
//! through line by line as the game confirms what has been shown.

use chrono::Local;
use serde_json::{json, Value};

use super::{
    parser::parse_lines,
    router::{
        ConfirmRequest, CreateConversationRequest, Engine, Outbound, PendingKind,
        ReCreateRequest,
    },
};
use crate::{
    llm::worker::{Generate, Recall},
    sys::{
        llm::{language_name, CONVERSATION_TEMPLATE, RE_CONVERSATION_TEMPLATE},
        Conversation, Line,
    },
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl Conversation {
    pub fn new(
        participants: Vec<String>,
        topic: String,
        location: String,
        stream: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            participants,
            topic,
            location,
            lines: vec![],
            current_index: 0,
            start_time: Local::now(),
            end_time: None,
            stream,
            memory_buffer: vec![],
            in_flight: None,
        }
    }

    /// Moves the cursor forward to `index`, buffering the lines passed over.
    /// Going backwards is a no-op. Returns whether the conversation ended.
    pub fn confirm(&mut self, index: usize) -> bool {
        let index = index.min(self.lines.len());
        if index <= self.current_index {
            return self.ended();
        }

        for line in &self.lines[self.current_index..index] {
            self.memory_buffer.push(line.transcript());
        }
        self.current_index = index;

        if self.current_index == self.lines.len() && self.in_flight.is_none() {
            self.end_time = Some(Local::now());
        }
        self.ended()
    }

    /// Drops every unconfirmed line and records the interruption. Returns the
    /// transcript so far, which seeds the regenerated tail.
    pub fn interrupt(&mut self, character: Option<&str>, interruption: &str) -> Vec<String> {
        let history = self.memory_buffer.clone();
        self.lines.truncate(self.current_index);
        if !interruption.is_empty() {
            let speaker = character.unwrap_or("Someone");
            self.memory_buffer.push(format!("{speaker}: {interruption}"));
        }
        history
    }

    /// Appends freshly generated lines, keeping only those spoken by a
    /// participant. Returns the index of the first new line.
    pub fn extend(&mut self, lines: Vec<Line>) -> usize {
        let index = self.lines.len();
        let before = lines.len();
        self.lines.extend(
            lines
                .into_iter()
                .filter(|line| self.participants.contains(&line.speaker)),
        );
        let dropped = before - (self.lines.len() - index);
        if dropped > 0 {
            log::warn!(
                "dropped {dropped} lines from non-participants in conversation {}",
                self.id
            );
        }
        index
    }
}

impl Engine {
    fn participants_context(
        &self,
        names: &[String],
        k: usize,
        query: &str,
    ) -> (Vec<Value>, Vec<Recall>) {
        let mut participants = Vec::with_capacity(names.len());
        let mut recall = vec![];

        for (i, name) in names.iter().enumerate() {
            let entry = match self.npcs.get(name) {
                Some(npc) => json!({
                    "name": npc.name,
                    "description": npc.description,
                    "mood": npc.mood,
                    "location": npc.location,
                    "backpack": npc.backpack,
                    "observation": npc.observation,
                }),
                None => json!({ "name": name }),
            };
            participants.push(entry);

            if let Some(store) = self.stores.get(name) {
                recall.push(Recall {
                    store: store.clone(),
                    query: query.to_string(),
                    k,
                    target: format!("/participants/{i}"),
                });
            }
        }
        (participants, recall)
    }

    fn language(&self) -> &str {
        self.scene
            .as_ref()
            .map(|scene| language_name(&scene.language))
            .unwrap_or("English")
    }

    /// Starts generating a conversation and returns its id.
    pub(super) fn create_conversation(&mut self, req: CreateConversationRequest) -> Option<String> {
        if req.npc.is_empty() {
            log::warn!("create_conversation without participants");
            return None;
        }

        for (name, update) in &req.state {
            if let Some(npc) = self.npcs.get_mut(name) {
                npc.apply(update);
            }
        }

        let conversation = Conversation::new(req.npc, req.topic, req.location, req.stream);
        let k = req.memory_k.unwrap_or(self.options.memory_k);
        let query = req
            .starting
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| conversation.topic.clone());
        let (participants, recall) =
            self.participants_context(&conversation.participants, k, &query);

        let context = json!({
            "language": self.language(),
            "topic": conversation.topic,
            "location": conversation.location,
            "starting": req.starting,
            "player_desc": req.player_desc,
            "line_count": req.length.lines(),
            "participants": participants,
        });

        let id = conversation.id.clone();
        log::info!(
            "creating conversation {id} between {:?} about {:?}",
            conversation.participants,
            conversation.topic
        );
        self.conversations.insert(id.clone(), conversation);
        self.generate_lines(&id, CONVERSATION_TEMPLATE, context, recall);
        Some(id)
    }

    pub(super) fn re_create_conversation(&mut self, req: ReCreateRequest) {
        let k = req.memory_k.unwrap_or(self.options.memory_k);
        let Some(conversation) = self.conversations.get_mut(&req.id) else {
            log::warn!("re_create for unknown conversation {}", req.id);
            return;
        };
        if conversation.in_flight.is_some() {
            log::warn!("conversation {} is still generating, ignoring re_create", req.id);
            return;
        }

        let history = conversation.interrupt(req.character.as_deref(), &req.interruption);
        let participants = conversation.participants.clone();
        let topic = conversation.topic.clone();
        let location = conversation.location.clone();

        let query = if req.interruption.is_empty() {
            topic.clone()
        } else {
            req.interruption.clone()
        };
        let (participants, recall) = self.participants_context(&participants, k, &query);
        let context = json!({
            "language": self.language(),
            "topic": topic,
            "location": location,
            "player_desc": req.player_desc,
            "character": req.character,
            "interruption": req.interruption,
            "history": history,
            "line_count": req.length.lines(),
            "participants": participants,
        });

        log::info!("regenerating conversation {} after interruption", req.id);
        self.generate_lines(&req.id, RE_CONVERSATION_TEMPLATE, context, recall);
    }

    fn generate_lines(
        &mut self,
        id: &str,
        template: &'static str,
        context: Value,
        recall: Vec<Recall>,
    ) {
        let job = Generate {
            ticket: 0,
            remember: vec![],
            recall,
            template,
            context,
        };
        let ticket = self.submit(job, PendingKind::Conversation { id: id.to_string() });
        if let Some(conversation) = self.conversations.get_mut(id) {
            conversation.in_flight = Some(ticket);
        }
    }

    pub(super) fn finish_conversation(&mut self, id: &str, text: Option<String>) {
        let Some(conversation) = self.conversations.get_mut(id) else {
            log::debug!("reply for finished conversation {id}");
            return;
        };
        conversation.in_flight = None;

        let lines = text.as_deref().map(parse_lines).unwrap_or_default();
        if lines.is_empty() {
            log::warn!("no usable lines for conversation {id}: {text:?}");
        }
        let index = conversation.extend(lines);

        if conversation.lines.is_empty() && conversation.memory_buffer.is_empty() {
            log::warn!("dropping empty conversation {id}");
            self.conversations.remove(id);
            return;
        }
        if index == conversation.lines.len() {
            // regeneration produced nothing; whatever was confirmed stands
            if conversation.current_index == conversation.lines.len() {
                self.end_conversation(id);
            }
            return;
        }

        let conversation = &self.conversations[id];
        self.emit(Outbound::Conversation {
            id,
            participants: &conversation.participants,
            location: &conversation.location,
            topic: &conversation.topic,
            index,
            length: conversation.lines.len(),
            lines: &conversation.lines[index..],
            start_time: conversation.start_time.format(TIME_FORMAT).to_string(),
        });
        if conversation.stream {
            // streamed lines count from 1, so each index is the value to confirm
            for (offset, line) in conversation.lines[index..].iter().enumerate() {
                self.emit(Outbound::ConversationLine {
                    id,
                    index: index + offset + 1,
                    line,
                });
            }
        }
    }

    pub(super) fn confirm_line(&mut self, req: ConfirmRequest) {
        let Some(conversation) = self.conversations.get_mut(&req.conversation_id) else {
            log::warn!("confirm for unknown conversation {}", req.conversation_id);
            return;
        };
        if conversation.confirm(req.index) {
            self.end_conversation(&req.conversation_id);
        }
    }

    /// Removes a conversation and commits its transcript to every participant.
    fn end_conversation(&mut self, id: &str) {
        let Some(mut conversation) = self.conversations.remove(id) else {
            return;
        };
        let end_time = *conversation.end_time.get_or_insert_with(Local::now);

        let memories: Vec<String> = conversation
            .memory_buffer
            .iter()
            .map(|line| {
                format!(
                    "At {} we talked about {}. {line}",
                    conversation.location, conversation.topic
                )
            })
            .collect();

        let mut remember = vec![];
        for name in &conversation.participants {
            if let Some(npc) = self.npcs.get_mut(name) {
                npc.memory.extend(memories.iter().cloned());
            }
            if let Some(store) = self.stores.get(name) {
                remember.extend(memories.iter().map(|m| (store.clone(), m.clone())));
            }
        }
        self.remember(remember);

        log::info!(
            "conversation {id} ended after {} lines",
            conversation.lines.len()
        );
        self.emit(Outbound::ConversationEnd {
            id,
            end_time: end_time.format(TIME_FORMAT).to_string(),
        });
    }
}
