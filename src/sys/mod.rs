use std::collections::VecDeque;

pub mod llm;
pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum NpcState {
    #[serde(rename = "dormant")]
    Dormant,
    #[serde(rename = "awake")]
    Awake,
    #[serde(rename = "acting")]
    Acting,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

/// What an NPC currently perceives. Always replaced wholesale, never merged.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
}

/// A directive for the game. Empty `action` means the model gave us nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Action {
    pub action: String,
    pub object: String,
    pub parameters: Vec<String>,
}

impl Action {
    pub fn idle(name: &str) -> Self {
        Self {
            action: name.to_string(),
            object: String::new(),
            parameters: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.action.is_empty()
    }
}

/// The thing an NPC reacts to when it is asked for its next action.
#[derive(Debug, Clone, PartialEq)]
pub enum Stimulus {
    Drive,
    Speech { speaker: String, content: String },
    Outcome { memory: String },
}

impl Stimulus {
    pub fn describe(&self) -> String {
        match self {
            Stimulus::Drive => "Decide what to do next.".to_string(),
            Stimulus::Speech { speaker, content } => {
                format!("{speaker} says to you: \"{content}\". Decide how to respond.")
            }
            Stimulus::Outcome { memory } => {
                format!("Your last action: {memory}. Decide what to do next.")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Npc {
    pub name: String,
    pub description: String,
    pub mood: String,
    pub location: String,
    pub position: Option<Position>,
    pub backpack: Vec<String>,
    pub memory: Vec<String>,
    pub action_space: Vec<String>,
    pub observation: Observation,
    pub state: NpcState,
    pub last_action: Option<Action>,

    /// Ticket of the model call currently owning this NPC, if any.
    pub in_flight: Option<u64>,
    pub pending: VecDeque<NpcEvent>,
}

/// Events that mutate an NPC, queued while a model call is in flight.
#[derive(Debug, Clone)]
pub enum NpcEvent {
    Wake {
        update: StateUpdate,
    },
    Talk {
        update: StateUpdate,
        player: String,
        speech: String,
    },
    Done {
        outcome: ActionOutcome,
    },
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct StateUpdate {
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub observation: Option<Observation>,
    #[serde(default)]
    pub backpack: Option<Vec<String>>,
    #[serde(skip)]
    pub scenario: Option<String>,
    #[serde(skip)]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub success: bool,
    pub action: String,
    pub object: String,
    pub parameters: Vec<String>,
    pub reason: String,
    pub time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Line {
    pub speaker: String,
    pub mood: String,
    #[serde(rename = "words")]
    pub utterance: String,
    pub action: Option<Action>,
}

impl Line {
    pub fn transcript(&self) -> String {
        format!("{}: {}", self.speaker, self.utterance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ConversationLength {
    S,
    #[default]
    M,
    L,
    X,
}

impl ConversationLength {
    pub fn lines(&self) -> usize {
        match self {
            ConversationLength::S => 3,
            ConversationLength::M => 6,
            ConversationLength::L => 10,
            ConversationLength::X => 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
    pub topic: String,
    pub location: String,
    pub lines: Vec<Line>,
    pub current_index: usize,
    pub start_time: chrono::DateTime<chrono::Local>,
    pub end_time: Option<chrono::DateTime<chrono::Local>>,
    pub stream: bool,
    /// Lines confirmed as spoken, not yet committed to participant memories.
    pub memory_buffer: Vec<String>,
    pub in_flight: Option<u64>,
}

impl Conversation {
    pub fn ended(&self) -> bool {
        self.end_time.is_some()
    }
}
