//! Conversation history shared with the language model.

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Human,
    Model,
}

impl Speaker {
    /// Chat-completions role name.
    #[must_use]
    pub fn role(self) -> &'static str {
        match self {
            Self::Human => "user",
            Self::Model => "assistant",
        }
    }
}

/// One exchange entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

/// Append-only, ordered dialog for one session.
///
/// Only the generation stage mutates it. Prompts are built from
/// [`window`](Self::window) so the request size stays bounded while the
/// history itself keeps every turn.
#[derive(Debug, Clone, Default)]
pub struct DialogHistory {
    system_prompt: Option<String>,
    turns: Vec<Turn>,
}

impl DialogHistory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let prompt = system_prompt.into();
        Self {
            system_prompt: (!prompt.trim().is_empty()).then_some(prompt),
            turns: Vec::new(),
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn push_human(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            speaker: Speaker::Human,
            text: text.into(),
        });
    }

    pub fn push_model(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            speaker: Speaker::Model,
            text: text.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The most recent `max_turns` turns (all of them when 0).
    pub fn window(&self, max_turns: usize) -> &[Turn] {
        if max_turns == 0 || self.turns.len() <= max_turns {
            return &self.turns;
        }
        &self.turns[self.turns.len() - max_turns..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
