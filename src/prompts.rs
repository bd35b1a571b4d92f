use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PromptError {
    #[error("Prompt index {index} out of range (have {len} fields)")]
    OutOfRange { index: usize, len: usize },
}

/// Decides which prompt list travels with a captured frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// The list committed by the last `submit`.
    #[default]
    OnSubmit,
    /// Whatever the fields hold at the instant of capture.
    Live,
}

#[derive(Debug)]
struct PromptState {
    fields: Vec<String>,
    submitted: Vec<String>,
}

/// User-edited prompt fields plus the committed copy sent with frames.
///
/// A fresh set holds a single empty field, the way the prompt form starts, and
/// nothing submitted yet.
#[derive(Debug)]
pub struct PromptSet {
    state: RwLock<PromptState>,
    policy: SnapshotPolicy,
}

impl PromptSet {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            state: RwLock::new(PromptState {
                fields: vec![String::new()],
                submitted: Vec::new(),
            }),
            policy,
        }
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    pub fn entries(&self) -> Vec<String> {
        self.state.read().fields.clone()
    }

    pub fn set(&self, index: usize, text: impl Into<String>) -> Result<(), PromptError> {
        let mut state = self.state.write();
        let len = state.fields.len();
        let field = state
            .fields
            .get_mut(index)
            .ok_or(PromptError::OutOfRange { index, len })?;
        *field = text.into();
        Ok(())
    }

    /// Appends an empty field.
    pub fn push(&self) {
        self.state.write().fields.push(String::new());
    }

    /// Removes the last field. The form always keeps one, so this returns
    /// `false` instead of emptying it.
    pub fn pop(&self) -> bool {
        let mut state = self.state.write();
        if state.fields.len() <= 1 {
            return false;
        }
        state.fields.pop();
        true
    }

    pub fn replace(&self, fields: Vec<String>) {
        let mut state = self.state.write();
        state.fields = if fields.is_empty() {
            vec![String::new()]
        } else {
            fields
        };
    }

    /// Commits the current fields and returns the cleaned list that frames
    /// will now carry under [`SnapshotPolicy::OnSubmit`].
    pub fn submit(&self) -> Vec<String> {
        let mut state = self.state.write();
        state.submitted = state.fields.clone();
        clean_prompts(&state.submitted)
    }

    pub fn submitted(&self) -> Vec<String> {
        clean_prompts(&self.state.read().submitted)
    }

    /// The list attached to an outbound frame right now.
    pub fn snapshot(&self) -> Vec<String> {
        let state = self.state.read();
        match self.policy {
            SnapshotPolicy::OnSubmit => clean_prompts(&state.submitted),
            SnapshotPolicy::Live => clean_prompts(&state.fields),
        }
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::new(SnapshotPolicy::default())
    }
}

/// Trims every prompt and drops the ones left empty, keeping relative order.
pub fn clean_prompts<S: AsRef<str>>(prompts: &[S]) -> Vec<String> {
    prompts
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
