use crate::{prompts::SnapshotPolicy, server::SharedState};
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub struct PromptsView {
    /// Raw field contents, blanks included.
    fields: Vec<String>,
    /// What frames carry right now.
    sent: Vec<String>,
    policy: SnapshotPolicy,
}

#[derive(Deserialize)]
pub struct ReplacePrompts {
    fields: Vec<String>,
}

fn view(state: &SharedState) -> PromptsView {
    PromptsView {
        fields: state.prompts.entries(),
        sent: state.prompts.snapshot(),
        policy: state.prompts.policy(),
    }
}

pub async fn get_prompts(State(state): State<SharedState>) -> Json<PromptsView> {
    Json(view(&state))
}

pub async fn replace_prompts(
    State(state): State<SharedState>,
    Json(body): Json<ReplacePrompts>,
) -> Json<PromptsView> {
    state.prompts.replace(body.fields);
    Json(view(&state))
}

pub async fn submit_prompts(State(state): State<SharedState>) -> Json<PromptsView> {
    let submitted = state.prompts.submit();
    tracing::info!("Prompts submitted: {:?}", submitted);
    Json(view(&state))
}
