use super::handlers;
use super::types::{Request, SharedState};
use crate::ipc::error::err;

pub async fn handle_request(state: SharedState, req: Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(&state, &req).await {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(&state, &req).await {
        return resp;
    }
    if let Some(resp) = handlers::grading::try_handle(&state, &req).await {
        return resp;
    }
    if let Some(resp) = handlers::lesson_plans::try_handle(&state, &req).await {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
