use std::sync::Arc;

use serde_json::json;

use crate::config::SessionParams;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{lock, Request, Session, SharedState};
use crate::transport::{Credential, HttpTransport};

fn handle_health(state: &SharedState, req: &Request) -> serde_json::Value {
    let st = lock(state);
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "connected": st.session.is_some(),
            "baseUrl": st.session.as_ref().map(|s| s.base_url.clone()),
            "anonymous": st.session.as_ref().map(|s| s.anonymous),
        }),
    )
}

fn handle_session_connect(state: &SharedState, req: &Request) -> serde_json::Value {
    let params: SessionParams = if req.params.is_null() {
        SessionParams::default()
    } else {
        match serde_json::from_value(req.params.clone()) {
            Ok(p) => p,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        }
    };

    let mut st = lock(state);
    let settings = match st.settings.overlay(params) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "bad_params", format!("{e:#}"), None),
    };
    let credential = Credential::bearer(settings.token.clone());
    let anonymous = credential.is_anonymous();
    let transport = match HttpTransport::new(&settings.api_url, credential, settings.timeout()) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "bad_params", format!("{e:#}"), None),
    };
    let base_url = transport.base_url().to_string();

    // A new session never sees the previous session's rows or edits.
    st.close_pages();
    st.session = Some(Session {
        transport: Arc::new(transport),
        base_url: base_url.clone(),
        anonymous,
    });
    tracing::info!(base_url = %base_url, anonymous, "session connected");
    ok(&req.id, json!({ "baseUrl": base_url, "anonymous": anonymous }))
}

fn handle_session_disconnect(state: &SharedState, req: &Request) -> serde_json::Value {
    let mut st = lock(state);
    st.close_pages();
    let was_connected = st.session.take().is_some();
    ok(&req.id, json!({ "disconnected": was_connected }))
}

fn handle_page_close(state: &SharedState, req: &Request) -> serde_json::Value {
    let page = match required_str(req, "page") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut st = lock(state);
    match page.as_str() {
        "attendance" => st.attendance.close(),
        "grading" => st.grading.close(),
        "plans" => st.plans.close(),
        other => {
            return err(
                &req.id,
                "bad_params",
                "page must be one of: attendance, grading, plans",
                Some(json!({ "page": other })),
            )
        }
    }
    ok(&req.id, json!({ "closed": page }))
}

pub async fn try_handle(state: &SharedState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "session.connect" => Some(handle_session_connect(state, req)),
        "session.disconnect" => Some(handle_session_disconnect(state, req)),
        "page.close" => Some(handle_page_close(state, req)),
        _ => None,
    }
}
