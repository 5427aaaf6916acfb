use std::time::Instant;

use {
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{debug, info},
};

use switchyard_protocol::{ErrorShape, events, methods};

use crate::{
    pending::{CallWaiter, ExecRoute, PendingToolCall},
    state::{GatewayInner, GatewayState},
    tools::ResolvedTool,
};

use super::{CLIENT, HandlerFn, MethodContext, MethodRegistry, MethodReply, NODE, ack, peer_error};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeParams {
    tool: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestParams {
    session_key: String,
    tool: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultParams {
    call_id: String,
    result: Option<Value>,
    error: Option<Value>,
}

/// Resolve `tool`, record the pending call and push `tool.invoke` to the
/// owning node. Returns the new call id.
async fn route_call(
    state: &GatewayState,
    tool: &str,
    args: Value,
    waiter: CallWaiter,
) -> Result<String, ErrorShape> {
    let call_id = uuid::Uuid::new_v4().to_string();
    let resolved: ResolvedTool = {
        let mut inner = state.inner.write().await;
        let GatewayInner {
            connections,
            tools,
            ledger,
            ..
        } = &mut *inner;
        let resolved = tools.resolve(tool, |id| connections.is_node_connected(id))?;
        ledger.tools.insert(PendingToolCall {
            call_id: call_id.clone(),
            node_id: resolved.node_id.clone(),
            tool: resolved.tool.clone(),
            waiter,
            created_at: Instant::now(),
        });
        resolved
    };

    let sent = state
        .send_event_to_node(
            &resolved.node_id,
            events::TOOL_INVOKE,
            json!({ "callId": call_id, "tool": resolved.tool, "args": args }),
        )
        .await;
    if !sent {
        // The node went away between resolution and send. If its cleanup
        // already failed the call, the waiter has its answer.
        let removed = state.inner.write().await.ledger.tools.remove(&call_id);
        if removed.is_some() {
            return Err(ErrorShape::not_connected(format!(
                "node not connected: {}",
                resolved.node_id
            )));
        }
    }
    info!(call_id = %call_id, node_id = %resolved.node_id, tool = %resolved.tool, "tool call routed");
    Ok(call_id)
}

fn invoke_handler() -> HandlerFn {
    Box::new(|ctx| {
        Box::pin(async move {
            let params: InvokeParams = ctx.parse_params()?;
            let waiter = CallWaiter::Client {
                client_id: ctx.caller.id.clone(),
                conn_id: ctx.conn_id.clone(),
                frame_id: ctx.request_id.clone(),
            };
            route_call(&ctx.state, &params.tool, params.args, waiter).await?;
            Ok(MethodReply::Deferred)
        })
    })
}

/// `(processId)` of a result that reports a still-running sub-process.
fn running_process(result: &Value) -> Option<&str> {
    if result.get("status").and_then(Value::as_str) != Some("running") {
        return None;
    }
    result.get("processId").and_then(Value::as_str)
}

async fn tool_result(ctx: MethodContext) -> Result<MethodReply, ErrorShape> {
    let params: ResultParams = ctx.parse_params()?;
    let node_id = ctx.caller.id.as_str();
    let call = {
        let mut inner = ctx.state.inner.write().await;
        let call = inner.ledger.tools.take(&params.call_id, node_id)?;
        if let CallWaiter::Session { session_key } = &call.waiter
            && let Some(process_id) = params.result.as_ref().and_then(running_process)
        {
            debug!(call_id = %call.call_id, node_id, process_id, "tracking running sub-process");
            inner.ledger.record_exec(node_id, process_id, ExecRoute {
                session_key: session_key.clone(),
                call_id: call.call_id.clone(),
            });
        }
        call
    };

    let outcome = match params.error {
        Some(error) => Err(peer_error(&error)),
        None => Ok(params.result.unwrap_or(Value::Null)),
    };
    let delivered = ctx.state.complete_tool_call(call, outcome).await;
    Ok(ack(delivered).into())
}

pub(super) fn register(reg: &mut MethodRegistry) {
    // tools.list
    reg.register(
        methods::TOOLS_LIST,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let inner = ctx.state.inner.read().await;
                let catalog = inner
                    .tools
                    .catalog(|id| inner.connections.is_node_connected(id));
                Ok(json!({ "tools": catalog }).into())
            })
        }),
    );

    // tools.invoke, and its singular alias
    reg.register(methods::TOOLS_INVOKE, CLIENT, invoke_handler());
    reg.register(methods::TOOL_INVOKE, CLIENT, invoke_handler());

    // tool.request: on behalf of a session; acknowledged immediately
    reg.register(
        methods::TOOL_REQUEST,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: RequestParams = ctx.parse_params()?;
                if params.session_key.is_empty() {
                    return Err(ErrorShape::bad_request("sessionKey is required"));
                }
                let waiter = CallWaiter::Session {
                    session_key: params.session_key,
                };
                let call_id = route_call(&ctx.state, &params.tool, params.args, waiter).await?;
                Ok(json!({ "status": "sent", "callId": call_id }).into())
            })
        }),
    );

    // tool.result
    reg.register(
        methods::TOOL_RESULT,
        NODE,
        Box::new(|ctx| Box::pin(tool_result(ctx))),
    );
}
