use {serde_json::json, switchyard_protocol::methods};

use crate::transfer::{
    AcceptParams, BeginParams, CompleteParams, DoneParams, MetaParams, TransferWaiter,
};

use super::{CLIENT, MethodRegistry, MethodReply, NODE};

pub(super) fn register(reg: &mut MethodRegistry) {
    // transfer.begin: answered once the destination has the bytes
    reg.register(
        methods::TRANSFER_BEGIN,
        CLIENT,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: BeginParams = ctx.parse_params()?;
                let waiter = TransferWaiter::Client {
                    client_id: ctx.caller.id.clone(),
                    conn_id: ctx.conn_id.clone(),
                    frame_id: ctx.request_id.clone(),
                };
                ctx.state
                    .transfers
                    .begin(&ctx.state, params.source, params.destination, waiter)
                    .await?;
                Ok(MethodReply::Deferred)
            })
        }),
    );

    reg.register(
        methods::TRANSFER_META,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: MetaParams = ctx.parse_params()?;
                ctx.state
                    .transfers
                    .on_meta(&ctx.state, &ctx.caller.id, params)
                    .await?;
                Ok(json!({ "ok": true }).into())
            })
        }),
    );

    reg.register(
        methods::TRANSFER_ACCEPT,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: AcceptParams = ctx.parse_params()?;
                ctx.state
                    .transfers
                    .on_accept(&ctx.state, &ctx.caller.id, params)
                    .await?;
                Ok(json!({ "ok": true }).into())
            })
        }),
    );

    reg.register(
        methods::TRANSFER_COMPLETE,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: CompleteParams = ctx.parse_params()?;
                ctx.state
                    .transfers
                    .on_complete(&ctx.state, &ctx.caller.id, params.transfer_id)
                    .await?;
                Ok(json!({ "ok": true }).into())
            })
        }),
    );

    reg.register(
        methods::TRANSFER_DONE,
        NODE,
        Box::new(|ctx| {
            Box::pin(async move {
                let params: DoneParams = ctx.parse_params()?;
                ctx.state
                    .transfers
                    .on_done(&ctx.state, &ctx.caller.id, params)
                    .await?;
                Ok(json!({ "ok": true }).into())
            })
        }),
    );
}
