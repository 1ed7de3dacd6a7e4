//! Outbound command serialization.
//!
//! Drains the command queue one opcode at a time: at most one command is in
//! flight on the wire until its response arrives. Responses update the
//! session flags and drive the sample recorder lifecycle.

use std::io;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::{write_packet, TaskContext, TaskOutcome, COMMANDER};
use stim_types::{OpCode, Packet};

pub(crate) async fn run(ctx: TaskContext, cancel: CancellationToken) {
    debug!("commander started");
    let mut last_id: u8 = 0;
    let mut last_op: Option<OpCode> = None;
    let mut last_returned = true;

    let outcome = loop {
        if cancel.is_cancelled() {
            break TaskOutcome::Completed;
        }

        if let Some(op) = ctx.queues.commands.try_pop() {
            if op != OpCode::Initial && last_op == Some(op) {
                warn!("duplicate {:?} command ignored", op);
                last_op = None;
                last_returned = true;
            } else if !last_returned {
                warn!(
                    "{:?} dropped: still awaiting the response to {:?}",
                    op, last_op
                );
            } else {
                let packet = Packet::transaction(op, ctx.id_gen.next());
                match write_packet(&ctx.writer, &packet) {
                    Ok(()) => {
                        debug!("sent {:?} (id {})", op, packet.id());
                        last_id = packet.id();
                        last_op = Some(op);
                        last_returned = false;
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        warn!("{:?} write timed out, requeueing", op);
                        ctx.queues.commands.try_push(op);
                    }
                    Err(e) => {
                        error!("command write failed: {}", e);
                        break TaskOutcome::Errored;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(ctx.config.timing.idle_sleep) => {}
        }

        if let Some(response) = ctx.queues.cmd_resp.try_pop() {
            if response.id() != last_id {
                warn!(
                    "command response id {} does not match sent id {}",
                    response.id(),
                    last_id
                );
            }
            last_returned = true;
            apply_response(&ctx, &response);
            last_op = None;
        }
    };

    debug!("commander exiting: {:?}", outcome);
    ctx.report_exit(COMMANDER, outcome);
}

/// Session side effects of an acknowledged command.
fn apply_response(ctx: &TaskContext, response: &Packet) {
    match response.opcode() {
        Some(OpCode::StartStream) => {
            info!("stream started");
            ctx.session.set_streaming(true);
            ctx.session.set_start_stream_sent(false);
            if let Ok(mut recorder) = ctx.recorder.lock() {
                if let Err(e) = recorder.open() {
                    warn!("unable to open the sample log: {}", e);
                }
            }
        }
        Some(OpCode::StopStream) => {
            info!("stream stopped");
            ctx.session.set_streaming(false);
            ctx.session.set_stop_stream_sent(false);
            if let Ok(mut recorder) = ctx.recorder.lock() {
                recorder.close();
            }
        }
        Some(OpCode::StartStim) => {
            info!("therapy started");
            ctx.session.set_stimming(true);
            ctx.session.set_start_stim_sent(false);
        }
        Some(OpCode::StopStim) => {
            info!("therapy stopped");
            ctx.session.set_stimming(false);
            ctx.session.set_stop_stim_sent(false);
        }
        Some(OpCode::Initial) => {
            debug!("handshake acknowledged");
            if ctx.session.user_streaming() {
                ctx.queues.commands.try_push(OpCode::StartStream);
            }
        }
        Some(OpCode::Keepalive) | None => {}
    }
}
