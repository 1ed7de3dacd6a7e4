//! Keepalive watchdog.
//!
//! Emits a keepalive transaction every period and correlates the device's
//! echo on the next cycle. A missed or mismatched response is logged and
//! retried; only a hard write failure ends the task.

use std::io;

use log::{debug, error, trace, warn};
use tokio_util::sync::CancellationToken;

use super::{write_packet, TaskContext, TaskOutcome, KEEPALIVE};
use stim_types::{OpCode, Packet};

pub(crate) async fn run(ctx: TaskContext, cancel: CancellationToken) {
    debug!("keepalive started");
    let mut outstanding: Option<u8> = None;

    let outcome = loop {
        // Correlate the previous cycle's response before sending the next.
        if let Some(expected) = outstanding.take() {
            match ctx.queues.keepalive.try_pop() {
                Some(response) => {
                    if response.id() != expected {
                        warn!(
                            "keepalive response id {} does not match sent id {}",
                            response.id(),
                            expected
                        );
                    }
                }
                None => warn!("keepalive response missed (id {})", expected),
            }
        }

        if cancel.is_cancelled() {
            break TaskOutcome::Completed;
        }

        let packet = Packet::transaction(OpCode::Keepalive, ctx.id_gen.next());
        match write_packet(&ctx.writer, &packet) {
            Ok(()) => {
                trace!("keepalive sent (id {})", packet.id());
                outstanding = Some(packet.id());
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("keepalive write timed out, retrying next cycle");
            }
            Err(e) => {
                error!("keepalive write failed: {}", e);
                break TaskOutcome::Errored;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break TaskOutcome::Completed,
            _ = tokio::time::sleep(ctx.config.timing.keepalive_period) => {}
        }
    };

    debug!("keepalive exiting: {:?}", outcome);
    ctx.report_exit(KEEPALIVE, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::{context_with_pipe, read_frames};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sends_on_every_period() {
        let (ctx, _exits, mut device) = context_with_pipe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx.clone(), cancel.clone()));

        let frames =
            tokio::task::spawn_blocking(move || read_frames(&mut device, 300)).await.unwrap();
        cancel.cancel();
        let _ = handle.await;

        assert!(frames.len() >= 2, "expected repeated keepalives");
        assert!(frames
            .iter()
            .all(|p| p.opcode() == Some(OpCode::Keepalive)));
        // Monotonic ids, one per cycle.
        assert!(frames.windows(2).all(|w| w[1].id() == w[0].id() + 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn matched_response_raises_no_retry() {
        let (ctx, _exits, mut device) = context_with_pipe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx.clone(), cancel.clone()));

        // Echo the first keepalive back through the correlation queue.
        let frames =
            tokio::task::spawn_blocking(move || read_frames(&mut device, 150)).await.unwrap();
        assert!(!frames.is_empty());
        ctx.queues.keepalive.try_push(frames[0].clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = handle.await;
        assert!(ctx.queues.keepalive.is_empty(), "response was consumed");
    }
}
