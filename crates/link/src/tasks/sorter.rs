//! Inbound packet routing.
//!
//! Drains the inbound queue and fans packets out to the keepalive,
//! command-response, stream, and client-event queues. Device faults are
//! split into fatal kinds (restart the group), advisory kinds (clear the
//! sent flags), and the NotConnected handshake recovery path.

use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use super::{TaskContext, TaskOutcome, SORTER};
use stim_types::{DeviceFault, OpCode, PacketType, StreamSample};

/// Consecutive NotConnected responses tolerated before escalating.
pub(crate) const RECONNECT_STRIKE_LIMIT: u32 = 3;

enum Routed {
    Continue,
    Fatal,
}

pub(crate) async fn run(ctx: TaskContext, cancel: CancellationToken) {
    debug!("sorter started");
    let mut not_connected_strikes: u32 = 0;

    let outcome = loop {
        match ctx.queues.inbound.try_pop() {
            Some(packet) => match route(&ctx, packet, &mut not_connected_strikes) {
                Routed::Continue => {}
                Routed::Fatal => break TaskOutcome::Errored,
            },
            None => {
                // Finish-work-on-kill: only exit once the queue is dry.
                if cancel.is_cancelled() {
                    break TaskOutcome::Completed;
                }
                tokio::time::sleep(ctx.config.timing.idle_sleep).await;
            }
        }
    };

    debug!("sorter exiting: {:?}", outcome);
    ctx.report_exit(SORTER, outcome);
}

fn route(ctx: &TaskContext, packet: stim_types::Packet, strikes: &mut u32) -> Routed {
    match packet.packet_type() {
        PacketType::Failure => {
            let Some(fault) = packet.fault() else {
                warn!("failure packet with unknown error code, ignoring");
                return Routed::Continue;
            };
            match fault {
                DeviceFault::BadChecksum | DeviceFault::BadOpCode | DeviceFault::BadPackType => {
                    error!("device reported a protocol fault: {:?}", fault);
                    Routed::Fatal
                }
                DeviceFault::NotConnected => {
                    *strikes += 1;
                    if *strikes >= RECONNECT_STRIKE_LIMIT {
                        error!(
                            "device still not connected after {} handshake attempts",
                            RECONNECT_STRIKE_LIMIT
                        );
                        return Routed::Fatal;
                    }
                    warn!(
                        "device reports NotConnected, re-running handshake ({}/{})",
                        *strikes, RECONNECT_STRIKE_LIMIT
                    );
                    send_connect_async(ctx);
                    Routed::Continue
                }
                DeviceFault::AlreadyConnected
                | DeviceFault::AlreadyStreaming
                | DeviceFault::AlreadyStopped
                | DeviceFault::AlreadyTherapy
                | DeviceFault::AlreadyNotTherapy => {
                    warn!("device state already matches request ({:?})", fault);
                    ctx.session.clear_sent_flags();
                    Routed::Continue
                }
                DeviceFault::TooLong => {
                    warn!("device rejected an oversized frame");
                    Routed::Continue
                }
            }
        }
        PacketType::Transaction => {
            match packet.opcode() {
                Some(OpCode::Keepalive) => {
                    ctx.queues.keepalive.try_push(packet);
                }
                Some(OpCode::Initial) => {
                    *strikes = 0;
                    ctx.queues.cmd_resp.try_push(packet.clone());
                    ctx.queues.client_events.try_push(packet);
                }
                Some(_) => {
                    ctx.queues.cmd_resp.try_push(packet.clone());
                    ctx.queues.client_events.try_push(packet);
                }
                None => warn!("transaction with unknown opcode, ignoring"),
            }
            Routed::Continue
        }
        PacketType::Stream => {
            if !packet.checksum_valid() {
                warn!("stream packet failed checksum validation, rejecting");
                return Routed::Continue;
            }
            match StreamSample::decode(packet.payload()) {
                Some(sample) => {
                    ctx.queues.stream.try_push(sample);
                    ctx.queues.client_events.try_push(packet);
                }
                None => warn!(
                    "stream payload of {} bytes is malformed, rejecting",
                    packet.payload().len()
                ),
            }
            Routed::Continue
        }
    }
}

/// Handshake recovery after a NotConnected fault: flush every queue, reset
/// the in-flight request state, and queue a fresh Initial.
fn send_connect_async(ctx: &TaskContext) {
    ctx.queues.clear_all();
    ctx.session.reset_for_reconnect();
    ctx.queues.commands.try_push(OpCode::Initial);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::context_with_pipe;
    use stim_types::{Packet, PacketType};

    fn failure(fault: DeviceFault) -> Packet {
        Packet::new(PacketType::Failure, 1, vec![fault as u8]).unwrap()
    }

    #[test]
    fn keepalive_responses_go_to_the_keepalive_queue() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;
        let packet = Packet::transaction(OpCode::Keepalive, 4);
        assert!(matches!(
            route(&ctx, packet, &mut strikes),
            Routed::Continue
        ));
        assert_eq!(ctx.queues.keepalive.len(), 1);
        assert!(ctx.queues.client_events.is_empty());
    }

    #[test]
    fn command_responses_fan_out_to_clients() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;
        route(&ctx, Packet::transaction(OpCode::StartStream, 4), &mut strikes);
        assert_eq!(ctx.queues.cmd_resp.len(), 1);
        assert_eq!(ctx.queues.client_events.len(), 1);
    }

    #[test]
    fn stream_packets_decode_and_fan_out() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;
        let payload = vec![0x05, 0x00, 0x00, 0x00, 0x10, 0x27];
        route(
            &ctx,
            Packet::new(PacketType::Stream, 8, payload).unwrap(),
            &mut strikes,
        );
        let sample = ctx.queues.stream.try_pop().unwrap();
        assert_eq!(sample.device_timestamp, 5);
        assert_eq!(sample.raw, 0x2710);
        assert_eq!(ctx.queues.client_events.len(), 1);
    }

    #[test]
    fn fatal_faults_stop_the_task() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;
        assert!(matches!(
            route(&ctx, failure(DeviceFault::BadChecksum), &mut strikes),
            Routed::Fatal
        ));
    }

    #[test]
    fn advisory_faults_clear_sent_flags() {
        let (ctx, _exits, _device) = context_with_pipe();
        ctx.session.set_start_stream_sent(true);
        ctx.session.set_start_stim_sent(true);
        let mut strikes = 0;
        assert!(matches!(
            route(&ctx, failure(DeviceFault::AlreadyStreaming), &mut strikes),
            Routed::Continue
        ));
        assert!(!ctx.session.start_stream_sent());
        assert!(!ctx.session.start_stim_sent());
    }

    #[test]
    fn not_connected_queues_a_handshake_then_escalates() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;

        for expected in 1..RECONNECT_STRIKE_LIMIT {
            assert!(matches!(
                route(&ctx, failure(DeviceFault::NotConnected), &mut strikes),
                Routed::Continue
            ));
            assert_eq!(strikes, expected);
            assert_eq!(ctx.queues.commands.try_pop(), Some(OpCode::Initial));
        }

        assert!(matches!(
            route(&ctx, failure(DeviceFault::NotConnected), &mut strikes),
            Routed::Fatal
        ));
    }

    #[test]
    fn initial_response_resets_the_strike_count() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;
        route(&ctx, failure(DeviceFault::NotConnected), &mut strikes);
        assert_eq!(strikes, 1);
        route(&ctx, Packet::transaction(OpCode::Initial, 2), &mut strikes);
        assert_eq!(strikes, 0);
    }

    #[test]
    fn corrupted_stream_packet_is_rejected() {
        let (ctx, _exits, _device) = context_with_pipe();
        let mut strikes = 0;
        let good = Packet::new(PacketType::Stream, 8, vec![0; 6]).unwrap();
        let frame = good.serialize();
        // Flip a payload byte after framing so the stored checksum is stale.
        let tampered = Packet::from_parts(
            PacketType::Stream,
            8,
            vec![1, 0, 0, 0, 0, 0],
            frame[frame.len() - 1],
        );
        route(&ctx, tampered, &mut strikes);
        assert!(ctx.queues.stream.is_empty());
        assert!(ctx.queues.client_events.is_empty());
    }
}
