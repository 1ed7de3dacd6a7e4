//! Serial read loop.
//!
//! Runs on a dedicated thread because the port read blocks for up to the
//! full read timeout. Bytes feed the packet factory one at a time; every
//! completed frame lands on the inbound queue.

use log::{debug, error, trace, warn};
use tokio_util::sync::CancellationToken;

use super::{TaskContext, TaskOutcome, LISTENER};
use crate::factory::PacketFactory;
use crate::port::LinkPort;

/// Consecutive framing failures tolerated before the task gives up.
pub(crate) const FRAMING_STRIKE_LIMIT: u32 = 3;

pub(crate) fn run(mut port: Box<dyn LinkPort>, ctx: TaskContext, cancel: CancellationToken) {
    debug!("listener started");
    let mut factory = PacketFactory::new();
    let mut framing_strikes: u32 = 0;

    let outcome = loop {
        if cancel.is_cancelled() {
            break TaskOutcome::Completed;
        }
        let mut byte = [0u8; 1];
        match port.read_bytes(&mut byte) {
            Ok(0) => {
                // Nothing on the wire; idle briefly before the next read.
                std::thread::sleep(ctx.config.timing.idle_sleep);
            }
            Ok(_) => {
                factory.push_byte(byte[0]);
                if factory.is_ready() {
                    let packet = std::mem::take(&mut factory).take();
                    if let Some(packet) = packet {
                        trace!(
                            "frame received: type {:?}, id {}",
                            packet.packet_type(),
                            packet.id()
                        );
                        ctx.queues.inbound.try_push(packet);
                    }
                    framing_strikes = 0;
                } else if factory.is_failed() {
                    framing_strikes += 1;
                    warn!(
                        "framing resync budget exhausted (strike {}/{})",
                        framing_strikes, FRAMING_STRIKE_LIMIT
                    );
                    factory = PacketFactory::new();
                    if framing_strikes >= FRAMING_STRIKE_LIMIT {
                        break TaskOutcome::Timeout;
                    }
                }
            }
            Err(e) => {
                error!("serial read failed: {}", e);
                break TaskOutcome::Errored;
            }
        }
    };

    debug!("listener exiting: {:?}", outcome);
    ctx.report_exit(LISTENER, outcome);
}
