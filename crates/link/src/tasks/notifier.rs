//! Subscriber notification.
//!
//! Drains the client-event queue and converts packets into subscriber
//! events: stream packets become `StreamData`, command acknowledgements
//! become lifecycle events. Subscribers run sequentially; a panicking
//! subscriber is logged and skipped without disturbing the rest.

use log::{debug, error};
use tokio_util::sync::CancellationToken;

use super::{TaskContext, TaskOutcome, NOTIFIER};
use stim_types::{LinkEvent, OpCode, Packet, PacketType, StreamSample};

pub(crate) async fn run(ctx: TaskContext, cancel: CancellationToken) {
    debug!("notifier started");

    let outcome = loop {
        match ctx.queues.client_events.try_pop() {
            Some(packet) => {
                if let Some(event) = event_for(&packet) {
                    deliver(&ctx, &event);
                }
            }
            None => {
                // Finish-work-on-kill: drain pending events first.
                if cancel.is_cancelled() {
                    break TaskOutcome::Completed;
                }
                tokio::time::sleep(ctx.config.timing.idle_sleep).await;
            }
        }
    };

    debug!("notifier exiting: {:?}", outcome);
    ctx.report_exit(NOTIFIER, outcome);
}

fn event_for(packet: &Packet) -> Option<LinkEvent> {
    match packet.packet_type() {
        PacketType::Stream => StreamSample::decode(packet.payload()).map(LinkEvent::StreamData),
        PacketType::Transaction => match packet.opcode()? {
            OpCode::StartStream => Some(LinkEvent::StreamStarted),
            OpCode::StopStream => Some(LinkEvent::StreamStopped),
            OpCode::StartStim => Some(LinkEvent::TherapyStarted),
            OpCode::StopStim => Some(LinkEvent::TherapyStopped),
            OpCode::Initial | OpCode::Keepalive => None,
        },
        PacketType::Failure => None,
    }
}

fn deliver(ctx: &TaskContext, event: &LinkEvent) {
    let subscribers = match ctx.subscribers.read() {
        Ok(subscribers) => subscribers,
        Err(poisoned) => poisoned.into_inner(),
    };
    for subscriber in subscribers.iter() {
        let call = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            subscriber.on_event(event)
        }));
        if call.is_err() {
            error!(
                "subscriber '{}' panicked handling {}",
                subscriber.name(),
                event.name()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::context_with_pipe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use stim_types::Subscribe;

    struct Collector {
        events: Mutex<Vec<LinkEvent>>,
    }

    impl Subscribe for Collector {
        fn name(&self) -> &'static str {
            "collector"
        }

        fn on_event(&self, event: &LinkEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    struct Panicker {
        calls: AtomicUsize,
    }

    impl Subscribe for Panicker {
        fn name(&self) -> &'static str {
            "panicker"
        }

        fn on_event(&self, _event: &LinkEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("subscriber bug");
        }
    }

    #[test]
    fn command_acks_map_to_lifecycle_events() {
        assert_eq!(
            event_for(&Packet::transaction(OpCode::StartStream, 1)),
            Some(LinkEvent::StreamStarted)
        );
        assert_eq!(
            event_for(&Packet::transaction(OpCode::StopStim, 1)),
            Some(LinkEvent::TherapyStopped)
        );
        assert_eq!(event_for(&Packet::transaction(OpCode::Initial, 1)), None);
        assert_eq!(event_for(&Packet::transaction(OpCode::Keepalive, 1)), None);
    }

    #[test]
    fn stream_packets_decode_into_stream_data() {
        let packet = Packet::new(PacketType::Stream, 3, vec![1, 0, 0, 0, 0, 0]).unwrap();
        match event_for(&packet) {
            Some(LinkEvent::StreamData(sample)) => assert_eq!(sample.device_timestamp, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_panicking_subscriber_does_not_block_the_rest() {
        let (ctx, _exits, _device) = context_with_pipe();
        let panicker = Arc::new(Panicker {
            calls: AtomicUsize::new(0),
        });
        let collector = Arc::new(Collector {
            events: Mutex::new(Vec::new()),
        });
        {
            let mut subscribers = ctx.subscribers.write().unwrap();
            subscribers.push(panicker.clone());
            subscribers.push(collector.clone());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx.clone(), cancel.clone()));
        ctx.queues
            .client_events
            .try_push(Packet::transaction(OpCode::StartStim, 1));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while collector.events.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "event never delivered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let _ = handle.await;

        assert_eq!(panicker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *collector.events.lock().unwrap(),
            vec![LinkEvent::TherapyStarted]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drains_pending_events_before_honoring_a_kill() {
        let (ctx, _exits, _device) = context_with_pipe();
        let collector = Arc::new(Collector {
            events: Mutex::new(Vec::new()),
        });
        ctx.subscribers.write().unwrap().push(collector.clone());

        for _ in 0..5 {
            ctx.queues
                .client_events
                .try_push(Packet::transaction(OpCode::StartStream, 1));
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        run(ctx.clone(), cancel).await;

        assert_eq!(collector.events.lock().unwrap().len(), 5);
    }
}
