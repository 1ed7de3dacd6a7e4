//! Closed-loop seizure detection.
//!
//! Feeds every decoded stream sample into the sliding FFT window, runs a
//! classification whenever enough new samples have arrived, and raises or
//! lowers therapy through the command gate based on classification and
//! confidence. Every sample is appended to the CSV recorder.

use classifier::SignalWindow;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::{TaskContext, TaskOutcome, DETECTOR};
use crate::commands::CommandGate;
use crate::recorder::StreamRecord;

pub(crate) async fn run(ctx: TaskContext, cancel: CancellationToken) {
    debug!("detector started");
    let mut window = SignalWindow::with_params(
        ctx.config.predict_rate,
        ctx.config.prediction_history,
    );
    let mut seizure_detected = false;
    let gate = CommandGate::new(ctx.session.clone(), ctx.queues.clone());

    let outcome = loop {
        match ctx.queues.stream.try_pop() {
            Some(sample) => {
                window.add(sample.microvolts);
                if window.predict_ready() {
                    seizure_detected = window.predict();
                }
                let confidence = window.confidence();
                let stimming = ctx.session.is_stimming();

                if seizure_detected && confidence > 0.0 && !stimming {
                    info!(
                        "seizure activity detected (confidence {:.2}), requesting therapy",
                        confidence
                    );
                    if let Err(refused) = gate.start_therapy() {
                        debug!("therapy start refused: {}", refused);
                    }
                } else if !seizure_detected && confidence < 0.0 && stimming {
                    info!(
                        "signal settled (confidence {:.2}), requesting therapy stop",
                        confidence
                    );
                    if let Err(refused) = gate.stop_therapy() {
                        debug!("therapy stop refused: {}", refused);
                    }
                }

                let record = StreamRecord {
                    device_timestamp: sample.device_timestamp,
                    microvolts: sample.microvolts,
                    seizure_detected,
                    therapy_on: stimming,
                };
                if let Ok(mut recorder) = ctx.recorder.lock() {
                    if let Err(e) = recorder.record(&record) {
                        warn!("sample log write failed: {}", e);
                    }
                }
            }
            None => {
                // Finish-work-on-kill: drain the stream queue first.
                if cancel.is_cancelled() {
                    break TaskOutcome::Completed;
                }
                tokio::time::sleep(ctx.config.timing.idle_sleep).await;
            }
        }
    };

    debug!("detector exiting: {:?}", outcome);
    ctx.report_exit(DETECTOR, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LinkStatus;
    use crate::tasks::testing::context_with_pipe;
    use classifier::WINDOW_SIZE;
    use std::time::Duration;
    use stim_types::{OpCode, StreamSample};

    fn seizure_sample(n: u32) -> StreamSample {
        let period = WINDOW_SIZE as f64;
        let phase = 2.0 * std::f64::consts::PI * 2.0 * (n as f64 % period) / period;
        let microvolts = 420.0 + 85.0 * phase.cos();
        StreamSample {
            device_timestamp: n,
            raw: 0,
            microvolts,
        }
    }

    fn resting_sample(n: u32) -> StreamSample {
        StreamSample {
            device_timestamp: n,
            raw: 0,
            microvolts: 0.4,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seizure_trace_requests_therapy_once() {
        let (ctx, _exits, _device) = context_with_pipe();
        ctx.session.set_status(LinkStatus::Running);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx.clone(), cancel.clone()));

        for n in 0..(WINDOW_SIZE as u32 + 16) {
            while ctx.queues.stream.len() >= ctx.queues.stream.capacity() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            ctx.queues.stream.try_push(seizure_sample(n));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if ctx.queues.commands.len() > 0 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no therapy command was queued"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let _ = handle.await;

        let commands: Vec<_> = std::iter::from_fn(|| ctx.queues.commands.try_pop()).collect();
        assert_eq!(commands, vec![OpCode::StartStim]);
        assert!(ctx.session.start_stim_sent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resting_trace_stays_quiet() {
        let (ctx, _exits, _device) = context_with_pipe();
        ctx.session.set_status(LinkStatus::Running);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx.clone(), cancel.clone()));

        for n in 0..(WINDOW_SIZE as u32 + 16) {
            ctx.queues.stream.try_push(resting_sample(n));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        cancel.cancel();
        let _ = handle.await;
        assert!(ctx.queues.commands.is_empty());
        assert!(!ctx.session.start_stim_sent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settled_signal_requests_therapy_stop() {
        let (ctx, _exits, _device) = context_with_pipe();
        ctx.session.set_status(LinkStatus::Running);
        ctx.session.set_stimming(true);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx.clone(), cancel.clone()));

        for n in 0..(WINDOW_SIZE as u32 + 64) {
            while ctx.queues.stream.len() >= ctx.queues.stream.capacity() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            ctx.queues.stream.try_push(resting_sample(n));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if ctx.queues.commands.len() > 0 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no stop command was queued"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let _ = handle.await;
        let commands: Vec<_> = std::iter::from_fn(|| ctx.queues.commands.try_pop()).collect();
        assert_eq!(commands, vec![OpCode::StopStim]);
    }
}
