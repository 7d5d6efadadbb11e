/// Async event observer
///
/// One task per debugger instance reads every line the debugger prints.
/// Records belonging to the in-flight command go to the response slot,
/// `*running`/`*stopped` drive the inferior state machine, and everything else
/// is broadcast on the event bus.

use std::sync::Arc;

use crate::breakpoints::OnHit;
use crate::lock;
use crate::parser::parse_gdb_output;
use crate::session::{DebugSession, Inner};
use crate::transport::TransportReader;
use crate::types::{AsyncClass, AsyncRecord, GdbOutput, InferiorStatus, StopReason};

pub(crate) async fn run(mut reader: TransportReader, inner: Arc<Inner>, generation: u64) {
    log::debug!("observer {} started", generation);

    while let Some(line) = reader.next_line().await {
        if inner.generation() != generation {
            break;
        }
        log::trace!("GDB_OUT: {}", line);

        match parse_gdb_output(&line) {
            Ok(GdbOutput::Prompt) => inner.engine.slot().on_prompt(),
            Ok(GdbOutput::Result(result)) => {
                let token = result.token;
                if !inner.engine.slot().on_result(result, &line) {
                    log::debug!("RECV[{:?}]: untracked result", token);
                    inner.bus.broadcast(&line);
                }
            }
            Ok(GdbOutput::Stream(stream)) => {
                if !inner.engine.slot().on_stream(&stream, &line) {
                    inner.bus.broadcast(&line);
                }
            }
            Ok(GdbOutput::Async(record)) => match record.class {
                AsyncClass::Running => on_running(&inner),
                AsyncClass::Stopped if record.is_exit() => {
                    log::info!("inferior exited ({:?})", record.stop_reason());
                    on_exit(&inner, generation);
                    break;
                }
                AsyncClass::Stopped => on_stopped(&inner, &record),
                _ => {
                    log::debug!("ASYNC: class={:?}", record.class);
                    inner.bus.broadcast(&line);
                }
            },
            // Inferior output and anything else that is not MI
            Err(_) => inner.bus.broadcast(&line),
        }
    }

    log::debug!("observer {} finished", generation);
    on_exit(&inner, generation);
}

fn on_running(inner: &Inner) {
    let notify = {
        let mut state = inner.state();
        let changed = state.status != InferiorStatus::Running;
        let after_internal_stop = std::mem::take(&mut state.last_stop_internal);
        changed && !after_internal_stop
    };
    inner.set_status(InferiorStatus::Running);
    if notify && !inner.trace_active() {
        inner.notifier.notify_status_change();
    }
}

fn on_stopped(inner: &Arc<Inner>, record: &AsyncRecord) {
    let number = record.breakpoint_number().map(str::to_string);
    let (changed, action) = {
        let mut state = inner.state();
        let changed = state.status != InferiorStatus::Stopped;
        state.stop_reason = state.pending_stop_reason.take().unwrap_or(StopReason::Debug);
        // Unknown numbers belong to breakpoints set outside this session
        let action = number
            .as_deref()
            .and_then(|n| state.hit_actions.get(n).copied());
        state.last_stop_internal = action.is_some_and(|a| a.internal);
        (changed, action)
    };
    inner.set_status(InferiorStatus::Stopped);

    let internal = action.is_some_and(|a| a.internal);
    if changed && !internal && !inner.trace_active() {
        inner.notifier.notify_status_change();
    }

    let (Some(number), Some(action)) = (number, action) else {
        return;
    };
    match action.on_hit {
        OnHit::Break => {}
        OnHit::Trace => {
            if let Some(trace) = lock(&inner.trace).triggered() {
                trace.trigger();
            }
        }
        OnHit::FindCode | OnHit::FindAddr => {
            let session = DebugSession::from_inner(inner.clone());
            tokio::spawn(async move {
                if let Err(e) = session.record_tracking_hit(&number, action.on_hit).await {
                    log::warn!("failed to record hit of breakpoint {}: {}", number, e);
                }
            });
        }
    }
}

fn on_exit(inner: &Inner, generation: u64) {
    if inner.teardown(generation) {
        inner.notifier.notify_status_change();
        inner.notifier.notify_process_exit();
    }
}
