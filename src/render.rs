//! Parallel event listing
//!
//! Formatting a finalized machine's events is independent per event, so
//! the index range is cut into chunks and rendered by a pool of scoped
//! workers. Chunks finish in any order but are committed in index order:
//! a worker holding chunk `n` waits on a condition variable until the
//! shared "next chunk" counter reaches `n`, writes, then advances it.
//!
//! ```text
//!   chunk queue ──► worker 0 ─┐
//!               ──► worker 1 ─┼─► wait(next == n) ─► write ─► next += 1
//!               ──► worker k ─┘
//! ```

use crate::error::KdError;
use crate::kdebug::codes;
use crate::kdebug::{FuncQualifier, KdEvent};
use crate::machine::Machine;
use crossbeam::channel;
use std::fmt::Write as _;
use std::io::Write;
use std::ops::Range;
use std::sync::{Condvar, Mutex};
use tracing::debug;

/// One listing line for `event`, without the trailing newline.
pub fn render_event(machine: &Machine, event: &KdEvent) -> String {
    let mut line = String::with_capacity(128);
    let t = event.timestamp;

    let owner = machine.thread(event.tid, t).map(|thread| {
        let process = machine.process_of(thread.handle());
        format!("{}/{}", process.pid(), process.name())
    });
    let name = match codes::event_name(event.debug_id.event_id()) {
        Some(name) => name.to_string(),
        None => event.debug_id.to_string(),
    };
    let func = match event.debug_id.func() {
        FuncQualifier::Start => " START",
        FuncQualifier::End => " END",
        FuncQualifier::Both => " START|END",
        FuncQualifier::None => "",
    };

    // Writing into a String cannot fail.
    let _ = write!(
        line,
        "{:>8} {:>16} cpu{:<3} 0x{:<8x} {:<24} {}{}",
        event.index,
        t.value(),
        event.cpu,
        event.tid,
        owner.as_deref().unwrap_or("-"),
        name,
        func
    );
    for arg in event.args {
        let _ = write!(line, " 0x{:x}", arg);
    }

    match event.debug_id.event_id() {
        codes::MACH_IPC_VOUCHER_CREATE => {
            if let Some(content) = machine
                .voucher(event.arg1(), t)
                .and_then(|voucher| voucher.content())
            {
                let _ = write!(line, " content={}", hex::encode(content));
            }
        }
        codes::MACH_IPC_MSG_SEND | codes::MACH_IPC_MSG_RECV => {
            if let Some(msg) = machine.mach_msg(event.index) {
                let _ = write!(line, " kmsg=0x{:x}", msg.kmsg);
                if let Some(latency) = msg.latency() {
                    let _ = write!(line, " latency={}", latency);
                }
            }
        }
        _ => {}
    }
    line
}

fn render_chunk(machine: &Machine, range: Range<usize>) -> String {
    let mut out = String::with_capacity(range.len() * 128);
    for event in &machine.events()[range] {
        out.push_str(&render_event(machine, event));
        out.push('\n');
    }
    out
}

/// Ordered-commit state shared by the workers
struct Commit<'w, W> {
    next: usize,
    writer: &'w mut W,
    error: Option<std::io::Error>,
}

/// Write the listing for `range` of the machine's events to `writer`.
///
/// The output is byte-identical to a sequential rendering regardless of
/// `workers`. Returns the number of events written.
pub fn render_events<W: Write + Send>(
    machine: &Machine,
    range: Range<usize>,
    workers: usize,
    chunk_size: usize,
    writer: &mut W,
) -> Result<usize, KdError> {
    let end = range.end.min(machine.events().len());
    let range = range.start.min(end)..end;
    let count = range.len();
    let chunk_size = chunk_size.max(1);

    if workers <= 1 || count <= chunk_size {
        writer.write_all(render_chunk(machine, range).as_bytes())?;
        writer.flush()?;
        return Ok(count);
    }

    let chunks: Vec<Range<usize>> = range
        .clone()
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(range.end))
        .collect();
    debug!(
        "rendering {} events in {} chunks on {} workers",
        count,
        chunks.len(),
        workers
    );

    let (tx, rx) = channel::unbounded::<(usize, Range<usize>)>();
    for (n, chunk) in chunks.into_iter().enumerate() {
        // The receiver is alive until the scope below ends.
        let _ = tx.send((n, chunk));
    }
    drop(tx);

    let commit = Mutex::new(Commit {
        next: 0,
        writer,
        error: None,
    });
    let turn = Condvar::new();

    let scoped = crossbeam::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let commit = &commit;
            let turn = &turn;
            scope.spawn(move |_| {
                for (n, chunk) in rx.iter() {
                    let text = render_chunk(machine, chunk);
                    let mut state = match commit.lock() {
                        Ok(state) => state,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    while state.next != n {
                        state = match turn.wait(state) {
                            Ok(state) => state,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                    if state.error.is_none() {
                        if let Err(e) = state.writer.write_all(text.as_bytes()) {
                            state.error = Some(e);
                        }
                    }
                    state.next += 1;
                    turn.notify_all();
                }
            });
        }
    });
    if scoped.is_err() {
        return Err(KdError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "render worker panicked",
        )));
    }

    let state = match commit.into_inner() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(e) = state.error {
        return Err(e.into());
    }
    state.writer.flush()?;
    Ok(count)
}
