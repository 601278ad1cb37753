//! Lazy range reads over a [`FeedLog`].
//!
//! A [`ReadRange`] mirrors the knobs a session derives from its seek mode:
//!
//! - `start` / `end`: half-open index range; `end = None` is unbounded.
//! - `tail`: ignore `start` and begin at the log length observed when the
//!   stream is created.
//! - `live`: never terminate on reaching the end of the log; park until new
//!   entries are appended.
//!
//! An explicit `end` is a promise to deliver up to that index: the stream
//! parks on the head until those entries are appended. A non-live range
//! without an `end` is a snapshot of the entries present at activation.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;

use super::{Entry, FeedLog, StorageError, StorageResult};

/// Range configuration for [`read_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadRange {
    pub start: u64,
    pub end: Option<u64>,
    pub tail: bool,
    pub live: bool,
}

/// Stream of entries produced by [`read_range`]. Yields at most one error,
/// after which it ends.
pub type EntryStream = BoxStream<'static, StorageResult<Entry>>;

struct RangeState {
    log: Arc<dyn FeedLog>,
    len_rx: watch::Receiver<u64>,
    next: u64,
    end: Option<u64>,
    // Park on the head instead of ending there.
    wait: bool,
    done: bool,
}

/// Opens a lazy entry stream over `log`.
///
/// The start position (and for snapshots, the end) is resolved immediately,
/// so a snapshot never observes entries appended after this call. Live and
/// bounded ranges wait for them.
pub fn read_range(log: Arc<dyn FeedLog>, range: ReadRange) -> EntryStream {
    let len_rx = log.watch_len();
    let len = log.len();
    let next = if range.tail { len } else { range.start };
    let end = match range.end {
        Some(end) => Some(end),
        None if range.live => None,
        None => Some(len),
    };

    let state = RangeState {
        log,
        len_rx,
        next,
        end,
        wait: range.live || range.end.is_some(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            if state.end.is_some_and(|end| state.next >= end) {
                return None;
            }

            if state.next < state.log.len() {
                let index = state.next;
                return match state.log.get(index).await {
                    Ok(Some(value)) => {
                        state.next += 1;
                        Some((Ok(Entry { index, value }), state))
                    }
                    Ok(None) => {
                        state.done = true;
                        let err = StorageError::Internal(format!(
                            "entry {} missing below reported length {}",
                            index,
                            state.log.len()
                        ));
                        Some((Err(err), state))
                    }
                    Err(err) => {
                        state.done = true;
                        Some((Err(err), state))
                    }
                };
            }

            if !state.wait {
                return None;
            }

            let next = state.next;
            if state.len_rx.wait_for(|len| *len > next).await.is_err() {
                // The log dropped its length publisher; nothing more will arrive.
                return None;
            }
        }
    })
    .boxed()
}
