//! Maps an open request's seek mode onto a storage [`ReadRange`].

use common::ReadRange;

use crate::proto::{OpenFeedReq, StreamMode};

/// Computes the range a session streams for `request`, given the feed
/// length observed after any genesis append.
///
/// Returns `None` for [`StreamMode::DontStream`]. A `max_entries_to_send` of
/// zero yields a live range; otherwise the range ends `max` entries after
/// its start and is a snapshot. For `AfterHead` the start is pinned to
/// `feed_len` and `tail` is set; the seek value is ignored.
pub fn derive_read_range(request: &OpenFeedReq, feed_len: u64) -> Option<ReadRange> {
    let seek = request.seek_entry_id;
    let mut range = ReadRange {
        start: seek,
        ..Default::default()
    };

    match request.stream_mode() {
        StreamMode::DontStream => return None,
        StreamMode::AtEntry | StreamMode::FromGenesis => {}
        StreamMode::AfterEntry => range.start = seek.saturating_add(1),
        StreamMode::AfterHead => {
            range.start = feed_len;
            range.tail = true;
        }
    }

    match request.max_entries_to_send {
        0 => range.live = true,
        max => range.end = Some(range.start.saturating_add(max)),
    }
    Some(range)
}

/// Entry ID carried by the first entry a session delivers for `range`.
///
/// Delivered IDs count from here, one per entry, regardless of where the
/// entries sit in the log. A tailing read reports IDs from the requested
/// seek rather than from the feed length it started at.
pub fn first_entry_id(request: &OpenFeedReq, range: &ReadRange) -> u64 {
    if range.tail {
        request.seek_entry_id
    } else {
        range.start
    }
}
