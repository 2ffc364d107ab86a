use crate::node_addr::NodeAddr;
use crate::seqno_list::SeqnoList;
use rustc_hash::FxHashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Watermark {
    /// highest missing seqno seen in the previous runs
    seen_up_to: u64,
    /// the seqnos of the last request
    requested: SeqnoList,
    /// the run in which the last request was sent
    requested_in_run: u64,
}

/// Decides which gaps to request for retransmission in a retransmission run.
///
/// A gap is requested only after it was seen in a previous run, which gives reordered messages
///  one interval to arrive before they are treated as lost. A gap that was requested in the
///  previous run is not requested again in this run, so an outstanding request gets a full
///  interval to be answered before it is repeated.
#[derive(Default)]
pub struct XmitWatermarks {
    watermarks: Mutex<FxHashMap<NodeAddr, Watermark>>,
}

impl XmitWatermarks {
    pub fn new() -> XmitWatermarks {
        XmitWatermarks::default()
    }

    /// Filters the gaps of `target`'s buffer down to the ones to request in run number `run`.
    ///  `missing` must be non-empty; gaps at or below `highest_deliverable` are dropped since they
    ///  were filled since the list was computed.
    pub fn to_request(&self, target: NodeAddr, run: u64, mut missing: SeqnoList, highest_deliverable: u64) -> Option<SeqnoList> {
        let highest_missing = missing.last()?;
        let mut watermarks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());

        if !watermarks.contains_key(&target) {
            watermarks.insert(target, Watermark {
                seen_up_to: highest_missing,
                requested: SeqnoList::new(),
                requested_in_run: 0,
            });
            return None;
        }
        let watermark = watermarks.get_mut(&target)?;

        missing.remove_higher_than(watermark.seen_up_to);
        watermark.seen_up_to = watermark.seen_up_to.max(highest_missing);
        missing.remove_up_to(highest_deliverable);

        if watermark.requested_in_run + 1 == run {
            let requested = &watermark.requested;
            missing.retain(|s| !requested.contains(*s));
        }
        if missing.is_empty() {
            return None;
        }

        watermark.requested = missing.clone();
        watermark.requested_in_run = run;
        Some(missing)
    }

    /// forgets `target`, called when its buffer has no gaps
    pub fn clear(&self, target: &NodeAddr) {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner())
            .remove(target);
    }

    pub fn retain(&self, f: impl Fn(&NodeAddr) -> bool) {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner())
            .retain(|addr, _| f(addr));
    }

    pub fn clear_all(&self) {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.watermarks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
