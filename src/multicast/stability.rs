use crate::digest::Digest;
use crate::node_addr::NodeAddr;
use crate::view::View;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use tracing::trace;

#[derive(Default)]
struct Round {
    view_id: u64,
    members: Vec<NodeAddr>,
    digests: FxHashMap<NodeAddr, Digest>,
}

/// Collects the digests of all members for a stability round. Once every member of the current
///  view reported, the round yields the stable digest and starts over.
#[derive(Default)]
pub struct StabilityTracker {
    round: Mutex<Round>,
}

impl StabilityTracker {
    pub fn new() -> StabilityTracker {
        StabilityTracker::default()
    }

    /// starts a new round for the members of `view`, discarding collected digests
    pub fn reset_for_view(&self, view: &View) {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        round.view_id = view.view_id;
        round.members = view.members.clone();
        round.digests.clear();
    }

    /// starts a new round for the same members
    pub fn reset_round(&self) {
        self.round.lock().unwrap_or_else(|e| e.into_inner())
            .digests.clear();
    }

    /// Adds a member's digest to the current round, replacing a digest it sent earlier in the
    ///  round. Returns the stable digest if this completed the round.
    pub fn add_digest(&self, sender: NodeAddr, digest: Digest) -> Option<Digest> {
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if !round.members.contains(&sender) {
            trace!("ignoring digest from {:?}, not a member of view {}", sender, round.view_id);
            return None;
        }

        round.digests.insert(sender, digest);
        if round.digests.len() < round.members.len() {
            return None;
        }

        let stable = Digest::stable_of(round.digests.values());
        round.digests.clear();
        Some(stable)
    }

    /// the members that did not report in the current round yet
    pub fn missing(&self) -> Vec<NodeAddr> {
        let round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        round.members.iter()
            .filter(|m| !round.digests.contains_key(m))
            .copied()
            .collect()
    }
}
