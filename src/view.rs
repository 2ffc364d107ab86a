use crate::node_addr::NodeAddr;
use std::sync::{Arc, RwLock};

/// A snapshot of group membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub view_id: u64,
    pub members: Vec<NodeAddr>,
}

impl View {
    pub fn new(view_id: u64, members: Vec<NodeAddr>) -> View {
        View { view_id, members }
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.members.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The membership capability the reliability engines depend on
pub trait Membership: Send + Sync {
    /// `true` if the address is a member of the current view, or if no view was installed yet
    fn is_member(&self, addr: &NodeAddr) -> bool;

    fn current_view(&self) -> Option<Arc<View>>;
}

/// Holds the most recently installed view
#[derive(Default)]
pub struct ViewHolder {
    view: RwLock<Option<Arc<View>>>,
}

impl ViewHolder {
    pub fn new() -> ViewHolder {
        ViewHolder::default()
    }

    /// Installs a view unless its id is lower than the current view's. Returns `true` if the view
    ///  was installed.
    pub fn install(&self, view: View) -> bool {
        let mut current = self.view.write().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = current.as_ref() {
            if prev.view_id > view.view_id {
                return false;
            }
        }
        *current = Some(Arc::new(view));
        true
    }

    pub fn members(&self) -> Vec<NodeAddr> {
        self.current_view()
            .map(|v| v.members.clone())
            .unwrap_or_default()
    }

    pub fn has_view(&self) -> bool {
        self.current_view().is_some()
    }
}

impl Membership for ViewHolder {
    fn is_member(&self, addr: &NodeAddr) -> bool {
        match self.current_view() {
            Some(view) => view.contains(addr),
            None => true,
        }
    }

    fn current_view(&self) -> Option<Arc<View>> {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
