use std::sync::Mutex;

use crate::claim;
use crate::node::NodeRef;

/// One worker's pending move-up grant.
///
/// A finishing delete whose sibling carries another worker's marker chain
/// cannot simply release its flags: the marked worker's fix-up is about to
/// climb straight through them. The donor publishes the flags here instead,
/// and the inheritor treats them as already claimed while its fix-up moves
/// up, until it climbs past `goal` or its operation ends.
///
/// A grant can also carry a black deficit. When two fix-ups meet across one
/// parent, the donor's short node travels with its flags in `short`; the
/// inheritor that finds that node as its own sibling knows both children of
/// the parent are short by the same one black and climbs once for both.
struct Record<K> {
    granted: Vec<NodeRef<K>>,
    goal: NodeRef<K>,
    peer: usize,
    short: Option<NodeRef<K>>,
}

/// A fix-up round's view of its own grant. Snapshots are taken fresh each
/// round; the record itself only changes hands at publish and consume.
pub(crate) struct Inherited<K> {
    granted: Vec<NodeRef<K>>,
    pub(crate) goal: NodeRef<K>,
    /// A second worker whose markers may sit inside the granted region. The
    /// spacing rule tolerates them the same way it tolerates our own.
    pub(crate) peer: usize,
    /// The donor's unpaid deficit node, when the grant settles a debt
    /// rather than a surrendered setup area.
    pub(crate) short: Option<NodeRef<K>>,
}

impl<K> Inherited<K> {
    pub(crate) fn holds(&self, node: NodeRef<K>) -> bool {
        self.granted.iter().any(|granted| *granted == node)
    }
}

pub(crate) struct HandoffTable<K> {
    slots: Vec<Mutex<Option<Record<K>>>>,
}

impl<K> HandoffTable<K> {
    pub(crate) fn new(capacity: usize) -> HandoffTable<K> {
        HandoffTable {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn slot(&self, id: usize) -> &Mutex<Option<Record<K>>> {
        self.slots.get(id).expect("a registered worker id")
    }

    /// Publishes a grant to `to`. Fails when that worker still has an
    /// unconsumed grant; the flags are handed back and the donor releases
    /// them normally.
    pub(crate) fn offer(
        &self,
        to: usize,
        granted: Vec<NodeRef<K>>,
        goal: NodeRef<K>,
        peer: usize,
    ) -> Result<(), Vec<NodeRef<K>>> {
        let mut slot = self.slot(to).lock().expect("hand-off slot poisoned");
        if slot.is_some() {
            return Err(granted);
        }
        *slot = Some(Record {
            granted,
            goal,
            peer,
            short: None,
        });
        Ok(())
    }

    /// Publishes a deficit grant to `to`: the donor's flags, its short
    /// node, and the node the donor saw the target's own deficit parked
    /// on. The parked marker is re-read under the slot lock; a target
    /// that settled in the meantime no longer wants flags, so the grant
    /// is refused and the donor keeps everything.
    pub(crate) fn offer_debt(
        &self,
        to: usize,
        granted: Vec<NodeRef<K>>,
        goal: NodeRef<K>,
        peer: usize,
        short: NodeRef<K>,
        gate: NodeRef<K>,
    ) -> Result<(), Vec<NodeRef<K>>> {
        let mut slot = self.slot(to).lock().expect("hand-off slot poisoned");
        if slot.is_some() || gate.marker() != to {
            return Err(granted);
        }
        *slot = Some(Record {
            granted,
            goal,
            peer,
            short: Some(short),
        });
        Ok(())
    }

    pub(crate) fn snapshot(&self, me: usize) -> Option<Inherited<K>> {
        let slot = self.slot(me).lock().expect("hand-off slot poisoned");
        slot.as_ref().map(|record| Inherited {
            granted: record.granted.clone(),
            goal: record.goal,
            peer: record.peer,
            short: record.short,
        })
    }

    /// Takes one node out of this worker's grant, making its flag the
    /// caller's own to track and release. Returns false if no grant names
    /// the node.
    pub(crate) fn adopt(&self, me: usize, node: NodeRef<K>) -> bool {
        let mut slot = self.slot(me).lock().expect("hand-off slot poisoned");
        if let Some(record) = slot.as_mut() {
            if let Some(at) = record.granted.iter().position(|granted| *granted == node) {
                record.granted.swap_remove(at);
                if record.short == Some(node) {
                    record.short = None;
                }
                if record.granted.is_empty() {
                    *slot = None;
                }
                return true;
            }
        }
        false
    }

    /// Consumes this worker's grant, releasing every flag still in it.
    /// Nodes the worker wanted to keep were adopted out of the record
    /// beforehand, so a grant and a local area never overlap.
    pub(crate) fn consume(&self, me: usize) {
        let mut slot = self.slot(me).lock().expect("hand-off slot poisoned");
        if let Some(record) = slot.take() {
            for node in record.granted {
                claim::release(node);
            }
        }
    }

    /// Takes the whole grant out of the slot without releasing anything.
    /// Every returned flag becomes the caller's own, along with the
    /// donor's deficit node if one is still unadopted.
    pub(crate) fn take(&self, me: usize) -> Option<(Vec<NodeRef<K>>, Option<NodeRef<K>>)> {
        let mut slot = self.slot(me).lock().expect("hand-off slot poisoned");
        slot.take().map(|record| (record.granted, record.short))
    }

    /// Releases an idle grant parked in this worker's slot. A deficit
    /// grant stays: its flags gate a debt that still has to be paid.
    pub(crate) fn shed(&self, me: usize) {
        let mut slot = self.slot(me).lock().expect("hand-off slot poisoned");
        if slot.as_ref().map_or(false, |record| record.short.is_some()) {
            return;
        }
        if let Some(record) = slot.take() {
            for node in record.granted {
                claim::release(node);
            }
        }
    }
}
