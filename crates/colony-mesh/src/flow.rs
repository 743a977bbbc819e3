//! Bounded recorder of dispatched events and the causal graph built from it

use colony_core::{Event, EventId};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// One recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: EventId,
    pub kind: String,
    pub from: String,
    pub to: String,
    pub parent_id: Option<EventId>,
    pub timestamp_ms: i64,
}

/// Parent to child link between two recorded events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub parent: EventId,
    pub child: EventId,
}

/// Exported causal graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFlow {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl EventFlow {
    /// Events with no recorded parent
    pub fn roots(&self) -> impl Iterator<Item = &FlowNode> {
        let children: HashSet<EventId> = self.edges.iter().map(|e| e.child).collect();
        self.nodes
            .iter()
            .filter(move |node| !children.contains(&node.id))
    }

    pub fn children_of(&self, parent: EventId) -> impl Iterator<Item = EventId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.parent == parent)
            .map(|e| e.child)
    }
}

pub(crate) struct FlowRecorder {
    capacity: usize,
    nodes: Mutex<VecDeque<FlowNode>>,
}

impl FlowRecorder {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            nodes: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record(&self, event: &Event) {
        let Ok(mut nodes) = self.nodes.lock() else {
            return;
        };
        if nodes.len() == self.capacity {
            nodes.pop_front();
        }
        nodes.push_back(FlowNode {
            id: event.id(),
            kind: event.kind().to_string(),
            from: event.from().to_string(),
            to: event.to().to_string(),
            parent_id: event.parent_id(),
            timestamp_ms: event.timestamp().timestamp_millis(),
        });
    }

    pub(crate) fn export(&self) -> EventFlow {
        let nodes: Vec<FlowNode> = match self.nodes.lock() {
            Ok(nodes) => nodes.iter().cloned().collect(),
            Err(_) => return EventFlow::default(),
        };
        let known: HashSet<EventId> = nodes.iter().map(|n| n.id).collect();
        let edges = nodes
            .iter()
            .filter_map(|node| {
                let parent = node.parent_id?;
                known.contains(&parent).then_some(FlowEdge {
                    parent,
                    child: node.id,
                })
            })
            .collect();
        EventFlow { nodes, edges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::{Address, AgentId};

    #[test]
    fn test_export_links_parent_and_child() {
        let recorder = FlowRecorder::new(16);
        let a = Address::Agent(AgentId::parse("a").unwrap());
        let root = Event::new("Ping", a.clone(), Address::Env);
        let child = Event::new("Pong", Address::Env, a).with_parent(root.id());
        recorder.record(&root);
        recorder.record(&child);

        let flow = recorder.export();
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(
            flow.edges,
            vec![FlowEdge {
                parent: root.id(),
                child: child.id()
            }]
        );
        assert_eq!(flow.roots().map(|n| n.id).collect::<Vec<_>>(), vec![root.id()]);
        assert_eq!(flow.children_of(root.id()).count(), 1);
    }

    #[test]
    fn test_capacity_bounds_recording() {
        let recorder = FlowRecorder::new(2);
        for _ in 0..5 {
            recorder.record(&Event::new("Tick", Address::Env, Address::All));
        }
        assert_eq!(recorder.export().nodes.len(), 2);
    }
}
