use crate::{op::Op, value::ValueId};
use id_arena::{Arena, Id};

pub type NodeId = Id<Node>;
pub type NodeArena = Arena<Node>;

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub name: Option<String>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub order: ScheduleOrder,
    pub liveness: Liveness,
}

/// Position of a node in the global execution order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScheduleOrder {
    #[default]
    Unscheduled,
    ScheduledAt(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Liveness {
    #[default]
    Live,
    Detached,
}

impl Node {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            name: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            order: ScheduleOrder::Unscheduled,
            liveness: Liveness::Live,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_in(mut self, id: ValueId) -> Self {
        self.inputs.push(id);
        self
    }

    pub fn with_ins(mut self, mut ids: Vec<ValueId>) -> Self {
        self.inputs.append(&mut ids);
        self
    }

    pub fn with_out(mut self, id: ValueId) -> Self {
        self.outputs.push(id);
        self
    }

    pub fn with_outs(mut self, mut ids: Vec<ValueId>) -> Self {
        self.outputs.append(&mut ids);
        self
    }

    pub fn is_live(&self) -> bool {
        self.liveness == Liveness::Live
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.order, ScheduleOrder::ScheduledAt(_))
    }

    pub fn stamp(&self) -> Option<u64> {
        match self.order {
            ScheduleOrder::ScheduledAt(s) => Some(s),
            ScheduleOrder::Unscheduled => None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.op.name())
    }
}

#[test]
fn unscheduled_sorts_first() {
    assert!(ScheduleOrder::Unscheduled < ScheduleOrder::ScheduledAt(0));
    assert!(ScheduleOrder::ScheduledAt(1) < ScheduleOrder::ScheduledAt(2));
    let node = Node::new(Op::ReLU).with_name("relu0");
    assert!(node.is_live());
    assert!(!node.is_scheduled());
    assert_eq!(node.display_name(), "relu0");
}
