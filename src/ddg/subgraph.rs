/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::{BoundaryEdge, DataDependenceGraph, MoveId, OpId};
use crate::BlockId;
use alloc::vec;
use smallvec::SmallVec;

impl DataDependenceGraph {
    /// Copy the part of the graph belonging to `block` into a new,
    /// independently owned graph. Edges with one end outside the block
    /// are kept as [`BoundaryEdge`] annotations on the subgraph.
    pub fn create_subgraph(&self, block: BlockId) -> DataDependenceGraph {
        let mut sub = self.empty_like();
        let mut local = vec![MoveId::invalid(); self.nodes.len()];

        for n in self.node_ids() {
            let node = &self.nodes[n];
            if node.block != block {
                continue;
            }
            let mut copy = node.clone();
            copy.ins.clear();
            copy.outs.clear();
            copy.src_op = None;
            copy.dst_op = None;
            local[n.index()] = sub.nodes.push(copy);
            sub.parent_ids.push(n);
        }

        for op in self.ops.ids() {
            let orig = &self.ops[op];
            let inputs: SmallVec<[MoveId; 4]> = orig
                .inputs
                .iter()
                .map(|n| local[n.index()])
                .filter(|n| n.is_valid())
                .collect();
            let outputs: SmallVec<[MoveId; 2]> = orig
                .outputs
                .iter()
                .map(|n| local[n.index()])
                .filter(|n| n.is_valid())
                .collect();
            if inputs.is_empty() && outputs.is_empty() {
                continue;
            }
            let mut copy = orig.clone();
            copy.inputs.clear();
            copy.outputs.clear();
            let new_op: OpId = sub.ops.push(copy);
            for n in inputs {
                sub.add_input(new_op, n);
            }
            for n in outputs {
                sub.add_output(new_op, n);
            }
        }

        for e in self.edge_ids() {
            let entry = &self.edges[e];
            let tail = local[entry.tail.index()];
            let head = local[entry.head.index()];
            match (tail.is_valid(), head.is_valid()) {
                (true, true) => {
                    sub.connect_nodes(tail, head, entry.edge);
                }
                (true, false) => sub.boundary.push(BoundaryEdge {
                    local: tail,
                    remote: entry.head,
                    edge: entry.edge,
                    incoming: false,
                }),
                (false, true) => sub.boundary.push(BoundaryEdge {
                    local: head,
                    remote: entry.tail,
                    edge: entry.edge,
                    incoming: true,
                }),
                (false, false) => {}
            }
        }
        trace!(
            "subgraph of block{}: {} nodes, {} boundary edges",
            block.index(),
            sub.nodes.len(),
            sub.boundary.len()
        );
        sub
    }
}
