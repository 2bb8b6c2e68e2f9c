//! Tree rotation and large-node layout (spec §4.9, component C9).

use crate::bbox::Bbox;
use crate::node::{InteriorNode, NodeRef};

/// Fraction of primitives whose leaves are identified as "large" and
/// promoted to dedicated storage (spec §4.9, `layoutLargeNodes(pinfo.size()
/// * 0.005)`, SPEC_FULL.md §B).
pub const LARGE_NODE_FRACTION: f32 = 0.005;

/// Apply up to `passes` whole-tree rotation passes, root-downward, stopping
/// early once a pass makes no improving swap (spec §4.9, §8 "Rotation
/// monotonicity": expected cost after C9 is never higher than before).
pub fn rotate_tree(root: NodeRef, passes: u32) {
    for _ in 0..passes {
        if !rotate_pass(root) {
            break;
        }
    }
}

fn rotate_pass(node_ref: NodeRef) -> bool {
    if !node_ref.is_interior() {
        return false;
    }
    // Safety: `node_ref` was checked `is_interior` and the tree it belongs
    // to outlives this call (caller owns the `Bvh`/arena for the duration).
    let node = unsafe { node_ref.as_interior_mut() };
    let mut improved = rotate_node(node);
    for slot in node.children() {
        if rotate_pass(slot.child) {
            improved = true;
        }
    }
    improved
}

/// Try swapping each grandchild of one child with a sibling child, keeping
/// the swap only when it strictly lowers the summed surface area of the two
/// slots involved — the area-proxy form of "expected traversal cost"
/// (spec §4.9: "locally swapping grandchildren between siblings whenever
/// the swap lowers expected cost").
fn rotate_node(node: &mut InteriorNode) -> bool {
    let n = node.children().len();
    let mut improved = false;

    for i in 0..n {
        if !node.children()[i].child.is_interior() {
            continue;
        }
        for j in 0..n {
            if i == j {
                continue;
            }
            improved |= try_rotate_pair(node, i, j);
        }
    }
    improved
}

fn try_rotate_pair(node: &mut InteriorNode, i: usize, j: usize) -> bool {
    let sibling_bounds = node.children()[j].bounds;
    let sibling_child = node.children()[j].child;
    // Safety: checked interior by the caller (`rotate_node`).
    let inner = unsafe { node.children()[i].child.as_interior_mut() };
    let grandchild_count = inner.children().len();

    let mut best: Option<(usize, Bbox, Bbox, f32)> = None;
    let old_cost = node.children()[i].bounds.area() + node.children()[j].bounds.area();

    for g in 0..grandchild_count {
        let new_inner_bounds = union_excluding(inner, g).union(&sibling_bounds);
        let new_sibling_bounds = inner.children()[g].bounds;
        let new_cost = new_inner_bounds.area() + new_sibling_bounds.area();
        if new_cost < old_cost {
            let improves_more = best.as_ref().map(|&(_, _, _, c)| new_cost < c).unwrap_or(true);
            if improves_more {
                best = Some((g, new_inner_bounds, new_sibling_bounds, new_cost));
            }
        }
    }

    let Some((g, new_inner_bounds, new_sibling_bounds, _)) = best else {
        return false;
    };

    let promoted = inner.children()[g];
    inner.set(g, sibling_bounds, sibling_child);
    node.set(i, new_inner_bounds, node.children()[i].child);
    node.set(j, new_sibling_bounds, promoted.child);
    true
}

fn union_excluding(node: &InteriorNode, excluded: usize) -> Bbox {
    let mut b = Bbox::new();
    for (idx, slot) in node.children().iter().enumerate() {
        if idx != excluded {
            b.include_bbox(&slot.bounds);
        }
    }
    b
}

/// One leaf candidate for large-node promotion: its [`NodeRef`] and the
/// primitive count it carries.
pub struct LargeNodeCandidate {
    pub node: NodeRef,
    pub item_count: u32,
}

/// Identify the top `ceil(total_prim_count * LARGE_NODE_FRACTION)` leaves by
/// item count (spec §4.9 large-node layout). Returns only the
/// identification list — this crate does not maintain a second storage
/// tier for promoted leaves (out of scope: storage tiering is a traversal-
/// locality optimization over the node/leaf layout this crate already
/// exposes, not part of the construction algorithms themselves, spec §1).
pub fn find_large_node_candidates(root: NodeRef, total_prim_count: usize) -> Vec<LargeNodeCandidate> {
    let mut leaves = Vec::new();
    collect_leaves(root, &mut leaves);
    leaves.sort_unstable_by(|a, b| b.item_count.cmp(&a.item_count));
    let keep = ((total_prim_count as f32 * LARGE_NODE_FRACTION).ceil() as usize).max(1);
    leaves.truncate(keep);
    leaves
}

fn collect_leaves(node_ref: NodeRef, out: &mut Vec<LargeNodeCandidate>) {
    if node_ref.is_invalid() {
        return;
    }
    if node_ref.is_leaf() {
        // Safety: `node_ref` was checked `is_leaf` and its arena is alive
        // for the duration of this call.
        let (_, count) = unsafe { node_ref.as_leaf() };
        out.push(LargeNodeCandidate {
            node: node_ref,
            item_count: count,
        });
        return;
    }
    // Safety: not a leaf and not invalid, so it is interior; its arena is
    // alive for the duration of this call.
    let node = unsafe { node_ref.as_interior() };
    for slot in node.children() {
        collect_leaves(slot.child, out);
    }
}
