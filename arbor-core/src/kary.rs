//! k-ary tree arithmetic for the overlay and the PMI reduction tree.
//!
//! Ranks are laid out breadth-first: the children of rank `r` in a tree of
//! degree `k` are `k*r + 1 ..= k*r + k`, bounded by the session size.
//!
//! ```
//! use arbor_core::kary;
//!
//! assert_eq!(kary::parent_of(2, 0), None);
//! assert_eq!(kary::parent_of(2, 4), Some(1));
//! assert_eq!(kary::children_of(2, 7, 1), vec![3, 4]);
//! ```

use crate::idset::IdSet;

/// The parent of `rank`, or `None` for the root.
#[must_use]
pub fn parent_of(k: u32, rank: u32) -> Option<u32> {
    if rank == 0 || k == 0 {
        None
    } else {
        Some((rank - 1) / k)
    }
}

/// The direct children of `rank` in a tree of `size` ranks.
#[must_use]
pub fn children_of(k: u32, size: u32, rank: u32) -> Vec<u32> {
    let mut out = Vec::new();
    if k == 0 {
        return out;
    }
    for i in 1..=k {
        // Checked math: k * rank can exceed u32 for absurd inputs.
        let Some(child) = rank.checked_mul(k).and_then(|base| base.checked_add(i)) else {
            break;
        };
        if child < size {
            out.push(child);
        }
    }
    out
}

/// Number of direct children of `rank`.
#[must_use]
pub fn child_count(k: u32, size: u32, rank: u32) -> usize {
    children_of(k, size, rank).len()
}

/// Every rank in the subtree rooted at `rank`, including `rank` itself.
#[must_use]
pub fn subtree_ranks(k: u32, size: u32, rank: u32) -> IdSet {
    let mut out = IdSet::new();
    let mut queue = vec![rank];
    while let Some(next) = queue.pop() {
        if next >= size {
            continue;
        }
        out.insert(next);
        queue.extend(children_of(k, size, next));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_tree_layout() {
        // size=7, k=2:       0
        //                  1   2
        //                 3 4 5 6
        assert_eq!(parent_of(2, 0), None);
        assert_eq!(parent_of(2, 1), Some(0));
        assert_eq!(parent_of(2, 2), Some(0));
        assert_eq!(parent_of(2, 6), Some(2));
        assert_eq!(children_of(2, 7, 0), vec![1, 2]);
        assert_eq!(children_of(2, 7, 2), vec![5, 6]);
        assert_eq!(children_of(2, 7, 3), Vec::<u32>::new());
    }

    #[test]
    fn truncated_bottom_level() {
        assert_eq!(children_of(2, 6, 2), vec![5]);
        assert_eq!(child_count(2, 6, 2), 1);
        assert_eq!(child_count(2, 1, 0), 0);
    }

    #[test]
    fn flat_tree() {
        // k >= size - 1 puts every rank directly under the root.
        assert_eq!(children_of(16, 5, 0), vec![1, 2, 3, 4]);
        for rank in 1..5 {
            assert_eq!(parent_of(16, rank), Some(0));
        }
    }

    #[test]
    fn subtree_collection() {
        assert_eq!(subtree_ranks(2, 7, 1).encode(), "1,3-4");
        assert_eq!(subtree_ranks(2, 7, 0).encode(), "0-6");
        assert_eq!(subtree_ranks(2, 7, 6).encode(), "6");
    }

    #[test]
    fn degenerate_degree() {
        assert_eq!(parent_of(0, 5), None);
        assert!(children_of(0, 7, 0).is_empty());
    }
}
