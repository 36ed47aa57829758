//! Graph helpers over a list of linked pipelines.
//!
//! Pipelines refer to each other by index into the same list. A pipeline
//! with no outgoing link is a sink; one that nobody links into is a source.

use tracing::error;

use crate::error::{CaptureError, Result};

/// A node of the pipeline graph.
pub trait Linked {
    /// Indices of the pipelines this one feeds.
    fn links(&self) -> &[usize];

    /// Bitmask of the paths this pipeline serves.
    fn path_mask(&self) -> u8;
}

/// Returns `true` if `node` feeds no other pipeline.
pub fn is_sink<T: Linked>(node: &T) -> bool {
    node.links().is_empty()
}

/// Returns `true` if no other pipeline in `all` links into `all[idx]`.
pub fn is_source<T: Linked>(idx: usize, all: &[T]) -> bool {
    all.iter()
        .enumerate()
        .all(|(i, node)| i == idx || !node.links().contains(&idx))
}

/// Orders pipelines so every producer precedes its consumers.
///
/// Returns indices into `all`. Fails with `NotFound` if a link points
/// outside the list or the graph has a cycle.
pub fn sort<T: Linked>(all: &[T]) -> Result<Vec<usize>> {
    let mut in_degree = vec![0usize; all.len()];
    for (i, node) in all.iter().enumerate() {
        for &to in node.links() {
            if to == i {
                continue;
            }
            match in_degree.get_mut(to) {
                Some(d) => *d += 1,
                None => {
                    error!(from = i, to, "pipeline links outside the list");
                    return Err(CaptureError::not_found(format!("linked pipeline {to}")));
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..all.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited: Vec<bool> = in_degree.iter().map(|&d| d == 0).collect();
    let mut next = 0;
    while next < order.len() {
        let cur = order[next];
        next += 1;
        for &to in all[cur].links() {
            if visited[to] {
                continue;
            }
            in_degree[to] = in_degree[to].saturating_sub(1);
            if in_degree[to] == 0 {
                visited[to] = true;
                order.push(to);
            }
        }
    }

    if order.len() != all.len() {
        error!(
            sorted = order.len(),
            total = all.len(),
            "pipelines wrongly configured"
        );
        return Err(CaptureError::not_found("pipeline order (cycle in links)"));
    }
    Ok(order)
}

/// Checks that exactly one pipeline serving `path` is a sink.
pub fn verify_single_sink<T: Linked>(all: &[T], path: u8) -> Result<()> {
    let bit = path_bit(path);
    let sinks = all
        .iter()
        .filter(|node| node.path_mask() & bit != 0 && is_sink(*node))
        .count();
    if sinks == 1 {
        return Ok(());
    }
    error!(path, sinks, "path must have exactly one sink pipeline");
    Err(CaptureError::not_found(format!(
        "single sink pipeline for path {path} (found {sinks})"
    )))
}

/// Number of paths covered by the masks in `all`: the position of the
/// highest bit of the largest mask.
pub fn path_count<T: Linked>(all: &[T]) -> u8 {
    let max = all.iter().map(Linked::path_mask).max().unwrap_or(0);
    (u8::BITS - max.leading_zeros()) as u8
}

/// Mask bit of `path`.
pub fn path_bit(path: u8) -> u8 {
    1u8.checked_shl(u32::from(path)).unwrap_or(0)
}

/// Index of the highest path in `mask`, or `None` for an empty mask.
pub fn path_index(mask: u8) -> Option<u8> {
    if mask == 0 {
        None
    } else {
        Some((u8::BITS - 1 - mask.leading_zeros()) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        links: Vec<usize>,
        mask: u8,
    }

    impl Linked for Node {
        fn links(&self) -> &[usize] {
            &self.links
        }

        fn path_mask(&self) -> u8 {
            self.mask
        }
    }

    fn node(links: &[usize], mask: u8) -> Node {
        Node {
            links: links.to_vec(),
            mask,
        }
    }

    fn position(order: &[usize], idx: usize) -> usize {
        order.iter().position(|&i| i == idx).unwrap()
    }

    #[test]
    fn test_sort_tree() {
        // 2 is the source feeding 0 and 1.
        let all = vec![node(&[], 0b01), node(&[], 0b10), node(&[0, 1], 0b11)];
        let order = sort(&all).unwrap();
        assert_eq!(order[0], 2);
        for (i, n) in all.iter().enumerate() {
            for &to in &n.links {
                assert!(position(&order, i) < position(&order, to));
            }
        }
    }

    #[test]
    fn test_sort_chain() {
        let all = vec![node(&[], 1), node(&[0], 1), node(&[1], 1)];
        assert_eq!(sort(&all).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_sort_cycle_not_found() {
        let all = vec![node(&[1], 1), node(&[0], 1)];
        assert!(sort(&all).unwrap_err().is_not_found());
    }

    #[test]
    fn test_sort_dangling_link() {
        let all = vec![node(&[5], 1)];
        assert!(sort(&all).unwrap_err().is_not_found());
    }

    #[test]
    fn test_source_and_sink() {
        let all = vec![node(&[], 1), node(&[0], 1)];
        assert!(is_sink(&all[0]));
        assert!(!is_sink(&all[1]));
        assert!(is_source(1, &all));
        assert!(!is_source(0, &all));
    }

    #[test]
    fn test_verify_single_sink() {
        let good = vec![node(&[], 0b01), node(&[], 0b10), node(&[0, 1], 0b11)];
        assert!(verify_single_sink(&good, 0).is_ok());
        assert!(verify_single_sink(&good, 1).is_ok());
        assert!(verify_single_sink(&good, 2).unwrap_err().is_not_found());

        let two_sinks = vec![node(&[], 0b01), node(&[], 0b01)];
        assert!(verify_single_sink(&two_sinks, 0).is_err());
    }

    #[test]
    fn test_path_helpers() {
        let all = vec![node(&[], 0b001), node(&[], 0b100)];
        assert_eq!(path_count(&all), 3);
        assert_eq!(path_bit(2), 0b100);
        assert_eq!(path_bit(9), 0);
        assert_eq!(path_index(0b101), Some(2));
        assert_eq!(path_index(0), None);
    }
}
