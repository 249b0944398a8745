//! Tour construction and improvement heuristics over a distance matrix.
//!
//! Tours are vectors of matrix indices starting at the depot. All functions
//! are deterministic: candidates are scanned in ascending index order and
//! ties go to the lowest index.

use std::time::{Duration, Instant};

use crate::matrix::DistanceMatrix;

/// Minimum gain for a 2-opt move to count as an improvement.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

/// Length of a tour; infinite when it uses an unresolved pair.
pub fn tour_length(matrix: &DistanceMatrix, tour: &[usize], closed: bool) -> f64 {
    let mut total: f64 = tour.windows(2).map(|leg| matrix.cost(leg[0], leg[1])).sum();
    if closed && tour.len() > 1 {
        total += matrix.cost(tour[tour.len() - 1], tour[0]);
    }
    total
}

/// Greedy tour: from `start`, always move to the closest unvisited index.
///
/// Unresolved pairs are only taken when nothing else remains.
pub fn nearest_neighbor(matrix: &DistanceMatrix, start: usize) -> Vec<usize> {
    let n = matrix.len();
    if n == 0 {
        return Vec::new();
    }

    let mut visited = vec![false; n];
    let mut tour = Vec::with_capacity(n);
    let mut current = start;
    visited[current] = true;
    tour.push(current);

    while tour.len() < n {
        let mut best: Option<(usize, f64)> = None;
        for candidate in 0..n {
            if visited[candidate] {
                continue;
            }
            let cost = matrix.cost(current, candidate);
            match best {
                Some((_, best_cost)) if cost >= best_cost => {}
                _ => best = Some((candidate, cost)),
            }
        }

        let Some((next, _)) = best else { break };
        visited[next] = true;
        tour.push(next);
        current = next;
    }

    tour
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoOptBudget {
    /// Maximum number of full scans over all edge pairs.
    pub max_passes: usize,
    pub time_limit: Option<Duration>,
}

impl Default for TwoOptBudget {
    fn default() -> Self {
        Self {
            max_passes: 1_000,
            time_limit: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwoOptOutcome {
    pub tour: Vec<usize>,
    pub passes: usize,
    pub improvements: usize,
    /// Stopped by the budget before reaching a local optimum.
    pub exhausted: bool,
}

/// First-improvement 2-opt.
///
/// Scans edge pairs `(i, j)` in ascending order and reverses
/// `tour[i + 1..=j]` whenever that strictly shortens the tour. The first
/// element (the depot) never moves. Stops after a pass without
/// improvement or when the budget runs out.
pub fn two_opt(
    matrix: &DistanceMatrix,
    mut tour: Vec<usize>,
    closed: bool,
    budget: TwoOptBudget,
) -> TwoOptOutcome {
    let n = tour.len();
    let mut outcome = TwoOptOutcome {
        tour: Vec::new(),
        passes: 0,
        improvements: 0,
        exhausted: false,
    };
    if n < 3 {
        outcome.tour = tour;
        return outcome;
    }

    let started = Instant::now();
    let mut converged = false;

    'passes: while outcome.passes < budget.max_passes {
        outcome.passes += 1;
        let mut improved = false;

        for i in 0..n - 1 {
            if budget.time_limit.is_some_and(|limit| started.elapsed() >= limit) {
                break 'passes;
            }

            for j in i + 2..n {
                let next = if j + 1 < n {
                    Some(tour[j + 1])
                } else if closed {
                    Some(tour[0])
                } else {
                    None
                };

                let (old, new) = move_costs(matrix, &tour, i, j, next);
                if new < old - IMPROVEMENT_EPSILON {
                    tour[i + 1..=j].reverse();
                    outcome.improvements += 1;
                    improved = true;
                }
            }
        }

        if !improved {
            converged = true;
            break;
        }
    }

    outcome.exhausted = !converged;
    outcome.tour = tour;
    outcome
}

/// Cost of the affected edges before and after reversing `tour[i + 1..=j]`.
fn move_costs(
    matrix: &DistanceMatrix,
    tour: &[usize],
    i: usize,
    j: usize,
    next: Option<usize>,
) -> (f64, f64) {
    let (a, b, c) = (tour[i], tour[i + 1], tour[j]);
    let mut old = matrix.cost(a, b);
    let mut new = matrix.cost(a, c);
    if let Some(d) = next {
        old += matrix.cost(c, d);
        new += matrix.cost(b, d);
    }

    // Reversal flips the direction of every inner edge.
    if !matrix.is_symmetric() {
        for k in i + 1..j {
            old += matrix.cost(tour[k], tour[k + 1]);
            new += matrix.cost(tour[k + 1], tour[k]);
        }
    }

    (old, new)
}

/// Tour from a depth-first preorder walk of a minimum spanning tree.
///
/// The tree is grown with Prim's algorithm from `root`; children are
/// visited in ascending index order.
pub fn mst_preorder(matrix: &DistanceMatrix, root: usize) -> Vec<usize> {
    let n = matrix.len();
    if n == 0 {
        return Vec::new();
    }

    let mut in_tree = vec![false; n];
    let mut key = vec![f64::INFINITY; n];
    let mut parent: Vec<Option<usize>> = vec![None; n];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    key[root] = 0.0;

    for _ in 0..n {
        let mut selected: Option<usize> = None;
        for v in 0..n {
            if in_tree[v] {
                continue;
            }
            match selected {
                Some(u) if key[v] >= key[u] => {}
                _ => selected = Some(v),
            }
        }
        let Some(u) = selected else { break };

        in_tree[u] = true;
        // Unreachable nodes hang off the root so the walk still visits them.
        match parent[u] {
            Some(p) => children[p].push(u),
            None if u != root => children[root].push(u),
            None => {}
        }

        for v in 0..n {
            if in_tree[v] {
                continue;
            }
            let weight = matrix.cost(u, v);
            if weight < key[v] {
                key[v] = weight;
                parent[v] = Some(u);
            }
        }
    }

    for list in &mut children {
        list.sort_unstable();
    }

    let mut tour = Vec::with_capacity(n);
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        tour.push(node);
        stack.extend(children[node].iter().rev());
    }
    tour
}
