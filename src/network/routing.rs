//! Route computation over the fabric topology.
//!
//! Both strategies cost edges by link latency and must agree on the
//! shortest-cost path; equal-cost alternatives resolve by node-id order,
//! which the ordered neighbor tables make deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::network::StorageVirtualNetwork;
use super::types::RoutingStrategy;

const MIN_CHUNK_SIZE_BYTES: u64 = 256 * 1024;
const MAX_CHUNK_SIZE_BYTES: u64 = 32 * 1024 * 1024;
const FALLBACK_BOTTLENECK_BPS: u64 = 500_000_000;

impl StorageVirtualNetwork {
    /// Usable capacity of the link `(u, v)` in bits/sec: the minimum of both
    /// directions' provisioned bandwidth and both endpoints' node bandwidth;
    /// zero when either endpoint or the link itself has failed.
    pub(crate) fn link_capacity_bps(&self, u: &str, v: &str) -> u64 {
        if self.failed_nodes.contains(u) || self.failed_nodes.contains(v) {
            return 0;
        }
        if self.failed_links.contains(&(u.to_string(), v.to_string())) {
            return 0;
        }
        let Some(node_u) = self.nodes.get(u) else {
            return 0;
        };
        let Some(node_v) = self.nodes.get(v) else {
            return 0;
        };
        let forward = node_u.connections().get(v).copied().unwrap_or(0);
        let backward = node_v.connections().get(u).copied().unwrap_or(0);
        forward
            .min(backward)
            .min(node_u.bandwidth_bps())
            .min(node_v.bandwidth_bps())
    }

    fn link_usable(&self, u: &str, v: &str) -> bool {
        !self.failed_links.contains(&(u.to_string(), v.to_string()))
            && !self.failed_nodes.contains(v)
    }

    fn edge_cost(&self, u: &str, v: &str) -> f64 {
        self.link_latency_ms
            .get(&(u.to_string(), v.to_string()))
            .copied()
            .unwrap_or_else(|| self.nodes.get(u).map(|n| n.link_latency(v)).unwrap_or(0.0))
    }

    /// Shortest-latency path from `src` to `dst` under the configured
    /// strategy, or `None` when no active path exists.
    pub fn compute_route(&self, src: &str, dst: &str) -> Option<Vec<String>> {
        if self.failed_nodes.contains(src) || self.failed_nodes.contains(dst) {
            return None;
        }
        if !self.nodes.contains_key(src) || !self.nodes.contains_key(dst) {
            return None;
        }
        if src == dst {
            return Some(vec![src.to_string()]);
        }
        match self.routing_strategy {
            RoutingStrategy::LinkState => self.dijkstra(src, dst),
            RoutingStrategy::DistanceVector => self.bellman_ford(src, dst),
        }
    }

    fn dijkstra(&self, src: &str, dst: &str) -> Option<Vec<String>> {
        let mut dist: BTreeMap<String, f64> = BTreeMap::new();
        let mut prev: BTreeMap<String, String> = BTreeMap::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        dist.insert(src.to_string(), 0.0);

        loop {
            // Deterministic extract-min: lowest (distance, node id).
            let current = dist
                .iter()
                .filter(|(node, _)| !visited.contains(*node))
                .min_by(|(a_id, a_d), (b_id, b_d)| a_d.total_cmp(b_d).then(a_id.cmp(b_id)))
                .map(|(id, d)| (id.clone(), *d));
            let Some((current, current_dist)) = current else {
                return None;
            };
            if current == dst {
                break;
            }
            visited.insert(current.clone());

            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            let neighbors: Vec<String> = node.connections().keys().cloned().collect();
            for neighbor in neighbors {
                if visited.contains(&neighbor) || !self.link_usable(&current, &neighbor) {
                    continue;
                }
                let candidate = current_dist + self.edge_cost(&current, &neighbor);
                let improved = dist
                    .get(&neighbor)
                    .map(|best| candidate < *best)
                    .unwrap_or(true);
                if improved {
                    dist.insert(neighbor.clone(), candidate);
                    prev.insert(neighbor, current.clone());
                }
            }
        }
        Some(Self::unwind_path(&prev, src, dst))
    }

    fn bellman_ford(&self, src: &str, dst: &str) -> Option<Vec<String>> {
        let active: Vec<String> = self
            .nodes
            .keys()
            .filter(|n| !self.failed_nodes.contains(*n))
            .cloned()
            .collect();
        let mut dist: BTreeMap<String, f64> = BTreeMap::new();
        let mut prev: BTreeMap<String, String> = BTreeMap::new();
        dist.insert(src.to_string(), 0.0);

        for _ in 0..active.len().saturating_sub(1) {
            let mut changed = false;
            for u in &active {
                let Some(&du) = dist.get(u) else {
                    continue;
                };
                let Some(node) = self.nodes.get(u) else {
                    continue;
                };
                let neighbors: Vec<String> = node.connections().keys().cloned().collect();
                for v in neighbors {
                    if self.failed_nodes.contains(&v) || !self.link_usable(u, &v) {
                        continue;
                    }
                    let candidate = du + self.edge_cost(u, &v);
                    let improved = dist.get(&v).map(|best| candidate < *best).unwrap_or(true);
                    if improved {
                        dist.insert(v.clone(), candidate);
                        prev.insert(v, u.clone());
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        if !dist.contains_key(dst) {
            return None;
        }
        Some(Self::unwind_path(&prev, src, dst))
    }

    fn unwind_path(prev: &BTreeMap<String, String>, src: &str, dst: &str) -> Vec<String> {
        let mut path = vec![dst.to_string()];
        let mut cursor = dst.to_string();
        while cursor != src {
            let Some(parent) = prev.get(&cursor) else {
                break;
            };
            path.push(parent.clone());
            cursor = parent.clone();
        }
        path.reverse();
        path
    }

    /// Nodes reachable from `src` across active links and nodes.
    pub(crate) fn reachable_from(&self, src: &str) -> BTreeSet<String> {
        let mut reachable = BTreeSet::new();
        if self.failed_nodes.contains(src) || !self.nodes.contains_key(src) {
            return reachable;
        }
        let mut queue = VecDeque::new();
        reachable.insert(src.to_string());
        queue.push_back(src.to_string());
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for neighbor in node.connections().keys() {
                if reachable.contains(neighbor)
                    || self.failed_nodes.contains(neighbor)
                    || !self.link_usable(&current, neighbor)
                {
                    continue;
                }
                reachable.insert(neighbor.clone());
                queue.push_back(neighbor.clone());
            }
        }
        reachable
    }

    /// Chunk size targeting a per-chunk duration that grows slowly with hop
    /// count, bounded by the route's bottleneck capacity.
    pub(crate) fn recommend_chunk_size(&self, file_size: u64, route: Option<&[String]>) -> u64 {
        let clamp = |size: u64| size.clamp(MIN_CHUNK_SIZE_BYTES, MAX_CHUNK_SIZE_BYTES).min(file_size).max(1);
        let Some(route) = route else {
            return clamp(file_size);
        };
        if route.len() < 2 {
            return clamp(file_size);
        }
        let hops = route.len() - 1;
        let mut bottleneck = u64::MAX;
        for window in route.windows(2) {
            bottleneck = bottleneck.min(self.link_capacity_bps(&window[0], &window[1]));
        }
        if bottleneck == 0 || bottleneck == u64::MAX {
            bottleneck = FALLBACK_BOTTLENECK_BPS;
        }
        let bytes_per_second = (bottleneck / 8).max(64 * 1024) as f64;
        let target_duration = 0.35 + 0.15 * ((hops + 1) as f64).log2();
        clamp((bytes_per_second * target_duration) as u64)
    }

    /// Bandwidth currently in use on every link touching `node_id`, in
    /// bits/sec. A link with any chunks on it is fully allocated (the
    /// per-chunk shares sum to its capacity).
    pub(crate) fn node_bandwidth_usage_bps(&self, node_id: &str) -> u64 {
        let mut usage = 0u64;
        for ((a, b), chunks) in &self.link_occupancy {
            if chunks.is_empty() {
                continue;
            }
            if a == node_id || b == node_id {
                usage += self.link_capacity_bps(a, b);
            }
        }
        usage
    }
}
