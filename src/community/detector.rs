use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};

use super::{CommunityDetectionConfig, CommunityDetectionResult};
use crate::graph::{DetectedCommunity, GraphEntity, GraphRelationship};

/// Hierarchical Louvain modularity optimization.
///
/// Detection is a pure function of its inputs: nothing is written anywhere,
/// and with a fixed `random_seed` the same graph yields the same partition
/// regardless of the order entities and relationships are supplied in.
#[derive(Debug, Clone, Default)]
pub struct CommunityDetector {
    config: CommunityDetectionConfig,
}

/// Immutable snapshot of one hierarchy level.
///
/// Node `i` of a level stands for the original entities in `members[i]`
/// (indices into the id-sorted entity list).
#[derive(Debug, Clone)]
struct LevelGraph {
    /// Symmetric weights, self-loops excluded.
    adjacency: Vec<BTreeMap<usize, f64>>,
    strengths: Vec<f64>,
    /// m: half the sum of strengths.
    total_weight: f64,
    members: Vec<Vec<usize>>,
}

impl LevelGraph {
    fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    fn from_input(entity_ids: &[String], relationships: &[GraphRelationship]) -> Self {
        let index: HashMap<&str, usize> = entity_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let n = entity_ids.len();
        let mut adjacency = vec![BTreeMap::new(); n];

        let mut edges: Vec<(usize, usize, f64)> = relationships
            .iter()
            .filter(|r| r.weight.is_finite() && r.weight > 0.0)
            .filter_map(|r| {
                let s = *index.get(r.source_id.as_str())?;
                let t = *index.get(r.target_id.as_str())?;
                (s != t).then_some((s, t, r.weight))
            })
            .collect();
        // fixed summation order keeps float totals independent of input order
        edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)).then(a.2.total_cmp(&b.2)));

        for (s, t, w) in edges {
            *adjacency[s].entry(t).or_insert(0.0) += w;
            *adjacency[t].entry(s).or_insert(0.0) += w;
        }

        Self::build(adjacency, (0..n).map(|i| vec![i]).collect())
    }

    fn build(adjacency: Vec<BTreeMap<usize, f64>>, members: Vec<Vec<usize>>) -> Self {
        let strengths: Vec<f64> = adjacency.iter().map(|nbrs| nbrs.values().sum()).collect();
        let total_weight = strengths.iter().sum::<f64>() / 2.0;
        Self {
            adjacency,
            strengths,
            total_weight,
            members,
        }
    }

    /// Collapse each group of nodes into a single node. Edges inside a group
    /// are dropped; edges between groups are summed.
    fn aggregate(&self, groups: &[Vec<usize>]) -> LevelGraph {
        let mut group_of: HashMap<usize, usize> = HashMap::new();
        for (g, nodes) in groups.iter().enumerate() {
            for &node in nodes {
                group_of.insert(node, g);
            }
        }

        let mut adjacency = vec![BTreeMap::new(); groups.len()];
        for (g, nodes) in groups.iter().enumerate() {
            for &node in nodes {
                for (&neighbor, &w) in &self.adjacency[node] {
                    match group_of.get(&neighbor) {
                        Some(&h) if h != g => *adjacency[g].entry(h).or_insert(0.0) += w,
                        _ => {}
                    }
                }
            }
        }

        let members = groups
            .iter()
            .map(|nodes| {
                let mut m: Vec<usize> = nodes.iter().flat_map(|&n| self.members[n].iter().copied()).collect();
                m.sort_unstable();
                m
            })
            .collect();
        LevelGraph::build(adjacency, members)
    }
}

impl CommunityDetector {
    pub fn new(config: CommunityDetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommunityDetectionConfig {
        &self.config
    }

    pub fn detect(&self, entities: &[GraphEntity], relationships: &[GraphRelationship]) -> CommunityDetectionResult {
        let mut entity_ids: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();
        entity_ids.sort();
        entity_ids.dedup();
        if entity_ids.is_empty() {
            return CommunityDetectionResult::default();
        }

        let mut rng = match self.config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let original = LevelGraph::from_input(&entity_ids, relationships);
        let mut graph = original.clone();
        let mut levels: Vec<Vec<Vec<usize>>> = Vec::new();
        let mut modularity = 0.0;
        let min_size = self.config.min_community_size.max(1);

        for level in 0..self.config.max_depth.max(1) {
            let assignment = self.local_moves(&graph, &mut rng);
            let groups = group_nodes(&assignment, &graph);

            if level == 0 {
                let partition: Vec<Vec<usize>> = groups.iter().map(|g| member_union(&graph, g)).collect();
                modularity = partition
                    .iter()
                    .map(|members| community_modularity(&original, members, self.config.resolution))
                    .sum();
            }

            let merged = groups.len() < graph.node_count();
            let surviving: Vec<Vec<usize>> = groups
                .into_iter()
                .filter(|g| member_count(&graph, g) >= min_size)
                .collect();

            log::debug!(
                "Louvain level {}: {} nodes, {} communities kept (merged: {})",
                level,
                graph.node_count(),
                surviving.len(),
                merged
            );

            if surviving.is_empty() || (level > 0 && !merged) {
                break;
            }
            levels.push(surviving.iter().map(|g| member_union(&graph, g)).collect());

            if surviving.len() <= 1 || !merged {
                break;
            }
            graph = graph.aggregate(&surviving);
        }

        self.assemble(&entity_ids, &original, levels, modularity)
    }

    /// Local phase: returns a community label per node.
    fn local_moves(&self, graph: &LevelGraph, rng: &mut StdRng) -> Vec<usize> {
        let n = graph.node_count();
        let mut community: Vec<usize> = (0..n).collect();
        if graph.total_weight <= 0.0 {
            return community;
        }

        let m2 = 2.0 * graph.total_weight;
        let resolution = self.config.resolution;
        let mut sigma_tot: Vec<f64> = graph.strengths.clone();
        let mut order: Vec<usize> = (0..n).collect();

        for _ in 0..self.config.max_iterations {
            order.shuffle(rng);
            let mut moved = false;

            for &node in &order {
                let ki = graph.strengths[node];
                let current = community[node];

                let mut links: BTreeMap<usize, f64> = BTreeMap::new();
                for (&neighbor, &w) in &graph.adjacency[node] {
                    *links.entry(community[neighbor]).or_insert(0.0) += w;
                }

                sigma_tot[current] -= ki;
                let gain = |c: usize, k_in: f64| k_in / m2 - resolution * sigma_tot[c] * ki / (m2 * m2);

                let stay = gain(current, links.get(&current).copied().unwrap_or(0.0));
                let mut best = current;
                let mut best_gain = stay;
                for (&candidate, &k_in) in &links {
                    if candidate == current {
                        continue;
                    }
                    let g = gain(candidate, k_in);
                    if g > best_gain {
                        best = candidate;
                        best_gain = g;
                    }
                }

                let target = if best != current && best_gain - stay > self.config.min_improvement {
                    moved = true;
                    best
                } else {
                    current
                };
                community[node] = target;
                sigma_tot[target] += ki;
            }

            if !moved {
                break;
            }
        }

        community
    }

    fn assemble(
        &self,
        entity_ids: &[String],
        original: &LevelGraph,
        levels: Vec<Vec<Vec<usize>>>,
        modularity: f64,
    ) -> CommunityDetectionResult {
        let mut result_levels: Vec<Vec<DetectedCommunity>> = levels
            .iter()
            .enumerate()
            .map(|(level, communities)| {
                communities
                    .iter()
                    .enumerate()
                    .map(|(index, members)| DetectedCommunity {
                        id: format!("c{}-{}", level, index),
                        level: level as u32,
                        entity_ids: members.iter().map(|&i| entity_ids[i].clone()).collect(),
                        modularity: community_modularity(original, members, self.config.resolution),
                        parent_community_id: None,
                        child_community_ids: Vec::new(),
                    })
                    .collect()
            })
            .collect();

        // children are the next-finer communities whose entities sit inside the parent
        for level in 1..levels.len() {
            for (parent_index, parent_members) in levels[level].iter().enumerate() {
                let parent_id = result_levels[level][parent_index].id.clone();
                let mut children = Vec::new();
                for (child_index, child_members) in levels[level - 1].iter().enumerate() {
                    if is_subset(child_members, parent_members) {
                        let child = &mut result_levels[level - 1][child_index];
                        child.parent_community_id = Some(parent_id.clone());
                        children.push(child.id.clone());
                    }
                }
                result_levels[level][parent_index].child_community_ids = children;
            }
        }

        let mut entity_to_community = BTreeMap::new();
        for community in result_levels.iter().flatten() {
            for id in &community.entity_ids {
                entity_to_community
                    .entry(id.clone())
                    .or_insert_with(|| community.id.clone());
            }
        }

        log::info!(
            "Detected {} communities across {} levels (modularity {:.4})",
            result_levels.iter().map(Vec::len).sum::<usize>(),
            result_levels.len(),
            modularity
        );

        CommunityDetectionResult {
            levels: result_levels,
            entity_to_community,
            modularity,
        }
    }
}

/// Groups of level nodes sharing a label, ordered by smallest member entity.
fn group_nodes(assignment: &[usize], graph: &LevelGraph) -> Vec<Vec<usize>> {
    let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (node, &label) in assignment.iter().enumerate() {
        by_label.entry(label).or_default().push(node);
    }
    let mut groups: Vec<Vec<usize>> = by_label.into_values().collect();
    groups.sort_by_key(|g| g.iter().filter_map(|&n| graph.members[n].first().copied()).min());
    groups
}

fn member_union(graph: &LevelGraph, nodes: &[usize]) -> Vec<usize> {
    let mut members: Vec<usize> = nodes.iter().flat_map(|&n| graph.members[n].iter().copied()).collect();
    members.sort_unstable();
    members
}

fn member_count(graph: &LevelGraph, nodes: &[usize]) -> usize {
    nodes.iter().map(|&n| graph.members[n].len()).sum()
}

/// Both slices sorted ascending.
fn is_subset(small: &[usize], large: &[usize]) -> bool {
    small.iter().all(|x| large.binary_search(x).is_ok())
}

/// `Σin/2m − γ(Σtot/2m)²` for one set of original nodes.
fn community_modularity(original: &LevelGraph, members: &[usize], resolution: f64) -> f64 {
    if original.total_weight <= 0.0 {
        return 0.0;
    }
    let m2 = 2.0 * original.total_weight;
    let mut sigma_in = 0.0;
    let mut sigma_tot = 0.0;
    for &i in members {
        sigma_tot += original.strengths[i];
        for (j, w) in &original.adjacency[i] {
            if members.binary_search(j).is_ok() {
                sigma_in += w;
            }
        }
    }
    sigma_in / m2 - resolution * (sigma_tot / m2).powi(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(ids: &[&str]) -> Vec<GraphEntity> {
        ids.iter()
            .map(|id| GraphEntity::new(*id, *id, "PERSON", vec![1.0]))
            .collect()
    }

    fn rel(s: &str, t: &str) -> GraphRelationship {
        GraphRelationship::new(format!("{}-{}", s, t), s, t, "KNOWS")
    }

    fn clique(prefix: &str, size: usize) -> (Vec<String>, Vec<GraphRelationship>) {
        let ids: Vec<String> = (0..size).map(|i| format!("{}{}", prefix, i)).collect();
        let mut rels = Vec::new();
        for i in 0..size {
            for j in (i + 1)..size {
                rels.push(rel(&ids[i], &ids[j]));
            }
        }
        (ids, rels)
    }

    /// Two K4 cliques joined by a single bridge.
    fn two_cliques() -> (Vec<GraphEntity>, Vec<GraphRelationship>) {
        let (a_ids, mut rels) = clique("a", 4);
        let (b_ids, b_rels) = clique("b", 4);
        rels.extend(b_rels);
        rels.push(rel("a0", "b0"));
        let all: Vec<&str> = a_ids.iter().chain(b_ids.iter()).map(String::as_str).collect();
        (entities(&all), rels)
    }

    fn seeded(seed: u64) -> CommunityDetector {
        CommunityDetector::new(CommunityDetectionConfig {
            random_seed: Some(seed),
            ..Default::default()
        })
    }

    #[test]
    fn test_empty_input() {
        let result = seeded(1).detect(&[], &[]);
        assert!(result.is_empty());
        assert!(result.levels.is_empty());
        assert_eq!(result.modularity, 0.0);
    }

    #[test]
    fn test_two_cliques_form_two_communities() {
        let (ents, rels) = two_cliques();
        let result = seeded(7).detect(&ents, &rels);

        let level0 = &result.levels[0];
        assert_eq!(level0.len(), 2, "got {:?}", level0);
        assert_eq!(level0[0].id, "c0-0");
        assert_eq!(level0[0].entity_ids, vec!["a0", "a1", "a2", "a3"]);
        assert_eq!(level0[1].entity_ids, vec!["b0", "b1", "b2", "b3"]);
        assert!(result.modularity > 0.3);
        assert_eq!(result.entity_to_community["b2"], "c0-1");
        for community in level0 {
            assert!(community.modularity > 0.0);
        }
    }

    #[test]
    fn test_hierarchy_children_are_subsets_of_parent() {
        let (ents, rels) = two_cliques();
        let result = seeded(3).detect(&ents, &rels);

        for level in 1..result.levels.len() {
            for parent in &result.levels[level] {
                assert!(!parent.child_community_ids.is_empty());
                for child_id in &parent.child_community_ids {
                    let child = result.levels[level - 1].iter().find(|c| &c.id == child_id).unwrap();
                    assert_eq!(child.parent_community_id.as_deref(), Some(parent.id.as_str()));
                    assert!(child.entity_ids.iter().all(|e| parent.entity_ids.contains(e)));
                }
            }
        }
    }

    #[test]
    fn test_same_seed_is_idempotent_and_order_independent() {
        let (ents, rels) = two_cliques();
        let first = seeded(42).detect(&ents, &rels);
        let second = seeded(42).detect(&ents, &rels);
        assert_eq!(first, second);

        let mut rev_ents = ents.clone();
        rev_ents.reverse();
        let mut rev_rels = rels.clone();
        rev_rels.reverse();
        let reversed = seeded(42).detect(&rev_ents, &rev_rels);
        assert_eq!(first, reversed);
    }

    #[test]
    fn test_isolated_entities_filtered_by_min_size() {
        let ents = entities(&["a", "b", "c"]);
        let result = seeded(1).detect(&ents, &[]);
        assert!(result.is_empty());
        assert_eq!(result.modularity, 0.0);

        let singletons = CommunityDetector::new(CommunityDetectionConfig {
            random_seed: Some(1),
            min_community_size: 1,
            ..Default::default()
        })
        .detect(&ents, &[]);
        assert_eq!(singletons.levels.len(), 1);
        assert_eq!(singletons.levels[0].len(), 3);
    }

    #[test]
    fn test_dangling_and_self_loop_edges_ignored() {
        let ents = entities(&["a", "b"]);
        let rels = vec![rel("a", "b"), rel("a", "ghost"), rel("b", "b")];
        let result = seeded(9).detect(&ents, &rels);
        assert_eq!(result.levels.len(), 1);
        assert_eq!(result.levels[0][0].entity_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_complete_graph_single_community_stops_hierarchy() {
        let (ids, rels) = clique("n", 5);
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let result = seeded(5).detect(&entities(&ids), &rels);
        assert_eq!(result.levels.len(), 1);
        assert_eq!(result.levels[0].len(), 1);
        assert_eq!(result.levels[0][0].entity_ids.len(), 5);
    }

    #[test]
    fn test_ring_of_cliques_builds_second_level() {
        // six triangles in a ring; level 0 finds the triangles, level 1 merges neighbours
        let mut ents = Vec::new();
        let mut rels = Vec::new();
        for c in 0..6 {
            let (ids, r) = clique(&format!("t{}_", c), 3);
            ents.extend(ids.iter().map(|id| GraphEntity::new(id.clone(), id.clone(), "PERSON", vec![1.0])));
            rels.extend(r);
            let next = (c + 1) % 6;
            rels.push(rel(&format!("t{}_0", c), &format!("t{}_1", next)));
        }
        let result = seeded(11).detect(&ents, &rels);
        assert_eq!(result.levels[0].len(), 6);
        assert!(result.levels.len() == 2, "expected two levels, got {}", result.levels.len());
        assert!(result.levels[1].len() < 6);
        let covered: usize = result.levels[1].iter().map(|c| c.entity_ids.len()).sum();
        assert_eq!(covered, 18);
    }

    #[test]
    fn test_moves_require_gain_above_min_improvement() {
        let (ents, rels) = two_cliques();
        let strict = CommunityDetector::new(CommunityDetectionConfig {
            random_seed: Some(1),
            min_improvement: 10.0,
            ..Default::default()
        })
        .detect(&ents, &rels);
        // no move can gain 10 modularity units, so every node stays alone and is filtered
        assert!(strict.is_empty());
    }
}
