//! Turns a flat set of messages into a safe display order.
//!
//! Stored parent pointers cannot be trusted: rows can be duplicated, point at
//! messages outside the current set, or (after bad writes) form cycles. All
//! of these are healed here rather than rejected. Every healed condition is
//! reported as an [`Anomaly`] and logged, and the functions in this module
//! are total: they terminate and never panic for any finite input.

mod view;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::domain::{Message, MessageId};

pub use view::{ConversationTree, TreeNode, build_tree, build_tree_with};

/// Default cap on how many levels deep a thread is flattened.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructOptions {
    pub max_depth: usize,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// A condition in the stored data that reconstruction had to work around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// A message id appeared more than once; later copies were dropped.
    DuplicateMessage { message_id: MessageId },
    /// The message sat on a parent cycle and was promoted to a root.
    CycleSevered {
        message_id: MessageId,
        parent_message_id: MessageId,
    },
    /// The parent is not in the message set; the message became a root.
    DanglingParent {
        message_id: MessageId,
        parent_message_id: MessageId,
    },
    /// The message and everything below it exceeded the depth cap.
    DepthTruncated { message_id: MessageId, depth: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconstruction {
    pub messages: Vec<Message>,
    /// Set when depth truncation dropped messages.
    pub partial: bool,
    pub anomalies: Vec<Anomaly>,
}

pub fn reconstruct(messages: &[Message]) -> Reconstruction {
    reconstruct_with(messages, ReconstructOptions::default())
}

pub fn reconstruct_with(messages: &[Message], options: ReconstructOptions) -> Reconstruction {
    let mut forest = Forest::resolve(messages);
    let walk = forest.preorder(options.max_depth);
    forest.anomalies.extend(walk.truncated);

    let mut seen = HashSet::with_capacity(walk.order.len());
    let ordered = walk
        .order
        .iter()
        .map(|&(index, _)| forest.nodes[index])
        .filter(|message| seen.insert(message.id))
        .cloned()
        .collect();

    log_anomalies(&forest.anomalies);

    Reconstruction {
        messages: ordered,
        partial: walk.partial,
        anomalies: forest.anomalies,
    }
}

/// Display order only, for callers that do not care about anomalies.
pub fn linearize(messages: &[Message]) -> Vec<Message> {
    reconstruct(messages).messages
}

/// Root-to-leaf path ending at `leaf_id`, following resolved parents.
///
/// Empty when the leaf is not part of `messages`.
pub fn lineage(messages: &[Message], leaf_id: MessageId) -> Vec<Message> {
    let forest = Forest::resolve(messages);
    let Some(&leaf) = forest.index.get(&leaf_id) else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut current = Some(leaf);
    // The resolved graph is acyclic; the bound only guards the walk.
    while let Some(index) = current {
        if path.len() > forest.nodes.len() {
            break;
        }
        path.push(forest.nodes[index].clone());
        current = forest.parent[index];
    }
    path.reverse();
    path
}

/// The message `root_id` followed by all of its resolved descendants, in
/// pre-order. Empty when the message is not part of `messages`.
pub fn subtree(messages: &[Message], root_id: MessageId) -> Vec<Message> {
    let forest = Forest::resolve(messages);
    let Some(&root) = forest.index.get(&root_id) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(index) = stack.pop() {
        out.push(forest.nodes[index].clone());
        stack.extend(forest.children[index].iter().rev());
    }
    out
}

fn log_anomalies(anomalies: &[Anomaly]) {
    for anomaly in anomalies {
        warn!(target: "arbor::tree", ?anomaly, "Healed inconsistent message data");
    }
}

/// Messages indexed by position, with parents resolved to an acyclic forest.
pub(crate) struct Forest<'a> {
    pub(crate) nodes: Vec<&'a Message>,
    pub(crate) index: HashMap<MessageId, usize>,
    pub(crate) parent: Vec<Option<usize>>,
    pub(crate) children: Vec<Vec<usize>>,
    pub(crate) roots: Vec<usize>,
    pub(crate) anomalies: Vec<Anomaly>,
}

pub(crate) struct Walk {
    /// Visited nodes with their depth, roots at depth 1.
    pub(crate) order: Vec<(usize, usize)>,
    pub(crate) partial: bool,
    pub(crate) truncated: Vec<Anomaly>,
}

impl<'a> Forest<'a> {
    pub(crate) fn resolve(messages: &'a [Message]) -> Self {
        let mut anomalies = Vec::new();
        let mut nodes: Vec<&Message> = Vec::with_capacity(messages.len());
        let mut index = HashMap::with_capacity(messages.len());

        for message in messages {
            if index.contains_key(&message.id) {
                anomalies.push(Anomaly::DuplicateMessage {
                    message_id: message.id,
                });
                continue;
            }
            index.insert(message.id, nodes.len());
            nodes.push(message);
        }

        let mut parent: Vec<Option<usize>> = nodes
            .iter()
            .map(|message| {
                let parent_id = message.parent_message_id?;
                let resolved = index.get(&parent_id).copied();
                if resolved.is_none() {
                    anomalies.push(Anomaly::DanglingParent {
                        message_id: message.id,
                        parent_message_id: parent_id,
                    });
                }
                resolved
            })
            .collect();

        for node in on_cycle(&parent) {
            if let Some(parent_id) = nodes[node].parent_message_id {
                anomalies.push(Anomaly::CycleSevered {
                    message_id: nodes[node].id,
                    parent_message_id: parent_id,
                });
            }
            parent[node] = None;
        }

        let mut children = vec![Vec::new(); nodes.len()];
        let mut roots = Vec::new();
        for (node, resolved) in parent.iter().enumerate() {
            match resolved {
                Some(p) => children[*p].push(node),
                None => roots.push(node),
            }
        }

        Self {
            nodes,
            index,
            parent,
            children,
            roots,
            anomalies,
        }
    }

    /// Depth-first pre-order over the forest with an explicit stack.
    pub(crate) fn preorder(&self, max_depth: usize) -> Walk {
        let max_depth = max_depth.max(1);
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut truncated = Vec::new();
        let mut stack: Vec<(usize, usize)> = self.roots.iter().rev().map(|&r| (r, 1)).collect();

        while let Some((node, depth)) = stack.pop() {
            if depth > max_depth {
                truncated.push(Anomaly::DepthTruncated {
                    message_id: self.nodes[node].id,
                    depth,
                });
                continue;
            }
            order.push((node, depth));
            stack.extend(self.children[node].iter().rev().map(|&c| (c, depth + 1)));
        }

        Walk {
            order,
            partial: !truncated.is_empty(),
            truncated,
        }
    }
}

/// Nodes that lie on a cycle of the parent function.
///
/// Colouring walk: every node is entered once, so this is linear. Severing
/// the parent edge of exactly these nodes leaves an acyclic graph.
fn on_cycle(parent: &[Option<usize>]) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        OnPath,
        Done,
    }

    let mut colour = vec![Colour::White; parent.len()];
    let mut cyclic = Vec::new();
    let mut path = Vec::new();

    for start in 0..parent.len() {
        if colour[start] != Colour::White {
            continue;
        }

        path.clear();
        let mut current = Some(start);
        while let Some(node) = current {
            match colour[node] {
                Colour::White => {
                    colour[node] = Colour::OnPath;
                    path.push(node);
                    current = parent[node];
                }
                Colour::OnPath => {
                    if let Some(position) = path.iter().position(|&n| n == node) {
                        cyclic.extend_from_slice(&path[position..]);
                    }
                    break;
                }
                Colour::Done => break,
            }
        }

        for &node in &path {
            colour[node] = Colour::Done;
        }
    }

    cyclic.sort_unstable();
    cyclic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConversationId, Role};
    use proptest::prelude::*;
    use rstest::rstest;

    fn message(conversation_id: ConversationId, parent: Option<MessageId>) -> Message {
        Message::new(conversation_id, Role::User, "m", parent)
    }

    fn ids(messages: &[Message]) -> Vec<MessageId> {
        messages.iter().map(|m| m.id).collect()
    }

    fn chain(len: usize) -> Vec<Message> {
        let conversation_id = ConversationId::new();
        let mut out: Vec<Message> = Vec::with_capacity(len);
        for _ in 0..len {
            let parent = out.last().map(|m| m.id);
            out.push(message(conversation_id, parent));
        }
        out
    }

    #[test]
    fn mutual_cycle_yields_two_roots() {
        let conversation_id = ConversationId::new();
        let mut a = message(conversation_id, None);
        let mut b = message(conversation_id, None);
        a.parent_message_id = Some(b.id);
        b.parent_message_id = Some(a.id);

        let result = reconstruct(&[a.clone(), b.clone()]);

        assert_eq!(ids(&result.messages), vec![a.id, b.id]);
        assert!(!result.partial);
        assert_eq!(
            result
                .anomalies
                .iter()
                .filter(|x| matches!(x, Anomaly::CycleSevered { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let conversation_id = ConversationId::new();
        let mut a = message(conversation_id, None);
        a.parent_message_id = Some(a.id);

        let result = reconstruct(std::slice::from_ref(&a));
        assert_eq!(ids(&result.messages), vec![a.id]);
        assert!(matches!(
            result.anomalies.as_slice(),
            [Anomaly::CycleSevered { .. }]
        ));
    }

    #[test]
    fn tail_into_cycle_keeps_its_edge() {
        let conversation_id = ConversationId::new();
        let mut a = message(conversation_id, None);
        let mut b = message(conversation_id, None);
        a.parent_message_id = Some(b.id);
        b.parent_message_id = Some(a.id);
        let c = message(conversation_id, Some(b.id));

        let result = reconstruct(&[a.clone(), b.clone(), c.clone()]);
        assert_eq!(ids(&result.messages), vec![a.id, b.id, c.id]);
        assert_eq!(lineage(&[a, b.clone(), c.clone()], c.id).len(), 2);
    }

    #[test]
    fn dangling_parent_becomes_root() {
        let conversation_id = ConversationId::new();
        let orphan = message(conversation_id, Some(MessageId::new()));
        let root = message(conversation_id, None);

        let result = reconstruct(&[orphan.clone(), root.clone()]);
        assert_eq!(ids(&result.messages), vec![orphan.id, root.id]);
        assert!(matches!(
            result.anomalies.as_slice(),
            [Anomaly::DanglingParent { .. }]
        ));
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let conversation_id = ConversationId::new();
        let root = message(conversation_id, None);
        let mut copy = root.clone();
        copy.content = "second copy".to_string();

        let result = reconstruct(&[root.clone(), copy]);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].content, "m");
    }

    #[test]
    fn siblings_follow_input_order_after_parent() {
        let conversation_id = ConversationId::new();
        let root = message(conversation_id, None);
        let first = message(conversation_id, Some(root.id));
        let second = message(conversation_id, Some(root.id));
        let grandchild = message(conversation_id, Some(first.id));

        // Children arrive before their parent in the input.
        let input = [
            second.clone(),
            grandchild.clone(),
            first.clone(),
            root.clone(),
        ];
        let result = reconstruct(&input);
        assert_eq!(
            ids(&result.messages),
            vec![root.id, second.id, first.id, grandchild.id]
        );
    }

    #[rstest]
    #[case(5, 10, 5, false)]
    #[case(5, 5, 5, false)]
    #[case(5, 3, 3, true)]
    #[case(3, 0, 1, true)]
    fn depth_cap_truncates(
        #[case] len: usize,
        #[case] max_depth: usize,
        #[case] kept: usize,
        #[case] partial: bool,
    ) {
        let messages = chain(len);
        let result = reconstruct_with(&messages, ReconstructOptions { max_depth });
        assert_eq!(result.messages.len(), kept);
        assert_eq!(result.partial, partial);
        assert_eq!(
            result
                .anomalies
                .iter()
                .any(|a| matches!(a, Anomaly::DepthTruncated { .. })),
            partial
        );
    }

    #[test]
    fn long_chain_is_not_recursive() {
        let messages = chain(5_000);
        let result = reconstruct_with(
            &messages,
            ReconstructOptions {
                max_depth: usize::MAX,
            },
        );
        assert_eq!(result.messages.len(), 5_000);
        assert_eq!(lineage(&messages, messages[4_999].id).len(), 5_000);
    }

    #[test]
    fn lineage_of_unknown_leaf_is_empty() {
        assert!(lineage(&chain(3), MessageId::new()).is_empty());
    }

    #[test]
    fn subtree_collects_descendants_only() {
        let conversation_id = ConversationId::new();
        let root = message(conversation_id, None);
        let left = message(conversation_id, Some(root.id));
        let left_child = message(conversation_id, Some(left.id));
        let right = message(conversation_id, Some(root.id));
        let all = [root, left.clone(), left_child.clone(), right];

        assert_eq!(ids(&subtree(&all, left.id)), vec![left.id, left_child.id]);
    }

    /// Parent choice per node: none, an index into the set, or a dangling id.
    fn arbitrary_messages() -> impl Strategy<Value = Vec<Message>> {
        (0usize..40).prop_flat_map(|len| {
            (
                Just(len),
                prop::collection::vec(prop_oneof![Just(None), (0usize..64).prop_map(Some)], len),
                prop::collection::vec(0usize..64, 0..8),
            )
                .prop_map(|(len, parents, duplicates)| {
                    let conversation_id = ConversationId::new();
                    let ids: Vec<MessageId> = (0..len).map(|_| MessageId::new()).collect();
                    let mut messages: Vec<Message> = parents
                        .iter()
                        .enumerate()
                        .map(|(i, parent)| {
                            let parent_id = parent.map(|p| {
                                if p < len { ids[p] } else { MessageId::new() }
                            });
                            let mut m = message(conversation_id, parent_id);
                            m.id = ids[i];
                            m
                        })
                        .collect();
                    if len > 0 {
                        for d in duplicates {
                            messages.push(messages[d % len].clone());
                        }
                    }
                    messages
                })
        })
    }

    fn acyclic_messages() -> impl Strategy<Value = Vec<Message>> {
        prop::collection::vec(prop::option::of(0usize..64), 0..40).prop_map(|parents| {
            let conversation_id = ConversationId::new();
            let mut messages: Vec<Message> = Vec::with_capacity(parents.len());
            for (i, parent) in parents.iter().enumerate() {
                let parent_id = parent.filter(|_| i > 0).map(|p| messages[p % i].id);
                messages.push(message(conversation_id, parent_id));
            }
            messages
        })
    }

    proptest! {
        #[test]
        fn reconstruct_is_total_and_unique(messages in arbitrary_messages()) {
            let result = reconstruct(&messages);
            let input: HashSet<MessageId> = messages.iter().map(|m| m.id).collect();
            let output: Vec<MessageId> = ids(&result.messages);
            let unique: HashSet<MessageId> = output.iter().copied().collect();

            prop_assert_eq!(unique.len(), output.len());
            prop_assert!(unique.is_subset(&input));
            prop_assert_eq!(unique.len(), input.len());
        }

        #[test]
        fn parents_precede_children(messages in acyclic_messages()) {
            let result = reconstruct(&messages);
            let position: HashMap<MessageId, usize> = result
                .messages
                .iter()
                .enumerate()
                .map(|(i, m)| (m.id, i))
                .collect();

            prop_assert_eq!(result.messages.len(), messages.len());
            for m in &result.messages {
                if let Some(parent) = m.parent_message_id {
                    prop_assert!(position[&parent] < position[&m.id]);
                }
            }
        }
    }
}
