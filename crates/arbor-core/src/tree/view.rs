use serde::Serialize;

use super::{Anomaly, Forest, ReconstructOptions, log_anomalies};
use crate::domain::{Message, MessageId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub message: Message,
    pub children: Vec<TreeNode>,
}

/// Hierarchical view of every message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTree {
    pub roots: Vec<TreeNode>,
    /// Messages with more than one resolved child, in display order.
    pub branching_points: Vec<MessageId>,
    pub partial: bool,
    pub anomalies: Vec<Anomaly>,
}

impl ConversationTree {
    pub fn message_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TreeNode> = self.roots.iter().collect();
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

pub fn build_tree(messages: &[Message]) -> ConversationTree {
    build_tree_with(messages, ReconstructOptions::default())
}

pub fn build_tree_with(messages: &[Message], options: ReconstructOptions) -> ConversationTree {
    let mut forest = Forest::resolve(messages);
    let walk = forest.preorder(options.max_depth);
    forest.anomalies.extend(walk.truncated);
    log_anomalies(&forest.anomalies);

    let branching_points = walk
        .order
        .iter()
        .map(|&(index, _)| index)
        .filter(|&index| forest.children[index].len() > 1)
        .map(|index| forest.nodes[index].id)
        .collect();

    // Reverse pre-order sees every child before its parent, so nodes can be
    // assembled bottom-up without recursion.
    let mut built: Vec<Option<TreeNode>> = vec![None; forest.nodes.len()];
    for &(index, _) in walk.order.iter().rev() {
        let children = forest.children[index]
            .iter()
            .filter_map(|&child| built[child].take())
            .collect();
        built[index] = Some(TreeNode {
            message: forest.nodes[index].clone(),
            children,
        });
    }

    let roots = forest
        .roots
        .iter()
        .filter_map(|&root| built[root].take())
        .collect();

    ConversationTree {
        roots,
        branching_points,
        partial: walk.partial,
        anomalies: forest.anomalies,
    }
}
