use std::fmt;

use anyhow::bail;
use log::info;
use pest::{error::Error as PestError, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{
    Node,
    NodeIdx::{self, Internal as Int, Leaf},
    Tree,
};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub struct ParsingError(pub Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParsingError {}

/// Parses one or more `;`-terminated newick trees. Nodes are numbered in the order they
/// appear, a `#k` annotation sets the branch label of the node to `k`.
pub fn from_newick(newick_string: &str) -> Result<Vec<Tree>> {
    info!("Parsing newick trees.");
    let newick_rule = match NewickParser::parse(Rule::newick, newick_string) {
        Ok(mut pairs) => pairs.next(),
        Err(err) => bail!(ParsingError(Box::new(err))),
    };
    let mut trees = Vec::new();
    if let Some(newick_rule) = newick_rule {
        for tree_rule in newick_rule.into_inner() {
            if tree_rule.as_rule() != Rule::tree {
                continue;
            }
            let mut tree = Tree::new_empty();
            tree.parse_tree_rule(tree_rule)?;
            trees.push(tree);
        }
    }
    info!("Finished parsing {} newick tree(s) successfully.", trees.len());
    Ok(trees)
}

impl Tree {
    fn parse_tree_rule(&mut self, tree_rule: Pair<Rule>) -> Result<()> {
        let mut node_idx = 0;
        for rule in tree_rule.into_inner() {
            match rule.as_rule() {
                Rule::leaf => {
                    self.parse_leaf_rule(&mut node_idx, None, rule)?;
                    self.root = Leaf(0);
                }
                Rule::internal => {
                    self.parse_internal_rule(&mut node_idx, None, rule)?;
                    self.root = Int(0);
                }
                _ => unreachable!(),
            }
        }
        if let Some(root) = self.nodes.first_mut() {
            root.blen = 0.0;
        }
        self.complete();
        Ok(())
    }

    fn parse_internal_rule(
        &mut self,
        node_idx: &mut usize,
        parent: Option<NodeIdx>,
        internal_rule: Pair<Rule>,
    ) -> Result<NodeIdx> {
        let cur_idx = *node_idx;
        self.nodes
            .push(Node::internal(cur_idx, parent, Vec::new(), 0.0, String::new()));
        *node_idx += 1;
        let mut children = Vec::new();
        for rule in internal_rule.into_inner() {
            match rule.as_rule() {
                Rule::label => self.nodes[cur_idx].id = Tree::parse_label_rule(rule),
                Rule::branch_length => {
                    self.nodes[cur_idx].blen = Tree::parse_branch_length_rule(rule)?
                }
                Rule::branch_label => {
                    self.nodes[cur_idx].label = Tree::parse_branch_label_rule(rule)?
                }
                Rule::internal => {
                    children.push(self.parse_internal_rule(node_idx, Some(Int(cur_idx)), rule)?)
                }
                Rule::leaf => {
                    children.push(self.parse_leaf_rule(node_idx, Some(Int(cur_idx)), rule)?)
                }
                _ => unreachable!(),
            }
        }
        self.nodes[cur_idx].children = children;
        Ok(Int(cur_idx))
    }

    fn parse_leaf_rule(
        &mut self,
        node_idx: &mut usize,
        parent: Option<NodeIdx>,
        leaf_rule: Pair<Rule>,
    ) -> Result<NodeIdx> {
        let mut id = String::new();
        let mut blen = 0.0;
        let mut label = 0;
        for rule in leaf_rule.into_inner() {
            match rule.as_rule() {
                Rule::label => id = Tree::parse_label_rule(rule),
                Rule::branch_length => blen = Tree::parse_branch_length_rule(rule)?,
                Rule::branch_label => label = Tree::parse_branch_label_rule(rule)?,
                _ => unreachable!(),
            }
        }
        let idx = *node_idx;
        self.nodes.push(Node {
            label,
            ..Node::leaf(idx, parent, blen, id)
        });
        *node_idx += 1;
        Ok(Leaf(idx))
    }

    fn parse_branch_length_rule(rule: Pair<Rule>) -> Result<f64> {
        let text = rule.as_str().trim_start_matches(':').trim();
        match text.parse::<f64>() {
            Ok(blen) => Ok(blen),
            Err(err) => bail!("Invalid branch length {}: {}", text, err),
        }
    }

    fn parse_branch_label_rule(rule: Pair<Rule>) -> Result<usize> {
        let text = rule.as_str().trim_start_matches('#');
        match text.parse::<usize>() {
            Ok(label) => Ok(label),
            Err(err) => bail!("Invalid branch label #{}: {}", text, err),
        }
    }

    fn parse_label_rule(rule: Pair<Rule>) -> String {
        rule.as_str().to_string()
    }
}
