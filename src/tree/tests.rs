use approx::assert_relative_eq;

use crate::tree;
use crate::tree::{
    tree_parser::{from_newick, ParsingError},
    Node,
    NodeIdx::{Internal as I, Leaf as L},
    Tree,
};

#[test]
fn newick_single_correct() {
    let trees = from_newick("(((A:1.0,B:1.0)E:2.0,C:1.0)F:1.0,D:1.0)G:2.0;").unwrap();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].root, I(0));
    let nodes = vec![
        Node::internal(0, None, vec![I(1), L(6)], 0.0, "G".to_string()),
        Node::internal(1, Some(I(0)), vec![I(2), L(5)], 1.0, "F".to_string()),
        Node::internal(2, Some(I(1)), vec![L(3), L(4)], 2.0, "E".to_string()),
        Node::leaf(3, Some(I(2)), 1.0, "A".to_string()),
        Node::leaf(4, Some(I(2)), 1.0, "B".to_string()),
        Node::leaf(5, Some(I(1)), 1.0, "C".to_string()),
        Node::leaf(6, Some(I(0)), 1.0, "D".to_string()),
    ];
    assert_eq!(trees[0].nodes, nodes);
    assert_eq!(trees[0].postorder.len(), 7);
    assert_eq!(trees[0].preorder.len(), 7);
    assert_eq!(trees[0].n(), 4);
    assert_eq!(trees[0].leaf_ids(), &["A", "B", "C", "D"]);
}

#[test]
fn nodes_compare_branch_labels() {
    let plain = from_newick("((A:0.1,B:0.2):0.3,C:0.4);").unwrap().pop().unwrap();
    let labelled = from_newick("((A:0.1,B:0.2):0.3,C:0.4 #2);").unwrap().pop().unwrap();
    assert_eq!(plain.nodes[..4], labelled.nodes[..4]);
    let c = Node {
        label: 2,
        ..Node::leaf(4, Some(I(0)), 0.4, "C".to_string())
    };
    assert_eq!(labelled.nodes[4], c);
    assert_ne!(plain.nodes[4], c);
}

#[test]
fn postorder_children_before_parents() {
    let tree = tree!("((A:1.0,B:1.0)E:2.0,(C:3.0,D:4.0)F:6.2)G;");
    for (pos, idx) in tree.postorder.iter().enumerate() {
        for child in tree.children(idx) {
            let child_pos = tree.postorder.iter().position(|n| n == child).unwrap();
            assert!(child_pos < pos);
        }
    }
    assert_eq!(*tree.postorder.last().unwrap(), tree.root);
    assert_eq!(tree.preorder[0], tree.root);
}

#[test]
fn newick_tiny_correct() {
    let trees = from_newick("A:1.0;").unwrap();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].root, L(0));
    assert_eq!(trees[0].len(), 1);
    assert_eq!(trees[0].branches().count(), 0);
}

#[test]
fn newick_multiple_correct() {
    let trees = from_newick(
        "((((A:1.0,B:1.0)F:1.0,C:2.0)G:1.0,D:3.0)H:1.0,E:4.0)I:1.0;\
            ((A:1.0,B:2.0)E:5.1,(C:3.0,D:4.0)F:6.2)G:7.3;\
            (A:1.0,(B:1.0,C:1.0)E:2.0)F:1.0;",
    )
    .unwrap();
    assert_eq!(trees.len(), 3);
    assert_eq!(trees[0].leaves().len(), 5);
    assert_eq!(trees[0].internals().len(), 4);
    assert_eq!(trees[1].leaves().len(), 4);
    assert_eq!(trees[2].internals().len(), 2);
}

#[test]
fn newick_multifurcating_root() {
    let tree = tree!("((A:1.0,B:1.0)E:1.0,(C:1.0,D:1.0)F:1.0,G:4.0);");
    assert_eq!(tree.children(&tree.root).len(), 3);
    assert_eq!(tree.n(), 5);
    assert_eq!(tree.branches().count(), 7);
    assert_relative_eq!(tree.height(), 10.0);
}

#[test]
fn newick_parse_whitespace() {
    let tree0 = tree!(
        "     (     (((  (A:1   , B  :   1.0)  \n \n F:1,C:2.0   )G:1,D:3)H:+1.0  ,  E:4)   I:1)\n;\n   "
    );
    let tree1 = tree!("(((((A:1,B:1)F:1,C:2)G:1,D:3)H:1,E:4)I:1);");
    assert_eq!(tree0.nodes, tree1.nodes);
}

#[test]
fn parse_scientific_floats() {
    let tree = tree!("((((A:.00001,B:1.4e-10)F:2.25e3,C:0.546)G:1.00030000,D:+003.95)H:1.0e-10,E:4.0e0)I;");
    let blen = |id: &str| tree.blen(&tree.try_idx(id).unwrap());
    assert_eq!(blen("A"), 0.00001);
    assert_eq!(blen("B"), 1.4e-10);
    assert_eq!(blen("C"), 0.546);
    assert_eq!(blen("D"), 3.95);
    assert_eq!(blen("E"), 4.0);
    assert_eq!(blen("F"), 2.25e3);
    assert_eq!(blen("G"), 1.0003);
    assert_eq!(blen("H"), 1.0e-10);
}

#[test]
fn branch_labels() {
    let tree = tree!("((A:0.1,B:0.2 #1):0.3 #2,C:0.4);");
    assert_eq!(tree.branch_label(&tree.try_idx("A").unwrap()), 0);
    assert_eq!(tree.branch_label(&tree.try_idx("B").unwrap()), 1);
    assert_eq!(tree.branch_label(&I(1)), 2);
    assert_relative_eq!(tree.blen(&I(1)), 0.3);
    assert_eq!(tree.n_branch_labels(), 3);

    let tree = tree!("((A #1:0.1,B:0.2):0.3,C:0.4);");
    assert_eq!(tree.branch_label(&tree.try_idx("A").unwrap()), 1);
    assert_relative_eq!(tree.blen(&tree.try_idx("A").unwrap()), 0.1);
}

#[test]
fn ancestors_up_to_root() {
    let tree = tree!("(((A:1.0,B:1.0)E:2.0,C:1.0)F:1.0,D:1.0)G:2.0;");
    let a = tree.try_idx("A").unwrap();
    assert_eq!(tree.ancestors(&a), vec![I(2), I(1), I(0)]);
    assert!(tree.ancestors(&tree.root).is_empty());
}

#[test]
fn newick_garbage() {
    assert!(from_newick(";").is_err());
    assert!(from_newick("((A:1.0,B:1.0);").is_err());
    assert!(from_newick("(:1.0,:2.0)E:5.1;").is_err());
    let err = from_newick("").unwrap_err();
    assert!(err.downcast_ref::<ParsingError>().is_some());
    assert!(format!("{}", err).starts_with("Malformed newick string"));
}

#[test]
fn from_structure_matches_newick() {
    // ((A:0.1,B:0.2):0.3,C:0.4)
    let parents = [None, Some(0), Some(1), Some(1), Some(0)];
    let blens = [0.0, 0.3, 0.1, 0.2, 0.4];
    let ids = ["", "", "A", "B", "C"].map(String::from);
    let tree = Tree::from_structure(&parents, &blens, &ids).unwrap();
    let parsed = tree!("((A:0.1,B:0.2):0.3,C:0.4);");
    assert_eq!(tree.nodes, parsed.nodes);
    assert_eq!(tree.postorder, parsed.postorder);
}

#[test]
fn from_structure_invalid() {
    assert!(Tree::from_structure(&[None, None], &[0.0, 0.0], &[]).is_err());
    assert!(Tree::from_structure(&[Some(1), Some(0)], &[0.0, 0.0], &[]).is_err());
    assert!(Tree::from_structure(&[None, Some(5)], &[0.0, 0.0], &[]).is_err());
    assert!(Tree::from_structure(&[None, Some(0)], &[0.0], &[]).is_err());
    // cycle below a valid root
    assert!(Tree::from_structure(&[None, Some(2), Some(1)], &[0.0; 3], &[]).is_err());
}

#[test]
fn node_idx_display() {
    assert_eq!(format!("{}", L(4)), "leaf node 4");
    assert_eq!(format!("{}", I(2)), "internal node 2");
    assert_eq!(usize::from(&L(7)), 7);
}
