use super::*;

#[test]
fn test_requests() {
    let mut reqs = Requests::default();
    assert!(reqs.is_empty());

    reqs.insert(Request::Removal);
    reqs.insert(Request::UpIn);
    reqs.insert(Request::UpIn);
    reqs.insert(Request::UpOut);
    assert_eq!(
        reqs.to_vec(),
        vec![Request::UpOut, Request::UpIn, Request::Removal]
    );

    assert!(reqs.remove(Request::UpIn));
    assert!(!reqs.remove(Request::UpIn));
    assert!(reqs.contains(Request::Removal));
    assert_eq!(format!("{:?}", reqs), "[UpOut, Removal]");

    reqs.clear();
    assert!(reqs.is_empty());
}

#[test]
fn test_node_payload() {
    let mut node: Node<u32> = Node::default();
    assert!(node.is_leaf() && node.is_black() && !node.is_live_leaf());

    node.value = Some(10);
    assert!(node.is_live_leaf());
    node.requests.insert(Request::Removal);
    assert!(!node.is_live_leaf());

    node.left = 5;
    node.right = 6;
    node.set_red();
    assert!(node.is_not_leaf() && node.is_red());
    assert_eq!(node.sibling_of(5), Some(6));
    assert_eq!(node.sibling_of(6), Some(5));
    assert_eq!(node.sibling_of(7), None);
    assert!(node.is_parent_of(5) && !node.is_parent_of(NIL));

    let payload = node.take_payload();
    assert!(node.dead && node.is_leaf() && node.requests.is_empty());
    assert_eq!(node.gen, 1);
    assert_eq!(payload.value, Some(10));
    assert_eq!((payload.left, payload.right), (5, 6));
    assert_eq!(payload.color, Color::Red);
    assert!(payload.requests.contains(Request::Removal));

    node.set_payload(payload);
    assert!(!node.dead);
    assert_eq!(node.gen, 1);
    assert_eq!(node.value, Some(10));
}
