use crate::error::IndexError;
use std::cmp::Ordering;

type Link<T> = Option<Box<Node<T>>>;

#[derive(Debug)]
struct Node<T> {
    value: T,
    left: Link<T>,
    right: Link<T>,
    height: u32,
}

impl<T> Node<T> {
    fn new(value: T) -> Box<Self> {
        Box::new(Self {
            value,
            left: None,
            right: None,
            height: 1,
        })
    }
}

fn height<T>(link: &Link<T>) -> u32 {
    link.as_ref().map_or(0, |node| node.height)
}

fn refresh_height<T>(node: &mut Node<T>) {
    node.height = 1 + height(&node.left).max(height(&node.right));
}

fn balance<T>(node: &Node<T>) -> i32 {
    height(&node.left) as i32 - height(&node.right) as i32
}

fn rotate_left<T>(mut node: Box<Node<T>>) -> Box<Node<T>> {
    let mut pivot = node.right.take().expect("left rotation without a right child");
    node.right = pivot.left.take();
    refresh_height(&mut node);
    pivot.left = Some(node);
    refresh_height(&mut pivot);
    pivot
}

fn rotate_right<T>(mut node: Box<Node<T>>) -> Box<Node<T>> {
    let mut pivot = node.left.take().expect("right rotation without a left child");
    node.left = pivot.right.take();
    refresh_height(&mut node);
    pivot.right = Some(node);
    refresh_height(&mut pivot);
    pivot
}

/// Restores the AVL invariant at one node, choosing between the single and
/// double rotations by comparing subtree heights at the unbalanced child.
fn rebalance<T>(mut node: Box<Node<T>>) -> Box<Node<T>> {
    refresh_height(&mut node);
    let factor = balance(&node);
    if factor > 1 {
        let left = node.left.take().expect("left-heavy node without a left child");
        node.left = if balance(&left) < 0 {
            // Double right: the weight hangs off the left child's right side.
            Some(rotate_left(left))
        } else {
            Some(left)
        };
        rotate_right(node)
    } else if factor < -1 {
        let right = node.right.take().expect("right-heavy node without a right child");
        node.right = if balance(&right) > 0 {
            Some(rotate_right(right))
        } else {
            Some(right)
        };
        rotate_left(node)
    } else {
        node
    }
}

fn rebalance_link<T>(link: &mut Link<T>) {
    let node = link.take().expect("rebalance of an empty link");
    *link = Some(rebalance(node));
}

fn insert_link<T, C>(link: &mut Link<T>, value: T, cmp: &C) -> Result<(), IndexError>
where
    C: Fn(&T, &T) -> Ordering,
{
    let node = match link {
        None => {
            *link = Some(Node::new(value));
            return Ok(());
        }
        Some(node) => node,
    };

    // Duplicates are detected on descent, before any link or height is
    // touched, so a failed insert leaves the tree untouched.
    match cmp(&node.value, &value) {
        Ordering::Equal => return Err(IndexError::DuplicateKey),
        Ordering::Greater => insert_link(&mut node.left, value, cmp)?,
        Ordering::Less => insert_link(&mut node.right, value, cmp)?,
    }
    rebalance_link(link);
    Ok(())
}

/// Detaches the leftmost node of a non-empty subtree, rebalancing on the way
/// back up.
fn take_leftmost<T>(link: &mut Link<T>) -> Box<Node<T>> {
    let node = link.as_deref_mut().expect("leftmost of an empty subtree");
    if node.left.is_some() {
        let taken = take_leftmost(&mut node.left);
        rebalance_link(link);
        taken
    } else {
        let mut taken = link.take().expect("link emptied during descent");
        *link = taken.right.take();
        taken
    }
}

fn take_rightmost<T>(link: &mut Link<T>) -> Box<Node<T>> {
    let node = link.as_deref_mut().expect("rightmost of an empty subtree");
    if node.right.is_some() {
        let taken = take_rightmost(&mut node.right);
        rebalance_link(link);
        taken
    } else {
        let mut taken = link.take().expect("link emptied during descent");
        *link = taken.left.take();
        taken
    }
}

fn remove_link<T, K, C>(link: &mut Link<T>, key: &K, cmp: &C) -> Result<T, IndexError>
where
    C: Fn(&T, &K) -> Ordering,
{
    let node = link.as_deref_mut().ok_or(IndexError::NotFound)?;
    let removed = match cmp(&node.value, key) {
        Ordering::Greater => remove_link(&mut node.left, key, cmp)?,
        Ordering::Less => remove_link(&mut node.right, key, cmp)?,
        Ordering::Equal => {
            // Swap in the in-order successor, or the predecessor when no
            // right subtree exists, and remove the donor node instead.
            if node.right.is_some() {
                let donor = take_leftmost(&mut node.right);
                std::mem::replace(&mut node.value, donor.value)
            } else if node.left.is_some() {
                let donor = take_rightmost(&mut node.left);
                std::mem::replace(&mut node.value, donor.value)
            } else {
                let taken = link.take().expect("link emptied during descent");
                return Ok(taken.value);
            }
        }
    };
    rebalance_link(link);
    Ok(removed)
}

/// A self-balancing binary search tree with caller-supplied ordering.
///
/// Every operation takes its comparison function per call, so the stored
/// type and the lookup key type are decoupled: an index of wrapper records
/// can be searched by the wrapped value's raw identity. The tree itself is
/// unsynchronized; [`crate::OrderedIndex`] is the gated variant.
#[derive(Debug)]
pub struct AvlTree<T> {
    root: Link<T>,
    len: usize,
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AvlTree<T> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every node in O(1) observable work.
    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    /// Inserts `value`, failing with [`IndexError::DuplicateKey`] if a node
    /// comparing equal already exists. `cmp` receives `(stored, new)`.
    pub fn insert_with<C>(&mut self, value: T, cmp: C) -> Result<(), IndexError>
    where
        C: Fn(&T, &T) -> Ordering,
    {
        insert_link(&mut self.root, value, &cmp)?;
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the entry matching `key`, failing with
    /// [`IndexError::NotFound`] if absent. `cmp` receives `(stored, key)`.
    pub fn remove_with<K, C>(&mut self, key: &K, cmp: C) -> Result<T, IndexError>
    where
        C: Fn(&T, &K) -> Ordering,
    {
        let removed = remove_link(&mut self.root, key, &cmp)?;
        self.len -= 1;
        Ok(removed)
    }

    pub fn get_with<K, C>(&self, key: &K, cmp: C) -> Result<&T, IndexError>
    where
        C: Fn(&T, &K) -> Ordering,
    {
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            match cmp(&node.value, key) {
                Ordering::Equal => return Ok(&node.value),
                Ordering::Greater => current = node.left.as_deref(),
                Ordering::Less => current = node.right.as_deref(),
            }
        }
        Err(IndexError::NotFound)
    }

    /// Like [`AvlTree::get_with`] but treats absence as a normal case.
    pub fn try_get_with<K, C>(&self, key: &K, cmp: C) -> Option<&T>
    where
        C: Fn(&T, &K) -> Ordering,
    {
        self.get_with(key, cmp).ok()
    }

    /// Mutable lookup. The caller must not perturb the stored order through
    /// the returned reference.
    pub fn get_mut_with<K, C>(&mut self, key: &K, cmp: C) -> Result<&mut T, IndexError>
    where
        C: Fn(&T, &K) -> Ordering,
    {
        let mut current = self.root.as_deref_mut();
        while let Some(node) = current {
            match cmp(&node.value, key) {
                Ordering::Equal => return Ok(&mut node.value),
                Ordering::Greater => current = node.left.as_deref_mut(),
                Ordering::Less => current = node.right.as_deref_mut(),
            }
        }
        Err(IndexError::NotFound)
    }

    pub fn contains_with<K, C>(&self, key: &K, cmp: C) -> bool
    where
        C: Fn(&T, &K) -> Ordering,
    {
        self.get_with(key, cmp).is_ok()
    }

    /// In-order visitation: values arrive sorted by the insertion ordering.
    /// Restartable; each call walks from the root anew.
    pub fn for_each<F: FnMut(&T)>(&self, mut visit: F) {
        fn walk<T, F: FnMut(&T)>(link: &Link<T>, visit: &mut F) {
            if let Some(node) = link {
                walk(&node.left, visit);
                visit(&node.value);
                walk(&node.right, visit);
            }
        }
        walk(&self.root, &mut visit);
    }

    /// In-order visitation that stops when the visitor returns `false`.
    /// Returns whether the walk ran to completion.
    pub fn for_each_while<F: FnMut(&T) -> bool>(&self, mut visit: F) -> bool {
        fn walk<T, F: FnMut(&T) -> bool>(link: &Link<T>, visit: &mut F) -> bool {
            match link {
                None => true,
                Some(node) => {
                    walk(&node.left, visit) && visit(&node.value) && walk(&node.right, visit)
                }
            }
        }
        walk(&self.root, &mut visit)
    }

    /// Pre-order visitation (node before subtrees), for structural
    /// inspection.
    pub fn for_each_preorder<F: FnMut(&T)>(&self, mut visit: F) {
        fn walk<T, F: FnMut(&T)>(link: &Link<T>, visit: &mut F) {
            if let Some(node) = link {
                visit(&node.value);
                walk(&node.left, visit);
                walk(&node.right, visit);
            }
        }
        walk(&self.root, &mut visit);
    }

    /// Post-order visitation (subtrees before node).
    pub fn for_each_postorder<F: FnMut(&T)>(&self, mut visit: F) {
        fn walk<T, F: FnMut(&T)>(link: &Link<T>, visit: &mut F) {
            if let Some(node) = link {
                walk(&node.left, visit);
                walk(&node.right, visit);
                visit(&node.value);
            }
        }
        walk(&self.root, &mut visit);
    }

    /// Materializes the in-order sequence.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut out = Vec::with_capacity(self.len);
        self.for_each(|value| out.push(value.clone()));
        out
    }

    #[cfg(test)]
    fn check_balanced(&self) {
        fn walk<T>(link: &Link<T>) -> u32 {
            match link {
                None => 0,
                Some(node) => {
                    let left = walk(&node.left);
                    let right = walk(&node.right);
                    assert!(
                        left.abs_diff(right) <= 1,
                        "unbalanced node: left {left}, right {right}"
                    );
                    let computed = 1 + left.max(right);
                    assert_eq!(node.height, computed, "stale cached height");
                    computed
                }
            }
        }
        walk(&self.root);
    }
}

#[test]
fn shuffled_inserts_stay_sorted_and_balanced() {
    use rand::seq::SliceRandom;

    let mut keys: Vec<u32> = (0..512).collect();
    keys.shuffle(&mut rand::thread_rng());

    let mut tree = AvlTree::new();
    for key in &keys {
        tree.insert_with(*key, u32::cmp).unwrap();
        tree.check_balanced();
    }

    assert_eq!(tree.len(), 512);
    let inorder = tree.to_vec();
    assert_eq!(inorder, (0..512).collect::<Vec<_>>());
}

#[test]
fn duplicate_insert_leaves_no_trace() {
    let mut tree = AvlTree::new();
    for key in [5u32, 2, 8, 1, 3] {
        tree.insert_with(key, u32::cmp).unwrap();
    }

    let before = tree.to_vec();
    assert_eq!(tree.insert_with(3, u32::cmp), Err(IndexError::DuplicateKey));
    assert_eq!(tree.len(), 5);
    assert_eq!(tree.to_vec(), before);
    tree.check_balanced();
}

#[test]
fn removals_rebalance_and_count() {
    use rand::seq::SliceRandom;

    let mut rng = rand::thread_rng();
    let mut keys: Vec<u32> = (0..256).collect();
    keys.shuffle(&mut rng);

    let mut tree = AvlTree::new();
    for key in &keys {
        tree.insert_with(*key, u32::cmp).unwrap();
    }

    keys.shuffle(&mut rng);
    for (removed, key) in keys.iter().take(128).enumerate() {
        assert_eq!(tree.remove_with(key, |v, k| v.cmp(k)), Ok(*key));
        assert_eq!(tree.len(), 256 - removed - 1);
        tree.check_balanced();
    }

    assert_eq!(
        tree.remove_with(&keys[0], |v, k| v.cmp(k)),
        Err(IndexError::NotFound)
    );
    assert_eq!(tree.len(), 128);

    let mut expected: Vec<u32> = keys[128..].to_vec();
    expected.sort_unstable();
    assert_eq!(tree.to_vec(), expected);
}

#[test]
fn lookup_by_projected_key() {
    // Store (name, payload) pairs but search by bare &str.
    let mut tree: AvlTree<(String, u32)> = AvlTree::new();
    for (name, payload) in [("wall", 3u32), ("floor", 7), ("lamp", 21)] {
        tree.insert_with((name.to_string(), payload), |a, b| a.0.cmp(&b.0))
            .unwrap();
    }

    let by_name = |stored: &(String, u32), key: &&str| stored.0.as_str().cmp(key);
    assert_eq!(tree.get_with(&"floor", by_name).map(|v| v.1), Ok(7));
    assert!(tree.contains_with(&"lamp", by_name));
    assert_eq!(tree.get_with(&"door", by_name), Err(IndexError::NotFound));
    assert_eq!(tree.try_get_with(&"door", by_name), None);

    let removed = tree.remove_with(&"wall", by_name).unwrap();
    assert_eq!(removed, ("wall".to_string(), 3));
    assert_eq!(tree.len(), 2);
}

#[test]
fn traversal_orders() {
    let mut tree = AvlTree::new();
    for key in [2u32, 1, 3] {
        tree.insert_with(key, u32::cmp).unwrap();
    }

    let mut pre = Vec::new();
    tree.for_each_preorder(|v| pre.push(*v));
    assert_eq!(pre, [2, 1, 3]);

    let mut post = Vec::new();
    tree.for_each_postorder(|v| post.push(*v));
    assert_eq!(post, [1, 3, 2]);

    let mut seen = Vec::new();
    let completed = tree.for_each_while(|v| {
        seen.push(*v);
        *v < 2
    });
    assert!(!completed);
    assert_eq!(seen, [1, 2]);

    // Restartable: a second walk starts over.
    let mut again = Vec::new();
    tree.for_each(|v| again.push(*v));
    assert_eq!(again, [1, 2, 3]);
}

#[test]
fn clear_resets() {
    let mut tree = AvlTree::new();
    for key in 0..32u32 {
        tree.insert_with(key, u32::cmp).unwrap();
    }
    tree.clear();
    assert!(tree.is_empty());
    assert_eq!(tree.to_vec(), Vec::<u32>::new());
    tree.insert_with(9, u32::cmp).unwrap();
    assert_eq!(tree.len(), 1);
}
