// src/tree.rs
//
// Search-tree recorder for offline debugging. The search instruments every
// recursive child; with recording disabled (release builds) every call is a
// cheap early return.

use chess::ChessMove;
use parking_lot::Mutex;

pub const NO_NODE: usize = usize::MAX;

#[derive(Clone, Copy)]
pub struct TreeNode {
    pub played: ChessMove,
    pub alpha: i32,
    pub beta: i32,
    pub depth: i32,
    pub ply: i32,
    pub score: i32,
    pub parent: Option<usize>,
}

#[derive(Default)]
struct TreeInner {
    nodes: Vec<TreeNode>,
    cursor: Option<usize>,
}

pub struct TreeRecorder {
    enabled: bool,
    inner: Mutex<TreeInner>,
}

impl TreeRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: Mutex::new(TreeInner::default()),
        }
    }

    pub fn begin_node(&self, played: ChessMove, alpha: i32, beta: i32, depth: i32, ply: i32) -> usize {
        if !self.enabled {
            return NO_NODE;
        }
        let mut inner = self.inner.lock();
        let parent = inner.cursor;
        let idx = inner.nodes.len();
        inner.nodes.push(TreeNode {
            played,
            alpha,
            beta,
            depth,
            ply,
            score: 0,
            parent,
        });
        inner.cursor = Some(idx);
        idx
    }

    pub fn end_node(&self, handle: usize, score: i32) {
        if handle == NO_NODE {
            return;
        }
        let mut inner = self.inner.lock();
        inner.nodes[handle].score = score;
        inner.cursor = inner.nodes[handle].parent;
    }

    pub fn clear(&self) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.cursor = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
