//! Hierarchical PID namespace table.
//!
//! A namespace is a container providing an isolated PID space. Namespaces form a tree rooted at
//! the namespace of `initproc`. Each process belongs to exactly one namespace and receives one
//! in-namespace PID per ancestor namespace (see [`crate::proc::ProcInner::pids`]).

use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, transmute};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::param::NUMNS;
use crate::spinlock::SpinLock;

pub static NS_TABLE: NamespaceTable = NamespaceTable::new();

/// Mutable fields of a namespace record. Guarded by the record's own lock.
#[derive(Debug)]
pub struct NamespaceInner {
    pub used: bool,
    pub ns_id: usize,
    pub depth: usize,
    /// Index into [`NamespaceTable`] of the parent namespace, `None` at the root.
    pub parent: Option<usize>,
    /// Index into `PROC_TABLE` of this namespace's "init-equivalent" process.
    pub head: Option<usize>,
    pub next_ns_pid: u32,
    pub proc_cnt: usize,
}

impl NamespaceInner {
    const fn new() -> Self {
        Self {
            used: false,
            ns_id: 0,
            depth: 0,
            parent: None,
            head: None,
            next_ns_pid: 1,
            proc_cnt: 0,
        }
    }
}

/// A namespace record. Indices into [`NamespaceTable`] are the only valid way to reference one,
/// per the arena-and-index pattern used for the cyclic parent/head links.
#[derive(Debug)]
pub struct Namespace {
    pub id: usize,
    pub inner: SpinLock<NamespaceInner>,
}

impl Namespace {
    const fn new(id: usize) -> Self {
        Self {
            id,
            inner: SpinLock::new(NamespaceInner::new(), "namespace"),
        }
    }
}

unsafe impl Sync for Namespace {}

/// Fixed-capacity pool of namespace slots.
pub struct NamespaceTable {
    table: [UnsafeCell<Namespace>; NUMNS],
}

impl NamespaceTable {
    const fn new() -> Self {
        let mut table: [MaybeUninit<UnsafeCell<Namespace>>; NUMNS] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let mut i = 0;
        while i < NUMNS {
            table[i] = MaybeUninit::new(UnsafeCell::new(Namespace::new(i)));
            i += 1;
        }

        Self {
            table: unsafe { transmute(table) },
        }
    }

    pub fn get(&self, index: usize) -> &Namespace {
        unsafe { &*self.table[index].get() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        (0..NUMNS).map(|i| self.get(i))
    }
}

unsafe impl Sync for NamespaceTable {}

/// Allocates a globally unique namespace id.
fn alloc_ns_id() -> usize {
    static NS_ID_LOCK: SpinLock<()> = SpinLock::new((), "ns_id");
    static NEXT_NS_ID: AtomicUsize = AtomicUsize::new(1);

    let _guard = NS_ID_LOCK.lock();
    NEXT_NS_ID.fetch_add(1, Ordering::Relaxed)
}

/// Linearly scans the namespace table for a free slot and initializes it as a new namespace whose
/// parent is `parent` (`None` for the root) and whose depth is `parent.depth + 1` (0 for the
/// root). Returns the slot's index.
pub fn allocnamespace(parent: Option<usize>) -> Result<usize, KernelError> {
    let depth = match parent {
        Some(index) => NS_TABLE.get(index).inner.lock().depth + 1,
        None => 0,
    };

    for ns in NS_TABLE.iter() {
        let mut inner = ns.inner.lock();
        if !inner.used {
            inner.ns_id = alloc_ns_id();
            inner.depth = depth;
            inner.parent = parent;
            inner.head = None;
            inner.used = true;
            inner.proc_cnt = 0;
            inner.next_ns_pid = 1;

            return Ok(ns.id);
        }
    }

    err!(KernelError::OutOfProc);
}

/// Returns the index of the given namespace's "init-equivalent" process, walking up through
/// parent namespaces if the namespace's own head has exited. Assumes the root namespace always
/// has a head once the system has finished booting.
pub fn get_ns_head(ns_index: usize) -> usize {
    let mut current = ns_index;

    loop {
        let inner = NS_TABLE.get(current).inner.lock();
        if let Some(head) = inner.head {
            return head;
        }

        match inner.parent {
            Some(parent) => {
                drop(inner);
                current = parent;
            }
            None => panic!("get_ns_head: root namespace has no head"),
        }
    }
}

/// Returns true if `ns_index` names a namespace equal to or a descendant of `ancestor_index`.
pub fn descends_from(ns_index: usize, ancestor_index: usize) -> bool {
    let mut current = Some(ns_index);

    while let Some(index) = current {
        if index == ancestor_index {
            return true;
        }

        current = NS_TABLE.get(index).inner.lock().parent;
    }

    false
}
