//! Intrusive list primitives.
//!
//! Two families back the session bookkeeping and the echo buffer pool:
//! raw lists whose nodes embed `Cell`-based pointer hooks (no allocation
//! per link), and a shared-pointer list whose forward edges are strong
//! `Arc`s and back edges `Weak`, so the list itself keeps members alive.

mod intrusive;
mod shared;

pub use intrusive::{
    ForwardHook, ForwardListNode, IntrusiveForwardList, IntrusiveList, ListHook, ListNode,
};
pub use shared::{SharedIntrusiveList, SharedListHook, SharedListNode};
