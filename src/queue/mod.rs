//! Multi-producer multi-consumer FIFO queues.
//!
//! Two shapes, matching the two auxiliary queues the scheduler rests on:
//!
//! - [`LinkedQueue`]: unbounded, linked-node storage. Used by workers as
//!   the cross-worker task injection channel.
//! - [`RingQueue`]: bounded, fixed capacity chosen at construction, with
//!   an evict-oldest overflow mode ([`RingQueue::push_until_success`]).
//!
//! Both are lock-free and ABA-safe by construction (built on the
//! crossbeam queue primitives rather than hand-tagged pointers, which
//! would require `unsafe` this crate forbids).

mod linked;
mod ring;

pub use linked::LinkedQueue;
pub use ring::RingQueue;
