//! Narrative Flow — a traversal engine for authored dialogue and story graphs.
//!
//! A [`FlowGraph`](schema::graph::FlowGraph) of dialogue fragments, hubs,
//! jumps, conditions and instructions is walked by a
//! [`FlowPlayer`](core::player::FlowPlayer). From the current cursor the
//! player explores every path to the next pause point speculatively, inside
//! shadow levels that undo all script side effects, and offers the results
//! as branches. Playing a branch commits its instructions to the live
//! [`Database`](core::database::Database).

pub mod core;
pub mod demo;
pub mod schema;
