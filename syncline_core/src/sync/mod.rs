//! Operation model and link combinators: the stream plumbing every pipeline is built from.

pub mod link;
pub mod operation;
pub mod row_id;

pub use link::{
    BoxLink, Link, OpHandlers, buffered_link, collect_ops, compose, handlers_link, link,
    log_link, map_data_link, noop_link, pipe, tap_link,
};
pub use operation::{
    ConnectionUpdate, DataOp, Entity, OpKind, OpStream, StateUpdate, SyncOperation, ops_stream,
};
pub use row_id::{RowIdAssigner, row_id, stable_stringify};
