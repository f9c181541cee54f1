//! Routing of inbound work to tokio tasks. The caller picks a [dispatcher::DispatchStrategy] per
//!  unit of work: related work (same conversation, transaction, session or ordering context) is
//!  serialized on one queue, unrelated work runs concurrently.

pub mod dispatcher;
