//! Device-triggered processing: bounded work queue, collaborator contracts,
//! and the single worker that drives scan → archive → upload → notify.

pub mod collaborators;
pub mod queue;
pub mod worker;
