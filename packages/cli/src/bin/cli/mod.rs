pub mod prepull;
pub mod purge;
pub mod reconcile;
pub mod sandbox;
pub mod serve;
pub mod template;
