pub mod analysis;
pub mod dispatcher;
pub mod executor;
pub mod maintenance;
pub mod meals;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod store;
